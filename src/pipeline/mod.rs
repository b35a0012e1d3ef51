//! Ingestion decision pipeline.
//!
//! Validates a submitted batch, then routes it by size: tiny batches are
//! persisted inline, medium batches become one background job, large
//! batches are split into chunks with the leading chunks prioritized.
//! Reads of derived views (stats, listings) go through the tiered cache.

mod batch_id;
mod processor;
mod route;

pub use batch_id::new_batch_id;
pub use processor::{BatchChunk, BatchProcessor, MAX_POINTS_PER_EVENT};
pub use route::{chunk_priority, route, split_chunks, Route};

use crate::broadcast::{message, Broadcaster};
use crate::cache::TieredCache;
use crate::queue::{JobId, JobQueue, JobSnapshot, Priority, QueueConfig, QueueError};
use crate::schema::{self, DataPoint};
use crate::storage::{Page, Pagination, PointFilter, StatsSnapshot, Storage, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Span};

pub const STATS_KEY: &str = "data:stats";
pub const REALTIME_STATS_KEY: &str = "data:stats:realtime";
pub const STATS_PATTERN: &str = "data:stats*";
pub const LIST_PATTERN: &str = "data:list*";

pub type IngestQueue = JobQueue<BatchChunk, BatchProcessor>;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid batch: {0}")]
    Validation(String),
    #[error("batch of {count} points exceeds limit of {max}")]
    Capacity { count: usize, max: usize },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("ingestion unavailable: {0}")]
    Unavailable(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Largest batch persisted inline.
    pub inline_max: usize,
    /// Largest batch handled by a single job.
    pub single_job_max: usize,
    pub chunk_size: usize,
    /// Leading chunks enqueued at high priority.
    pub priority_chunks: usize,
    pub max_batch_points: usize,
    pub stats_ttl: Duration,
    pub realtime_window: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inline_max: 10,
            single_job_max: 5000,
            chunk_size: 1000,
            priority_chunks: 3,
            max_batch_points: 100_000,
            stats_ttl: Duration::from_secs(30),
            realtime_window: Duration::from_secs(300),
        }
    }
}

/// Returned to the submitter once a batch is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub batch_id: String,
    pub queued: bool,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<JobId>,
}

pub struct IngestPipeline {
    config: PipelineConfig,
    storage: Arc<dyn Storage>,
    cache: Arc<TieredCache>,
    broadcaster: Arc<Broadcaster>,
    queue: IngestQueue,
}

impl IngestPipeline {
    /// Build the pipeline and its queue. Workers start with `start`.
    pub fn new(
        config: PipelineConfig,
        queue_config: QueueConfig,
        storage: Arc<dyn Storage>,
        cache: Arc<TieredCache>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let processor = Arc::new(BatchProcessor::new(
            storage.clone(),
            cache.clone(),
            broadcaster.clone(),
            config.realtime_window,
            config.stats_ttl,
        ));
        let queue = JobQueue::new(queue_config, processor);
        Self {
            config,
            storage,
            cache,
            broadcaster,
            queue,
        }
    }

    pub fn start(&self) {
        self.queue.start();
    }

    pub fn queue(&self) -> &IngestQueue {
        &self.queue
    }

    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        self.queue.job(id)
    }

    /// Drain background work. See `JobQueue::shutdown`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.queue.shutdown(timeout).await
    }

    /// Parse raw JSON records at the boundary, then ingest them.
    pub async fn ingest(&self, raw: Vec<JsonValue>) -> Result<IngestReceipt, IngestError> {
        let points = schema::parse_batch(&raw).map_err(IngestError::Validation)?;
        self.ingest_points(points).await
    }

    #[tracing::instrument(
        name = "ingest",
        skip_all,
        fields(
            count = points.len(),
            batch_id = tracing::field::Empty,
            route = tracing::field::Empty,
        )
    )]
    pub async fn ingest_points(&self, points: Vec<DataPoint>) -> Result<IngestReceipt, IngestError> {
        schema::validate_points(&points).map_err(IngestError::Validation)?;
        let count = points.len();
        if count > self.config.max_batch_points {
            warn!(count, max = self.config.max_batch_points, "batch rejected, too large");
            return Err(IngestError::Capacity {
                count,
                max: self.config.max_batch_points,
            });
        }

        let batch_id = new_batch_id();
        let route = route(count, &self.config);
        Span::current().record("batch_id", batch_id.as_str());
        Span::current().record("route", tracing::field::debug(route));

        match route {
            Route::Inline => self.ingest_inline(batch_id, points).await,
            Route::Single => self.enqueue_chunks(batch_id, vec![points], |_| Priority::Default),
            Route::Chunked => {
                let chunks = split_chunks(points, self.config.chunk_size);
                self.enqueue_chunks(batch_id, chunks, |index| {
                    chunk_priority(index, &self.config)
                })
            }
        }
    }

    async fn ingest_inline(
        &self,
        batch_id: String,
        points: Vec<DataPoint>,
    ) -> Result<IngestReceipt, IngestError> {
        let count = self.storage.insert(&points).await?;
        processor::invalidate_derived(&self.cache).await;
        self.broadcaster.broadcast_global(
            message::BATCH_PROCESSED,
            json!({
                "batch_id": batch_id,
                "job_id": null,
                "count": count,
                "queued": false,
            }),
        );
        info!(count, "batch stored inline");
        Ok(IngestReceipt {
            batch_id,
            queued: false,
            count,
            jobs: Vec::new(),
        })
    }

    fn enqueue_chunks(
        &self,
        batch_id: String,
        chunks: Vec<Vec<DataPoint>>,
        priority: impl Fn(usize) -> Priority,
    ) -> Result<IngestReceipt, IngestError> {
        if !self.queue.is_accepting() {
            return Err(QueueError::ShuttingDown.into());
        }

        let total = chunks.len();
        let mut count = 0;
        let mut jobs = Vec::with_capacity(total);
        for (index, points) in chunks.into_iter().enumerate() {
            count += points.len();
            let chunk = BatchChunk {
                batch_id: batch_id.clone(),
                points,
                index,
                chunks: total,
            };
            jobs.push(self.queue.enqueue(chunk, priority(index))?);
        }

        info!(count, jobs = jobs.len(), "batch queued");
        Ok(IngestReceipt {
            batch_id,
            queued: true,
            count,
            jobs,
        })
    }

    /// Aggregate stats, optionally for one point type.
    pub async fn stats(&self, point_type: Option<&str>) -> Result<StatsSnapshot, IngestError> {
        let (key, filter) = match point_type {
            Some(t) => (format!("{}:type={}", STATS_KEY, t), PointFilter::by_type(t)),
            None => (STATS_KEY.to_string(), PointFilter::default()),
        };
        if let Some(cached) = self.cache.get_json(&key).await {
            return Ok(cached);
        }

        let snapshot = self.storage.aggregate_stats(&filter).await?;
        self.cache
            .set_json(&key, &snapshot, Some(self.config.stats_ttl))
            .await;
        Ok(snapshot)
    }

    /// Stats over the recent window.
    pub async fn realtime_stats(&self) -> Result<StatsSnapshot, IngestError> {
        if let Some(cached) = self.cache.get_json(REALTIME_STATS_KEY).await {
            return Ok(cached);
        }

        let window = chrono::Duration::from_std(self.config.realtime_window)
            .unwrap_or(chrono::Duration::zero());
        let filter = PointFilter::since(chrono::Utc::now() - window);
        let snapshot = self.storage.aggregate_stats(&filter).await?;
        self.cache
            .set_json(REALTIME_STATS_KEY, &snapshot, Some(self.config.stats_ttl))
            .await;
        Ok(snapshot)
    }

    /// Paginated listing. Only the first page is cached.
    pub async fn list(&self, filter: PointFilter, page: Pagination) -> Result<Page, IngestError> {
        let key = page.is_first().then(|| {
            format!(
                "data:list:type={}:limit={}",
                filter.point_type.as_deref().unwrap_or("all"),
                page.limit
            )
        });

        if let Some(key) = &key {
            if let Some(cached) = self.cache.get_json(key).await {
                debug!(key, "listing served from cache");
                return Ok(cached);
            }
        }

        let result = self.storage.query(&filter, page).await?;
        if let Some(key) = &key {
            self.cache.set_json(key, &result, None).await;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::TokenVerifier;
    use crate::cache::MemoryBroker;
    use crate::queue::{JobState, RetryConfig};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_queue() -> QueueConfig {
        QueueConfig {
            concurrency: 2,
            retry: RetryConfig::exponential(3, Duration::from_millis(1), Duration::from_millis(5)),
            ..QueueConfig::default()
        }
    }

    fn pipeline_with(storage: Arc<dyn Storage>) -> (IngestPipeline, Arc<TieredCache>) {
        let cache = Arc::new(TieredCache::new(Arc::new(MemoryBroker::new()), "test"));
        let broadcaster = Arc::new(Broadcaster::new(TokenVerifier::new("secret")));
        let pipeline = IngestPipeline::new(
            PipelineConfig::default(),
            fast_queue(),
            storage,
            cache.clone(),
            broadcaster,
        );
        (pipeline, cache)
    }

    fn points(n: usize, point_type: &str) -> Vec<DataPoint> {
        (0..n).map(|i| DataPoint::new(point_type, i as f64)).collect()
    }

    #[tokio::test]
    async fn small_batch_is_stored_inline() {
        let storage = Arc::new(MemoryStorage::new());
        let (pipeline, _) = pipeline_with(storage.clone());

        let receipt = pipeline.ingest_points(points(10, "temperature")).await.unwrap();

        assert!(!receipt.queued);
        assert_eq!(receipt.count, 10);
        assert!(receipt.jobs.is_empty());
        assert!(receipt.batch_id.starts_with("batch_"));
        assert_eq!(storage.len(), 10);
    }

    #[tokio::test]
    async fn medium_batch_is_one_job() {
        let storage = Arc::new(MemoryStorage::new());
        let (pipeline, _) = pipeline_with(storage.clone());

        let receipt = pipeline.ingest_points(points(11, "temperature")).await.unwrap();
        assert!(receipt.queued);
        assert_eq!(receipt.jobs.len(), 1);
        assert_eq!(storage.len(), 0);

        assert!(pipeline.shutdown(Duration::from_secs(5)).await);
        assert_eq!(storage.len(), 11);
        assert_eq!(
            pipeline.job(receipt.jobs[0]).unwrap().state,
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn large_batch_is_chunked_with_leading_priority() {
        let storage = Arc::new(MemoryStorage::new());
        let (pipeline, _) = pipeline_with(storage.clone());

        let receipt = pipeline.ingest_points(points(5500, "temperature")).await.unwrap();
        assert!(receipt.queued);
        assert_eq!(receipt.count, 5500);
        assert_eq!(receipt.jobs.len(), 6);

        let priorities: Vec<Priority> = receipt
            .jobs
            .iter()
            .map(|id| pipeline.job(*id).unwrap().priority)
            .collect();
        assert_eq!(&priorities[..3], &[Priority::High; 3]);
        assert_eq!(&priorities[3..], &[Priority::Default; 3]);

        pipeline.start();
        assert!(pipeline.shutdown(Duration::from_secs(5)).await);
        assert_eq!(storage.len(), 5500);
    }

    #[tokio::test]
    async fn empty_and_oversized_batches_are_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let (pipeline, _) = pipeline_with(storage.clone());

        assert!(matches!(
            pipeline.ingest_points(Vec::new()).await,
            Err(IngestError::Validation(_))
        ));
        assert!(matches!(
            pipeline.ingest_points(points(100_001, "t")).await,
            Err(IngestError::Capacity { count: 100_001, .. })
        ));
        assert_eq!(pipeline.queue().counts().queued, 0);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn malformed_raw_record_rejects_whole_batch() {
        let storage = Arc::new(MemoryStorage::new());
        let (pipeline, _) = pipeline_with(storage.clone());

        let err = pipeline
            .ingest(vec![
                json!({"type": "temperature", "value": 21.5}),
                json!({"type": "temperature", "value": "hot"}),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn ingest_after_shutdown_is_unavailable() {
        let (pipeline, _) = pipeline_with(Arc::new(MemoryStorage::new()));
        pipeline.shutdown(Duration::from_secs(1)).await;

        assert!(matches!(
            pipeline.ingest_points(points(20, "t")).await,
            Err(IngestError::Unavailable(QueueError::ShuttingDown))
        ));
    }

    #[tokio::test]
    async fn stats_reflect_new_inline_point() {
        let (pipeline, cache) = pipeline_with(Arc::new(MemoryStorage::new()));
        pipeline.ingest_points(points(3, "humidity")).await.unwrap();

        let before = pipeline.stats(None).await.unwrap();
        assert!(cache.get(STATS_KEY).await.is_some());

        pipeline
            .ingest(vec![json!({"type": "temperature", "value": 21.5})])
            .await
            .unwrap();
        assert!(cache.get(STATS_KEY).await.is_none());

        let after = pipeline.stats(None).await.unwrap();
        assert_eq!(after.total_points, before.total_points + 1);
        assert_eq!(after.by_type["temperature"].avg, 21.5);
    }

    #[tokio::test]
    async fn only_first_list_page_is_cached() {
        let (pipeline, cache) = pipeline_with(Arc::new(MemoryStorage::new()));
        pipeline.ingest_points(points(5, "temperature")).await.unwrap();

        let first = pipeline
            .list(PointFilter::default(), Pagination::new(Some(1), Some(2)))
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(cache.get("data:list:type=all:limit=2").await.is_some());

        pipeline
            .list(PointFilter::by_type("temperature"), Pagination::new(Some(2), Some(2)))
            .await
            .unwrap();
        assert!(cache.get("data:list:type=temperature:limit=2").await.is_none());
    }

    /// Fails the first `failures_left` inserts and the first
    /// `stats_failures_left` aggregations with a transient error.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        failures_left: AtomicUsize,
        stats_failures_left: AtomicUsize,
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn insert(&self, points: &[DataPoint]) -> Result<usize, StorageError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Transient("connection reset".into()));
            }
            self.inner.insert(points).await
        }

        async fn query(&self, filter: &PointFilter, page: Pagination) -> Result<Page, StorageError> {
            self.inner.query(filter, page).await
        }

        async fn aggregate_stats(&self, filter: &PointFilter) -> Result<StatsSnapshot, StorageError> {
            if self
                .stats_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Transient("stats timeout".into()));
            }
            self.inner.aggregate_stats(filter).await
        }
    }

    #[tokio::test]
    async fn transient_storage_failures_are_retried_by_workers() {
        let storage = Arc::new(FlakyStorage {
            failures_left: AtomicUsize::new(2),
            ..FlakyStorage::default()
        });
        let (pipeline, _) = pipeline_with(storage.clone());
        pipeline.start();

        let receipt = pipeline.ingest_points(points(50, "pressure")).await.unwrap();
        assert!(pipeline.shutdown(Duration::from_secs(5)).await);

        let job = pipeline.job(receipt.jobs[0]).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(storage.inner.len(), 50);
    }

    #[tokio::test]
    async fn stats_failure_after_insert_does_not_store_twice() {
        let storage = Arc::new(FlakyStorage {
            stats_failures_left: AtomicUsize::new(1),
            ..FlakyStorage::default()
        });
        let (pipeline, _) = pipeline_with(storage.clone());
        pipeline.start();

        let receipt = pipeline.ingest_points(points(50, "pressure")).await.unwrap();
        assert!(pipeline.shutdown(Duration::from_secs(5)).await);

        let job = pipeline.job(receipt.jobs[0]).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 1);
        assert_eq!(storage.inner.len(), 50);
        assert_eq!(pipeline.stats(None).await.unwrap().total_points, 50);
    }

    #[tokio::test]
    async fn inline_storage_failure_propagates() {
        let storage = Arc::new(FlakyStorage {
            failures_left: AtomicUsize::new(1),
            ..FlakyStorage::default()
        });
        let (pipeline, _) = pipeline_with(storage);

        assert!(matches!(
            pipeline.ingest_points(points(1, "t")).await,
            Err(IngestError::Storage(StorageError::Transient(_)))
        ));
    }
}
