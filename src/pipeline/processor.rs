//! Background post-processing of queued batch chunks.

use super::{LIST_PATTERN, REALTIME_STATS_KEY, STATS_PATTERN};
use crate::broadcast::{message, Broadcaster};
use crate::cache::TieredCache;
use crate::queue::{Job, JobProcessor, Progress};
use crate::schema::DataPoint;
use crate::storage::{PointFilter, Storage, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Points per `data_update` event; the remainder is reported as dropped.
pub const MAX_POINTS_PER_EVENT: usize = 100;

/// Job payload: one chunk of a submitted batch.
#[derive(Debug, Clone)]
pub struct BatchChunk {
    pub batch_id: String,
    pub points: Vec<DataPoint>,
    /// Zero-based chunk index within the batch.
    pub index: usize,
    pub chunks: usize,
}

pub struct BatchProcessor {
    storage: Arc<dyn Storage>,
    cache: Arc<TieredCache>,
    broadcaster: Arc<Broadcaster>,
    realtime_window: Duration,
    stats_ttl: Duration,
}

impl BatchProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<TieredCache>,
        broadcaster: Arc<Broadcaster>,
        realtime_window: Duration,
        stats_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            cache,
            broadcaster,
            realtime_window,
            stats_ttl,
        }
    }

    fn publish_points(&self, batch_id: &str, points: &[DataPoint]) {
        let mut by_type: BTreeMap<&str, Vec<&DataPoint>> = BTreeMap::new();
        for point in points {
            by_type.entry(point.point_type.as_str()).or_default().push(point);
        }

        for (point_type, points) in by_type {
            let dropped = points.len().saturating_sub(MAX_POINTS_PER_EVENT);
            let sent = &points[..points.len() - dropped];
            self.broadcaster.broadcast_to_topic(
                &message::data_topic(point_type),
                message::DATA_UPDATE,
                json!({
                    "batch_id": batch_id,
                    "points": sent,
                    "dropped": dropped,
                }),
            );
        }
    }
}

/// Drop every cached view derived from stored points.
pub(crate) async fn invalidate_derived(cache: &TieredCache) -> usize {
    cache.invalidate_pattern(STATS_PATTERN).await + cache.invalidate_pattern(LIST_PATTERN).await
}

#[async_trait]
impl JobProcessor<BatchChunk> for BatchProcessor {
    type Error = StorageError;

    #[tracing::instrument(
        name = "process_chunk",
        skip_all,
        fields(
            job_id = %job.id,
            batch_id = %job.payload.batch_id,
            attempt = job.attempts,
            points = job.payload.points.len(),
        )
    )]
    async fn process(&self, job: &Job<BatchChunk>, progress: &Progress) -> Result<(), StorageError> {
        let chunk = &job.payload;

        let inserted = self.storage.insert(&chunk.points).await?;
        progress.report(40);

        // Points are stored; nothing past this point may fail the job.
        let since = Utc::now()
            - chrono::Duration::from_std(self.realtime_window).unwrap_or(chrono::Duration::zero());
        let realtime = match self.storage.aggregate_stats(&PointFilter::since(since)).await {
            Ok(realtime) => Some(realtime),
            Err(error) => {
                warn!(error = %error, "realtime stats unavailable, skipping refresh");
                None
            }
        };
        progress.report(70);

        let invalidated = invalidate_derived(&self.cache).await;
        if let Some(realtime) = &realtime {
            self.cache
                .set_json(REALTIME_STATS_KEY, realtime, Some(self.stats_ttl))
                .await;
        }
        debug!(invalidated, "derived cache refreshed");

        self.broadcaster.broadcast_global(
            message::BATCH_PROCESSED,
            json!({
                "batch_id": chunk.batch_id,
                "job_id": job.id,
                "count": inserted,
                "queued": true,
                "chunk": chunk.index,
                "chunks": chunk.chunks,
            }),
        );
        if let Some(realtime) = realtime {
            self.broadcaster.broadcast_to_topic(
                message::STATS_TOPIC,
                message::STATS_UPDATE,
                json!(realtime),
            );
        }
        self.publish_points(&chunk.batch_id, &chunk.points);
        progress.report(100);

        info!(inserted, chunk = chunk.index, chunks = chunk.chunks, "chunk processed");
        Ok(())
    }

    async fn on_failed(&self, job: &Job<BatchChunk>, error: &str) {
        self.broadcaster.broadcast_global(
            message::BATCH_FAILED,
            json!({
                "batch_id": job.payload.batch_id,
                "job_id": job.id,
                "attempts": job.attempts,
                "error": error,
            }),
        );
    }
}
