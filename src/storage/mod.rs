//! Persistence collaborator for ingested points.

mod memory;
mod stats;

pub use memory::MemoryStorage;
pub use stats::{StatsAccumulator, StatsSnapshot, TypeStats};

use crate::queue::IsRetryable;
use crate::schema::DataPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Worth retrying: connection loss, timeouts, lock contention.
    #[error("storage temporarily unavailable: {0}")]
    Transient(String),
    #[error("storage rejected write: {0}")]
    Rejected(String),
}

impl IsRetryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// A persisted data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPoint {
    pub id: Uuid,
    #[serde(flatten)]
    pub point: DataPoint,
    pub created_at: DateTime<Utc>,
}

impl StoredPoint {
    pub fn new(point: DataPoint) -> Self {
        Self {
            id: Uuid::now_v7(),
            point,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointFilter {
    pub point_type: Option<String>,
    /// Only points with `timestamp >= since`.
    pub since: Option<DateTime<Utc>>,
}

impl PointFilter {
    pub fn by_type(point_type: impl Into<String>) -> Self {
        Self {
            point_type: Some(point_type.into()),
            since: None,
        }
    }

    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            point_type: None,
            since: Some(since),
        }
    }

    pub fn matches(&self, point: &DataPoint) -> bool {
        if let Some(point_type) = &self.point_type {
            if &point.point_type != point_type {
                return false;
            }
        }
        match self.since {
            Some(since) => point.timestamp >= since,
            None => true,
        }
    }
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Pagination {
    /// Clamp user input: page >= 1, 1 <= limit <= MAX_PAGE_LIMIT.
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit
                .unwrap_or(DEFAULT_PAGE_LIMIT)
                .clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }

    pub fn is_first(&self) -> bool {
        self.page <= 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<StoredPoint>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

/// Backend holding ingested points.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Persist a batch. Returns the number of points written.
    async fn insert(&self, points: &[DataPoint]) -> Result<usize, StorageError>;

    /// Newest first.
    async fn query(&self, filter: &PointFilter, page: Pagination) -> Result<Page, StorageError>;

    async fn aggregate_stats(&self, filter: &PointFilter) -> Result<StatsSnapshot, StorageError>;
}
