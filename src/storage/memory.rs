//! In-memory reference storage.

use super::{
    Page, Pagination, PointFilter, StatsAccumulator, StatsSnapshot, Storage, StorageError,
    StoredPoint,
};
use crate::schema::DataPoint;
use async_trait::async_trait;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

#[derive(Default)]
pub struct MemoryStorage {
    points: RwLock<Vec<StoredPoint>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert(&self, points: &[DataPoint]) -> Result<usize, StorageError> {
        let stored: Vec<StoredPoint> = points.iter().cloned().map(StoredPoint::new).collect();
        let count = stored.len();
        self.points
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(stored);
        debug!(count, "points stored");
        Ok(count)
    }

    async fn query(&self, filter: &PointFilter, page: Pagination) -> Result<Page, StorageError> {
        let points = self.points.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<&StoredPoint> =
            points.iter().filter(|p| filter.matches(&p.point)).collect();
        matching.sort_by(|a, b| {
            b.point
                .timestamp
                .cmp(&a.point.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset())
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok(Page {
            items,
            page: page.page,
            limit: page.limit,
            total,
        })
    }

    async fn aggregate_stats(&self, filter: &PointFilter) -> Result<StatsSnapshot, StorageError> {
        let points = self.points.read().unwrap_or_else(PoisonError::into_inner);
        let mut acc = StatsAccumulator::default();
        for stored in points.iter().filter(|p| filter.matches(&p.point)) {
            acc.accumulate(&stored.point.point_type, stored.point.value);
        }
        Ok(acc.finish())
    }
}
