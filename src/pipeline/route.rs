//! Size-based routing for ingested batches.

use super::PipelineConfig;
use crate::queue::Priority;
use crate::schema::DataPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Persist in the caller's request.
    Inline,
    /// One background job for the whole batch.
    Single,
    /// Fixed-size chunks, each its own job.
    Chunked,
}

pub fn route(len: usize, config: &PipelineConfig) -> Route {
    if len <= config.inline_max {
        Route::Inline
    } else if len <= config.single_job_max {
        Route::Single
    } else {
        Route::Chunked
    }
}

/// Priority of the chunk at `index`: the leading chunks jump the queue so
/// early data becomes visible first.
pub fn chunk_priority(index: usize, config: &PipelineConfig) -> Priority {
    if index < config.priority_chunks {
        Priority::High
    } else {
        Priority::Default
    }
}

/// Move `points` into chunks of at most `chunk_size`, preserving order.
pub fn split_chunks(points: Vec<DataPoint>, chunk_size: usize) -> Vec<Vec<DataPoint>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(points.len().div_ceil(chunk_size));
    let mut current = Vec::with_capacity(chunk_size.min(points.len()));
    for point in points {
        current.push(point);
        if current.len() == chunk_size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(chunk_size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
