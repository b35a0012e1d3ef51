// src/lib.rs
//! Telemetry ingestion with queued processing, a two-tier cache and
//! real-time WebSocket fan-out.

pub mod broadcast;
pub mod cache;
pub mod cli;
pub mod config;
pub mod handler;
pub mod native;
pub mod pipeline;
pub mod queue;
pub mod schema;
pub mod storage;

// Re-export tracing for use in other modules
pub use tracing;

pub use config::Config;
pub use handler::AppState;
pub use native::{build_router, build_state};
pub use pipeline::{IngestError, IngestPipeline, IngestReceipt};
pub use schema::DataPoint;
