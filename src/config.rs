//! Service configuration, loaded from TOML. Every field has a default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::pipeline::PipelineConfig;
use crate::queue::{QueueConfig, RetryConfig};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheSection,
    pub queue: QueueSection,
    pub pipeline: PipelineSection,
    pub auth: AuthSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub namespace: String,
    pub default_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            namespace: "fanout".to_string(),
            default_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub keep_completed: usize,
    pub keep_failed: usize,
    pub stall_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            keep_completed: 100,
            keep_failed: 50,
            stall_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

impl QueueSection {
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.concurrency,
            retry: RetryConfig::exponential(
                self.max_attempts,
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_max_ms),
            ),
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
            stall_timeout: Duration::from_secs(self.stall_timeout_secs.max(1)),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub inline_max: usize,
    pub single_job_max: usize,
    pub chunk_size: usize,
    pub priority_chunks: usize,
    pub max_batch_points: usize,
    pub stats_ttl_secs: u64,
    pub realtime_window_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            inline_max: 10,
            single_job_max: 5000,
            chunk_size: 1000,
            priority_chunks: 3,
            max_batch_points: 100_000,
            stats_ttl_secs: 30,
            realtime_window_secs: 300,
        }
    }
}

impl PipelineSection {
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            inline_max: self.inline_max,
            single_job_max: self.single_job_max,
            chunk_size: self.chunk_size,
            priority_chunks: self.priority_chunks,
            max_batch_points: self.max_batch_points,
            stats_ttl: Duration::from_secs(self.stats_ttl_secs),
            realtime_window: Duration::from_secs(self.realtime_window_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub jwt_secret: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make routing or the worker pool inert.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if self.queue.concurrency == 0 {
            anyhow::bail!("queue.concurrency must be at least 1");
        }
        if p.chunk_size == 0 {
            anyhow::bail!("pipeline.chunk_size must be at least 1");
        }
        if p.inline_max > p.single_job_max {
            anyhow::bail!(
                "pipeline.inline_max ({}) must not exceed pipeline.single_job_max ({})",
                p.inline_max,
                p.single_job_max
            );
        }
        if self.cache.namespace.is_empty() {
            anyhow::bail!("cache.namespace must not be empty");
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_secs)
    }
}
