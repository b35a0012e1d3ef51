use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::broadcast::{Broadcaster, TokenVerifier};
use crate::cache::{MemoryBroker, TieredCache};
use crate::config::Config;
use crate::handler::{self, ws, AppState};
use crate::pipeline::IngestPipeline;
use crate::storage::{MemoryStorage, Storage};

/// Initialize the tracing subscriber.
/// Uses RUST_LOG env var for filtering (defaults to info).
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_ansi(true)).init();
    }
}

/// Wire storage, cache, broadcaster and pipeline from configuration.
/// Workers are not started.
pub fn build_state(config: &Config, jwt_secret: &str) -> AppState {
    build_state_with_storage(config, jwt_secret, Arc::new(MemoryStorage::new()))
}

pub fn build_state_with_storage(
    config: &Config,
    jwt_secret: &str,
    storage: Arc<dyn Storage>,
) -> AppState {
    let cache = Arc::new(
        TieredCache::new(Arc::new(MemoryBroker::new()), config.cache.namespace.clone())
            .with_default_ttl(config.default_ttl()),
    );
    let broadcaster = Arc::new(Broadcaster::new(TokenVerifier::new(jwt_secret)));
    let pipeline = Arc::new(IngestPipeline::new(
        config.pipeline.to_pipeline_config(),
        config.queue.to_queue_config(),
        storage,
        cache,
        broadcaster.clone(),
    ));

    AppState {
        pipeline,
        broadcaster,
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/data",
            post(handler::ingest_data)
                .layer(DefaultBodyLimit::max(handler::MAX_DECOMPRESSED_SIZE))
                .get(handler::list_data),
        )
        .route("/v1/data/stats", get(handler::get_stats))
        .route("/v1/data/stats/realtime", get(handler::get_realtime_stats))
        .route("/v1/jobs/:id", get(handler::get_job))
        .route("/ws", get(ws::ws_upgrade))
        .route("/health", get(handler::health))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain the job queue.
///
/// Returns whether the drain finished within `drain_timeout`.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    drain_timeout: Duration,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<bool> {
    state.pipeline.start();
    let pipeline = state.pipeline.clone();
    let app = build_router(state);

    info!(addr = ?listener.local_addr().ok(), "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!(timeout_secs = drain_timeout.as_secs(), "http server stopped, draining queue");
    let drained = pipeline.shutdown(drain_timeout).await;
    if !drained {
        warn!("queue drain incomplete at shutdown");
    }
    Ok(drained)
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
