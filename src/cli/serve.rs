use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::cli::ServeArgs;
use crate::config::Config;
use crate::native;

pub async fn execute_serve(args: ServeArgs) -> Result<()> {
    native::init_tracing(args.json_logs);

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(secret) = args.jwt_secret {
        config.auth.jwt_secret = Some(secret);
    }

    let Some(secret) = config.auth.jwt_secret.clone().filter(|s| !s.is_empty()) else {
        bail!("No JWT secret configured. Set [auth] jwt_secret, --jwt-secret or FANOUT_JWT_SECRET.");
    };

    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    let state = native::build_state(&config, &secret);

    info!(
        listen = %config.server.listen,
        namespace = %config.cache.namespace,
        concurrency = config.queue.concurrency,
        "starting fanout server"
    );
    let drained = native::serve(
        listener,
        state,
        config.queue.shutdown_timeout(),
        native::shutdown_signal(),
    )
    .await
    .context("Server error")?;

    if !drained {
        bail!("Shutdown timed out with jobs still pending");
    }
    Ok(())
}
