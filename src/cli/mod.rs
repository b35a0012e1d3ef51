pub mod serve;
pub mod tail;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Telemetry ingestion with queued processing and real-time fan-out")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the ingestion server
    Serve(ServeArgs),
    /// Stream topic events from a running server
    Tail(TailArgs),
}

#[derive(clap::Args)]
pub struct ServeArgs {
    /// Path to a TOML config file
    #[arg(long, env = "FANOUT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(long, env = "FANOUT_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// HS256 secret for client tokens (overrides config)
    #[arg(long, env = "FANOUT_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(clap::Args)]
pub struct TailArgs {
    /// Server URL (http, https, ws or wss)
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub url: String,

    /// Topics to subscribe to (repeatable), e.g. stats or data:temperature
    #[arg(long = "topic", required = true)]
    pub topics: Vec<String>,

    /// Bearer token used to authenticate the session
    #[arg(long, env = "FANOUT_TOKEN", hide_env_values = true)]
    pub token: String,
}
