use clap::Parser;
use telemetry_fanout::cli::{serve, tail, Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve::execute_serve(args).await?,
        Commands::Tail(args) => tail::execute_tail(args).await?,
    }

    Ok(())
}
