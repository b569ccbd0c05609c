use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use mdfeed_sim::config::FeedConfig;
use mdfeed_sim::service::FeedService;
use mdfeed_sim::telemetry;

const DEFAULT_CONFIG: &str = "config/feed.toml";

#[derive(Parser, Debug)]
#[command(name = "mdfeed-sim", version, about = "Simulated CME MDP3 and Reuters SBE market data feeds")]
struct Cli {
    /// TOML config; when omitted, config/feed.toml is used if present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_filter: String,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long, global = true)]
    duration_secs: Option<u64>,

    #[arg(long, global = true, default_value = "0.0.0.0:9000")]
    metrics_listen: SocketAddr,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate market data and publish it on the enabled feeds
    Run,
    /// Print the configured instruments as JSON and exit
    Instruments,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env

    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);

    let config = match &cli.config {
        Some(path) => FeedConfig::load(Some(path.as_path()), true),
        None => FeedConfig::load(Some(Path::new(DEFAULT_CONFIG)), false),
    }
    .context("loading configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Instruments => {
            println!("{}", serde_json::to_string_pretty(&config.instruments)?);
        }
        Command::Run => {
            telemetry::init_metrics(cli.metrics_listen)?;
            let service = FeedService::build(config).await?;
            let stats = service.run(cli.duration_secs.map(Duration::from_secs)).await?;
            info!(updates = stats.updates, trades = stats.trades, "Exiting");
        }
    }
    Ok(())
}
