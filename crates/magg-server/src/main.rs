//! magg-serve: run the magg MCP aggregator
//!
//! Serves MCP over stdio (default) or HTTP. Logs go to stderr so stdout
//! stays clean for the wire.

use anyhow::Result;
use clap::{Parser, Subcommand};
use magg_server::{MaggRunner, MaggServer};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "magg-serve", about = "MCP aggregator server", version)]
struct Cli {
    /// Path to the configuration file (default: .magg/config.json,
    /// overridable via MAGG_CONFIG_PATH)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve MCP on stdin/stdout (default)
    Stdio,
    /// Serve MCP over HTTP with SSE notifications
    Http {
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

fn init_logging() {
    let quiet = std::env::var("MAGG_QUIET")
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);

    let level = std::env::var("MAGG_LOG_LEVEL")
        .ok()
        .filter(|level| !level.is_empty())
        .map(|level| level.to_lowercase())
        .unwrap_or_else(|| if quiet { "error".to_string() } else { "info".to_string() });
    let default_filter = format!(
        "magg_core={level},magg_config={level},magg_client={level},magg_server={level},warn"
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let server = MaggServer::new(cli.config);
    let runner = MaggRunner::new(server);

    let reason = match cli.mode.unwrap_or(Mode::Stdio) {
        Mode::Stdio => runner.run_stdio().await?,
        Mode::Http { host, port } => runner.run_http(&host, port, None).await?,
    };

    std::process::exit(reason.exit_code());
}
