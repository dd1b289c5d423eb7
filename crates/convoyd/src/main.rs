//! convoyd: convoy sync sidecar daemon
//!
//! Usage:
//!   convoyd [--config /etc/convoy/config.toml] [--user <id>]
//!
//! Wires the sync core against the configured remote backend, probes
//! connectivity, drains the queue on reconnect, runs periodic full syncs and
//! serves status/health/metrics over HTTP.

mod daemon;
mod metrics;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "convoyd", version, about = "convoy sync sidecar daemon")]
struct Cli {
    /// Path to convoy.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "CONVOY_CONFIG",
        default_value = "/etc/convoy/config.toml"
    )]
    config: PathBuf,

    /// User identity the device identity is bound to
    #[arg(long, env = "CONVOY_USER", default_value = "local")]
    user: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CONVOY_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "CONVOY_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "convoyd starting"
    );

    let config = load_config(&cli.config).await?;
    daemon::run(config, cli.user).await
}

async fn load_config(path: &PathBuf) -> Result<convoy_core::config::ConvoyConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(convoy_core::config::ConvoyConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
