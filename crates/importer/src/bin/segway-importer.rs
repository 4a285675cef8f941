//! segway-importer: relays import jobs from per-source queues to the
//! normalized outbound queue.
//!
//! Consumes `<domain>.<source>` for every configured source, publishes
//! normalized messages to `<domain>` and dead letters to
//! `<domain>.<source>.dead`. Runs until SIGINT/SIGTERM, then drains.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use segway_core::config::load_dotenv;
use segway_core::{ConfigError, ImporterConfig};
use segway_importer::Supervisor;
use segway_queue::{AmqpConnector, Backoff, ConnectionManager, Connector, MemoryBroker};

// ── CLI ─────────────────────────────────────────────────────────────

/// Import worker pipeline: source queues in, normalized messages out.
#[derive(Parser, Debug)]
#[command(name = "segway-importer", version, about)]
struct Cli {
    /// Path to the segway.toml config file.
    #[arg(long, env = "SEGWAY_CONFIG", default_value = "config/segway.toml")]
    config: String,

    /// Broker URL, overriding the config file and SEGWAY_BROKER_URL.
    #[arg(long)]
    broker_url: Option<String>,

    /// Run against an in-process broker instead of RabbitMQ.
    #[arg(long)]
    memory: bool,
}

fn load_config(cli: &Cli) -> Result<ImporterConfig, ConfigError> {
    let mut config = match ImporterConfig::from_file(&cli.config) {
        Ok(config) => {
            info!(path = %cli.config, "loaded segway config");
            config
        }
        Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %cli.config, "config file not found, using defaults and environment");
            ImporterConfig::from_env()?
        }
        Err(e) => return Err(e),
    };
    if let Some(url) = &cli.broker_url {
        config.broker.url = url.clone();
    }
    Ok(config)
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    config.log_summary();

    let connector: Arc<dyn Connector> = if cli.memory {
        info!("using in-memory broker");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(AmqpConnector::new(&config.broker.url))
    };
    let backoff = Backoff::new(config.backoff.base(), config.backoff.cap());
    let connection = ConnectionManager::connect(connector, backoff).await?;
    connection.on_disconnect(|event| {
        warn!(
            sequence = event.sequence,
            "workers paused until the broker is reachable again"
        );
    });

    let supervisor = Supervisor::from_config(&config, connection)?;
    supervisor.run_until(shutdown_signal()).await?;

    info!("segway-importer exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl_c");
    }
}
