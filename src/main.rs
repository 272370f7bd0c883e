use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::ratelimit::RateLimiter;

#[derive(Parser)]
#[clap(
    name = "floodgate",
    about = "Adaptive admission control for outbound marketplace API traffic",
    rename_all = "kebab-case",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the limiter's background loops and report status until stopped
    Run {
        /// YAML configuration file; FLOODGATE__* environment variables override it
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "pretty")]
        log_format: LogFormat,
        /// Seconds between status reports
        #[arg(long, default_value_t = 30)]
        status_interval_secs: u64,
    },
    /// Validate a configuration file and exit
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Copy, Clone, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Run {
            config,
            log_format,
            status_interval_secs,
        } => {
            init_tracing(log_format);
            run(config, Duration::from_secs(status_interval_secs.max(1))).await
        }
        Command::CheckConfig { config } => {
            init_tracing(LogFormat::Pretty);
            let loaded = FloodgateConfig::load(Some(&config))
                .with_context(|| format!("invalid configuration in {}", config.display()))?;
            info!(
                classes = loaded.classes.len(),
                queue_capacity = loaded.queue.capacity,
                failure_policy = ?loaded.failure_policy,
                "Configuration is valid"
            );
            Ok(())
        }
    }
}

async fn run(config_path: Option<PathBuf>, status_interval: Duration) -> anyhow::Result<()> {
    info!("Starting Floodgate admission controller");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = FloodgateConfig::load(config_path.as_deref()).context("failed to load configuration")?;
    let limiter = RateLimiter::new(config)?;
    limiter.start();

    let mut ticker = tokio::time::interval(status_interval);
    ticker.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                match serde_json::to_string(&limiter.status(None, None)) {
                    Ok(status) => info!(status = %status, "Limiter status"),
                    Err(e) => error!(error = %e, "Failed to serialize limiter status"),
                }
            }
        }
    }

    limiter.shutdown().await;
    info!("Floodgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
