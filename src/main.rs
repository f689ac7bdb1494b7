use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use keyrate::clock::SystemClock;
use keyrate::config::KeyrateConfig;
use keyrate::ratelimit::KeyRateConfig;
use keyrate::server::{spawn_rules_watcher, Gateway, GatewayServer};
use keyrate::store::InMemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Key-scoped rate limiting gateway.
#[derive(Debug, Parser)]
#[command(name = "keyrate", version, about)]
struct Args {
    /// Service configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Rate limit rules file, overrides limiter.rules_path
    #[arg(short, long)]
    rules: Option<String>,

    /// HTTP listen address, overrides server.listen_addr
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Number of workers, overrides limiter.workers
    #[arg(short, long)]
    workers: Option<usize>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match args.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting Keyrate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = KeyrateConfig::load(args.config.as_deref())?;
    if let Some(rules) = args.rules {
        config.limiter.rules_path = Some(rules);
    }
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(workers) = args.workers {
        config.limiter.workers = workers;
    }
    config.validate()?;
    info!(listen_addr = %config.server.listen_addr, workers = config.limiter.workers, "Configuration loaded");

    let rules_path = PathBuf::from(config.limiter.rules_path.clone().unwrap_or_default());
    let rules = KeyRateConfig::from_file(&rules_path)?;

    let gateway = Arc::new(
        Gateway::start(
            Arc::new(InMemoryStore::new()),
            Arc::new(SystemClock),
            &rules,
            config.limiter.settings(),
            config.limiter.workers,
        )
        .await?,
    );

    let mut tasks = gateway.spawn_refill_tasks(config.limiter.refill_tick());
    if let Some(interval) = config.limiter.reload_interval() {
        info!(path = %rules_path.display(), ?interval, "Watching rules file");
        tasks.push(spawn_rules_watcher(gateway.clone(), rules_path, interval));
    }

    let server = GatewayServer::new(config.server.listen_addr, gateway);
    let result = server.serve_with_shutdown(shutdown_signal()).await;

    for task in &tasks {
        task.abort();
    }

    if let Err(e) = &result {
        error!(error = %e, "Keyrate stopped with an error");
    }
    result?;

    info!("Keyrate Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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
