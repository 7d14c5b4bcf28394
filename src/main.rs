use std::process::ExitCode;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use tinymemd::cache::Cache;
use tinymemd::cli::Cli;
use tinymemd::config::{self, Config};
use tinymemd::{logging, server};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let cli = Cli::parse();
    let config = match Config::load(&cli).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config file");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    info!(?config, "starting");

    let active_connections = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(Cache::new(
        config.threads,
        config.total_max_bytes(),
        active_connections.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);
    spawn_expiry_sweeper(cache.clone(), shutdown_rx.clone());

    let bind = config::bind_target(&config);
    let result = server::run(bind, cache, config.connections, active_connections, shutdown_rx).await;

    match result {
        Ok(()) => {
            info!("shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "listener failed");
            ExitCode::FAILURE
        }
    }
}

/// Installs SIGINT/SIGTERM handlers; either signals `shutdown_tx`.
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c");
        }
        let _ = shutdown_tx.send(true);
    });
}

/// Runs the periodic expiry sweep until shutdown is signaled.
fn spawn_expiry_sweeper(cache: Arc<Cache>, mut shutdown_rx: watch::Receiver<bool>) {
    const SWEEP_PERIOD: Duration = Duration::from_millis(100);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_PERIOD);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    cache.sweep_expired().await;
                }
                _ = shutdown_rx.changed() => {
                    return;
                }
            }
        }
    });
}
