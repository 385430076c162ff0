//! Folio relay: admits peers into rooms and forwards their sync frames.
//!
//! Configured from the environment (a `.env` file is loaded first):
//! `HOST`, `PORT`, `ALLOWED_ORIGINS`, `RATE_LIMIT_WINDOW_MS`, `RATE_LIMIT_MAX`,
//! `SIGNALING_API_KEY`. Log level via `RUST_LOG` (default `info`).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use folio_collab::{RelayConfig, RelayServer};
use log::{error, info};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Ok(path) = dotenv {
        info!("Loaded environment from {}", path.display());
    }

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if config.api_key.is_some() {
        info!("API key required for all connections");
    }

    let server = match RelayServer::bind(config).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to bind relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    let reporter = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATS_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                let stats = server.stats().await;
                info!(
                    "{} connections in {} rooms ({} accepted, {} rejected, {} frames relayed)",
                    stats.active_connections,
                    stats.active_rooms,
                    stats.connections_accepted,
                    stats.connections_rejected,
                    stats.frames_relayed
                );
            }
        })
    };

    let result = server.run_until(shutdown_signal()).await;
    reporter.abort();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Relay stopped: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
