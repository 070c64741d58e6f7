//! OS signal handling.
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP reloads the config file, it never shuts down

use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::load_config;
use crate::runtime::ProxyRuntime;

/// Resolves on Ctrl-C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Reload `path` on every SIGHUP until shutdown.
#[cfg(unix)]
pub fn spawn_reload_on_hangup(runtime: Arc<ProxyRuntime>, path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGHUP handler, reload on signal disabled");
            return;
        }
    };
    let stop = runtime.shutdown().signalled();

    tokio::spawn(async move {
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match load_config(&path) {
                        Ok(config) => {
                            runtime.apply_config(config).await;
                        }
                        Err(e) => tracing::error!(path = ?path, error = %e, "Reload on SIGHUP failed, keeping current configuration"),
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_reload_on_hangup(_runtime: Arc<ProxyRuntime>, _path: PathBuf) {}
