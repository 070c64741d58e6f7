//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Initialize all subsystems in dependency order
//! - Start background tasks (config watcher, SIGHUP reload, metrics)
//! - Bind listeners and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: configuration and bind errors are fatal
//! - Backend processes start lazily on the first request
//! - Listeners start last (traffic only when ready)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::RecommendedWatcher;
use tokio::net::TcpListener;

use crate::admin::setup_admin_router;
use crate::config::watcher::ConfigWatcher;
use crate::config::{load_config, ConfigError};
use crate::http::HttpServer;
use crate::lifecycle::signals::{spawn_reload_on_hangup, wait_for_shutdown_signal};
use crate::observability::{logging, metrics};
use crate::runtime::ProxyRuntime;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to load configuration from {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything started before traffic is accepted.
pub struct Bootstrap {
    runtime: Arc<ProxyRuntime>,
    listener: TcpListener,
    admin_listener: Option<TcpListener>,
    _watcher: Option<RecommendedWatcher>,
}

/// Bring the forwarder up from the configuration file at `config_path`.
pub async fn bootstrap(config_path: &Path) -> Result<Bootstrap, StartupError> {
    let config = load_config(config_path).map_err(|source| StartupError::Config {
        path: config_path.to_path_buf(),
        source,
    })?;

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        process_path = %config.application.process_path,
        processes = config.application.processes_per_application,
        "aspnetcore-forwarder starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address, metrics disabled"
            ),
        }
    }

    let listener = bind(&config.listener.bind_address).await?;
    let admin_listener = if config.admin.enabled {
        Some(bind(&config.admin.bind_address).await?)
    } else {
        None
    };

    let runtime = ProxyRuntime::new(config);
    let watcher = spawn_config_watcher(Arc::clone(&runtime), config_path);
    spawn_reload_on_hangup(Arc::clone(&runtime), config_path.to_path_buf());

    Ok(Bootstrap {
        runtime,
        listener,
        admin_listener,
        _watcher: watcher,
    })
}

impl Bootstrap {
    pub fn runtime(&self) -> &Arc<ProxyRuntime> {
        &self.runtime
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until Ctrl-C, SIGTERM or a programmatic shutdown, then stop
    /// every backend process.
    pub async fn run(self) -> Result<(), std::io::Error> {
        let runtime = self.runtime;

        if let Some(admin_listener) = self.admin_listener {
            let app = setup_admin_router(Arc::clone(&runtime));
            let stop = runtime.shutdown().signalled();
            tokio::spawn(async move {
                match admin_listener.local_addr() {
                    Ok(addr) => tracing::info!(address = %addr, "Admin API listening"),
                    Err(e) => tracing::warn!(error = %e, "Admin listener has no local address"),
                }
                if let Err(e) = axum::serve(admin_listener, app).with_graceful_shutdown(stop).await {
                    tracing::error!(error = %e, "Admin API server failed");
                }
            });
        }

        let stop = {
            let runtime = Arc::clone(&runtime);
            let signalled = runtime.shutdown().signalled();
            async move {
                tokio::select! {
                    _ = wait_for_shutdown_signal() => {}
                    _ = signalled => {}
                }
                runtime.shutdown().trigger();
            }
        };

        let served = HttpServer::new(Arc::clone(&runtime)).run(self.listener, stop).await;
        runtime.shutdown_backends().await;
        tracing::info!("Shutdown complete");
        served
    }
}

async fn bind(address: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(address).await.map_err(|source| StartupError::Bind {
        address: address.to_string(),
        source,
    })
}

/// Apply validated file changes until shutdown. A watcher that cannot start
/// leaves reload to SIGHUP.
fn spawn_config_watcher(runtime: Arc<ProxyRuntime>, path: &Path) -> Option<RecommendedWatcher> {
    let (watcher, mut updates) = ConfigWatcher::new(path);
    let watcher = match watcher.run() {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Config watcher unavailable, reload only on SIGHUP");
            return None;
        }
    };

    let stop = runtime.shutdown().signalled();
    tokio::spawn(async move {
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                update = updates.recv() => match update {
                    Some(config) => {
                        runtime.apply_config(config).await;
                    }
                    None => break,
                },
            }
        }
    });
    Some(watcher)
}
