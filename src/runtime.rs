//! Process-wide forwarder context.
//!
//! # Responsibilities
//! - Own every piece of shared state: configuration, supervisor, connection
//!   cache, response header table, port probe and shutdown coordinator
//! - Apply configuration changes (swap and recycle)
//! - Tear everything down on shutdown
//!
//! # Design Decisions
//! - Built once at startup and passed around as `Arc<ProxyRuntime>`; no
//!   module-level globals
//! - Configuration is read lock-free through `ArcSwap`

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use crate::config::schema::ForwarderConfig;
use crate::connection::ConnectionCache;
use crate::forwarding::response_headers::ResponseHeaderTable;
use crate::lifecycle::Shutdown;
use crate::process::{PortProbe, ProcessManager};
use crate::resilience::circuit_breaker::RAPID_FAIL_WINDOW;

pub struct ProxyRuntime {
    config: ArcSwap<ForwarderConfig>,
    manager: Arc<ProcessManager>,
    cache: Arc<ConnectionCache>,
    header_table: ResponseHeaderTable,
    probe: PortProbe,
    shutdown: Shutdown,
    started_at: Instant,
}

impl ProxyRuntime {
    pub fn new(config: ForwarderConfig) -> Arc<Self> {
        Self::with_rapid_fail_window(config, RAPID_FAIL_WINDOW)
    }

    /// Runtime whose rapid-fail breaker uses `window` instead of one minute.
    pub fn with_rapid_fail_window(config: ForwarderConfig, window: Duration) -> Arc<Self> {
        let probe = PortProbe::detect();
        let cache = ConnectionCache::new(config.protocol.keep_alive);
        let manager = ProcessManager::with_rapid_fail_window(
            Arc::new(config.application.clone()),
            probe,
            Arc::clone(&cache),
            window,
        );
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            manager,
            cache,
            header_table: ResponseHeaderTable::new(),
            probe,
            shutdown: Shutdown::new(),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> Arc<ForwarderConfig> {
        self.config.load_full()
    }

    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    pub fn header_table(&self) -> &ResponseHeaderTable {
        &self.header_table
    }

    pub fn probe(&self) -> PortProbe {
        self.probe
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Swap in a new validated configuration and recycle the backends.
    ///
    /// Returns the number of processes retired. Ignored once shutdown began.
    pub async fn apply_config(&self, config: ForwarderConfig) -> usize {
        if self.shutdown.is_triggered() {
            tracing::debug!("Shutting down, configuration change ignored");
            return 0;
        }
        let application = Arc::new(config.application.clone());
        self.cache.set_keep_alive(config.protocol.keep_alive);
        self.config.store(Arc::new(config));
        let retired = self.manager.recycle(Some(application)).await;
        tracing::info!(retired, "Configuration applied, application recycled");
        retired
    }

    /// Recycle the application with the current configuration.
    pub async fn recycle(&self) -> usize {
        self.manager.recycle(None).await
    }

    /// Stop accepting work and stop every backend process.
    pub async fn shutdown_backends(&self) {
        self.shutdown.trigger();
        self.manager.shutdown().await;
        tracing::info!("All backend processes stopped");
    }
}
