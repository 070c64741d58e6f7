//! Backend process supervisor.
//!
//! # Responsibilities
//! - Map each request to a ready backend process (round robin over the pool)
//! - (Re)create processes on demand, behind the rapid-fail breaker
//! - Tear slots down on crash, recycle and shutdown
//!
//! # Design Decisions
//! - Fast path takes the pool read lock only; creation happens under the
//!   write lock so one slot is never launched twice concurrently
//! - The stopping flag is an atomic, checked before any lock
//! - Retired processes are stopped in the background; requests that still
//!   hold one keep it alive until they finish

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use tokio::sync::RwLock;

use crate::config::schema::ApplicationConfig;
use crate::connection::ConnectionCache;
use crate::error::ProcessError;
use crate::observability::metrics;
use crate::process::platform;
use crate::process::pool::{ProcessPool, RoundRobin};
use crate::process::port::{Listening, PortProbe};
use crate::process::server::{LaunchContext, ProcessSnapshot, ServerProcess};
use crate::process::state::ProcessState;
use crate::resilience::backoff::LaunchBackoff;
use crate::resilience::circuit_breaker::RAPID_FAIL_WINDOW;
use crate::resilience::{RapidFailBreaker, StartRetryPolicy};

/// Base and cap for the delay between launch attempts.
const LAUNCH_BACKOFF: LaunchBackoff = LaunchBackoff::new(Duration::from_millis(100), Duration::from_secs(1));

pub struct ProcessManager {
    self_ref: Weak<ProcessManager>,
    config: ArcSwap<ApplicationConfig>,
    pool: RwLock<ProcessPool>,
    round_robin: RoundRobin,
    stopping: AtomicBool,
    breaker: RapidFailBreaker,
    retry: StartRetryPolicy,
    cache: Arc<ConnectionCache>,
    probe: PortProbe,
    launches: AtomicU64,
}

impl ProcessManager {
    pub fn new(config: Arc<ApplicationConfig>, probe: PortProbe, cache: Arc<ConnectionCache>) -> Arc<Self> {
        Self::with_rapid_fail_window(config, probe, cache, RAPID_FAIL_WINDOW)
    }

    pub fn with_rapid_fail_window(
        config: Arc<ApplicationConfig>,
        probe: PortProbe,
        cache: Arc<ConnectionCache>,
        window: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            pool: RwLock::new(ProcessPool::new(config.processes_per_application)),
            breaker: RapidFailBreaker::with_window(config.rapid_fails_per_minute, window),
            config: ArcSwap::new(config),
            round_robin: RoundRobin::new(),
            stopping: AtomicBool::new(false),
            retry: StartRetryPolicy::default(),
            cache,
            probe,
            launches: AtomicU64::new(0),
        })
    }

    /// A ready backend process for the next request.
    pub async fn get_process(&self, websocket_supported: bool) -> Result<Arc<ServerProcess>, ProcessError> {
        if self.is_stopping() {
            return Err(ProcessError::ApplicationExiting);
        }

        let index = {
            let pool = self.pool.read().await;
            let index = self.round_robin.next_index(pool.len());
            if let Some(process) = pool.ready(index) {
                return Ok(process);
            }
            index
        };

        let mut pool = self.pool.write().await;
        if self.is_stopping() {
            return Err(ProcessError::ApplicationExiting);
        }
        // The pool may have been resized while the lock was released.
        let index = index % pool.len();
        if let Some(process) = pool.ready(index) {
            return Ok(process);
        }
        if let Some(stale) = pool.take(index) {
            tracing::info!(slot = index, pid = stale.pid(), state = ?stale.state(), "Replacing backend process that is not ready");
            self.retire(stale);
        }

        if let Some(failures) = self.breaker.check() {
            metrics::record_rapid_fail_trip();
            tracing::error!(
                slot = index,
                failures,
                app_path = %self.config.load().app_path,
                "Rapid-fail threshold reached, not starting backend process"
            );
            return Err(ProcessError::ServerDisabled { failures });
        }

        let config = self.config.load_full();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let generation = self.launches.fetch_add(1, Ordering::Relaxed) + 1;
            let launched = ServerProcess::launch(LaunchContext {
                config: &config,
                probe: self.probe,
                cache: &self.cache,
                slot: index,
                generation,
                websocket_supported,
            })
            .await;

            match launched {
                Ok(process) => {
                    pool.put(index, process.clone());
                    metrics::set_ready_processes(pool.ready_count());
                    self.watch_exit(&process);
                    return Ok(process);
                }
                Err(_) if self.is_stopping() => return Err(ProcessError::ApplicationExiting),
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    let delay = LAUNCH_BACKOFF.delay(attempt);
                    tracing::warn!(slot = index, attempt, error = %e, delay = ?delay, "Retrying backend launch");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let failures = self.breaker.record_failure();
                    tracing::error!(
                        slot = index,
                        attempt,
                        failures,
                        app_path = %config.app_path,
                        command = %config.command_line(),
                        error = %e,
                        "Failed to create backend process"
                    );
                    return Err(if e.is_critical() {
                        e
                    } else {
                        ProcessError::CreateFailed {
                            attempts: attempt,
                            last: Box::new(e),
                        }
                    });
                }
            }
        }
    }

    /// Called once a process has exited. Tears its slot down unless the
    /// port turns out to be served by the same process tree after all.
    pub async fn handle_process_exit(&self, process: &Arc<ServerProcess>) {
        if self.is_stopping() {
            return;
        }
        if matches!(process.state(), ProcessState::Stopping | ProcessState::Stopped) {
            return;
        }

        if let Ok(Listening::Yes { owner: Some(owner) }) = self.probe.probe(process.port()).await {
            if owner == process.listener_pid() && platform::is_alive(owner) {
                tracing::debug!(pid = process.pid(), port = process.port(), "Port still served by backend tree");
                return;
            }
        }

        let removed = {
            let mut pool = self.pool.write().await;
            let removed = pool.remove(process);
            metrics::set_ready_processes(pool.ready_count());
            removed
        };

        if removed.is_some() {
            let failures = self.breaker.record_failure();
            metrics::record_process_crash();
            let config = self.config.load();
            tracing::error!(
                slot = process.slot(),
                pid = process.pid(),
                port = process.port(),
                status = %process.exit_status().unwrap_or_default(),
                failures,
                app_path = %config.app_path,
                command = %config.command_line(),
                "Backend process exited unexpectedly"
            );
        }
        process.stop().await;
    }

    /// A request could not connect to `process`. If the port no longer
    /// listens the slot is torn down so the next request relaunches it.
    pub async fn report_unreachable(&self, process: &Arc<ServerProcess>) {
        if process.is_exited() {
            self.handle_process_exit(process).await;
            return;
        }
        if !matches!(self.probe.probe(process.port()).await, Ok(Listening::No)) {
            return;
        }

        let removed = self.pool.write().await.remove(process);
        if let Some(process) = removed {
            tracing::warn!(slot = process.slot(), pid = process.pid(), port = process.port(), "Backend stopped listening, recycling slot");
            self.retire(process);
        }
    }

    /// Stop every process and refuse new ones. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let processes = {
            let mut pool = self.pool.write().await;
            let size = pool.len();
            pool.drain(size)
        };
        tracing::info!(count = processes.len(), "Stopping backend processes");
        join_all(processes.iter().map(|p| p.stop())).await;
        metrics::set_ready_processes(0);
    }

    /// Tear every slot down so the next requests relaunch, optionally with a
    /// new configuration. Returns the number of processes retired.
    pub async fn recycle(&self, config: Option<Arc<ApplicationConfig>>) -> usize {
        if let Some(config) = config {
            self.breaker.set_threshold(config.rapid_fails_per_minute);
            self.config.store(config);
        }
        let size = self.config.load().processes_per_application;
        let processes = self.pool.write().await.drain(size);
        self.breaker.reset();
        metrics::set_ready_processes(0);

        let count = processes.len();
        tracing::info!(count, pool_size = size, "Recycling backend processes");
        for process in processes {
            self.retire(process);
        }
        count
    }

    pub async fn snapshot(&self) -> Vec<ProcessSnapshot> {
        self.pool.read().await.occupants().map(|p| p.snapshot()).collect()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Launch attempts made so far.
    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    pub fn rapid_fail_count(&self) -> usize {
        self.breaker.failure_count()
    }

    pub fn config(&self) -> Arc<ApplicationConfig> {
        self.config.load_full()
    }

    fn retire(&self, process: Arc<ServerProcess>) {
        tokio::spawn(async move {
            process.stop().await;
        });
    }

    fn watch_exit(&self, process: &Arc<ServerProcess>) {
        let mut exit = process.exit_receiver();
        let process = Arc::downgrade(process);
        let manager = self.self_ref.clone();
        tokio::spawn(async move {
            if exit.wait_for(|e| e.is_some()).await.is_err() {
                return;
            }
            let (Some(manager), Some(process)) = (manager.upgrade(), process.upgrade()) else {
                return;
            };
            manager.handle_process_exit(&process).await;
        });
    }
}
