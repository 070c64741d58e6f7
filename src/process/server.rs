//! One supervised backend process.
//!
//! # Responsibilities
//! - Launch the executable with its port, token and environment
//! - Wait until it listens, and confirm the listener belongs to it
//! - Expose exit notifications and the graceful-then-forced stop
//!
//! # Design Decisions
//! - A `ServerProcess` is built per launch attempt; its port never changes
//! - The process group is killed when the last reference goes away, so a
//!   request still holding the process keeps it alive past a teardown

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::schema::ApplicationConfig;
use crate::connection::{ConnectionCache, ForwarderConnection};
use crate::error::ProcessError;
use crate::health::active::ReadinessCheck;
use crate::health::passive::{spawn_exit_monitor, ExitInfo};
use crate::observability::metrics;
use crate::process::environment::LaunchSpec;
use crate::process::platform;
use crate::process::port::PortProbe;
use crate::process::shutdown::{self, ShutdownLimits, ShutdownOutcome, ShutdownTarget};
use crate::process::state::{AtomicProcessState, ProcessState};
use crate::process::stdout::StdoutLog;

/// Everything a launch needs from the supervisor.
pub struct LaunchContext<'a> {
    pub config: &'a Arc<ApplicationConfig>,
    pub probe: PortProbe,
    pub cache: &'a Arc<ConnectionCache>,
    pub slot: usize,
    pub generation: u64,
    pub websocket_supported: bool,
}

#[derive(Debug)]
pub struct ServerProcess {
    slot: usize,
    generation: u64,
    port: u16,
    token: String,
    pid: u32,
    /// Pid owning the listening socket; may be a descendant of `pid`.
    listener_pid: Arc<AtomicU32>,
    state: AtomicProcessState,
    debugger_attached: AtomicBool,
    websocket_supported: bool,
    started_at: Instant,
    config: Arc<ApplicationConfig>,
    connection: OnceLock<Arc<ForwarderConnection>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    stdout: Option<StdoutLog>,
}

/// Point-in-time view of a process, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub slot: usize,
    pub generation: u64,
    pub pid: u32,
    pub listener_pid: u32,
    pub port: u16,
    pub state: ProcessState,
    pub uptime_secs: u64,
    pub debugger_attached: bool,
    pub websocket_supported: bool,
    pub stdout_log: Option<String>,
}

impl ServerProcess {
    /// Launch one backend and wait until it is ready.
    ///
    /// On failure the launched process tree is killed before returning.
    pub async fn launch(ctx: LaunchContext<'_>) -> Result<Arc<Self>, ProcessError> {
        let config = ctx.config.clone();
        let port = ctx.probe.select_port(config.port)?;
        let token = Uuid::new_v4().to_string();
        let spec = LaunchSpec::build(&config, port, &token, ctx.websocket_supported);

        let mut command = Command::new(&spec.program);
        command.args(&spec.args).envs(&spec.env).stdin(Stdio::null());

        let stdout = if config.stdout_log_enabled {
            match StdoutLog::create(&config.stdout_log_file) {
                Ok(log) => {
                    let (out, err) = log.stdio_pair()?;
                    command.stdout(out).stderr(err);
                    Some(log)
                }
                Err(e) => {
                    tracing::warn!(
                        path = %config.stdout_log_file,
                        error = %e,
                        "Failed to create stdout log, discarding backend output"
                    );
                    command.stdout(Stdio::null()).stderr(Stdio::null());
                    None
                }
            }
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
            None
        };

        platform::isolate_process_tree(&mut command);

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            path: spec.program.clone(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("process exited before its pid was read")))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let listener_pid = Arc::new(AtomicU32::new(0));
        spawn_exit_monitor(child, listener_pid.clone(), exit_tx);

        let process = Arc::new(Self {
            slot: ctx.slot,
            generation: ctx.generation,
            port,
            token,
            pid,
            listener_pid,
            state: AtomicProcessState::new(ProcessState::NotStarted),
            debugger_attached: AtomicBool::new(false),
            websocket_supported: ctx.websocket_supported,
            started_at: Instant::now(),
            config: config.clone(),
            connection: OnceLock::new(),
            exit_rx,
            stdout,
        });
        let _ = process.state.transition(ProcessState::Starting);

        tracing::info!(
            slot = ctx.slot,
            pid,
            port,
            command = %config.command_line(),
            "Backend process launched"
        );

        let mut exit_rx = process.exit_rx.clone();
        let readiness = ReadinessCheck {
            probe: ctx.probe,
            port,
            pid,
            startup_limit: config.startup_time_limit(),
            exit: &mut exit_rx,
        }
        .wait()
        .await;

        match readiness {
            Ok(owner) => {
                let owner = owner.unwrap_or(pid);
                process.listener_pid.store(owner, Ordering::Release);
                process
                    .debugger_attached
                    .store(platform::debugger_attached(pid), Ordering::Relaxed);
                let _ = process.connection.set(ctx.cache.get_or_create(port));
                let _ = process.state.transition(ProcessState::Ready);

                metrics::record_process_start(true);
                tracing::info!(slot = ctx.slot, pid, listener_pid = owner, port, "Backend process ready");
                Ok(process)
            }
            Err(e) => {
                let _ = process.state.transition(ProcessState::Failed);
                metrics::record_process_start(false);
                tracing::error!(
                    slot = ctx.slot,
                    pid,
                    port,
                    app_path = %config.app_path,
                    command = %config.command_line(),
                    error = %e,
                    "Backend process failed to start"
                );
                process.abort().await;
                Err(e)
            }
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn listener_pid(&self) -> u32 {
        match self.listener_pid.load(Ordering::Acquire) {
            0 => self.pid,
            pid => pid,
        }
    }

    /// Per-launch token the backend expects in `MS-ASPNETCORE-TOKEN`.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state.get() == ProcessState::Ready && !self.is_exited()
    }

    pub fn is_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Re-read on every call; a debugger may attach at any time.
    pub fn debugger_attached(&self) -> bool {
        let attached = platform::debugger_attached(self.listener_pid());
        self.debugger_attached.store(attached, Ordering::Relaxed);
        attached
    }

    pub fn websocket_supported(&self) -> bool {
        self.websocket_supported
    }

    pub fn connection(&self) -> Option<&Arc<ForwarderConnection>> {
        self.connection.get()
    }

    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    pub fn exit_status(&self) -> Option<String> {
        self.exit_rx.borrow().as_ref().map(|info| info.status.clone())
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            slot: self.slot,
            generation: self.generation,
            pid: self.pid,
            listener_pid: self.listener_pid(),
            port: self.port,
            state: self.state(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            debugger_attached: self.debugger_attached.load(Ordering::Relaxed),
            websocket_supported: self.websocket_supported,
            stdout_log: self.stdout.as_ref().map(|log| log.path().display().to_string()),
        }
    }

    /// Graceful-then-forced stop. Only the first caller escalates; later
    /// callers return `None`.
    pub async fn stop(&self) -> Option<ShutdownOutcome> {
        if self.state.transition(ProcessState::Stopping).is_err() {
            return None;
        }
        let limits = ShutdownLimits {
            message: self.config.shutdown_time_limit(),
            signal: self.config.signal_time_limit(),
        };
        let outcome = shutdown::escalate(self, limits).await;
        let _ = self.state.transition(ProcessState::Stopped);

        tracing::info!(slot = self.slot, pid = self.pid, port = self.port, outcome = ?outcome, "Backend process stopped");
        if let Some(log) = &self.stdout {
            log.remove_if_empty();
        }
        Some(outcome)
    }

    /// Kill a process that never became ready.
    async fn abort(&self) {
        if self.state.transition(ProcessState::Stopping).is_err() {
            return;
        }
        if !self.has_exited() {
            if let Err(e) = self.kill_tree() {
                tracing::warn!(pid = self.pid, error = %e, "Failed to kill backend process tree");
            }
            self.wait_for_exit(Duration::from_secs(5)).await;
        }
        let _ = self.state.transition(ProcessState::Stopped);
        if let Some(log) = &self.stdout {
            log.remove_if_empty();
        }
    }
}

impl ShutdownTarget for ServerProcess {
    async fn send_shutdown_message(&self) -> io::Result<bool> {
        shutdown::send_shutdown_request(self.port, &self.config.app_path, &self.token).await
    }

    fn send_stop_signal(&self) -> io::Result<()> {
        platform::signal_process_group(self.pid)
    }

    fn kill_tree(&self) -> io::Result<()> {
        platform::kill_process_group(self.pid)?;
        let listener = self.listener_pid();
        if listener != self.pid {
            // A re-executed listener may have left the group.
            platform::kill_process(listener)?;
        }
        Ok(())
    }

    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        let exited = matches!(tokio::time::timeout(timeout, rx.wait_for(|exit| exit.is_some())).await, Ok(Ok(_)));
        exited
    }

    fn has_exited(&self) -> bool {
        self.is_exited()
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            tracing::debug!(pid = self.pid, "Killing backend process tree on release");
            if let Err(e) = self.kill_tree() {
                tracing::warn!(pid = self.pid, error = %e, "Failed to kill backend process tree");
            }
        }
    }
}
