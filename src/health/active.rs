//! Active readiness checking for a freshly launched backend.
//!
//! # Responsibilities
//! - Poll the backend's port until something listens on it
//! - Fail fast when the process exits first
//! - Enforce the startup time limit (suspended while a debugger is attached)
//!
//! # Design Decisions
//! - Polls every 200 ms; an exit notification interrupts the wait immediately
//! - A probe error other than "connection refused" is a real failure

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};

use crate::error::ProcessError;
use crate::health::passive::ExitInfo;
use crate::process::platform;
use crate::process::port::{Listening, PortProbe};

/// Delay between readiness probes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// What the readiness check needs to know about the launched process.
pub struct ReadinessCheck<'a> {
    pub probe: PortProbe,
    pub port: u16,
    pub pid: u32,
    pub startup_limit: Duration,
    pub exit: &'a mut watch::Receiver<Option<ExitInfo>>,
}

impl ReadinessCheck<'_> {
    /// Wait until the port listens. Returns the owning pid when the probe can
    /// tell, after checking it belongs to the launched process tree.
    pub async fn wait(mut self) -> Result<Option<u32>, ProcessError> {
        let started = Instant::now();

        loop {
            if let Some(info) = self.exit.borrow().as_ref() {
                return Err(ProcessError::ExitedBeforeListening {
                    pid: self.pid,
                    port: self.port,
                    status: info.status.clone(),
                });
            }

            match self.probe.probe(self.port).await? {
                Listening::Yes { owner } => return self.verify_owner(owner),
                Listening::No => {}
            }

            // A debugger pauses the clock.
            if !platform::debugger_attached(self.pid) && started.elapsed() >= self.startup_limit {
                return Err(ProcessError::StartupTimeout {
                    pid: self.pid,
                    port: self.port,
                    secs: self.startup_limit.as_secs(),
                });
            }

            pause(&mut *self.exit).await;
        }
    }

    fn verify_owner(&self, owner: Option<u32>) -> Result<Option<u32>, ProcessError> {
        match owner {
            Some(owner) if !platform::is_same_or_descendant(owner, self.pid) => {
                Err(ProcessError::PortOwnedByOtherProcess { port: self.port, owner })
            }
            other => Ok(other),
        }
    }
}

/// Wait one poll interval, cut short when the exit status changes. A closed
/// exit channel no longer interrupts anything.
async fn pause(exit: &mut watch::Receiver<Option<ExitInfo>>) {
    tokio::select! {
        _ = time::sleep(POLL_INTERVAL) => {}
        changed = exit.changed() => {
            if changed.is_err() {
                time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}
