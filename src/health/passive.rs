//! Passive health checking (exit detection).
//!
//! # Responsibilities
//! - Own the child handle and wait for it to exit
//! - Publish the exit on a watch channel so readiness checks, shutdown
//!   escalation and the supervisor all observe it
//!
//! # Design Decisions
//! - When the socket is owned by a descendant of the launched process, the
//!   backend counts as running until that descendant is gone too

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;

use crate::process::platform;

/// Interval for polling a re-executed listener that is not our direct child.
const DESCENDANT_POLL: Duration = Duration::from_millis(500);

/// How a backend process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub status: String,
}

/// Spawn the task that waits for `child` to exit.
///
/// `listener_pid` is read after the launched process exits; a non-zero value
/// naming another live process delays the notification until it exits too.
pub fn spawn_exit_monitor(
    mut child: Child,
    listener_pid: Arc<AtomicU32>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) -> tokio::task::JoinHandle<()> {
    let pid = child.id().unwrap_or_default();
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        };

        let listener = listener_pid.load(Ordering::Acquire);
        if listener != 0 && listener != pid {
            while platform::is_alive(listener) && !exit_tx.is_closed() {
                tokio::time::sleep(DESCENDANT_POLL).await;
            }
        }

        tracing::debug!(pid, status = %status, "Backend process exited");
        let _ = exit_tx.send(Some(ExitInfo { status }));
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn exit_is_published() {
        let child = Command::new("sh").arg("-c").arg("exit 7").spawn().unwrap();
        let (tx, mut rx) = watch::channel(None);
        spawn_exit_monitor(child, Arc::new(AtomicU32::new(0)), tx);

        let info = rx.wait_for(|e| e.is_some()).await.unwrap().clone().unwrap();
        assert!(info.status.contains('7'), "{}", info.status);
    }
}
