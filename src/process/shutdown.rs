//! Graceful-then-forced backend shutdown.
//!
//! # Escalation
//! ```text
//! 1. POST {app_path}/iisintegration  (MS-ASPNETCORE-EVENT: shutdown + token), expect 202
//!    wait up to shutdown_time_limit for exit
//! 2. Stop signal to the process group
//!    wait up to signal_time_limit for exit
//! 3. Kill the process group
//! ```
//! Each level is skipped once the process is gone.

use std::future::Future;
use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::forwarding::request_headers::{EVENT_HEADER, TOKEN_HEADER};

/// Grace period after a forced kill before the process is reported unresponsive.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Operations the escalation drives. Implemented by the real backend process
/// and by test doubles.
pub trait ShutdownTarget: Send + Sync {
    /// Send the shutdown event. `Ok(true)` when the backend acknowledged it.
    fn send_shutdown_message(&self) -> impl Future<Output = io::Result<bool>> + Send;

    fn send_stop_signal(&self) -> io::Result<()>;

    fn kill_tree(&self) -> io::Result<()>;

    /// Resolve to `true` once the process has exited, or `false` after `timeout`.
    fn wait_for_exit(&self, timeout: Duration) -> impl Future<Output = bool> + Send;

    fn has_exited(&self) -> bool;
}

/// Time budget for each escalation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownLimits {
    pub message: Duration,
    pub signal: Duration,
}

/// How the process ended up stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    AlreadyExited,
    Graceful,
    Signaled,
    Killed,
    Unresponsive,
}

pub async fn escalate<T: ShutdownTarget>(target: &T, limits: ShutdownLimits) -> ShutdownOutcome {
    if target.has_exited() {
        return ShutdownOutcome::AlreadyExited;
    }

    match tokio::time::timeout(limits.message, target.send_shutdown_message()).await {
        Ok(Ok(true)) => {
            if target.wait_for_exit(limits.message).await {
                return ShutdownOutcome::Graceful;
            }
            tracing::warn!("Backend acknowledged shutdown but did not exit in time");
        }
        Ok(Ok(false)) => tracing::warn!("Backend rejected the shutdown message"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to send shutdown message"),
        Err(_) => tracing::warn!("Shutdown message timed out"),
    }

    if target.has_exited() {
        return ShutdownOutcome::Graceful;
    }

    match target.send_stop_signal() {
        Ok(()) => {
            if target.wait_for_exit(limits.signal).await {
                return ShutdownOutcome::Signaled;
            }
            tracing::warn!("Backend ignored the stop signal");
        }
        Err(e) => tracing::warn!(error = %e, "Failed to signal backend"),
    }

    if let Err(e) = target.kill_tree() {
        tracing::error!(error = %e, "Failed to kill backend process tree");
    }
    if target.wait_for_exit(KILL_WAIT).await {
        ShutdownOutcome::Killed
    } else {
        ShutdownOutcome::Unresponsive
    }
}

/// Send the shutdown event over a fresh loopback connection. Returns whether
/// the backend answered 202.
pub async fn send_shutdown_request(port: u16, app_path: &str, token: &str) -> io::Result<bool> {
    let client: Client<HttpConnector, Body> = Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(0)
        .build(HttpConnector::new());

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("http://127.0.0.1:{port}{}", shutdown_path(app_path)))
        .header(EVENT_HEADER, "shutdown")
        .header(TOKEN_HEADER, token)
        .header(header::CONTENT_LENGTH, "0")
        .body(Body::empty())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let response = client.request(request).await.map_err(io::Error::other)?;
    tracing::debug!(port, status = %response.status(), "Shutdown event answered");
    Ok(response.status() == StatusCode::ACCEPTED)
}

fn shutdown_path(app_path: &str) -> String {
    format!("{}/iisintegration", app_path.trim_end_matches('/'))
}
