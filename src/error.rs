//! Error taxonomy for the supervisor and the forwarding engine.
//!
//! Supervisor failures are classified so the caller can decide between a
//! retry, an immediate rejection, or a 502/503 answer. Forwarding failures
//! carry enough context to pick the client-visible status once, before any
//! response headers have gone out.

use std::io;

use axum::http::StatusCode;

/// Failures raised while obtaining or running a backend process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Shutdown is in progress; no new process will be handed out.
    #[error("application is shutting down")]
    ApplicationExiting,

    /// Rapid-fail threshold reached within the rolling window.
    #[error("application disabled after {failures} failures within a minute")]
    ServerDisabled { failures: usize },

    /// All start attempts failed.
    #[error("failed to create backend process after {attempts} attempt(s): {last}")]
    CreateFailed { attempts: u32, last: Box<ProcessError> },

    /// Configuration that no retry can fix.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No free port could be found in the allowed range.
    #[error("no free port available in range {min}..={max}")]
    PortExhausted { min: u16, max: u16 },

    /// The OS refused to launch the executable.
    #[error("failed to launch {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The process exited before it started listening on its port.
    #[error("process {pid} exited with {status} before listening on port {port}")]
    ExitedBeforeListening { pid: u32, port: u16, status: String },

    /// The process did not start listening within the startup time limit.
    #[error("process {pid} did not listen on port {port} within {secs}s")]
    StartupTimeout { pid: u32, port: u16, secs: u64 },

    /// Another process took the port before the backend could bind it.
    #[error("port {port} is owned by unrelated process {owner}")]
    PortOwnedByOtherProcess { port: u16, owner: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// Failures that must not be retried.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ProcessError::InvalidConfig(_)
                | ProcessError::PortExhausted { .. }
                | ProcessError::ApplicationExiting
                | ProcessError::ServerDisabled { .. }
        ) || matches!(self, ProcessError::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound
            || source.kind() == io::ErrorKind::PermissionDenied)
    }
}

/// Failures raised while forwarding one request.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The client went away; nothing more is sent to it.
    #[error("client disconnected")]
    ClientDisconnected,

    /// The client reset the connection while its request was being read.
    #[error("client connection reset: {0}")]
    ClientReset(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Connecting to the backend port failed.
    #[error("backend unreachable on port {port}: {source}")]
    BackendUnreachable {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The backend produced bytes that are not a valid HTTP response.
    #[error("invalid response from backend: {0}")]
    InvalidServerResponse(String),

    /// Reading the client's request body failed.
    #[error("failed to read request body: {0}")]
    RequestBody(String),

    /// A backend operation exceeded the request timeout.
    #[error("backend operation timed out")]
    Timeout,

    /// Any other transport failure talking to the backend.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl ForwardError {
    /// Status to answer with when response headers have not been sent yet.
    ///
    /// Returns `None` when there is nobody left to answer.
    pub fn client_status(&self) -> Option<StatusCode> {
        match self {
            ForwardError::ClientDisconnected => None,
            ForwardError::ClientReset(_) | ForwardError::RequestBody(_) => Some(StatusCode::BAD_REQUEST),
            ForwardError::Process(ProcessError::ApplicationExiting) => Some(StatusCode::SERVICE_UNAVAILABLE),
            ForwardError::Process(_) => Some(StatusCode::BAD_GATEWAY),
            // Backend resets included: only the client side maps to 400.
            _ => Some(StatusCode::BAD_GATEWAY),
        }
    }

    /// Human-readable description sent with a 502.
    ///
    /// Transport failures carry the OS description; anything else gets a
    /// generic text.
    pub fn description(&self) -> String {
        match self {
            ForwardError::BackendUnreachable { source, .. } => source.to_string(),
            ForwardError::Transport(e) => e.to_string(),
            ForwardError::Timeout => "The operation timed out".to_string(),
            ForwardError::InvalidServerResponse(_) => "The server returned an invalid or unrecognized response".to_string(),
            ForwardError::Process(ProcessError::ApplicationExiting) => "The application is shutting down".to_string(),
            _ => "Bad Gateway".to_string(),
        }
    }

    /// Unparseable backend output resets the client connection instead of
    /// producing a clean error response.
    pub fn requires_reset(&self) -> bool {
        matches!(self, ForwardError::InvalidServerResponse(_))
    }

    /// Whether the failure happened while starting the backend.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            ForwardError::Process(e) if !matches!(e, ProcessError::ApplicationExiting)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ForwardError::ClientDisconnected.client_status(), None);
        assert_eq!(
            ForwardError::ClientReset("reset".into()).client_status(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            ForwardError::Process(ProcessError::ApplicationExiting).client_status(),
            Some(StatusCode::SERVICE_UNAVAILABLE)
        );
        assert_eq!(
            ForwardError::Process(ProcessError::ServerDisabled { failures: 10 }).client_status(),
            Some(StatusCode::BAD_GATEWAY)
        );
        assert_eq!(ForwardError::Timeout.client_status(), Some(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn backend_resets_are_bad_gateway() {
        for kind in [io::ErrorKind::ConnectionReset, io::ErrorKind::ConnectionAborted, io::ErrorKind::BrokenPipe] {
            assert_eq!(
                ForwardError::Transport(io::Error::from(kind)).client_status(),
                Some(StatusCode::BAD_GATEWAY)
            );
        }
    }

    #[test]
    fn only_invalid_responses_reset() {
        assert!(ForwardError::InvalidServerResponse("garbage".into()).requires_reset());
        assert!(!ForwardError::Timeout.requires_reset());
    }

    #[test]
    fn critical_classification() {
        assert!(ProcessError::InvalidConfig("bad".into()).is_critical());
        assert!(ProcessError::PortExhausted { min: 1025, max: 48000 }.is_critical());
        assert!(ProcessError::Spawn {
            path: "x".into(),
            source: io::Error::from(io::ErrorKind::NotFound)
        }
        .is_critical());
        assert!(!ProcessError::StartupTimeout { pid: 1, port: 5000, secs: 1 }.is_critical());
        assert!(!ProcessError::ExitedBeforeListening {
            pid: 1,
            port: 5000,
            status: "exit status: 1".into()
        }
        .is_critical());
    }
}
