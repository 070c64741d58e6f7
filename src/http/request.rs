//! Client-side request facts.
//!
//! # Responsibilities
//! - Describe the client connection (address, scheme)
//! - Carry identities established in front of the forwarder
//! - Extract the request ID and the client-facing host
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing (tower-http layer)
//! - Authentication happens upstream; its results arrive as request extensions

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, Uri};

/// Header carrying the per-request correlation ID.
pub const X_REQUEST_ID: &str = "x-request-id";

/// The client end of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub remote_addr: SocketAddr,
    pub https: bool,
}

impl ClientInfo {
    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }
}

/// Windows identity established by an authentication layer in front of the
/// forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsIdentity {
    /// Authentication scheme, e.g. `Negotiate` or `NTLM`.
    pub scheme: String,
    /// Token handle as the backend expects it (hex).
    pub token: String,
}

impl WindowsIdentity {
    /// Only Negotiate and NTLM identities carry a forwardable token.
    pub fn is_forwardable(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("negotiate") || self.scheme.eq_ignore_ascii_case("ntlm")
    }
}

/// Client certificate presented to the TLS terminator, base64-encoded DER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate(pub String);

pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Host the client addressed: the Host header, else the URI authority.
pub fn original_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
}
