//! Replay of backend response headers onto the client response.
//!
//! # Design Decisions
//! - Standard headers needing special treatment are looked up in one table
//!   built at startup and owned by the runtime
//! - Framing headers are consumed here; the front end re-derives framing
//! - Header lines that are not valid HTTP tokens/values are skipped

use std::collections::HashMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::connection::RawResponseHead;
use crate::forwarding::rewrite::ReverseRewriter;

/// Special handling for one response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRule {
    /// Never forwarded.
    Drop,
    /// Consumed to learn whether the body is chunked.
    TransferEncoding,
    /// Forwarded for 101 responses or when it asks to close.
    Connection,
    /// Forwarded only with a 101.
    Upgrade,
    /// Forwarded; captured for body framing except for HEAD.
    ContentLength,
    /// Forwarded; presence replaces the host default.
    Server,
    /// Absolute URL subject to reverse rewrite.
    Url,
    /// Cookie subject to domain rewrite.
    SetCookie,
}

/// Lookup table for standard response headers.
#[derive(Debug)]
pub struct ResponseHeaderTable {
    rules: HashMap<&'static str, HeaderRule>,
}

impl Default for ResponseHeaderTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseHeaderTable {
    pub fn new() -> Self {
        let rules = HashMap::from([
            ("transfer-encoding", HeaderRule::TransferEncoding),
            ("date", HeaderRule::Drop),
            ("keep-alive", HeaderRule::Drop),
            ("proxy-connection", HeaderRule::Drop),
            ("trailer", HeaderRule::Drop),
            ("connection", HeaderRule::Connection),
            ("upgrade", HeaderRule::Upgrade),
            ("content-length", HeaderRule::ContentLength),
            ("server", HeaderRule::Server),
            ("location", HeaderRule::Url),
            ("content-location", HeaderRule::Url),
            ("set-cookie", HeaderRule::SetCookie),
        ]);
        Self { rules }
    }

    pub fn rule(&self, name: &str) -> Option<HeaderRule> {
        self.rules.get(name).copied()
    }

    /// Translate a parsed backend head into client response parts.
    pub fn replay(&self, head: &RawResponseHead, head_request: bool, rewriter: Option<&ReverseRewriter>) -> ReplayedHead {
        let mut replayed = ReplayedHead {
            status: StatusCode::from_u16(head.status).unwrap_or(StatusCode::BAD_GATEWAY),
            headers: HeaderMap::with_capacity(head.headers.len()),
            content_length: None,
            chunked: false,
            server_present: false,
            connection_close: false,
        };
        let upgrade = head.status == 101;

        for (raw_name, raw_value) in &head.headers {
            let Ok(name) = HeaderName::from_bytes(raw_name.as_bytes()) else {
                tracing::debug!(header = %raw_name, "Skipping invalid backend header name");
                continue;
            };
            let Ok(mut value) = HeaderValue::from_bytes(raw_value) else {
                tracing::debug!(header = %raw_name, "Skipping invalid backend header value");
                continue;
            };

            match self.rule(name.as_str()) {
                Some(HeaderRule::Drop) => continue,
                Some(HeaderRule::TransferEncoding) => {
                    if contains_token(&value, "chunked") {
                        replayed.chunked = true;
                    }
                    continue;
                }
                Some(HeaderRule::Connection) => {
                    let close = contains_token(&value, "close");
                    replayed.connection_close |= close;
                    if !upgrade && !close {
                        continue;
                    }
                }
                Some(HeaderRule::Upgrade) if !upgrade => continue,
                Some(HeaderRule::ContentLength) => {
                    if !head_request {
                        replayed.content_length = value.to_str().ok().and_then(|v| v.trim().parse().ok());
                    }
                }
                Some(HeaderRule::Server) => replayed.server_present = true,
                Some(HeaderRule::Url) => {
                    if let Some(rewritten) = rewriter.and_then(|r| value.to_str().ok().and_then(|v| r.rewrite_url(v))) {
                        value = HeaderValue::from_str(&rewritten).unwrap_or(value);
                    }
                }
                Some(HeaderRule::SetCookie) => {
                    if let Some(rewritten) =
                        rewriter.and_then(|r| value.to_str().ok().and_then(|v| r.rewrite_set_cookie(v)))
                    {
                        value = HeaderValue::from_str(&rewritten).unwrap_or(value);
                    }
                }
                Some(HeaderRule::Upgrade) | None => {}
            }
            replayed.headers.append(name, value);
        }

        if replayed.chunked {
            // Chunked framing wins over a conflicting length.
            replayed.headers.remove(axum::http::header::CONTENT_LENGTH);
            replayed.content_length = None;
        }
        replayed
    }
}

/// Client response head derived from a backend response.
#[derive(Debug)]
pub struct ReplayedHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub server_present: bool,
    pub connection_close: bool,
}

fn contains_token(value: &HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}
