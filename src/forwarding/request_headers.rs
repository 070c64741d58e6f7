//! Request header translation toward the backend.
//!
//! # Rules
//! - `MS-ASPNETCORE*` headers from the client are dropped (spoofing guard)
//! - Hop-by-hop headers and `Expect` are dropped; framing is re-derived
//! - The per-process token is injected; the Windows auth token when enabled
//! - X-Forwarded-For / proto / client certificate appended per policy
//! - WebSocket upgrades keep `Upgrade`/`Connection` but lose
//!   `Sec-WebSocket-Extensions`

use std::net::SocketAddr;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::config::schema::ProtocolConfig;
use crate::http::request::{ClientCertificate, ClientInfo, WindowsIdentity};

pub const TOKEN_HEADER: &str = "MS-ASPNETCORE-TOKEN";
pub const EVENT_HEADER: &str = "MS-ASPNETCORE-EVENT";
pub const WINAUTH_TOKEN_HEADER: &str = "MS-ASPNETCORE-WINAUTHTOKEN";
const INTERNAL_PREFIX: &str = "ms-aspnetcore";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "expect",
];

/// How the request body is framed on the way to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFraming {
    None,
    Length(u64),
    /// The client sent a chunked body; it is re-chunked per read.
    Chunked,
}

/// Per-request inputs for the translation.
pub struct HeaderContext<'a> {
    pub protocol: &'a ProtocolConfig,
    pub client: ClientInfo,
    pub token: &'a str,
    pub backend_port: u16,
    pub original_host: Option<&'a str>,
    pub windows_identity: Option<&'a WindowsIdentity>,
    pub forward_windows_token: bool,
    pub client_certificate: Option<&'a ClientCertificate>,
    pub websocket: bool,
}

/// Whether the request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("websocket")))
}

/// Body framing implied by the client's headers.
pub fn request_framing(headers: &HeaderMap) -> RequestFraming {
    let chunked = headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return RequestFraming::Chunked;
    }
    match headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        Some(0) | None => RequestFraming::None,
        Some(len) => RequestFraming::Length(len),
    }
}

/// Build the header block sent to the backend.
pub fn backend_headers(incoming: &HeaderMap, ctx: &HeaderContext<'_>) -> HeaderMap {
    let connection_listed = connection_tokens(incoming);
    let mut out = HeaderMap::with_capacity(incoming.len() + 6);

    for (name, value) in incoming {
        let lower = name.as_str();
        if lower.starts_with(INTERNAL_PREFIX)
            || HOP_BY_HOP.contains(&lower)
            || connection_listed.iter().any(|t| t == lower)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
        {
            continue;
        }
        if ctx.websocket && *name == header::SEC_WEBSOCKET_EXTENSIONS {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    let host = match (ctx.protocol.preserve_host_header, ctx.original_host) {
        (true, Some(host)) => HeaderValue::from_str(host).ok(),
        _ => None,
    }
    .unwrap_or_else(|| loopback_host(ctx.backend_port));
    out.insert(header::HOST, host);

    match request_framing(incoming) {
        RequestFraming::Chunked => {
            out.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        RequestFraming::Length(len) => {
            out.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        RequestFraming::None => {
            if let Some(value) = incoming.get(header::CONTENT_LENGTH) {
                out.insert(header::CONTENT_LENGTH, value.clone());
            }
        }
    }

    if ctx.websocket {
        out.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        out.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    } else if !ctx.protocol.keep_alive {
        out.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    if let Ok(token) = HeaderValue::from_str(ctx.token) {
        out.insert(HeaderName::from_static("ms-aspnetcore-token"), token);
    }

    if ctx.forward_windows_token {
        if let Some(identity) = ctx.windows_identity.filter(|id| id.is_forwardable()) {
            if let Ok(token) = HeaderValue::from_str(&identity.token) {
                out.insert(HeaderName::from_static("ms-aspnetcore-winauthtoken"), token);
            }
        }
    }

    if let Some(name) = header_name(&ctx.protocol.x_forwarded_for_header) {
        append_list(&mut out, name, &client_address(ctx.client.remote_addr, ctx.protocol.include_port_in_xff));
    }
    if let Some(name) = header_name(&ctx.protocol.ssl_header) {
        append_list(&mut out, name, ctx.client.scheme());
    }
    if let (Some(name), Some(cert)) = (header_name(&ctx.protocol.client_cert_header), ctx.client_certificate) {
        if let Ok(value) = HeaderValue::from_str(&cert.0) {
            out.insert(name, value);
        }
    }

    out
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn loopback_host(port: u16) -> HeaderValue {
    HeaderValue::from_str(&format!("127.0.0.1:{port}")).unwrap_or(HeaderValue::from_static("127.0.0.1"))
}

fn header_name(configured: &str) -> Option<HeaderName> {
    if configured.is_empty() {
        return None;
    }
    HeaderName::from_bytes(configured.as_bytes()).ok()
}

fn client_address(addr: SocketAddr, include_port: bool) -> String {
    match (addr, include_port) {
        (SocketAddr::V4(v4), true) => format!("{}:{}", v4.ip(), v4.port()),
        (SocketAddr::V6(v6), true) => format!("[{}]:{}", v6.ip(), v6.port()),
        (addr, false) => addr.ip().to_string(),
    }
}

/// Append `value` to a comma-separated list header, merging duplicates.
fn append_list(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let existing: Vec<&str> = headers
        .get_all(&name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let merged = if existing.is_empty() {
        value.to_string()
    } else {
        format!("{}, {value}", existing.join(", "))
    };
    if let Ok(merged) = HeaderValue::from_str(&merged) {
        headers.insert(name, merged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientInfo {
        ClientInfo {
            remote_addr: "203.0.113.7:50123".parse().unwrap(),
            https: true,
        }
    }

    fn ctx<'a>(protocol: &'a ProtocolConfig) -> HeaderContext<'a> {
        HeaderContext {
            protocol,
            client: client(),
            token: "process-token",
            backend_port: 5123,
            original_host: Some("www.example.com"),
            windows_identity: None,
            forward_windows_token: true,
            client_certificate: None,
            websocket: false,
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(HeaderName::from_bytes(k.as_bytes()).unwrap(), v.parse().unwrap());
        }
        map
    }

    #[test]
    fn internal_headers_are_replaced() {
        let protocol = ProtocolConfig::default();
        let incoming = headers(&[
            ("MS-ASPNETCORE-TOKEN", "forged"),
            ("ms-aspnetcore-winauthtoken", "forged"),
            ("MS-ASPNETCORE-CLIENTCERT", "forged"),
            ("Accept", "text/html"),
        ]);
        let out = backend_headers(&incoming, &ctx(&protocol));

        assert_eq!(out.get(TOKEN_HEADER).unwrap(), "process-token");
        assert!(out.get(WINAUTH_TOKEN_HEADER).is_none());
        assert!(out.get("ms-aspnetcore-clientcert").is_none());
        assert_eq!(out.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let protocol = ProtocolConfig::default();
        let incoming = headers(&[
            ("Connection", "keep-alive, X-Custom-Hop"),
            ("Keep-Alive", "timeout=5"),
            ("X-Custom-Hop", "1"),
            ("Expect", "100-continue"),
            ("Content-Length", "10"),
        ]);
        let out = backend_headers(&incoming, &ctx(&protocol));

        assert!(out.get("connection").is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get("x-custom-hop").is_none());
        assert!(out.get("expect").is_none());
        assert_eq!(out.get("content-length").unwrap(), "10");
    }

    #[test]
    fn forwarded_headers_are_appended() {
        let protocol = ProtocolConfig::default();
        let incoming = headers(&[("X-Forwarded-For", "198.51.100.1"), ("X-Forwarded-Proto", "http")]);
        let out = backend_headers(&incoming, &ctx(&protocol));

        assert_eq!(out.get("x-forwarded-for").unwrap(), "198.51.100.1, 203.0.113.7:50123");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "http, https");
        assert_eq!(out.get("host").unwrap(), "www.example.com");
    }

    #[test]
    fn host_can_point_at_backend() {
        let protocol = ProtocolConfig {
            preserve_host_header: false,
            include_port_in_xff: false,
            ..Default::default()
        };
        let out = backend_headers(&HeaderMap::new(), &ctx(&protocol));
        assert_eq!(out.get("host").unwrap(), "127.0.0.1:5123");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "203.0.113.7");
    }

    #[test]
    fn windows_token_forwarded_for_negotiate_only() {
        let protocol = ProtocolConfig::default();
        let negotiate = WindowsIdentity { scheme: "Negotiate".into(), token: "0x1f4".into() };
        let mut context = ctx(&protocol);
        context.windows_identity = Some(&negotiate);
        let out = backend_headers(&HeaderMap::new(), &context);
        assert_eq!(out.get(WINAUTH_TOKEN_HEADER).unwrap(), "0x1f4");

        context.forward_windows_token = false;
        let out = backend_headers(&HeaderMap::new(), &context);
        assert!(out.get(WINAUTH_TOKEN_HEADER).is_none());
    }

    #[test]
    fn websocket_upgrade_drops_extensions() {
        let protocol = ProtocolConfig::default();
        let incoming = headers(&[
            ("Connection", "Upgrade"),
            ("Upgrade", "websocket"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Sec-WebSocket-Extensions", "permessage-deflate"),
        ]);
        assert!(is_websocket_upgrade(&incoming));

        let mut context = ctx(&protocol);
        context.websocket = true;
        let out = backend_headers(&incoming, &context);
        assert_eq!(out.get("upgrade").unwrap(), "websocket");
        assert_eq!(out.get("connection").unwrap(), "Upgrade");
        assert!(out.get("sec-websocket-extensions").is_none());
        assert!(out.get("sec-websocket-key").is_some());
    }

    #[test]
    fn chunked_requests_are_rechunked() {
        let incoming = headers(&[("Transfer-Encoding", "chunked")]);
        assert_eq!(request_framing(&incoming), RequestFraming::Chunked);

        let protocol = ProtocolConfig::default();
        let out = backend_headers(&incoming, &ctx(&protocol));
        assert_eq!(out.get("transfer-encoding").unwrap(), "chunked");
        assert!(out.get("content-length").is_none());
    }

    #[test]
    fn client_certificate_header() {
        let protocol = ProtocolConfig::default();
        let cert = ClientCertificate("MIIBase64".into());
        let mut context = ctx(&protocol);
        context.client_certificate = Some(&cert);
        let out = backend_headers(&HeaderMap::new(), &context);
        assert_eq!(out.get("ms-aspnetcore-clientcert").unwrap(), "MIIBase64");
    }
}
