//! Reverse rewrite of backend-host URLs.
//!
//! Backends see `127.0.0.1:<port>` (or `localhost`) as their own address and
//! sometimes leak it into redirects and cookies. When enabled, absolute
//! `Location`/`Content-Location` values and `Set-Cookie` domains pointing at
//! the backend are rewritten to the host the client addressed.

use url::Url;

#[derive(Debug, Clone)]
pub struct ReverseRewriter {
    backend_port: u16,
    client_host: String,
    client_port: Option<u16>,
    client_scheme: &'static str,
}

impl ReverseRewriter {
    /// `client_host` is the Host header value as the client sent it,
    /// optionally with a port.
    pub fn new(backend_port: u16, client_host: &str, client_scheme: &'static str) -> Self {
        let (host, port) = split_host_port(client_host);
        Self {
            backend_port,
            client_host: host.to_string(),
            client_port: port,
            client_scheme,
        }
    }

    /// Rewrite an absolute URL naming the backend. Relative or foreign URLs
    /// yield `None` and are forwarded untouched.
    pub fn rewrite_url(&self, value: &str) -> Option<String> {
        let mut url = Url::parse(value).ok()?;
        if !is_backend_host(url.host_str()?) || url.port_or_known_default() != Some(self.backend_port) {
            return None;
        }
        if url.scheme() != self.client_scheme {
            url.set_scheme(self.client_scheme).ok()?;
        }
        url.set_host(Some(&self.client_host)).ok()?;
        url.set_port(self.client_port).ok()?;
        Some(url.to_string())
    }

    /// Rewrite the `Domain` attribute of a cookie set for the backend host.
    pub fn rewrite_set_cookie(&self, value: &str) -> Option<String> {
        let mut changed = false;
        let parts: Vec<String> = value
            .split(';')
            .map(|part| {
                let trimmed = part.trim_start();
                let Some((name, domain)) = trimmed.split_once('=') else {
                    return part.to_string();
                };
                if name.trim().eq_ignore_ascii_case("domain") && is_backend_host(domain.trim().trim_start_matches('.')) {
                    changed = true;
                    let lead = &part[..part.len() - trimmed.len()];
                    format!("{lead}{}={}", name.trim(), self.client_host)
                } else {
                    part.to_string()
                }
            })
            .collect();
        changed.then(|| parts.join(";"))
    }
}

fn is_backend_host(host: &str) -> bool {
    host == "127.0.0.1" || host.eq_ignore_ascii_case("localhost") || host == "[::1]"
}

fn split_host_port(host: &str) -> (&str, Option<u16>) {
    // Bracketed IPv6 literals keep their colons.
    if let Some(end) = host.rfind(']') {
        let (addr, rest) = host.split_at(end + 1);
        return (addr, rest.strip_prefix(':').and_then(|p| p.parse().ok()));
    }
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse() {
            Ok(port) => (name, Some(port)),
            Err(_) => (host, None),
        },
        None => (host, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_pointing_at_backend_is_rewritten() {
        let rewriter = ReverseRewriter::new(5123, "www.example.com", "https");
        assert_eq!(
            rewriter.rewrite_url("http://127.0.0.1:5123/login?next=%2F").as_deref(),
            Some("https://www.example.com/login?next=%2F")
        );
        assert_eq!(
            rewriter.rewrite_url("http://localhost:5123/a").as_deref(),
            Some("https://www.example.com/a")
        );
    }

    #[test]
    fn client_port_is_kept() {
        let rewriter = ReverseRewriter::new(5123, "front.example:8443", "https");
        assert_eq!(
            rewriter.rewrite_url("http://127.0.0.1:5123/").as_deref(),
            Some("https://front.example:8443/")
        );
    }

    #[test]
    fn other_urls_are_untouched() {
        let rewriter = ReverseRewriter::new(5123, "www.example.com", "http");
        assert_eq!(rewriter.rewrite_url("/relative/path"), None);
        assert_eq!(rewriter.rewrite_url("http://other.example/"), None);
        assert_eq!(rewriter.rewrite_url("http://127.0.0.1:9999/"), None);
    }

    #[test]
    fn cookie_domain_is_rewritten() {
        let rewriter = ReverseRewriter::new(5123, "www.example.com:8080", "http");
        assert_eq!(
            rewriter.rewrite_set_cookie("id=1; Path=/; Domain=localhost; HttpOnly").as_deref(),
            Some("id=1; Path=/; Domain=www.example.com; HttpOnly")
        );
        assert_eq!(rewriter.rewrite_set_cookie("id=1; Domain=example.org"), None);
        assert_eq!(rewriter.rewrite_set_cookie("id=1"), None);
    }
}
