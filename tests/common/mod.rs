//! Shared utilities for the integration tests.
//!
//! The supervised application is the `mock-backend` binary built alongside
//! the tests; `MOCK_BACKEND_MODE` in its environment selects how it misbehaves.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aspnetcore_forwarder::{ForwarderConfig, HttpServer, ProxyRuntime};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const MOCK_BACKEND: &str = env!("CARGO_BIN_EXE_mock-backend");

/// Configuration supervising one mock backend in `mode`.
pub fn test_config(mode: &str) -> ForwarderConfig {
    let mut config = ForwarderConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.listener.server_header = Some("forwarder-test".to_string());

    let app = &mut config.application;
    app.process_path = MOCK_BACKEND.to_string();
    app.startup_time_limit_secs = 10;
    app.shutdown_time_limit_secs = 2;
    app.signal_time_limit_secs = 1;
    app.request_timeout_secs = 10;
    if !mode.is_empty() {
        app.environment.insert("MOCK_BACKEND_MODE".to_string(), mode.to_string());
    }
    config
}

/// A forwarder serving on an ephemeral port.
pub struct TestForwarder {
    pub addr: SocketAddr,
    pub runtime: Arc<ProxyRuntime>,
    server: JoinHandle<()>,
}

impl TestForwarder {
    pub async fn start(config: ForwarderConfig) -> Self {
        Self::start_with_runtime(ProxyRuntime::new(config)).await
    }

    pub async fn start_with_runtime(runtime: Arc<ProxyRuntime>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(Arc::clone(&runtime));
        let stop = runtime.shutdown().signalled();
        let server = tokio::spawn(async move {
            server.run(listener, stop).await.unwrap();
        });
        Self { addr, runtime, server }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop the front end and every backend process.
    pub async fn stop(self) {
        self.runtime.shutdown_backends().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server).await;
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}

/// Start a raw TCP backend that answers every request with `response`
/// verbatim and then closes the connection. Returns its port.
pub async fn start_raw_backend(response: &'static [u8]) -> u16 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => request.extend_from_slice(&buf[..n]),
                            }
                        }
                        let _ = socket.write_all(response).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    port
}
