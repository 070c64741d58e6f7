//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router with the catch-all forwarding handler
//! - Wire up middleware (request ID, tracing, default server header)
//! - Serve on a listener until the stop future resolves
//!
//! # Design Decisions
//! - Every method and path goes to the backend; the forwarder owns no routes
//! - Connection info is captured so X-Forwarded-For sees the peer address

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::forwarding::{forward_request, ForwardedResponse};
use crate::http::request::ClientInfo;
use crate::runtime::ProxyRuntime;

/// HTTP front end of the forwarder.
pub struct HttpServer {
    runtime: Arc<ProxyRuntime>,
}

impl HttpServer {
    pub fn new(runtime: Arc<ProxyRuntime>) -> Self {
        Self { runtime }
    }

    /// Build the Axum router with all middleware layers.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(forward_handler))
            .route("/{*path}", any(forward_handler))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&self.runtime),
                default_server_header,
            ))
            .with_state(Arc::clone(&self.runtime))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Serve until `stop` resolves, then drain in-flight requests.
    pub async fn run<F>(self, listener: TcpListener, stop: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app).with_graceful_shutdown(stop).await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn forward_handler(
    State(runtime): State<Arc<ProxyRuntime>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let client = ClientInfo {
        remote_addr,
        https: runtime.config().listener.https,
    };
    forward_request(runtime, client, request).await
}

/// Responses the forwarder produced itself carry the configured server
/// header. Backend responses keep whatever the backend sent, or none.
async fn default_server_header(
    State(runtime): State<Arc<ProxyRuntime>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    if response.extensions().get::<ForwardedResponse>().is_some() {
        return response;
    }
    if let Some(value) = runtime
        .config()
        .listener
        .server_header
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        response.headers_mut().entry(header::SERVER).or_insert(value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ForwarderConfig;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    fn runtime() -> Arc<ProxyRuntime> {
        let mut config = ForwarderConfig::default();
        config.application.process_path = "/nonexistent/forwarder-test-app".to_string();
        config.listener.server_header = Some("forwarder-test".to_string());
        ProxyRuntime::new(config)
    }

    fn request(path: &str) -> Request<Body> {
        let mut request = Request::builder().uri(path).body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 50000))));
        request
    }

    #[tokio::test]
    async fn generated_response_gets_server_header_and_request_id() {
        let runtime = runtime();
        let response = HttpServer::new(Arc::clone(&runtime))
            .router()
            .oneshot(request("/anything"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[header::SERVER], "forwarder-test");
        assert!(response.headers().contains_key("x-request-id"));
        runtime.shutdown_backends().await;
    }

    #[tokio::test]
    async fn stopping_runtime_answers_503() {
        let runtime = runtime();
        runtime.shutdown_backends().await;
        let response = HttpServer::new(runtime).router().oneshot(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
