use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::runtime::ProxyRuntime;

/// Bearer-token check against the configured admin API key. An empty key
/// locks the admin API entirely.
pub async fn admin_auth_middleware(
    State(runtime): State<Arc<ProxyRuntime>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let config = runtime.config();
    let api_key = config.admin.api_key.as_str();
    if api_key.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == api_key => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
