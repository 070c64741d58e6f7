//! Responses the forwarder generates itself.
//!
//! # Responsibilities
//! - Map forwarding failures to the client-visible answer
//! - Render the startup failure page
//! - Force a connection reset when the backend output was not HTTP
//!
//! # Design Decisions
//! - Only used before any backend response head reached the client
//! - Start failures get an HTML page unless disabled in config

use std::io;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use bytes::Bytes;

use crate::config::schema::ForwarderConfig;
use crate::error::ForwardError;

/// Answer for a request that failed before the response started.
pub fn error_response(err: &ForwardError, config: &ForwarderConfig) -> Response {
    if err.requires_reset() {
        return reset_response();
    }
    let status = err.client_status().unwrap_or(StatusCode::BAD_REQUEST);
    if err.is_startup_failure() {
        if config.application.disable_startup_error_page {
            return status.into_response();
        }
        return startup_error_page(status);
    }
    (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], err.description()).into_response()
}

/// HTML page shown when the backend application could not be started.
pub fn startup_error_page(status: StatusCode) -> Response {
    let page = format!(
        "<!DOCTYPE html>\n<html><head><title>HTTP Error {code}.5 - Process Failure</title></head>\n\
         <body><h1>HTTP Error {code}.5 - Process Failure</h1>\n\
         <p>The application process failed to start or is disabled after repeated failures.</p>\n\
         <p>Check the forwarder log and the application stdout log for details.</p>\n\
         </body></html>\n",
        code = status.as_u16()
    );
    (status, Html(page)).into_response()
}

/// A response whose body fails at once, so the front end aborts the client
/// connection instead of completing a clean answer.
pub fn reset_response() -> Response {
    let body = Body::from_stream(futures_util::stream::once(async {
        Err::<Bytes, io::Error>(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "backend returned an invalid response",
        ))
    }));
    (StatusCode::BAD_GATEWAY, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;

    #[tokio::test]
    async fn startup_failure_renders_page() {
        let config = ForwarderConfig::default();
        let err = ForwardError::Process(ProcessError::ServerDisabled { failures: 10 });
        let response = error_response(&err, &config);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("502.5"));
    }

    #[tokio::test]
    async fn startup_page_can_be_disabled() {
        let mut config = ForwarderConfig::default();
        config.application.disable_startup_error_page = true;
        let err = ForwardError::Process(ProcessError::ServerDisabled { failures: 10 });
        let response = error_response(&err, &config);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn shutting_down_is_503() {
        let config = ForwarderConfig::default();
        let err = ForwardError::Process(ProcessError::ApplicationExiting);
        assert_eq!(error_response(&err, &config).status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn invalid_backend_response_aborts_body() {
        let config = ForwarderConfig::default();
        let err = ForwardError::InvalidServerResponse("garbage".into());
        let response = error_response(&err, &config);
        assert!(axum::body::to_bytes(response.into_body(), usize::MAX).await.is_err());
    }
}
