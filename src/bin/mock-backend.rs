//! Stand-in for an ASP.NET Core application, used by the integration tests
//! and for local experiments.
//!
//! Behaves like an app hosted behind the forwarder: listens on
//! `ASPNETCORE_PORT`, rejects requests without the pairing token and exits
//! when the forwarder posts the shutdown event. `MOCK_BACKEND_MODE` selects
//! failure behaviour: `crash` exits at once, `hang` never listens,
//! `ignore-shutdown` acknowledges the shutdown event but keeps running,
//! `garbage` answers every request with bytes that are not HTTP, `switch`
//! answers with a 101 nobody asked for and `reset` resets every connection
//! once a request arrives.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, Method, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const TOKEN_HEADER: &str = "ms-aspnetcore-token";
const EVENT_HEADER: &str = "ms-aspnetcore-event";

#[derive(Clone)]
struct MockState {
    token: Option<Arc<str>>,
    exit_on_shutdown: bool,
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mode = std::env::var("MOCK_BACKEND_MODE").unwrap_or_default();
    match mode.as_str() {
        "crash" => std::process::exit(3),
        "hang" => loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        },
        _ => {}
    }

    let port: u16 = std::env::var("ASPNETCORE_PORT")?.parse()?;
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;
    match mode.as_str() {
        "garbage" => return serve_canned(listener, b"THIS IS NOT HTTP\r\n\r\n").await,
        "switch" => return serve_canned(listener, SWITCH).await,
        "reset" => return serve_reset(listener).await,
        _ => {}
    }

    let state = MockState {
        token: std::env::var("ASPNETCORE_TOKEN").ok().map(Arc::from),
        exit_on_shutdown: mode != "ignore-shutdown",
        port,
    };

    let app = Router::new()
        .route("/iisintegration", post(shutdown_event))
        .route("/pid", get(pid))
        .route("/ws", get(websocket_echo))
        .route("/status/{code}", any(status))
        .route("/chunked", get(chunked))
        .route("/redirect", get(redirect))
        .route("/", any(echo))
        .route("/{*path}", any(echo))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state);

    println!("mock-backend pid {} listening on port {port}", std::process::id());
    axum::serve(listener, app).await?;
    Ok(())
}

const SWITCH: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

/// Answer every request with `reply` and hang up.
async fn serve_canned(listener: TcpListener, reply: &'static [u8]) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let (mut socket, _) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(reply).await;
            let _ = socket.shutdown().await;
        });
    }
}

async fn serve_reset(listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let (mut socket, _) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            if matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {
                // Zero linger turns the close into a reset.
                let _ = socket.set_zero_linger();
            }
        });
    }
}

async fn require_token(State(state): State<MockState>, request: Request<Body>, next: Next) -> Response {
    if let Some(expected) = state.token.as_deref() {
        let presented = request.headers().get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            return (StatusCode::BAD_REQUEST, "missing or wrong pairing token").into_response();
        }
    }
    next.run(request).await
}

async fn shutdown_event(State(state): State<MockState>, headers: HeaderMap) -> StatusCode {
    let is_shutdown = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("shutdown"));
    if !is_shutdown {
        return StatusCode::BAD_REQUEST;
    }
    if state.exit_on_shutdown {
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::process::exit(0);
        });
    }
    StatusCode::ACCEPTED
}

async fn pid() -> String {
    std::process::id().to_string()
}

async fn status(Path(code): Path<u16>) -> Response {
    StatusCode::from_u16(code)
        .map(|status| (status, format!("status {code}")).into_response())
        .unwrap_or_else(|_| StatusCode::BAD_REQUEST.into_response())
}

async fn chunked() -> Body {
    let parts = ["first;", "second;", "third"];
    Body::from_stream(futures_util::stream::iter(
        parts.into_iter().map(|p| Ok::<_, std::io::Error>(Bytes::from_static(p.as_bytes()))),
    ))
}

/// Redirect and cookie naming the app's own loopback address.
async fn redirect(State(state): State<MockState>) -> Response {
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, format!("http://127.0.0.1:{}/landing?from=redirect", state.port)),
            (header::SET_COOKIE, "session=abc; Domain=localhost; Path=/".to_string()),
        ],
    )
        .into_response()
}

/// Describes the request as the application saw it.
async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<serde_json::Value> {
    let headers: BTreeMap<String, String> = headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect();
    Json(json!({
        "method": method.as_str(),
        "uri": uri.to_string(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

async fn websocket_echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(echo_frames)
}

async fn echo_frames(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let reply = match message {
            Message::Text(text) => Message::Text(text),
            Message::Binary(data) => Message::Binary(data),
            Message::Close(frame) => {
                let _ = socket.send(Message::Close(frame)).await;
                return;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if socket.send(reply).await.is_err() {
            return;
        }
    }
}
