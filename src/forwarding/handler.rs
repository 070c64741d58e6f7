//! Forwarding of one request to a backend process.
//!
//! # Data Flow
//! ```text
//! front end handler
//!     → get_process (supervisor)              errors → 400/502/503 answer
//!     → spawn exchange task, await the response head
//!
//! exchange task (holds the request handle lock throughout):
//!     START
//!     → SENDING_REQUEST: connect, write head, copy body (re-chunked)
//!     → RECEIVING_RESPONSE: read head, skip 1xx, replay headers
//!         → 101 on an upgrade request: RECEIVED_WEBSOCKET_RESPONSE → relay
//!         → otherwise: deliver head, pump body → DONE
//! ```
//!
//! # Design Decisions
//! - The response head crosses to the front end through a one-shot
//!   completion; once delivered, later failures only abort the body
//! - A client disconnect is a flag the exchange checks between steps and
//!   races against every backend wait
//! - Metrics are recorded when the last backend handle closes

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::config::schema::ForwarderConfig;
use crate::connection::head::read_raw_head;
use crate::connection::{ForwarderConnection, RawResponseHead};
use crate::error::ForwardError;
use crate::forwarding::body::{pump_body, BodyFraming, BodyReader, ResponseBuffer};
use crate::forwarding::chunked::{encode_chunk, FINAL_CHUNK};
use crate::forwarding::disconnect::{DisconnectNotifier, DisconnectSignal};
use crate::forwarding::handle::{HandleLock, RequestHandle};
use crate::forwarding::request_headers::{
    backend_headers, is_websocket_upgrade, request_framing, HeaderContext, RequestFraming,
};
use crate::forwarding::response_headers::ReplayedHead;
use crate::forwarding::rewrite::ReverseRewriter;
use crate::forwarding::status::{HandleTracker, RequestCompletion, RequestStatus, StatusCell};
use crate::forwarding::url::{backend_target, decode_path};
use crate::http::request::{self, ClientCertificate, ClientInfo, WindowsIdentity};
use crate::http::response::error_response;
use crate::observability::metrics;
use crate::process::ServerProcess;
use crate::resilience::OperationTimeout;
use crate::runtime::ProxyRuntime;
use crate::websocket;

/// Marks responses that came from a backend, as opposed to ones generated
/// by the forwarder itself.
#[derive(Debug, Clone, Copy)]
pub struct ForwardedResponse {
    pub server_present: bool,
}

/// Forward `request` to a backend process and return the client response.
pub async fn forward_request(runtime: Arc<ProxyRuntime>, client: ClientInfo, mut request: Request<Body>) -> Response {
    let start = Instant::now();
    let config = runtime.config();
    let request_id = request::request_id(request.headers());
    let method = request.method().clone();

    let process = match runtime.manager().get_process(config.application.websockets_enabled).await {
        Ok(process) => process,
        Err(e) => {
            let err = ForwardError::from(e);
            tracing::warn!(request_id = %request_id, error = %err, "No backend process available");
            let response = error_response(&err, &config);
            metrics::record_request(method.as_str(), response.status().as_u16(), start);
            return response;
        }
    };

    let on_upgrade = if config.application.websockets_enabled && is_websocket_upgrade(request.headers()) {
        request.extensions_mut().remove::<OnUpgrade>()
    } else {
        None
    };

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %request.uri().path(),
        port = process.port(),
        websocket = on_upgrade.is_some(),
        "Forwarding request"
    );

    let (completion, response_rx) = RequestCompletion::new();
    let signal = DisconnectSignal::new();
    let notifier = DisconnectNotifier::new(Arc::clone(&signal));

    let exchange = Exchange {
        runtime,
        config,
        process,
        client,
        request_id,
        method,
        websocket: on_upgrade.is_some(),
        completion,
        response_status: Arc::new(AtomicU16::new(0)),
        signal,
        status: StatusCell::default(),
        handle: RequestHandle::new(),
        start,
    };
    tokio::spawn(exchange.run(request, on_upgrade));

    let response = response_rx
        .await
        .unwrap_or_else(|_| (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response());
    notifier.disarm();
    response
}

struct Exchange {
    runtime: Arc<ProxyRuntime>,
    config: Arc<ForwarderConfig>,
    process: Arc<ServerProcess>,
    client: ClientInfo,
    request_id: String,
    method: Method,
    websocket: bool,
    completion: RequestCompletion<Response>,
    response_status: Arc<AtomicU16>,
    signal: Arc<DisconnectSignal>,
    status: StatusCell,
    handle: RequestHandle,
    start: Instant,
}

impl Exchange {
    async fn run(self, request: Request<Body>, on_upgrade: Option<OnUpgrade>) {
        let tracker = {
            let method = self.method.clone();
            let status = Arc::clone(&self.response_status);
            let start = self.start;
            HandleTracker::new(move || {
                metrics::record_request(method.as_str(), status.load(Ordering::Relaxed), start);
            })
        };
        let http_handle = tracker.open();

        if let Err(err) = self.execute(request, on_upgrade, &tracker).await {
            self.fail(err).await;
        }
        self.status.advance(RequestStatus::Done);
        drop(http_handle);
    }

    async fn execute(
        &self,
        request: Request<Body>,
        on_upgrade: Option<OnUpgrade>,
        tracker: &HandleTracker,
    ) -> Result<(), ForwardError> {
        let connection = self.process.connection().cloned().ok_or_else(|| {
            ForwardError::Transport(io::Error::new(io::ErrorKind::NotConnected, "backend process is not ready"))
        })?;
        let timeout = OperationTimeout::for_request(
            self.config.application.request_timeout(),
            self.process.debugger_attached(),
        );
        let (parts, body) = request.into_parts();
        let original_host = request::original_host(&parts.headers, &parts.uri);

        let mut lock = self.handle.lock().await;
        self.check_client()?;
        self.status.advance(RequestStatus::SendingRequest);
        let stream = self.guarded(timeout, connection.connect()).await?;
        lock.attach(stream);

        self.send_request(&mut lock, &parts, original_host.as_deref(), body, timeout)
            .await?;

        self.status.advance(RequestStatus::ReceivingResponse);
        let head = self.receive_head(&mut lock, timeout).await?;

        let upgraded = head.status == 101;
        if upgraded && !self.websocket {
            return Err(ForwardError::InvalidServerResponse(
                "protocol switch without an upgrade request".to_string(),
            ));
        }
        if self.websocket && !upgraded {
            tracing::debug!(
                request_id = %self.request_id,
                status = head.status,
                "Backend declined the WebSocket upgrade, continuing as HTTP"
            );
        }

        let rewriter = match (self.config.protocol.reverse_rewrite_headers, original_host.as_deref()) {
            (true, Some(host)) => Some(ReverseRewriter::new(self.process.port(), host, self.client.scheme())),
            _ => None,
        };
        let head_request = self.method == Method::HEAD;
        let replayed = self
            .runtime
            .header_table()
            .replay(&head, head_request, rewriter.as_ref());

        // A 101 was rejected above unless this request carries an upgrade.
        match on_upgrade.filter(|_| upgraded) {
            Some(on_upgrade) => self.relay_websocket(&mut lock, replayed, on_upgrade, tracker).await,
            None => {
                self.stream_body(&mut lock, replayed, head_request, timeout, connection.as_ref())
                    .await
            }
        }
    }

    async fn send_request(
        &self,
        lock: &mut HandleLock<'_>,
        parts: &Parts,
        original_host: Option<&str>,
        body: Body,
        timeout: OperationTimeout,
    ) -> Result<(), ForwardError> {
        let framing = request_framing(&parts.headers);
        let context = HeaderContext {
            protocol: &self.config.protocol,
            client: self.client,
            token: self.process.token(),
            backend_port: self.process.port(),
            original_host,
            windows_identity: parts.extensions.get::<WindowsIdentity>(),
            forward_windows_token: self.config.application.forward_windows_auth_token,
            client_certificate: parts.extensions.get::<ClientCertificate>(),
            websocket: self.websocket,
        };
        let headers = backend_headers(&parts.headers, &context);
        let target = backend_target(&decode_path(parts.uri.path()), parts.uri.query());
        let head = encode_request_head(&parts.method, &target, &headers);

        let stream = lock.stream()?;
        self.guarded(timeout, async { stream.write_all(&head).await.map_err(ForwardError::from) }).await?;

        if framing != RequestFraming::None {
            let chunked = framing == RequestFraming::Chunked;
            let mut data = body.into_data_stream();
            loop {
                let next = tokio::select! {
                    next = data.next() => next,
                    _ = self.signal.wait() => return Err(ForwardError::ClientDisconnected),
                };
                let Some(chunk) = next else { break };
                let chunk = chunk.map_err(|e| ForwardError::RequestBody(e.to_string()))?;
                if chunk.is_empty() {
                    continue;
                }
                let framed = if chunked { encode_chunk(&chunk) } else { chunk };
                self.guarded(timeout, async { stream.write_all(&framed).await.map_err(ForwardError::from) }).await?;
            }
            if chunked {
                self.guarded(timeout, async { stream.write_all(FINAL_CHUNK).await.map_err(ForwardError::from) }).await?;
            }
        }

        self.guarded(timeout, async { stream.flush().await.map_err(ForwardError::from) }).await
    }

    async fn receive_head(
        &self,
        lock: &mut HandleLock<'_>,
        timeout: OperationTimeout,
    ) -> Result<RawResponseHead, ForwardError> {
        let max_size = self.config.protocol.max_response_header_size;
        loop {
            let stream = lock.stream()?;
            let raw = self.guarded(timeout, read_raw_head(stream, max_size)).await?;
            let head = RawResponseHead::parse(&raw)?;
            if head.is_informational() {
                tracing::debug!(status = head.status, "Skipping interim backend response");
                continue;
            }
            return Ok(head);
        }
    }

    async fn relay_websocket(
        &self,
        lock: &mut HandleLock<'_>,
        replayed: ReplayedHead,
        on_upgrade: OnUpgrade,
        tracker: &HandleTracker,
    ) -> Result<(), ForwardError> {
        self.status.advance(RequestStatus::ReceivedWebSocketResponse);
        let backend = lock.take().ok_or(ForwardError::ClientDisconnected)?;
        if !self.deliver(build_response(replayed, Body::empty())) {
            return Err(ForwardError::ClientDisconnected);
        }

        let upgraded = on_upgrade
            .await
            .map_err(|e| ForwardError::ClientReset(e.to_string()))?;
        let websocket_handle = tracker.open();
        websocket::relay_upgraded(
            TokioIo::new(upgraded),
            backend,
            self.config.protocol.websocket_buffer_size,
        )
        .await;
        drop(websocket_handle);
        Ok(())
    }

    async fn stream_body(
        &self,
        lock: &mut HandleLock<'_>,
        replayed: ReplayedHead,
        head_request: bool,
        timeout: OperationTimeout,
        connection: &ForwarderConnection,
    ) -> Result<(), ForwardError> {
        let framing = BodyFraming::for_response(head_request, &replayed);
        let reusable = framing.allows_reuse() && !replayed.connection_close;

        if framing == BodyFraming::Empty {
            self.deliver(build_response(replayed, Body::empty()));
            if reusable {
                if let Some(stream) = lock.take() {
                    connection.release(stream);
                }
            }
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<Result<Bytes, io::Error>>(1);
        let body = Body::from_stream(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)));
        if !self.deliver(build_response(replayed, body)) {
            return Err(ForwardError::ClientDisconnected);
        }

        let mut reader = BodyReader::new(framing);
        let mut buffer = ResponseBuffer::new(
            self.config.protocol.min_response_buffer,
            self.config.protocol.response_buffer_limit,
        );
        let stream = lock.stream()?;
        let result = tokio::select! {
            result = pump_body(stream, &mut reader, &mut buffer, &tx, timeout) => result,
            _ = tx.closed() => Err(ForwardError::ClientDisconnected),
        };

        match result {
            Ok(bytes) => {
                tracing::debug!(request_id = %self.request_id, bytes, "Response body forwarded");
                if reusable && reader.is_finished() {
                    if let Some(stream) = lock.take() {
                        connection.release(stream);
                    }
                }
                Ok(())
            }
            Err(err) => {
                // Abort the client body so the truncation is visible.
                let abort = io::Error::new(io::ErrorKind::ConnectionAborted, err.to_string());
                let _ = tokio::time::timeout(std::time::Duration::from_secs(1), tx.send(Err(abort))).await;
                Err(err)
            }
        }
    }

    /// Hand the response to the front end. Only the first call succeeds.
    fn deliver(&self, response: Response) -> bool {
        self.response_status.store(response.status().as_u16(), Ordering::Relaxed);
        self.completion.complete(response)
    }

    async fn fail(&self, err: ForwardError) {
        if matches!(err, ForwardError::BackendUnreachable { .. }) {
            self.runtime.manager().report_unreachable(&self.process).await;
        }
        if self.handle.try_close() {
            tracing::trace!(request_id = %self.request_id, "Backend handle closed");
        }

        if self.completion.is_completed() {
            tracing::warn!(
                request_id = %self.request_id,
                stage = self.status.get().as_str(),
                error = %err,
                "Forwarding failed after the response started"
            );
            return;
        }
        if matches!(err, ForwardError::ClientDisconnected) {
            tracing::debug!(request_id = %self.request_id, stage = self.status.get().as_str(), "Client disconnected");
            return;
        }

        tracing::warn!(
            request_id = %self.request_id,
            port = self.process.port(),
            stage = self.status.get().as_str(),
            error = %err,
            "Forwarding failed"
        );
        self.deliver(error_response(&err, &self.config));
    }

    fn check_client(&self) -> Result<(), ForwardError> {
        if self.signal.is_disconnected() {
            Err(ForwardError::ClientDisconnected)
        } else {
            Ok(())
        }
    }

    /// Run one backend step under the request timeout, abandoning it when
    /// the client goes away.
    async fn guarded<T>(
        &self,
        timeout: OperationTimeout,
        step: impl Future<Output = Result<T, ForwardError>>,
    ) -> Result<T, ForwardError> {
        tokio::select! {
            result = timeout.run(step) => result,
            _ = self.signal.wait() => Err(ForwardError::ClientDisconnected),
        }
    }
}

fn build_response(replayed: ReplayedHead, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = replayed.status;
    *response.headers_mut() = replayed.headers;
    response.extensions_mut().insert(ForwardedResponse {
        server_present: replayed.server_present,
    });
    response
}

/// Serialize the HTTP/1.1 request line and headers.
pub fn encode_request_head(method: &Method, target: &str, headers: &HeaderMap) -> Bytes {
    let mut out = BytesMut::with_capacity(256);
    out.extend_from_slice(method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.freeze()
}
