//! Response body framing and the body pump.
//!
//! # Data Flow
//! ```text
//! backend stream ──► BodyReader (length / chunked / until-close)
//!                        │  reads of at most 8 KiB
//!                        ▼
//!                  ResponseBuffer (streaming, or accumulate to threshold)
//!                        │
//!                        ▼
//!                  bounded channel ──► client response body
//! ```
//!
//! The channel holds one chunk, so a slow client stops further backend reads.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::connection::stream::{BackendStream, READ_CHUNK};
use crate::error::ForwardError;
use crate::forwarding::chunked::ChunkedDecoder;
use crate::forwarding::response_headers::ReplayedHead;
use crate::resilience::timeouts::OperationTimeout;

/// Items carried to the client body stream.
pub type BodySender = mpsc::Sender<Result<Bytes, io::Error>>;

/// How the backend delimits the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    /// No length and no chunking: the body ends when the backend closes.
    UntilClose,
}

impl BodyFraming {
    pub fn for_response(head_request: bool, replayed: &ReplayedHead) -> Self {
        let status = replayed.status.as_u16();
        if head_request || status == 204 || status == 304 || replayed.status.is_informational() {
            return BodyFraming::Empty;
        }
        if replayed.chunked {
            return BodyFraming::Chunked;
        }
        match replayed.content_length {
            Some(0) => BodyFraming::Empty,
            Some(len) => BodyFraming::Length(len),
            None => BodyFraming::UntilClose,
        }
    }

    /// Whether the connection can carry another request once the body ends.
    pub fn allows_reuse(&self) -> bool {
        !matches!(self, BodyFraming::UntilClose)
    }
}

/// Reads one response body according to its framing.
#[derive(Debug)]
pub struct BodyReader {
    framing: BodyFraming,
    remaining: u64,
    decoder: ChunkedDecoder,
    finished: bool,
}

impl BodyReader {
    pub fn new(framing: BodyFraming) -> Self {
        let remaining = match framing {
            BodyFraming::Length(len) => len,
            _ => 0,
        };
        Self {
            framing,
            remaining,
            decoder: ChunkedDecoder::new(),
            finished: matches!(framing, BodyFraming::Empty),
        }
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Whether the body ended cleanly.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next piece of the body, at most `max` bytes. `None` at the end.
    pub async fn next(&mut self, stream: &mut BackendStream, max: usize) -> Result<Option<Bytes>, ForwardError> {
        if self.finished {
            return Ok(None);
        }
        match self.framing {
            BodyFraming::Empty => Ok(None),
            BodyFraming::Length(_) => {
                let want = self.remaining.min(max as u64) as usize;
                let data = stream.read_chunk(want).await?;
                if data.is_empty() {
                    return Err(ForwardError::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "backend closed before the declared content length",
                    )));
                }
                self.remaining -= data.len() as u64;
                self.finished = self.remaining == 0;
                Ok(Some(data))
            }
            BodyFraming::Chunked => {
                let data = self.decoder.next(stream, max).await?;
                self.finished = self.decoder.is_done();
                Ok(data)
            }
            BodyFraming::UntilClose => {
                let data = stream.read_chunk(max).await?;
                if data.is_empty() {
                    self.finished = true;
                    return Ok(None);
                }
                Ok(Some(data))
            }
        }
    }
}

/// Accumulates body data until the flush threshold.
#[derive(Debug)]
pub struct ResponseBuffer {
    threshold: usize,
    pending: BytesMut,
}

impl ResponseBuffer {
    /// `min_buffer == 0` streams every read. A threshold above `limit` is
    /// capped at `limit`.
    pub fn new(min_buffer: usize, limit: usize) -> Self {
        let threshold = if min_buffer == 0 { 0 } else { min_buffer.min(limit.max(1)) };
        Self {
            threshold,
            pending: BytesMut::new(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.threshold == 0
    }

    /// Add `data`; returns what should be flushed now.
    pub fn push(&mut self, data: Bytes) -> Option<Bytes> {
        if self.is_streaming() {
            return Some(data);
        }
        self.pending.extend_from_slice(&data);
        (self.pending.len() >= self.threshold).then(|| self.pending.split().freeze())
    }

    /// Whatever is still held at the end of the body.
    pub fn finish(&mut self) -> Option<Bytes> {
        (!self.pending.is_empty()).then(|| self.pending.split().freeze())
    }
}

/// Pump the body from the backend to the client channel.
///
/// Returns `Ok` once the body ended cleanly. A closed channel means the
/// client is gone.
pub async fn pump_body(
    stream: &mut BackendStream,
    reader: &mut BodyReader,
    buffer: &mut ResponseBuffer,
    sink: &BodySender,
    timeout: OperationTimeout,
) -> Result<u64, ForwardError> {
    let mut sent = 0u64;
    while let Some(data) = timeout.run(reader.next(stream, READ_CHUNK)).await? {
        if let Some(flush) = buffer.push(data) {
            sent += flush.len() as u64;
            sink.send(Ok(flush)).await.map_err(|_| ForwardError::ClientDisconnected)?;
        }
    }
    if let Some(rest) = buffer.finish() {
        sent += rest.len() as u64;
        sink.send(Ok(rest)).await.map_err(|_| ForwardError::ClientDisconnected)?;
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    fn replayed(status: StatusCode, content_length: Option<u64>, chunked: bool) -> ReplayedHead {
        ReplayedHead {
            status,
            headers: HeaderMap::new(),
            content_length,
            chunked,
            server_present: false,
            connection_close: false,
        }
    }

    async fn backend_with(bytes: &'static [u8], close: bool) -> BackendStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        server.write_all(bytes).await.unwrap();
        if close {
            drop(server);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                drop(server);
            });
        }
        BackendStream::new(client, port)
    }

    #[test]
    fn framing_selection() {
        assert_eq!(
            BodyFraming::for_response(false, &replayed(StatusCode::OK, Some(10), false)),
            BodyFraming::Length(10)
        );
        assert_eq!(
            BodyFraming::for_response(true, &replayed(StatusCode::OK, Some(10), false)),
            BodyFraming::Empty
        );
        assert_eq!(
            BodyFraming::for_response(false, &replayed(StatusCode::NO_CONTENT, None, false)),
            BodyFraming::Empty
        );
        assert_eq!(
            BodyFraming::for_response(false, &replayed(StatusCode::OK, None, true)),
            BodyFraming::Chunked
        );
        let until_close = BodyFraming::for_response(false, &replayed(StatusCode::OK, None, false));
        assert_eq!(until_close, BodyFraming::UntilClose);
        assert!(!until_close.allows_reuse());
    }

    #[test]
    fn buffer_flushes_at_threshold() {
        let mut buffer = ResponseBuffer::new(10, 1024);
        assert!(buffer.push(Bytes::from_static(b"hello")).is_none());
        assert_eq!(buffer.push(Bytes::from_static(b" world")).unwrap(), "hello world");
        assert!(buffer.push(Bytes::from_static(b"!")).is_none());
        assert_eq!(buffer.finish().unwrap(), "!");
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn streaming_buffer_passes_through() {
        let mut buffer = ResponseBuffer::new(0, 1024);
        assert!(buffer.is_streaming());
        assert_eq!(buffer.push(Bytes::from_static(b"a")).unwrap(), "a");
    }

    #[tokio::test]
    async fn length_body_leaves_connection_clean() {
        let mut stream = backend_with(b"0123456789", false).await;
        let mut reader = BodyReader::new(BodyFraming::Length(10));
        let mut buffer = ResponseBuffer::new(0, 1024);
        let (tx, mut rx) = mpsc::channel(16);

        let sent = pump_body(&mut stream, &mut reader, &mut buffer, &tx, OperationTimeout::infinite())
            .await
            .unwrap();
        assert_eq!(sent, 10);
        assert!(reader.is_finished());
        drop(tx);

        let mut body = Vec::new();
        while let Some(chunk) = rx.recv().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"0123456789");
    }

    #[tokio::test]
    async fn until_close_body_ends_at_eof() {
        let mut stream = backend_with(b"streamed until close", true).await;
        let mut reader = BodyReader::new(BodyFraming::UntilClose);
        let mut buffer = ResponseBuffer::new(4, 1024);
        let (tx, mut rx) = mpsc::channel(16);

        pump_body(&mut stream, &mut reader, &mut buffer, &tx, OperationTimeout::infinite())
            .await
            .unwrap();
        drop(tx);

        let mut body = Vec::new();
        while let Some(chunk) = rx.recv().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"streamed until close");
    }

    #[tokio::test]
    async fn truncated_length_body_fails() {
        let mut stream = backend_with(b"short", true).await;
        let mut reader = BodyReader::new(BodyFraming::Length(100));
        let mut buffer = ResponseBuffer::new(0, 1024);
        let (tx, _rx) = mpsc::channel(16);

        let result = pump_body(&mut stream, &mut reader, &mut buffer, &tx, OperationTimeout::infinite()).await;
        assert!(matches!(result, Err(ForwardError::Transport(_))));
        assert!(!reader.is_finished());
    }

    #[tokio::test]
    async fn closed_client_stops_pump() {
        let mut stream = backend_with(b"0123456789", false).await;
        let mut reader = BodyReader::new(BodyFraming::Length(10));
        let mut buffer = ResponseBuffer::new(0, 1024);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = pump_body(&mut stream, &mut reader, &mut buffer, &tx, OperationTimeout::infinite()).await;
        assert!(matches!(result, Err(ForwardError::ClientDisconnected)));
    }
}
