//! Bidirectional frame relay.
//!
//! # Design Decisions
//! - Frames, not messages: each frame is forwarded with its FIN bit and
//!   opcode, so fragmented messages keep their fragmentation and no message
//!   is ever buffered whole
//! - One read in flight per direction: a payload piece read from one side is
//!   written (and, at the end of the frame, flushed) to the other side before
//!   the next read is issued, so a slow consumer throttles its producer and
//!   memory stays at one buffer per direction
//! - Pings and pongs are relayed end to end like data frames
//! - Cleanup runs once, with a reason telling which side failed
//!
//! # Data Flow
//! ```text
//! client ──header, payload pieces──► backend   (client mask kept)
//! client ◄──header, payload pieces── backend   (unmasked)
//!
//! close from either side:
//!     → forwarded to the other side
//!     → the other direction gets a grace period to finish the handshake
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::observability::metrics;
use crate::websocket::frame::{self, FrameError, FrameReader};

/// Time the second direction gets to finish after the first one closed.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }
}

/// Why the relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// Both sides closed cleanly.
    Closed,
    /// The client connection failed; the backend is told it went away.
    ClientError,
    /// The backend connection failed; the client connection is dropped.
    BackendError,
}

impl CleanupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupReason::Closed => "closed",
            CleanupReason::ClientError => "client_error",
            CleanupReason::BackendError => "backend_error",
        }
    }
}

/// How one direction ended.
#[derive(Debug)]
enum PumpEnd {
    /// A close frame was read and forwarded.
    Closed,
    /// `side` failed or vanished without a close.
    Failed { side: Side, error: String },
}

impl PumpEnd {
    fn failed(side: Side, error: impl ToString) -> Self {
        PumpEnd::Failed {
            side,
            error: error.to_string(),
        }
    }
}

/// Relay frames between the upgraded `client_io` and `backend_io`
/// connections until both sides are done. Payloads move in pieces of at
/// most `buffer_size` bytes.
pub async fn relay<C, B>(client_io: C, backend_io: B, buffer_size: usize) -> CleanupReason
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (client_rd, mut client_tx) = tokio::io::split(client_io);
    let (backend_rd, mut backend_tx) = tokio::io::split(backend_io);
    let mut client_rx = FrameReader::new(client_rd, buffer_size, true);
    let mut backend_rx = FrameReader::new(backend_rd, buffer_size, false);
    let cleanup = Cleanup::default();

    let reason = {
        let upstream = pump(&mut client_rx, &mut backend_tx, Side::Client);
        let downstream = pump(&mut backend_rx, &mut client_tx, Side::Backend);
        tokio::pin!(upstream, downstream);

        let (first_side, first) = tokio::select! {
            end = &mut upstream => (Side::Client, end),
            end = &mut downstream => (Side::Backend, end),
        };

        match first {
            PumpEnd::Closed => {
                let second = match first_side.other() {
                    Side::Client => tokio::time::timeout(CLOSE_GRACE, &mut upstream).await,
                    Side::Backend => tokio::time::timeout(CLOSE_GRACE, &mut downstream).await,
                };
                match second {
                    Ok(PumpEnd::Closed) => CleanupReason::Closed,
                    Ok(PumpEnd::Failed { side, error }) => failure(side, &error),
                    // The peer never answered the close; treat as done.
                    Err(_) => CleanupReason::Closed,
                }
            }
            PumpEnd::Failed { side, error } => failure(side, &error),
        }
    };

    if cleanup.begin() {
        match reason {
            CleanupReason::ClientError => {
                if let Ok(close) = frame::going_away() {
                    let _ = tokio::time::timeout(Duration::from_secs(1), write_frame(&mut backend_tx, &close)).await;
                }
            }
            CleanupReason::BackendError => {
                // Dropping the client halves closes the client connection.
            }
            CleanupReason::Closed => {
                let _ = tokio::time::timeout(Duration::from_secs(1), client_tx.shutdown()).await;
                let _ = tokio::time::timeout(Duration::from_secs(1), backend_tx.shutdown()).await;
            }
        }
    }
    reason
}

/// Relay between the upgraded connections, recording the session.
pub async fn relay_upgraded<C, B>(client_io: C, backend_io: B, buffer_size: usize) -> CleanupReason
where
    C: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let started = Instant::now();
    tracing::debug!(buffer_size, "WebSocket relay started");
    let reason = relay(client_io, backend_io, buffer_size).await;
    let elapsed = started.elapsed();
    metrics::record_websocket_session(reason.as_str(), elapsed);
    tracing::info!(
        reason = reason.as_str(),
        duration_ms = elapsed.as_millis() as u64,
        "WebSocket relay finished"
    );
    reason
}

async fn pump<R, W>(source: &mut FrameReader<R>, sink: &mut W, side: Side) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let (header, len) = match source.header().await {
            Ok(next) => next,
            Err(e) => return PumpEnd::failed(side, e),
        };

        if frame::is_close(&header) {
            let close = match source.payload(len).await.and_then(|body| frame::close_frame(&header, &body)) {
                Ok(close) => close,
                Err(e) => return PumpEnd::failed(side, e),
            };
            // The destination may have closed first; its close reply is
            // then already on the way.
            if let Err(e) = write_frame(sink, &close).await {
                tracing::debug!(error = %e, "Close not forwarded");
            }
            return PumpEnd::Closed;
        }

        let head = match frame::encode_header(&header, len) {
            Ok(head) => head,
            Err(e) => return PumpEnd::failed(side, e),
        };
        if let Err(e) = sink.write_all(&head).await {
            return PumpEnd::failed(side.other(), e);
        }

        let mut remaining = len;
        while remaining > 0 {
            let piece = match source.chunk(remaining).await {
                Ok(piece) => piece,
                Err(e) => return PumpEnd::failed(side, e),
            };
            remaining -= piece.len() as u64;
            if let Err(e) = sink.write_all(&piece).await {
                return PumpEnd::failed(side.other(), e);
            }
        }

        if let Err(e) = sink.flush().await {
            return PumpEnd::failed(side.other(), e);
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(sink: &mut W, bytes: &[u8]) -> Result<(), FrameError> {
    sink.write_all(bytes).await?;
    sink.flush().await?;
    Ok(())
}

fn failure(side: Side, error: &str) -> CleanupReason {
    tracing::debug!(side = ?side, error = %error, "WebSocket side failed");
    match side {
        Side::Client => CleanupReason::ClientError,
        Side::Backend => CleanupReason::BackendError,
    }
}

/// Runs cleanup at most once.
#[derive(Debug, Default)]
struct Cleanup {
    done: AtomicBool,
}

impl Cleanup {
    fn begin(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }
}
