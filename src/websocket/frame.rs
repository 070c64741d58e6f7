//! Raw WebSocket frames as they cross the relay.
//!
//! Frames keep their header bits (FIN, RSV, opcode) and their mask, and the
//! payload streams through in buffer-sized pieces. Nothing is reassembled
//! into messages, so frame size is bounded only by the peers. Close frames
//! are the one exception: they are decoded so that codes reserved for local
//! use never reach the wire.

use std::io::Cursor;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Control, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::{Frame, FrameHeader, Utf8Bytes};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Control frames carry at most 125 payload bytes.
const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Smallest read buffer; a full header (14 bytes) always fits.
const MIN_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed without a close frame")]
    Eof,

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("frame masking does not match the sender")]
    Masking,

    #[error("control frame with {0} payload bytes")]
    OversizedControl(u64),
}

/// Reads frames from one side of the relay.
///
/// At most one buffer of payload is held at a time; the next read is only
/// issued once the previous piece was handed out.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
    chunk_size: usize,
    /// Frames from this side must be masked (true for the client side).
    masked: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, chunk_size: usize, masked: bool) -> Self {
        let chunk_size = chunk_size.max(MIN_CHUNK);
        Self {
            io,
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            masked,
        }
    }

    /// Next frame header and its payload length.
    pub async fn header(&mut self) -> Result<(FrameHeader, u64), FrameError> {
        loop {
            let mut cursor = Cursor::new(&self.buf[..]);
            if let Some((header, len)) = FrameHeader::parse(&mut cursor)? {
                let consumed = cursor.position() as usize;
                self.buf.advance(consumed);

                if header.mask.is_some() != self.masked {
                    return Err(FrameError::Masking);
                }
                if matches!(header.opcode, OpCode::Control(_)) && len > MAX_CONTROL_PAYLOAD {
                    return Err(FrameError::OversizedControl(len));
                }
                return Ok((header, len));
            }

            if self.fill().await? == 0 {
                return Err(if self.buf.is_empty() {
                    FrameError::Eof
                } else {
                    FrameError::Truncated
                });
            }
        }
    }

    /// Next piece of the current payload, at most `remaining` bytes.
    pub async fn chunk(&mut self, remaining: u64) -> Result<Bytes, FrameError> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Err(FrameError::Truncated);
        }
        let take = (self.buf.len() as u64).min(remaining) as usize;
        Ok(self.buf.split_to(take).freeze())
    }

    /// The whole payload of a (small) control frame.
    pub async fn payload(&mut self, len: u64) -> Result<Bytes, FrameError> {
        let mut payload = BytesMut::with_capacity(len as usize);
        let mut remaining = len;
        while remaining > 0 {
            let piece = self.chunk(remaining).await?;
            remaining -= piece.len() as u64;
            payload.extend_from_slice(&piece);
        }
        Ok(payload.freeze())
    }

    async fn fill(&mut self) -> std::io::Result<usize> {
        self.buf.reserve(self.chunk_size);
        self.io.read_buf(&mut self.buf).await
    }
}

pub fn is_close(header: &FrameHeader) -> bool {
    header.opcode == OpCode::Control(Control::Close)
}

/// Wire form of a frame header for a payload of `len` bytes.
pub fn encode_header(header: &FrameHeader, len: u64) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(header.len(len));
    header.format(len, &mut out)?;
    Ok(out)
}

/// Re-encode a close frame for the other side, keeping the sender's mask.
/// A reserved code (1005, 1006, 1015) turns into a close without a body.
pub fn close_frame(header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut body = payload.to_vec();
    if let Some(mask) = header.mask {
        unmask(&mut body, mask);
    }
    let close = decode_close(Bytes::from(body)).filter(|f| is_sendable(f.code));

    let mut frame = Frame::close(close);
    frame.header_mut().mask = header.mask;
    encode(frame)
}

/// Close frame telling the backend the client went away. Masked, since the
/// relay talks to the backend as a client.
pub fn going_away() -> Result<Vec<u8>, FrameError> {
    let mut frame = Frame::close(Some(CloseFrame {
        code: CloseCode::Away,
        reason: "client connection lost".into(),
    }));
    frame.header_mut().mask = Some(rand::random());
    encode(frame)
}

fn encode(frame: Frame) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(frame.len());
    frame.format(&mut out)?;
    Ok(out)
}

fn decode_close(body: Bytes) -> Option<CloseFrame> {
    if body.len() < 2 {
        return None;
    }
    let code = CloseCode::from(u16::from_be_bytes([body[0], body[1]]));
    let reason = Utf8Bytes::try_from(body.slice(2..)).unwrap_or_else(|_| "".into());
    Some(CloseFrame { code, reason })
}

fn unmask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

fn is_sendable(code: CloseCode) -> bool {
    !matches!(code, CloseCode::Status | CloseCode::Abnormal | CloseCode::Tls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::Data;

    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn wire(mut frame: Frame, mask: Option<[u8; 4]>) -> Vec<u8> {
        frame.header_mut().mask = mask;
        encode(frame).unwrap()
    }

    fn parse(bytes: &[u8]) -> (FrameHeader, Vec<u8>) {
        let mut cursor = Cursor::new(bytes);
        let (header, len) = FrameHeader::parse(&mut cursor).unwrap().unwrap();
        let start = cursor.position() as usize;
        let mut payload = bytes[start..start + len as usize].to_vec();
        if let Some(mask) = header.mask {
            unmask(&mut payload, mask);
        }
        (header, payload)
    }

    #[tokio::test]
    async fn payload_is_handed_out_in_pieces() {
        let bytes = wire(Frame::message(vec![9u8; 5000], OpCode::Data(Data::Binary), true), None);
        let mut reader = FrameReader::new(&bytes[..], 1024, false);

        let (header, len) = reader.header().await.unwrap();
        assert!(header.is_final);
        assert_eq!(len, 5000);

        let mut remaining = len;
        while remaining > 0 {
            let piece = reader.chunk(remaining).await.unwrap();
            assert!(!piece.is_empty());
            assert!(piece.len() <= 4096);
            remaining -= piece.len() as u64;
        }
        assert!(matches!(reader.header().await, Err(FrameError::Eof)));
    }

    #[tokio::test]
    async fn masking_must_match_the_side() {
        let bytes = wire(Frame::message("hi", OpCode::Data(Data::Text), true), None);
        let mut reader = FrameReader::new(&bytes[..], 1024, true);
        assert!(matches!(reader.header().await, Err(FrameError::Masking)));
    }

    #[tokio::test]
    async fn cut_off_header_is_truncated() {
        let bytes = wire(Frame::message(vec![1u8; 300], OpCode::Data(Data::Binary), true), Some(MASK));
        let mut reader = FrameReader::new(&bytes[..3], 1024, true);
        assert!(matches!(reader.header().await, Err(FrameError::Truncated)));
    }

    #[test]
    fn close_is_forwarded_with_its_mask() {
        let original = wire(
            Frame::close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            })),
            Some(MASK),
        );
        let (header, _) = parse(&original);
        let start = original.len() - 5;
        assert_eq!(close_frame(&header, &original[start..]).unwrap(), original);
    }

    #[test]
    fn reserved_close_codes_are_dropped() {
        let original = wire(
            Frame::close(Some(CloseFrame {
                code: CloseCode::Abnormal,
                reason: "".into(),
            })),
            None,
        );
        let (header, payload) = parse(&original);
        let (relayed, body) = parse(&close_frame(&header, &payload).unwrap());
        assert!(is_close(&relayed));
        assert!(body.is_empty());
    }

    #[test]
    fn going_away_is_masked() {
        let (header, body) = parse(&going_away().unwrap());
        assert!(header.mask.is_some());
        assert_eq!(decode_close(Bytes::from(body)).unwrap().code, CloseCode::Away);
    }
}
