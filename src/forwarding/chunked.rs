//! Chunked transfer coding.
//!
//! Request bodies that arrived chunked are re-framed for the backend one
//! read at a time; chunked backend responses are decoded before they reach
//! the client, which gets its own framing from the front end.

use bytes::{Bytes, BytesMut};

use crate::connection::stream::BackendStream;
use crate::error::ForwardError;

/// Terminating zero-length chunk with an empty trailer section.
pub const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// Longest chunk-size line accepted from a backend.
const MAX_CHUNK_LINE: usize = 4096;

/// Frame `data` as one chunk: `<hex length>\r\n<data>\r\n`.
///
/// The length uses as many hex digits as its magnitude needs (1 to 4 for
/// reads up to 64 KiB).
pub fn encode_chunk(data: &[u8]) -> Bytes {
    let prefix = format!("{:x}\r\n", data.len());
    let mut out = BytesMut::with_capacity(prefix.len() + data.len() + 2);
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out.freeze()
}

/// Incremental decoder for a chunked response body.
#[derive(Debug, Default)]
pub struct ChunkedDecoder {
    /// Bytes left in the current chunk.
    remaining: u64,
    /// CRLF after chunk data still to be consumed.
    expect_crlf: bool,
    done: bool,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next piece of body data, at most `max` bytes. `None` once the final
    /// chunk and trailers have been consumed.
    pub async fn next(&mut self, stream: &mut BackendStream, max: usize) -> Result<Option<Bytes>, ForwardError> {
        if self.done {
            return Ok(None);
        }

        if self.remaining == 0 {
            if self.expect_crlf {
                let line = stream.read_line(MAX_CHUNK_LINE).await?;
                if !line.is_empty() {
                    return Err(invalid("missing CRLF after chunk data"));
                }
                self.expect_crlf = false;
            }

            let line = stream.read_line(MAX_CHUNK_LINE).await?;
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                // Trailers end with an empty line; they are not forwarded.
                loop {
                    if stream.read_line(MAX_CHUNK_LINE).await?.is_empty() {
                        break;
                    }
                }
                self.done = true;
                return Ok(None);
            }
            self.remaining = size;
        }

        let want = self.remaining.min(max as u64) as usize;
        let data = stream.read_chunk(want).await?;
        if data.is_empty() {
            return Err(invalid("backend closed mid-chunk"));
        }
        self.remaining -= data.len() as u64;
        if self.remaining == 0 {
            self.expect_crlf = true;
        }
        Ok(Some(data))
    }
}

/// Size from a chunk-size line read without its CRLF. Extensions after
/// `;` are ignored.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ForwardError> {
    if line.is_empty() {
        return Err(invalid("missing chunk size"));
    }
    let mut framed = Vec::with_capacity(line.len() + 2);
    framed.extend_from_slice(line);
    framed.extend_from_slice(b"\r\n");
    match httparse::parse_chunk_size(&framed) {
        Ok(httparse::Status::Complete((_, size))) => Ok(size),
        Ok(httparse::Status::Partial) | Err(_) => Err(invalid("invalid chunk size")),
    }
}

fn invalid(msg: &str) -> ForwardError {
    ForwardError::InvalidServerResponse(msg.to_string())
}
