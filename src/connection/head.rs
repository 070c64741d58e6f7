//! Backend response head: raw blob capture and parsing.

use std::io;

use bytes::Bytes;

use crate::connection::stream::BackendStream;
use crate::error::ForwardError;

/// Header lines kept from one response head; more is an invalid response.
const MAX_HEADERS: usize = 256;

/// A parsed status line plus header lines, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RawResponseHead {
    /// Parse a raw status-line-plus-headers blob.
    ///
    /// The blob need not end with the blank line or even a final CRLF;
    /// truncated heads are terminated before parsing. Continuation lines
    /// are folded into the previous header and unparseable header lines are
    /// skipped.
    pub fn parse(raw: &[u8]) -> Result<Self, ForwardError> {
        let blob = terminate_head(raw);
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut slots);

        let mut config = httparse::ParserConfig::default();
        config
            .allow_obsolete_multiline_headers_in_responses(true)
            .allow_multiple_spaces_in_response_status_delimiters(true)
            .ignore_invalid_headers_in_responses(true);
        match config.parse_response(&mut response, &blob) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err(invalid("empty response head")),
            Err(e) => return Err(invalid(&format!("malformed response head: {e}"))),
        }

        let status = response
            .code
            .filter(|code| *code >= 100)
            .ok_or_else(|| invalid("invalid status code"))?;
        let reason = response.reason.unwrap_or_default().trim().to_string();
        let headers = response
            .headers
            .iter()
            .map(|h| (h.name.to_string(), unfold(h.value)))
            .collect();

        Ok(Self { status, reason, headers })
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }
}

/// Read the response head from the stream, up to and including the blank
/// line. Bytes after the head stay buffered in the stream.
pub async fn read_raw_head(stream: &mut BackendStream, max_size: usize) -> Result<Bytes, ForwardError> {
    let mut searched: usize = 0;
    loop {
        let buffered = stream.buffered();
        let from = searched.saturating_sub(3);
        if let Some(pos) = buffered[from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let end = from + pos + 4;
            let head = Bytes::copy_from_slice(&buffered[..end]);
            stream.consume(end);
            return Ok(head);
        }
        searched = buffered.len();
        if searched > max_size {
            return Err(invalid("response headers exceed the size limit"));
        }

        if stream.fill().await? == 0 {
            let buffered = stream.buffered();
            if buffered.is_empty() {
                return Err(ForwardError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backend closed the connection without a response",
                )));
            }
            // Backend closed mid-head: take what arrived and let the parser terminate it.
            let head = Bytes::copy_from_slice(buffered);
            stream.consume(head.len());
            return Ok(head);
        }
    }
}

/// Append whatever is missing of the final CRLF and the blank line.
fn terminate_head(raw: &[u8]) -> Vec<u8> {
    let missing: &[u8] = if raw.ends_with(b"\r\n\r\n") {
        b""
    } else if raw.ends_with(b"\r\n\r") {
        b"\n"
    } else if raw.ends_with(b"\r\n") {
        b"\r\n"
    } else if raw.ends_with(b"\r") {
        b"\n\r\n"
    } else {
        b"\r\n\r\n"
    };
    let mut blob = Vec::with_capacity(raw.len() + missing.len());
    blob.extend_from_slice(raw);
    blob.extend_from_slice(missing);
    blob
}

/// Join obsolete folded lines with a single space.
fn unfold(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for line in value.split(|&b| b == b'\n').map(trim).filter(|line| !line.is_empty()) {
        if !out.is_empty() {
            out.push(b' ');
        }
        out.extend_from_slice(line);
    }
    out
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn invalid(msg: &str) -> ForwardError {
    ForwardError::InvalidServerResponse(msg.to_string())
}
