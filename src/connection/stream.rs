//! Buffered TCP stream to a backend.
//!
//! Response parsing reads ahead; bytes that belong to the body (or to the
//! WebSocket session after a 101) stay in the buffer and are handed out
//! before anything new is read from the socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Size of each socket read.
pub const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug)]
pub struct BackendStream {
    io: TcpStream,
    buf: BytesMut,
    port: u16,
}

impl BackendStream {
    pub fn new(io: TcpStream, port: u16) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bytes read from the socket but not consumed yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Read more bytes into the buffer. Returns 0 at end of stream.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.io.read_buf(&mut self.buf).await
    }

    /// Take up to `max` bytes, reading from the socket only when the buffer
    /// is empty. An empty result means end of stream.
    pub async fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(Bytes::new());
        }
        let n = self.buf.len().min(max);
        Ok(self.buf.split_to(n).freeze())
    }

    /// Take exactly `n` buffered-or-read bytes.
    pub async fn read_exact_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "backend closed mid-frame"));
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Read one CRLF-terminated line, without the terminator.
    pub async fn read_line(&mut self, limit: usize) -> io::Result<Bytes> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos).freeze();
                self.buf.advance(2);
                return Ok(line);
            }
            if self.buf.len() > limit {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            if self.fill().await? == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "backend closed mid-line"));
            }
        }
    }

    /// Whether an idle connection can carry another request: nothing is
    /// pending and the peer has not closed it.
    pub fn is_reusable(&self) -> bool {
        if !self.buf.is_empty() {
            return false;
        }
        let mut probe = [0u8; 1];
        matches!(self.io.try_read(&mut probe), Err(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            out.put_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, out)
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn pair() -> (BackendStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (BackendStream::new(client, port), server)
    }

    #[tokio::test]
    async fn lines_then_leftover_bytes() {
        let (mut stream, mut server) = pair().await;
        server.write_all(b"first\r\nsecond\r\nrest").await.unwrap();
        drop(server);

        assert_eq!(&stream.read_line(1024).await.unwrap()[..], b"first");
        assert_eq!(&stream.read_line(1024).await.unwrap()[..], b"second");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"rest");
    }

    #[tokio::test]
    async fn closed_peer_is_not_reusable() {
        let (stream, server) = pair().await;
        assert!(stream.is_reusable());

        drop(server);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!stream.is_reusable());
    }
}
