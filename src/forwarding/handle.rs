//! The backend request handle and its lock.
//!
//! Operations on the backend stream run under one lock. Instead of tracking
//! which task holds it, the guard itself is the proof of holding it: every
//! step that touches the stream takes `&mut HandleLock`, so a step called
//! from inside another never locks twice.

use tokio::sync::{Mutex, MutexGuard};

use crate::connection::stream::BackendStream;
use crate::error::ForwardError;

#[derive(Debug, Default)]
pub struct RequestHandle {
    stream: Mutex<Option<BackendStream>>,
}

impl RequestHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> HandleLock<'_> {
        HandleLock {
            guard: self.stream.lock().await,
        }
    }

    /// Close the handle unless an operation holds it. The holder observes
    /// the disconnect flag and closes it itself.
    pub fn try_close(&self) -> bool {
        match self.stream.try_lock() {
            Ok(mut guard) => {
                guard.take();
                true
            }
            Err(_) => false,
        }
    }
}

/// Held lock on a [`RequestHandle`].
pub struct HandleLock<'a> {
    guard: MutexGuard<'a, Option<BackendStream>>,
}

impl HandleLock<'_> {
    pub fn attach(&mut self, stream: BackendStream) {
        *self.guard = Some(stream);
    }

    pub fn stream(&mut self) -> Result<&mut BackendStream, ForwardError> {
        self.guard.as_mut().ok_or(ForwardError::ClientDisconnected)
    }

    /// Detach the stream, e.g. to return it to the cache or hand it to the
    /// WebSocket relay.
    pub fn take(&mut self) -> Option<BackendStream> {
        self.guard.take()
    }

    pub fn is_open(&self) -> bool {
        self.guard.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn close_waits_for_holder() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let handle = RequestHandle::new();
        {
            let mut lock = handle.lock().await;
            lock.attach(BackendStream::new(client, port));
            assert!(!handle.try_close());
            assert!(lock.is_open());
            assert_eq!(lock.stream().unwrap().port(), port);
        }
        assert!(handle.try_close());

        let mut lock = handle.lock().await;
        assert!(!lock.is_open());
        assert!(matches!(lock.stream(), Err(ForwardError::ClientDisconnected)));
    }
}
