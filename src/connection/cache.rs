//! Per-port backend connection cache.
//!
//! # Responsibilities
//! - Hand out one shared [`ForwarderConnection`] per backend port
//! - Keep idle keep-alive streams for reuse
//!
//! # Design Decisions
//! - The cache holds `Weak` entries; backend processes and in-flight requests
//!   hold the `Arc`s. The last holder dropping the connection removes its
//!   entry, so there is at most one live connection object per port.
//! - Idle streams are checked for a peer close before reuse

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::TcpStream;

use crate::connection::stream::BackendStream;
use crate::error::ForwardError;

/// Idle streams kept per port.
pub const MAX_IDLE_PER_PORT: usize = 32;

#[derive(Debug)]
pub struct ConnectionCache {
    entries: DashMap<u16, Weak<ForwarderConnection>>,
    keep_alive: AtomicBool,
}

impl ConnectionCache {
    pub fn new(keep_alive: bool) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            keep_alive: AtomicBool::new(keep_alive),
        })
    }

    /// Shared connection for `port`, created on first use.
    pub fn get_or_create(self: &Arc<Self>, port: u16) -> Arc<ForwarderConnection> {
        match self.entries.entry(port) {
            Entry::Occupied(mut entry) => {
                if let Some(existing) = entry.get().upgrade() {
                    return existing;
                }
                let connection = self.new_connection(port);
                entry.insert(Arc::downgrade(&connection));
                connection
            }
            Entry::Vacant(entry) => {
                let connection = self.new_connection(port);
                entry.insert(Arc::downgrade(&connection));
                connection
            }
        }
    }

    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.keep_alive.store(keep_alive, Ordering::Relaxed);
    }

    /// Number of live cached connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn new_connection(self: &Arc<Self>, port: u16) -> Arc<ForwarderConnection> {
        tracing::debug!(port, "Creating backend connection");
        Arc::new(ForwarderConnection {
            port,
            cache: Arc::downgrade(self),
            idle: Mutex::new(Vec::new()),
        })
    }
}

/// Shared connection state for one backend port.
#[derive(Debug)]
pub struct ForwarderConnection {
    port: u16,
    cache: Weak<ConnectionCache>,
    idle: Mutex<Vec<BackendStream>>,
}

impl ForwarderConnection {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// A stream to the backend: a reusable idle one, or a new connection.
    pub async fn connect(&self) -> Result<BackendStream, ForwardError> {
        while let Some(stream) = self.pop_idle() {
            if stream.is_reusable() {
                return Ok(stream);
            }
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let io = TcpStream::connect(addr)
            .await
            .map_err(|source| ForwardError::BackendUnreachable { port: self.port, source })?;
        io.set_nodelay(true)?;
        Ok(BackendStream::new(io, self.port))
    }

    /// Return a stream whose exchange finished cleanly.
    pub fn release(&self, stream: BackendStream) {
        let keep_alive = self
            .cache
            .upgrade()
            .is_some_and(|cache| cache.keep_alive.load(Ordering::Relaxed));
        if !keep_alive || !stream.is_reusable() {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < MAX_IDLE_PER_PORT {
            idle.push(stream);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn pop_idle(&self) -> Option<BackendStream> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }
}

impl Drop for ForwarderConnection {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            // A newer connection for the same port may already be registered.
            cache.entries.remove_if(&self.port, |_, weak| weak.strong_count() == 0);
        }
        tracing::debug!(port = self.port, "Backend connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn one_connection_per_port() {
        let cache = ConnectionCache::new(true);
        let a = cache.get_or_create(5000);
        let b = cache.get_or_create(5000);
        let c = cache.get_or_create(5001);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn last_holder_removes_entry() {
        let cache = ConnectionCache::new(true);
        let holders: Vec<_> = (0..8).map(|_| cache.get_or_create(5000)).collect();
        assert_eq!(Arc::strong_count(&holders[0]), 8);

        let mut holders = holders;
        while holders.len() > 1 {
            holders.pop();
            assert_eq!(cache.len(), 1);
        }
        holders.pop();
        assert!(cache.is_empty());

        // A fresh connection replaces the released one.
        let again = cache.get_or_create(5000);
        assert_eq!(again.port(), 5000);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn idle_streams_are_reused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let mut sockets = Vec::new();
            for _ in 0..2 {
                let (socket, _) = listener.accept().await.unwrap();
                sockets.push(socket);
            }
            sockets
        });

        let cache = ConnectionCache::new(true);
        let connection = cache.get_or_create(port);
        let first = connection.connect().await.unwrap();
        connection.release(first);
        assert_eq!(connection.idle_count(), 1);

        let reused = connection.connect().await.unwrap();
        assert_eq!(connection.idle_count(), 0);
        let fresh = connection.connect().await.unwrap();
        assert_eq!(reused.port(), fresh.port());

        assert_eq!(accept.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn refused_connect_is_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let cache = ConnectionCache::new(false);
        let err = cache.get_or_create(port).connect().await.unwrap_err();
        assert!(matches!(err, ForwardError::BackendUnreachable { .. }));
    }
}
