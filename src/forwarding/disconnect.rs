//! Client disconnect notification.
//!
//! The front end drops the handler future when the client goes away. A
//! [`DisconnectNotifier`] living in that future turns the drop into a flag
//! the backend exchange observes between steps; the exchange is never torn
//! down from the outside.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct DisconnectSignal {
    disconnected: AtomicBool,
    notify: Notify,
}

impl DisconnectSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn notify_disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Resolves once the client has disconnected.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_disconnected() {
                return;
            }
            notified.await;
        }
    }
}

/// Fires the signal when dropped while armed.
#[derive(Debug)]
pub struct DisconnectNotifier {
    signal: Arc<DisconnectSignal>,
    armed: bool,
}

impl DisconnectNotifier {
    pub fn new(signal: Arc<DisconnectSignal>) -> Self {
        Self { signal, armed: true }
    }

    /// The response reached the front end; later disconnects surface through
    /// the body channel instead.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectNotifier {
    fn drop(&mut self) {
        if self.armed {
            self.signal.notify_disconnect();
        }
    }
}
