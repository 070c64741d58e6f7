//! Process-wide stop flag.

use std::future::Future;

use tokio::sync::watch;

/// Set once when the forwarder starts stopping. Late subscribers still see
/// it, so a task spawned during shutdown stops at once.
#[derive(Debug)]
pub struct Shutdown {
    stopped: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (stopped, _) = watch::channel(false);
        Self { stopped }
    }

    pub fn trigger(&self) {
        self.stopped.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Resolves once [`Shutdown::trigger`] has been called, including before
    /// this future was created.
    pub fn signalled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.stopped.subscribe();
        async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn every_waiter_is_released() {
        let shutdown = Shutdown::new();
        let waiters = [shutdown.signalled(), shutdown.signalled()];

        shutdown.trigger();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap();
        }
    }

    #[tokio::test]
    async fn late_waiter_sees_earlier_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();

        assert!(shutdown.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), shutdown.signalled()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn untriggered_stays_pending() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(tokio::time::timeout(Duration::from_secs(60), shutdown.signalled()).await.is_err());
    }
}
