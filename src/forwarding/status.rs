//! Request progress, one-shot completion and handle accounting.
//!
//! # Design Decisions
//! - The response is delivered to the front end at most once; every later
//!   attempt is refused, which is what keeps a sent status from being
//!   overwritten by a late failure
//! - Each backend handle (the HTTP exchange, the upgraded WebSocket) holds a
//!   guard; the finish hook runs when the last guard drops

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Progress of one forwarded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestStatus {
    Start = 0,
    SendingRequest = 1,
    ReceivingResponse = 2,
    ReceivedWebSocketResponse = 3,
    Done = 4,
}

impl RequestStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestStatus::Start,
            1 => RequestStatus::SendingRequest,
            2 => RequestStatus::ReceivingResponse,
            3 => RequestStatus::ReceivedWebSocketResponse,
            _ => RequestStatus::Done,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Start => "start",
            RequestStatus::SendingRequest => "sending_request",
            RequestStatus::ReceivingResponse => "receiving_response",
            RequestStatus::ReceivedWebSocketResponse => "received_websocket_response",
            RequestStatus::Done => "done",
        }
    }
}

/// Shared, monotonically advancing request status.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        Self(AtomicU8::new(RequestStatus::Start as u8))
    }
}

impl StatusCell {
    pub fn get(&self) -> RequestStatus {
        RequestStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move forward to `next`. Going backwards is ignored.
    pub fn advance(&self, next: RequestStatus) {
        self.0.fetch_max(next as u8, Ordering::AcqRel);
    }
}

/// Delivers the response to the waiting front end exactly once.
#[derive(Debug)]
pub struct RequestCompletion<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> RequestCompletion<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Mutex::new(Some(tx)) }, rx)
    }

    /// Deliver `value`. Returns `false` if a value was already delivered or
    /// the receiver is gone.
    pub fn complete(&self, value: T) -> bool {
        let sender = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

type FinishHook = Box<dyn FnOnce() + Send>;

/// Counts open handles; runs the finish hook when the count reaches zero.
#[derive(Clone)]
pub struct HandleTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    outstanding: AtomicUsize,
    on_finish: Mutex<Option<FinishHook>>,
}

impl HandleTracker {
    pub fn new(on_finish: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                outstanding: AtomicUsize::new(0),
                on_finish: Mutex::new(Some(Box::new(on_finish))),
            }),
        }
    }

    /// Register an open handle.
    pub fn open(&self) -> HandleGuard {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        HandleGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

/// One open handle; closing it is dropping it.
pub struct HandleGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let hook = self.inner.on_finish.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        let status = StatusCell::default();
        status.advance(RequestStatus::ReceivingResponse);
        status.advance(RequestStatus::SendingRequest);
        assert_eq!(status.get(), RequestStatus::ReceivingResponse);
        status.advance(RequestStatus::Done);
        assert_eq!(status.get().as_str(), "done");
    }

    #[tokio::test]
    async fn completion_is_delivered_once_under_contention() {
        let (completion, rx) = RequestCompletion::<usize>::new();
        let completion = Arc::new(completion);

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let completion = Arc::clone(&completion);
                tokio::spawn(async move { completion.complete(i) })
            })
            .collect();

        let mut delivered = 0;
        for task in tasks {
            if task.await.unwrap() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
        assert!(completion.is_completed());
        assert!(rx.await.unwrap() < 32);
    }

    #[test]
    fn finish_runs_when_last_handle_closes() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let tracker = HandleTracker::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let http = tracker.open();
        let websocket = tracker.open();
        assert_eq!(tracker.outstanding(), 2);

        drop(http);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        drop(websocket);
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // Reopening after the finish does not run the hook again.
        drop(tracker.open());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_handles_finish_once() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let tracker = HandleTracker::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let guards: Vec<_> = (0..64).map(|_| tracker.open()).collect();
        let threads: Vec<_> = guards.into_iter().map(|g| std::thread::spawn(move || drop(g))).collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
