//! Rapid-fail circuit breaker for backend launches.
//!
//! # States
//! - Closed: failures in the last minute are below the threshold, launches proceed
//! - Open: threshold reached, launches are rejected without being attempted
//!
//! # State Transitions
//! ```text
//! Closed → Open: failures within the rolling window >= threshold
//! Open → Closed: enough failures age out of the window
//! ```
//!
//! # Design Decisions
//! - One breaker per application (shared by every pool slot)
//! - Rolling window: each failure is timestamped and pruned after the window
//! - Uses `tokio::time::Instant` so paused-clock tests can roll the window

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Length of the rolling window.
pub const RAPID_FAIL_WINDOW: Duration = Duration::from_secs(60);

/// Counts backend failures within a rolling window.
#[derive(Debug)]
pub struct RapidFailBreaker {
    threshold: AtomicU32,
    window: Duration,
    failures: Mutex<VecDeque<Instant>>,
}

impl RapidFailBreaker {
    /// Create a breaker that opens after `threshold` failures per minute.
    /// A threshold of zero disables the breaker.
    pub fn new(threshold: u32) -> Self {
        Self::with_window(threshold, RAPID_FAIL_WINDOW)
    }

    pub fn with_window(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: AtomicU32::new(threshold),
            window,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one failure now. Returns the number of failures in the window.
    pub fn record_failure(&self) -> usize {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> usize {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut failures, now, self.window);
        failures.push_back(now);
        failures.len()
    }

    /// Failures currently inside the window.
    pub fn failure_count(&self) -> usize {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut failures, Instant::now(), self.window);
        failures.len()
    }

    /// Returns `Some(count)` when launches must be rejected.
    pub fn check(&self) -> Option<usize> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> Option<usize> {
        let threshold = self.threshold.load(Ordering::Relaxed);
        if threshold == 0 {
            return None;
        }
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut failures, now, self.window);
        let count = failures.len();
        (count >= threshold as usize).then_some(count)
    }

    /// Apply a reloaded threshold. Recorded failures are kept.
    pub fn set_threshold(&self, threshold: u32) {
        self.threshold.store(threshold, Ordering::Relaxed);
    }

    /// Forget all recorded failures.
    pub fn reset(&self) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn prune(failures: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = failures.front() {
        if now.saturating_duration_since(*oldest) >= window {
            failures.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_threshold() {
        let breaker = RapidFailBreaker::new(3);
        let start = Instant::now();

        breaker.record_failure_at(start);
        breaker.record_failure_at(start + Duration::from_secs(1));
        assert_eq!(breaker.check_at(start + Duration::from_secs(2)), None);

        breaker.record_failure_at(start + Duration::from_secs(2));
        assert_eq!(breaker.check_at(start + Duration::from_secs(3)), Some(3));
    }

    #[test]
    fn window_rolls_over() {
        let breaker = RapidFailBreaker::new(2);
        let start = Instant::now();

        breaker.record_failure_at(start);
        breaker.record_failure_at(start + Duration::from_secs(30));
        assert!(breaker.check_at(start + Duration::from_secs(31)).is_some());

        // The first failure ages out; one remains.
        assert_eq!(breaker.check_at(start + Duration::from_secs(61)), None);
        // Both age out.
        assert_eq!(breaker.check_at(start + Duration::from_secs(91)), None);
        assert_eq!(breaker.record_failure_at(start + Duration::from_secs(92)), 1);
    }

    #[test]
    fn zero_threshold_never_opens() {
        let breaker = RapidFailBreaker::new(0);
        for _ in 0..100 {
            breaker.record_failure();
        }
        assert_eq!(breaker.check(), None);
        assert_eq!(breaker.failure_count(), 100);
    }
}
