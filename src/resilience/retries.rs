//! Retry policy for backend launches.
//!
//! # Responsibilities
//! - Bound the number of start attempts per pool slot
//! - Stop immediately on critical failures (bad config, exhausted ports)
//!
//! # Design Decisions
//! - Transient failures (port taken, early exit, startup timeout) are retried
//! - A fresh random port is picked for every attempt unless one is configured

use crate::error::ProcessError;

/// Retries after the first failed launch.
pub const MAX_START_RETRIES: u32 = 2;

/// Decides whether another launch attempt is made.
#[derive(Debug, Clone, Copy)]
pub struct StartRetryPolicy {
    max_retries: u32,
}

impl Default for StartRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_START_RETRIES,
        }
    }
}

impl StartRetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Total attempts, counting the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// `attempt` is 1-based and refers to the attempt that just failed.
    pub fn should_retry(&self, attempt: u32, error: &ProcessError) -> bool {
        !error.is_critical() && attempt < self.max_attempts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_retry_twice() {
        let policy = StartRetryPolicy::default();
        let err = ProcessError::StartupTimeout { pid: 1, port: 5000, secs: 1 };
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));
    }

    #[test]
    fn critical_failures_do_not_retry() {
        let policy = StartRetryPolicy::default();
        let err = ProcessError::PortExhausted { min: 1025, max: 48000 };
        assert!(!policy.should_retry(1, &err));
    }
}
