//! Delay between backend launch attempts.
//!
//! The delay doubles per retry up to a cap, plus up to 10% random jitter so
//! slots that failed together do not relaunch together.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchBackoff {
    base: Duration,
    cap: Duration,
}

impl LaunchBackoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `retry`, counting from 1.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        delay + jitter(delay)
    }
}

fn jitter(delay: Duration) -> Duration {
    let spread = delay / 10;
    if spread.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..spread)
}
