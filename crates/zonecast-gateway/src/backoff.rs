//! Retry pacing for the in-connection recovery loop.
//!
//! Each attempt doubles the delay window up to a cap, and the actual
//! delay is drawn uniformly from that window so concurrent recoveries
//! do not retry in lockstep.

use std::time::Duration;

/// Jittered exponential delay source.
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Draw the delay for the current attempt and advance to the next.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        let doubling = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        let window = base_ms.saturating_mul(doubling).min(cap_ms);
        self.attempt = self.attempt.saturating_add(1);
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(fastrand::u64(0..=window))
    }
}
