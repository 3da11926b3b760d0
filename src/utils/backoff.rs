use std::time::Duration;

/// Doubling delay schedule with an upper bound.
///
/// Attempt `1` waits `base`, attempt `n` waits `base * 2^(n-1)`, never more
/// than `max`. Shared by producer retries and client reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1_u32 << exponent).min(self.max)
    }
}
