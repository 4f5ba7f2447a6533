//! Retry delay policy.

use chrono::{DateTime, Duration, Utc};

/// Linear backoff with a cap.
///
/// | Attempts | Delay (5 min base, 30 min cap) |
/// |----------|--------------------------------|
/// | 1        | 5 min                          |
/// | 2        | 10 min                         |
/// | 5        | 25 min                         |
/// | 6+       | 30 min                         |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::minutes(5),
            cap: Duration::minutes(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// `min(attempts * base, cap)`.
    pub fn delay(&self, attempts: u32) -> Duration {
        let base_ms = self.base.num_milliseconds().max(0);
        let cap_ms = self.cap.num_milliseconds().max(0);
        let delay_ms = base_ms.saturating_mul(i64::from(attempts)).min(cap_ms);
        Duration::milliseconds(delay_ms)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        now + self.delay(attempts)
    }
}
