use crate::BackoffPolicy;
use dispatch_config_and_utils::{ClaimCapability, DispatchConfig};
use std::time::Duration;

/// Settings a [`crate::Dispatcher`] is constructed with.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    /// Events processed per cycle unless the request overrides it.
    pub batch_size: usize,
    pub lookahead_multiplier: usize,
    /// Attempts at which an event is dead-lettered.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// How long a lease is honoured before the row may be reclaimed.
    pub stale_claim_window: chrono::Duration,
    /// Budget for the transactional select-and-mark.
    pub transaction_timeout: Duration,
    pub claim_capability: ClaimCapability,
    pub force_fallback: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            lookahead_multiplier: config.lookahead_multiplier.max(1),
            max_attempts: config.max_attempts,
            backoff: BackoffPolicy::new(
                chrono::Duration::milliseconds(config.base_backoff_ms as i64),
                chrono::Duration::milliseconds(config.backoff_cap_ms as i64),
            ),
            stale_claim_window: chrono::Duration::milliseconds(
                config.stale_claim_window_ms as i64,
            ),
            transaction_timeout: Duration::from_millis(config.transaction_timeout_ms),
            claim_capability: config.claim_capability,
            force_fallback: config.force_fallback,
        }
    }
}

impl DispatchSettings {
    /// Candidates read per claim: `max(batch_size, batch_size * multiplier)`.
    pub fn lookahead(&self, batch_size: usize) -> usize {
        batch_size.max(batch_size.saturating_mul(self.lookahead_multiplier))
    }

    pub fn uses_transactional_claim(&self) -> bool {
        self.claim_capability == ClaimCapability::Transactional && !self.force_fallback
    }
}
