//! Leasing a batch of outbox events to one dispatch cycle.

use crate::{build_fair_batch, DispatchResult, DispatchSettings, OutboxStore};
use chrono::{DateTime, Utc};
use dispatch_database::{ClaimWindow, OutboxEvent};
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Which protocol produced a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimPath {
    Transactional,
    ConditionalUpdate,
}

impl ClaimPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transactional => "transactional",
            Self::ConditionalUpdate => "conditional_update",
        }
    }
}

/// Events leased under one processing token.
#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub processing_token: String,
    pub events: Vec<OutboxEvent>,
    /// `None` when both protocols failed and nothing was leased.
    pub path: Option<ClaimPath>,
}

impl ClaimedBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Claims batches for a dispatch cycle.
///
/// The transactional protocol is tried first when the settings allow it.
/// Any failure there falls back to the conditional update for this cycle,
/// and a failure of the fallback yields an empty batch.
pub struct ClaimManager<'a, S> {
    store: &'a S,
    settings: &'a DispatchSettings,
}

impl<'a, S: OutboxStore> ClaimManager<'a, S> {
    pub fn new(store: &'a S, settings: &'a DispatchSettings) -> Self {
        Self { store, settings }
    }

    /// Lease up to `batch_size` events. Never fails.
    pub fn claim(&self, now: DateTime<Utc>, batch_size: usize) -> ClaimedBatch {
        let window = ClaimWindow::new(
            now,
            self.settings.stale_claim_window,
            self.settings.lookahead(batch_size),
        );
        let processing_token = Uuid::new_v4().to_string();

        if self.settings.uses_transactional_claim() {
            match self.store.claim_in_transaction(
                &window,
                &processing_token,
                self.settings.transaction_timeout,
                |candidates| build_fair_batch(candidates, batch_size),
            ) {
                Ok(events) => {
                    return ClaimedBatch {
                        processing_token,
                        events,
                        path: Some(ClaimPath::Transactional),
                    };
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        reason_code = err.reason_code(),
                        "outbox claim fell back to conditional update"
                    );
                }
            }
        } else {
            debug!(
                claim_capability = self.settings.claim_capability.as_str(),
                force_fallback = self.settings.force_fallback,
                "using conditional update claim"
            );
        }

        match self.claim_conditionally(&window, &processing_token, batch_size) {
            Ok(events) => ClaimedBatch {
                processing_token,
                events,
                path: Some(ClaimPath::ConditionalUpdate),
            },
            Err(err) => {
                error!(
                    error = %err,
                    reason_code = err.reason_code(),
                    "outbox claim failed"
                );
                ClaimedBatch {
                    processing_token,
                    events: Vec::new(),
                    path: None,
                }
            }
        }
    }

    fn claim_conditionally(
        &self,
        window: &ClaimWindow,
        processing_token: &str,
        batch_size: usize,
    ) -> DispatchResult<Vec<OutboxEvent>> {
        let candidates = self.store.select_candidates(window)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let selected = build_fair_batch(candidates, batch_size);
        let ids: Vec<String> = selected.into_iter().map(|e| e.event_id).collect();
        let claimed = self.store.claim_selected(window, processing_token, &ids)?;

        if claimed.len() < ids.len() {
            debug!(
                selected = ids.len(),
                claimed = claimed.len(),
                "some selected events were claimed by another cycle"
            );
        }
        Ok(claimed)
    }
}
