//! Idempotent per-event dispatch.

use crate::{DispatchError, DispatchResult, DispatchSettings, OutboxStore};
use chrono::{DateTime, Utc};
use dispatch_database::{CreateOperationOutcome, NewOperation, Operation, OutboxEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Reason stored when an event runs out of attempts.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "MAX_ATTEMPTS_EXCEEDED";
/// Reason stored when the event's operation was dead-lettered downstream.
pub const OPERATION_DEAD_LETTER: &str = "OPERATION_DEAD_LETTER";

/// Outcome of processing one claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchOutcome {
    Published,
    Retry,
    DeadLetter,
    /// The lease was lost to another cycle.
    Skipped,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Published => "PUBLISHED",
            Self::Retry => "RETRY",
            Self::DeadLetter => "DEAD_LETTER",
            Self::Skipped => "SKIPPED",
        }
    }
}

/// Payload registered on the operation for an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl From<&OutboxEvent> for OperationSnapshot {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            causation_id: event.causation_id.clone(),
            correlation_id: event.correlation_id.clone(),
        }
    }
}

/// Ledger key for an event's side effect.
pub fn dedupe_key(event_id: &str) -> String {
    format!("outbox:{event_id}")
}

/// Processes claimed events one at a time.
///
/// Every write is scoped to the event id and processing token; a write
/// that touches no row means the lease was lost and yields
/// [`DispatchOutcome::Skipped`].
pub struct EventProcessor<'a, S> {
    store: &'a S,
    settings: &'a DispatchSettings,
}

impl<'a, S: OutboxStore> EventProcessor<'a, S> {
    pub fn new(store: &'a S, settings: &'a DispatchSettings) -> Self {
        Self { store, settings }
    }

    /// Process one event. Storage errors become a recorded failed attempt.
    pub fn process(
        &self,
        event: &OutboxEvent,
        processing_token: &str,
        now: DateTime<Utc>,
    ) -> DispatchOutcome {
        match self.try_process(event, processing_token, now) {
            Ok(outcome) => outcome,
            Err(err) => self.handle_failure(event, processing_token, now, &err),
        }
    }

    fn try_process(
        &self,
        event: &OutboxEvent,
        processing_token: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<DispatchOutcome> {
        let current = self.store.processing_token_of(&event.event_id)?;
        if current.as_deref() != Some(processing_token) {
            debug!(event_id = %event.event_id, "outbox event lease lost before processing");
            return Ok(DispatchOutcome::Skipped);
        }

        if event.attempts >= self.settings.max_attempts {
            return self.dead_letter(event, processing_token, now, MAX_ATTEMPTS_EXCEEDED);
        }

        let key = dedupe_key(&event.event_id);
        let operation = match self.store.find_operation(&key)? {
            Some(operation) => operation,
            None => {
                let new_operation = NewOperation {
                    dedupe_key: key,
                    operation_type: event.event_type.clone(),
                    payload: serde_json::to_value(OperationSnapshot::from(event))
                        .map_err(|e| DispatchError::Store(e.to_string()))?,
                    created_at: now,
                };
                match self.store.create_operation(&new_operation)? {
                    CreateOperationOutcome::Created(operation) => {
                        debug!(
                            event_id = %event.event_id,
                            operation_id = operation.id,
                            "outbox operation registered"
                        );
                        return self.retry(event, processing_token, now);
                    }
                    CreateOperationOutcome::AlreadyExists(operation) => operation,
                }
            }
        };

        self.reconcile(event, processing_token, now, &operation)
    }

    /// Follow the operation's status.
    fn reconcile(
        &self,
        event: &OutboxEvent,
        processing_token: &str,
        now: DateTime<Utc>,
        operation: &Operation,
    ) -> DispatchResult<DispatchOutcome> {
        if operation.status.is_terminal_success() {
            let published_at = operation.updated_at;
            if !self
                .store
                .mark_published(&event.event_id, processing_token, published_at)?
            {
                return Ok(DispatchOutcome::Skipped);
            }
            info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                attempts = event.attempts,
                correlation_id = event.correlation_id.as_deref().unwrap_or(""),
                operation_id = operation.id,
                "outbox event published"
            );
            return Ok(DispatchOutcome::Published);
        }

        if operation.status.is_dead_letter() {
            return self.dead_letter(event, processing_token, now, OPERATION_DEAD_LETTER);
        }

        self.retry(event, processing_token, now)
    }

    fn retry(
        &self,
        event: &OutboxEvent,
        processing_token: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<DispatchOutcome> {
        let next_attempt_at = self
            .settings
            .backoff
            .next_attempt_at(now, event.attempts.max(1));
        if !self
            .store
            .schedule_retry(&event.event_id, processing_token, next_attempt_at)?
        {
            return Ok(DispatchOutcome::Skipped);
        }
        debug!(
            event_id = %event.event_id,
            next_attempt_at = %next_attempt_at,
            "outbox event awaiting operation"
        );
        Ok(DispatchOutcome::Retry)
    }

    fn dead_letter(
        &self,
        event: &OutboxEvent,
        processing_token: &str,
        now: DateTime<Utc>,
        reason_code: &str,
    ) -> DispatchResult<DispatchOutcome> {
        if !self.store.mark_dead_lettered(
            &event.event_id,
            processing_token,
            now,
            Some(reason_code),
        )? {
            return Ok(DispatchOutcome::Skipped);
        }
        warn!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            attempts = event.attempts,
            correlation_id = event.correlation_id.as_deref().unwrap_or(""),
            reason_code,
            "outbox event dead-lettered"
        );
        Ok(DispatchOutcome::DeadLetter)
    }

    fn handle_failure(
        &self,
        event: &OutboxEvent,
        processing_token: &str,
        now: DateTime<Utc>,
        err: &DispatchError,
    ) -> DispatchOutcome {
        warn!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            attempts = event.attempts,
            correlation_id = event.correlation_id.as_deref().unwrap_or(""),
            reason_code = err.reason_code(),
            error = %err,
            "outbox publish failed"
        );

        let recorded = self.store.record_failure(
            &event.event_id,
            processing_token,
            now,
            &err.to_failure(),
            self.settings.max_attempts,
            &self.settings.backoff,
        );

        match recorded {
            Ok(Some(failure)) if failure.dead_lettered => {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    attempts = failure.attempts,
                    correlation_id = event.correlation_id.as_deref().unwrap_or(""),
                    reason_code = err.reason_code(),
                    "outbox event dead-lettered"
                );
                DispatchOutcome::DeadLetter
            }
            Ok(Some(_)) => DispatchOutcome::Retry,
            Ok(None) => DispatchOutcome::Skipped,
            Err(record_err) => {
                // the lease stays until the stale window passes
                error!(
                    event_id = %event.event_id,
                    error = %record_err,
                    "failed to record outbox failure"
                );
                DispatchOutcome::Retry
            }
        }
    }
}
