//! Storage seams used by the engine.
//!
//! The engine talks to storage only through these traits so tests can
//! wrap the SQLite store and inject failures.

use crate::{BackoffPolicy, DispatchError, DispatchResult};
use chrono::{DateTime, Utc};
use dispatch_database::{
    queries, ClaimWindow, CreateOperationOutcome, Database, DatabaseError, EventFailure,
    NewOperation, OutboxEvent, Operation, OperationStatus, RecordedFailure,
};
use std::time::Duration;

/// Candidate store and dedupe ledger operations of one dispatch cycle.
///
/// Guarded mutations return `false` when the lease was lost or the
/// event is already terminal.
pub trait OutboxStore {
    /// Read, select and lease a batch atomically.
    fn claim_in_transaction<F>(
        &self,
        window: &ClaimWindow,
        processing_token: &str,
        timeout: Duration,
        select: F,
    ) -> DispatchResult<Vec<OutboxEvent>>
    where
        F: FnOnce(Vec<OutboxEvent>) -> Vec<OutboxEvent>;

    /// Unlocked eligibility read.
    fn select_candidates(&self, window: &ClaimWindow) -> DispatchResult<Vec<OutboxEvent>>;

    /// Conditionally lease exactly `event_ids`.
    fn claim_selected(
        &self,
        window: &ClaimWindow,
        processing_token: &str,
        event_ids: &[String],
    ) -> DispatchResult<Vec<OutboxEvent>>;

    fn processing_token_of(&self, event_id: &str) -> DispatchResult<Option<String>>;

    fn mark_published(
        &self,
        event_id: &str,
        processing_token: &str,
        published_at: DateTime<Utc>,
    ) -> DispatchResult<bool>;

    fn mark_dead_lettered(
        &self,
        event_id: &str,
        processing_token: &str,
        now: DateTime<Utc>,
        reason_code: Option<&str>,
    ) -> DispatchResult<bool>;

    fn schedule_retry(
        &self,
        event_id: &str,
        processing_token: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> DispatchResult<bool>;

    fn record_failure(
        &self,
        event_id: &str,
        processing_token: &str,
        now: DateTime<Utc>,
        failure: &EventFailure,
        max_attempts: u32,
        backoff: &BackoffPolicy,
    ) -> DispatchResult<Option<RecordedFailure>>;

    fn find_operation(&self, dedupe_key: &str) -> DispatchResult<Option<Operation>>;

    fn create_operation(&self, operation: &NewOperation) -> DispatchResult<CreateOperationOutcome>;
}

/// Operation ledger access for the downstream worker.
pub trait OperationStore {
    fn runnable_operations(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> DispatchResult<Vec<Operation>>;

    fn claim_operation(
        &self,
        id: i64,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> DispatchResult<Option<Operation>>;

    fn complete_operation(&self, id: i64, now: DateTime<Utc>) -> DispatchResult<bool>;

    fn fail_operation(
        &self,
        id: i64,
        now: DateTime<Utc>,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> DispatchResult<Option<OperationStatus>>;
}

impl OutboxStore for Database {
    fn claim_in_transaction<F>(
        &self,
        window: &ClaimWindow,
        processing_token: &str,
        timeout: Duration,
        select: F,
    ) -> DispatchResult<Vec<OutboxEvent>>
    where
        F: FnOnce(Vec<OutboxEvent>) -> Vec<OutboxEvent>,
    {
        queries::claim_with_transaction(self.connection(), window, processing_token, timeout, select)
            .map_err(|e| match e {
                DatabaseError::TransactionTimeout(ms) => DispatchError::ClaimTimeout(ms),
                other => DispatchError::Database(other),
            })
    }

    fn select_candidates(&self, window: &ClaimWindow) -> DispatchResult<Vec<OutboxEvent>> {
        Ok(queries::select_claim_candidates(self.connection(), window)?)
    }

    fn claim_selected(
        &self,
        window: &ClaimWindow,
        processing_token: &str,
        event_ids: &[String],
    ) -> DispatchResult<Vec<OutboxEvent>> {
        Ok(queries::claim_selected(
            self.connection(),
            window,
            processing_token,
            event_ids,
        )?)
    }

    fn processing_token_of(&self, event_id: &str) -> DispatchResult<Option<String>> {
        Ok(queries::processing_token_of(self.connection(), event_id)?)
    }

    fn mark_published(
        &self,
        event_id: &str,
        processing_token: &str,
        published_at: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let changed = queries::mark_event_published(
            self.connection(),
            event_id,
            processing_token,
            published_at,
        )?;
        Ok(changed > 0)
    }

    fn mark_dead_lettered(
        &self,
        event_id: &str,
        processing_token: &str,
        now: DateTime<Utc>,
        reason_code: Option<&str>,
    ) -> DispatchResult<bool> {
        let changed = queries::mark_event_dead_lettered(
            self.connection(),
            event_id,
            processing_token,
            now,
            reason_code,
        )?;
        Ok(changed > 0)
    }

    fn schedule_retry(
        &self,
        event_id: &str,
        processing_token: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        let changed = queries::schedule_event_retry(
            self.connection(),
            event_id,
            processing_token,
            next_attempt_at,
        )?;
        Ok(changed > 0)
    }

    fn record_failure(
        &self,
        event_id: &str,
        processing_token: &str,
        now: DateTime<Utc>,
        failure: &EventFailure,
        max_attempts: u32,
        backoff: &BackoffPolicy,
    ) -> DispatchResult<Option<RecordedFailure>> {
        Ok(queries::record_event_failure(
            self.connection(),
            event_id,
            processing_token,
            now,
            failure,
            max_attempts,
            |attempts| backoff.next_attempt_at(now, attempts),
        )?)
    }

    fn find_operation(&self, dedupe_key: &str) -> DispatchResult<Option<Operation>> {
        Ok(queries::get_operation_by_dedupe_key(
            self.connection(),
            dedupe_key,
        )?)
    }

    fn create_operation(&self, operation: &NewOperation) -> DispatchResult<CreateOperationOutcome> {
        Ok(queries::create_operation(self.connection(), operation)?)
    }
}

impl OperationStore for Database {
    fn runnable_operations(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> DispatchResult<Vec<Operation>> {
        Ok(queries::select_runnable_operations(
            self.connection(),
            now,
            stale_before,
            limit,
        )?)
    }

    fn claim_operation(
        &self,
        id: i64,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> DispatchResult<Option<Operation>> {
        Ok(queries::claim_operation(
            self.connection(),
            id,
            now,
            stale_before,
        )?)
    }

    fn complete_operation(&self, id: i64, now: DateTime<Utc>) -> DispatchResult<bool> {
        Ok(queries::complete_operation(self.connection(), id, now)? > 0)
    }

    fn fail_operation(
        &self,
        id: i64,
        now: DateTime<Utc>,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> DispatchResult<Option<OperationStatus>> {
        Ok(queries::fail_operation(
            self.connection(),
            id,
            now,
            error,
            max_attempts,
            retry_at,
        )?)
    }
}
