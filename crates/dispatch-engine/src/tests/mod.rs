//! Engine tests against SQLite.
//!
//! - `claiming.rs`    - leasing, fallback, stale reclaim
//! - `processing.rs`  - per-event outcomes and failure bookkeeping
//! - `fairness.rs`    - randomized fair-batching properties
//! - `concurrency.rs` - concurrent cycles on one database file
//! - `end_to_end.rs`  - outbox to operation to published

mod fairness;

use crate::{BackoffPolicy, DispatchError, DispatchResult, DispatchSettings, OutboxStore};
use chrono::{DateTime, Duration, TimeZone, Utc};
use dispatch_database::{
    queries, ClaimWindow, CreateOperationOutcome, Database, EventFailure, NewOperation,
    NewOutboxEvent, Operation, OutboxEvent, RecordedFailure,
};
use serde_json::json;
use std::cell::RefCell;
use std::collections::HashSet;

/// Fixed test clock: 2025-01-01T12:00:00Z plus `minutes`.
pub(crate) fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub(crate) fn seed(db: &Database, event_id: &str, event_type: &str, created_minute: i64) {
    queries::insert_outbox_event(
        db.connection(),
        &NewOutboxEvent::new(event_id, event_type, json!({ "ref": event_id }))
            .with_created_at(t(created_minute))
            .with_correlation_id(format!("corr-{event_id}")),
    )
    .unwrap();
}

pub(crate) fn event(db: &Database, event_id: &str) -> OutboxEvent {
    queries::get_outbox_event(db.connection(), event_id)
        .unwrap()
        .unwrap()
}

pub(crate) fn settings() -> DispatchSettings {
    DispatchSettings::default()
}

pub(crate) fn operation_count(db: &Database) -> i64 {
    db.connection()
        .query_row("SELECT COUNT(*) FROM operations", [], |row| row.get(0))
        .unwrap()
}

pub(crate) fn set_operation_status(db: &Database, dedupe_key: &str, status: &str, at: DateTime<Utc>) {
    db.connection()
        .execute(
            "UPDATE operations SET status = ?1, updated_at = ?2 WHERE dedupe_key = ?3",
            rusqlite::params![status, at.timestamp_millis(), dedupe_key],
        )
        .unwrap();
}

pub(crate) fn set_attempts(db: &Database, event_id: &str, attempts: u32) {
    db.connection()
        .execute(
            "UPDATE outbox_events SET attempts = ?1 WHERE event_id = ?2",
            rusqlite::params![attempts, event_id],
        )
        .unwrap();
}

/// Store calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Call {
    ClaimInTransaction,
    SelectCandidates,
    ClaimSelected,
    ProcessingToken,
    FindOperation,
    CreateOperation,
    RecordFailure,
}

/// SQLite store that fails selected calls and records every call.
pub(crate) struct FlakyStore {
    pub inner: Database,
    failing: RefCell<HashSet<Call>>,
    calls: RefCell<Vec<Call>>,
    /// Report "no operation" on lookups, as if read before a concurrent create.
    pub miss_operation_lookup: RefCell<bool>,
}

impl FlakyStore {
    pub fn new(inner: Database) -> Self {
        Self {
            inner,
            failing: RefCell::new(HashSet::new()),
            calls: RefCell::new(Vec::new()),
            miss_operation_lookup: RefCell::new(false),
        }
    }

    pub fn fail(&self, call: Call) {
        self.failing.borrow_mut().insert(call);
    }

    pub fn heal(&self, call: Call) {
        self.failing.borrow_mut().remove(&call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    fn enter(&self, call: Call) -> DispatchResult<()> {
        self.calls.borrow_mut().push(call);
        if self.failing.borrow().contains(&call) {
            return Err(DispatchError::Store(format!("injected {call:?} failure")));
        }
        Ok(())
    }
}

impl OutboxStore for FlakyStore {
    fn claim_in_transaction<F>(
        &self,
        window: &ClaimWindow,
        processing_token: &str,
        timeout: std::time::Duration,
        select: F,
    ) -> DispatchResult<Vec<OutboxEvent>>
    where
        F: FnOnce(Vec<OutboxEvent>) -> Vec<OutboxEvent>,
    {
        self.enter(Call::ClaimInTransaction)?;
        self.inner
            .claim_in_transaction(window, processing_token, timeout, select)
    }

    fn select_candidates(&self, window: &ClaimWindow) -> DispatchResult<Vec<OutboxEvent>> {
        self.enter(Call::SelectCandidates)?;
        self.inner.select_candidates(window)
    }

    fn claim_selected(
        &self,
        window: &ClaimWindow,
        processing_token: &str,
        event_ids: &[String],
    ) -> DispatchResult<Vec<OutboxEvent>> {
        self.enter(Call::ClaimSelected)?;
        self.inner.claim_selected(window, processing_token, event_ids)
    }

    fn processing_token_of(&self, event_id: &str) -> DispatchResult<Option<String>> {
        self.enter(Call::ProcessingToken)?;
        self.inner.processing_token_of(event_id)
    }

    fn mark_published(
        &self,
        event_id: &str,
        processing_token: &str,
        published_at: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        self.inner
            .mark_published(event_id, processing_token, published_at)
    }

    fn mark_dead_lettered(
        &self,
        event_id: &str,
        processing_token: &str,
        now: DateTime<Utc>,
        reason_code: Option<&str>,
    ) -> DispatchResult<bool> {
        self.inner
            .mark_dead_lettered(event_id, processing_token, now, reason_code)
    }

    fn schedule_retry(
        &self,
        event_id: &str,
        processing_token: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> DispatchResult<bool> {
        self.inner
            .schedule_retry(event_id, processing_token, next_attempt_at)
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
        self.enter(Call::RecordFailure)?;
        self.inner.record_failure(
            event_id,
            processing_token,
            now,
            failure,
            max_attempts,
            backoff,
        )
    }

    fn find_operation(&self, dedupe_key: &str) -> DispatchResult<Option<Operation>> {
        self.enter(Call::FindOperation)?;
        if *self.miss_operation_lookup.borrow() {
            return Ok(None);
        }
        self.inner.find_operation(dedupe_key)
    }

    fn create_operation(&self, operation: &NewOperation) -> DispatchResult<CreateOperationOutcome> {
        self.enter(Call::CreateOperation)?;
        self.inner.create_operation(operation)
    }
}
