//! Downstream operation worker.
//!
//! Advances operations registered by dispatch cycles: each runnable
//! operation is locked, handed to the handler registered for its type,
//! and marked SUCCEEDED, FAILED (due again after a fixed delay) or
//! DEAD_LETTER once its attempts are used up. The next dispatch cycle
//! observes the terminal status and settles the outbox event.

use crate::{DispatchError, DispatchResult, OperationStore};
use chrono::{DateTime, Duration, Utc};
use dispatch_database::{Operation, OperationStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Performs the side effect of one operation type.
pub trait OperationHandler: Send + Sync {
    fn handle(&self, operation: &Operation) -> DispatchResult<()>;
}

/// Handler that only logs the operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOperationHandler;

impl OperationHandler for LogOperationHandler {
    fn handle(&self, operation: &Operation) -> DispatchResult<()> {
        info!(
            operation_id = operation.id,
            operation_type = %operation.operation_type,
            dedupe_key = %operation.dedupe_key,
            attempts = operation.attempts,
            "operation handled"
        );
        Ok(())
    }
}

/// Handlers keyed by operation type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
    fallback: Option<Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        operation_type: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> &mut Self {
        self.handlers.insert(operation_type.into(), handler);
        self
    }

    /// Handler used for types without a registration.
    pub fn with_fallback(mut self, handler: Arc<dyn OperationHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn get(&self, operation_type: &str) -> Option<&Arc<dyn OperationHandler>> {
        self.handlers
            .get(operation_type)
            .or(self.fallback.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }
}

/// Operation worker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationWorkerSettings {
    /// Operations selected per batch.
    pub batch_size: usize,
    /// Attempts after which a failing operation is dead-lettered.
    pub max_attempts: u32,
    /// Fixed delay before a failed operation is retried.
    pub retry_delay: Duration,
    /// RUNNING operations locked longer than this are picked up again.
    pub stale_lock_window: Duration,
}

impl Default for OperationWorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_attempts: 5,
            retry_delay: Duration::minutes(5),
            stale_lock_window: Duration::minutes(15),
        }
    }
}

/// Result for one operation in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub id: i64,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of one worker batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRunReport {
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Claimed by another worker, or a store error on this one.
    pub skipped: usize,
    pub results: Vec<OperationResult>,
}

pub struct OperationWorker<S> {
    store: S,
    registry: HandlerRegistry,
    settings: OperationWorkerSettings,
}

impl<S: OperationStore> OperationWorker<S> {
    pub fn new(store: S, registry: HandlerRegistry, settings: OperationWorkerSettings) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one batch of runnable operations, lowest id first.
    pub fn run_batch(&self, now: DateTime<Utc>) -> DispatchResult<OperationRunReport> {
        let stale_before = now - self.settings.stale_lock_window;
        let runnable =
            self.store
                .runnable_operations(now, stale_before, self.settings.batch_size)?;

        let mut report = OperationRunReport {
            selected: runnable.len(),
            ..Default::default()
        };

        for candidate in runnable {
            let operation = match self.store.claim_operation(candidate.id, now, stale_before) {
                Ok(Some(operation)) => operation,
                Ok(None) => {
                    debug!(operation_id = candidate.id, "operation claimed elsewhere");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(operation_id = candidate.id, error = %err, "operation claim failed");
                    report.skipped += 1;
                    continue;
                }
            };

            match self.run_one(&operation, now) {
                Ok(result) => {
                    match result.status {
                        OperationStatus::Succeeded => report.succeeded += 1,
                        OperationStatus::DeadLetter => report.dead_lettered += 1,
                        _ => report.failed += 1,
                    }
                    report.results.push(result);
                }
                Err(err) => {
                    // the lock expires after the stale window
                    warn!(operation_id = operation.id, error = %err, "operation update failed");
                    report.skipped += 1;
                }
            }
        }

        info!(
            selected = report.selected,
            succeeded = report.succeeded,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            skipped = report.skipped,
            "operation worker batch complete"
        );
        Ok(report)
    }

    fn run_one(&self, operation: &Operation, now: DateTime<Utc>) -> DispatchResult<OperationResult> {
        let outcome = match self.registry.get(&operation.operation_type) {
            Some(handler) => handler.handle(operation),
            None => Err(DispatchError::Handler(format!(
                "no handler registered for {}",
                operation.operation_type
            ))),
        };

        match outcome {
            Ok(()) => {
                self.store.complete_operation(operation.id, now)?;
                Ok(OperationResult {
                    id: operation.id,
                    status: OperationStatus::Succeeded,
                    error: None,
                })
            }
            Err(err) => {
                let message = err.to_string();
                let status = self
                    .store
                    .fail_operation(
                        operation.id,
                        now,
                        &message,
                        self.settings.max_attempts,
                        now + self.settings.retry_delay,
                    )?
                    .unwrap_or(OperationStatus::Failed);
                warn!(
                    operation_id = operation.id,
                    operation_type = %operation.operation_type,
                    attempts = operation.attempts,
                    status = %status,
                    error = %message,
                    "operation failed"
                );
                Ok(OperationResult {
                    id: operation.id,
                    status,
                    error: Some(message),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dispatch_database::{queries, Database, NewOperation};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingHandler;

    impl OperationHandler for FailingHandler {
        fn handle(&self, _operation: &Operation) -> DispatchResult<()> {
            Err(DispatchError::Handler("partner unavailable".into()))
        }
    }

    #[derive(Default)]
    struct CountingHandler(AtomicUsize);

    impl OperationHandler for CountingHandler {
        fn handle(&self, _operation: &Operation) -> DispatchResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn seed(db: &Database, key: &str, operation_type: &str) -> i64 {
        queries::create_operation(
            db.connection(),
            &NewOperation {
                dedupe_key: key.into(),
                operation_type: operation_type.into(),
                payload: json!({}),
                created_at: t(0),
            },
        )
        .unwrap()
        .into_operation()
        .id
    }

    #[test]
    fn registered_handler_succeeds_operation() {
        let db = Database::open_in_memory().unwrap();
        let id = seed(&db, "outbox:a", "order.paid");
        let handler = Arc::new(CountingHandler::default());
        let mut registry = HandlerRegistry::new();
        registry.register("order.paid", handler.clone());

        let worker = OperationWorker::new(db, registry, OperationWorkerSettings::default());
        let report = worker.run_batch(t(1)).unwrap();

        assert_eq!(report.selected, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        let op = queries::get_operation(worker.store().connection(), id)
            .unwrap()
            .unwrap();
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert_eq!(op.updated_at, t(1));
    }

    #[test]
    fn missing_handler_fails_with_fixed_retry() {
        let db = Database::open_in_memory().unwrap();
        let id = seed(&db, "outbox:a", "unknown.type");

        let worker = OperationWorker::new(db, HandlerRegistry::new(), OperationWorkerSettings::default());
        let report = worker.run_batch(t(0)).unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.results[0].status, OperationStatus::Failed);
        assert!(report.results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("no handler registered"));

        let op = queries::get_operation(worker.store().connection(), id)
            .unwrap()
            .unwrap();
        assert_eq!(op.next_retry_at, Some(t(5)));
        assert!(worker.run_batch(t(4)).unwrap().results.is_empty());
    }

    #[test]
    fn failing_handler_dead_letters_after_max_attempts() {
        let db = Database::open_in_memory().unwrap();
        let id = seed(&db, "outbox:a", "order.paid");
        let mut registry = HandlerRegistry::new();
        registry.register("order.paid", Arc::new(FailingHandler));
        let worker = OperationWorker::new(db, registry, OperationWorkerSettings::default());

        let mut statuses = Vec::new();
        for round in 0..5 {
            let report = worker.run_batch(t(round * 5)).unwrap();
            statuses.push(report.results[0].status.clone());
        }

        assert_eq!(
            statuses,
            vec![
                OperationStatus::Failed,
                OperationStatus::Failed,
                OperationStatus::Failed,
                OperationStatus::Failed,
                OperationStatus::DeadLetter,
            ]
        );
        let op = queries::get_operation(worker.store().connection(), id)
            .unwrap()
            .unwrap();
        assert_eq!(op.attempts, 5);
        assert!(worker.run_batch(t(60)).unwrap().results.is_empty());
    }

    #[test]
    fn fallback_handler_covers_unregistered_types() {
        let db = Database::open_in_memory().unwrap();
        seed(&db, "outbox:a", "anything");
        let registry = HandlerRegistry::new().with_fallback(Arc::new(LogOperationHandler));
        assert!(!registry.is_empty());
        assert_eq!(registry.len(), 0);

        let worker = OperationWorker::new(db, registry, OperationWorkerSettings::default());
        assert_eq!(worker.run_batch(t(0)).unwrap().succeeded, 1);
    }

    #[test]
    fn batch_size_limits_selection_in_id_order() {
        let db = Database::open_in_memory().unwrap();
        let ids: Vec<i64> = (0..7)
            .map(|i| seed(&db, &format!("outbox:{i}"), "x"))
            .collect();
        let worker = OperationWorker::new(
            db,
            HandlerRegistry::new().with_fallback(Arc::new(LogOperationHandler)),
            OperationWorkerSettings::default(),
        );

        let report = worker.run_batch(t(0)).unwrap();
        let done: Vec<i64> = report.results.iter().map(|r| r.id).collect();
        assert_eq!(done, ids[..5].to_vec());
    }
}
