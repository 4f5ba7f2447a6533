//! Transactional outbox dispatch engine.
//!
//! One dispatch cycle leases a fair batch of pending outbox events,
//! registers each event's side effect at most once in the operation
//! ledger, and records a published / retry / dead-letter outcome per
//! event. The [`OperationWorker`] is the downstream processor that
//! advances ledger entries to a terminal status.
//!
//! ```ignore
//! let db = Database::open(&path)?;
//! let dispatcher = Dispatcher::new(db, DispatchSettings::from(&config.dispatch));
//! let report = dispatcher.run_cycle(CycleRequest::default());
//! ```

mod backoff;
mod claim;
mod cycle;
mod error;
mod fairness;
mod operations;
mod processor;
mod settings;
mod store;

#[cfg(test)]
mod tests;

pub use backoff::BackoffPolicy;
pub use claim::{ClaimManager, ClaimPath, ClaimedBatch};
pub use cycle::{CycleReport, CycleRequest, Dispatcher, EventOutcome};
pub use error::{DispatchError, DispatchResult};
pub use fairness::{build_fair_batch, BatchCandidate};
pub use operations::{
    HandlerRegistry, LogOperationHandler, OperationHandler, OperationResult, OperationRunReport,
    OperationWorker, OperationWorkerSettings,
};
pub use processor::{
    dedupe_key, DispatchOutcome, EventProcessor, OperationSnapshot, MAX_ATTEMPTS_EXCEEDED,
    OPERATION_DEAD_LETTER,
};
pub use settings::DispatchSettings;
pub use store::{OperationStore, OutboxStore};
