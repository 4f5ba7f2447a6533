//! Dispatch cycle orchestration.

use crate::{
    ClaimManager, ClaimPath, DispatchOutcome, DispatchSettings, EventProcessor, OutboxStore,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Optional overrides for one cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleRequest {
    pub now: Option<DateTime<Utc>>,
    pub batch_size: Option<usize>,
}

/// Outcome for one claimed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOutcome {
    pub event_id: String,
    pub event_type: String,
    pub outcome: DispatchOutcome,
}

/// Summary of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub batch_size: usize,
    pub claimed: usize,
    pub published: usize,
    pub retry: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_path: Option<ClaimPath>,
    pub outcomes: Vec<EventOutcome>,
}

impl CycleReport {
    fn tally(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Published => self.published += 1,
            DispatchOutcome::Retry => self.retry += 1,
            DispatchOutcome::DeadLetter => self.dead_lettered += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Runs dispatch cycles against one store.
pub struct Dispatcher<S> {
    store: S,
    settings: DispatchSettings,
}

impl<S: OutboxStore> Dispatcher<S> {
    pub fn new(store: S, settings: DispatchSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Claim a batch and process each event in claim order.
    ///
    /// Per-event failures are folded into the outcomes; this never fails.
    pub fn run_cycle(&self, request: CycleRequest) -> CycleReport {
        let now = request.now.unwrap_or_else(Utc::now);
        let batch_size = request
            .batch_size
            .unwrap_or(self.settings.batch_size)
            .max(1);

        let batch = ClaimManager::new(&self.store, &self.settings).claim(now, batch_size);
        let mut report = CycleReport {
            batch_size,
            claimed: batch.events.len(),
            claim_path: batch.path,
            ..Default::default()
        };

        if batch.is_empty() {
            info!(
                batch_size,
                claimed = 0,
                published = 0,
                retry = 0,
                dead_lettered = 0,
                skipped = 0,
                "outbox dispatch cycle empty"
            );
            return report;
        }

        let processor = EventProcessor::new(&self.store, &self.settings);
        for event in &batch.events {
            let outcome = processor.process(event, &batch.processing_token, now);
            report.tally(outcome);
            report.outcomes.push(EventOutcome {
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                outcome,
            });
        }

        info!(
            batch_size,
            claimed = report.claimed,
            published = report.published,
            retry = report.retry,
            dead_lettered = report.dead_lettered,
            skipped = report.skipped,
            claim_path = batch.path.map(|p| p.as_str()).unwrap_or("none"),
            processing_token = %batch.processing_token,
            "outbox dispatch cycle complete"
        );
        report
    }
}
