//! Database model types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outbox event - one domain fact awaiting (or past) dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processing_token: Option<String>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reason_code: Option<String>,
    pub error_class: Option<String>,
    pub error_stack: Option<String>,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn state(&self) -> OutboxEventState {
        if self.published_at.is_some() {
            OutboxEventState::Published
        } else if self.dead_lettered_at.is_some() {
            OutboxEventState::DeadLettered
        } else {
            OutboxEventState::Pending
        }
    }
}

/// Lifecycle state of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxEventState {
    Pending,
    Published,
    DeadLettered,
}

impl OutboxEventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Input for enqueuing an outbox event.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl NewOutboxEvent {
    pub fn new(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
            causation_id: None,
            correlation_id: None,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Eligibility window for one claim.
///
/// A row is eligible when it is pending, due (`next_attempt_at <= now`),
/// and either unclaimed or claimed at or before `stale_before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimWindow {
    pub now: DateTime<Utc>,
    pub stale_before: DateTime<Utc>,
    /// Maximum number of candidates read.
    pub lookahead: usize,
}

impl ClaimWindow {
    pub fn new(now: DateTime<Utc>, stale_claim_window: Duration, lookahead: usize) -> Self {
        Self {
            now,
            stale_before: now - stale_claim_window,
            lookahead,
        }
    }
}

/// Diagnostics captured for a failed processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFailure {
    pub reason_code: String,
    pub error_class: String,
    pub error_stack: Option<String>,
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedFailure {
    /// Attempts after the increment.
    pub attempts: u32,
    pub dead_lettered: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Row counts per outbox state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventStateCounts {
    pub pending: u64,
    pub published: u64,
    pub dead_lettered: u64,
}

/// Operation status.
///
/// Unknown values written by other processors are kept verbatim and
/// treated as non-terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
    Other(String),
}

impl OperationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
            Self::Other(s) => s.as_str(),
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "DEAD_LETTER" => Self::DeadLetter,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Self::DeadLetter)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_terminal_success() || self.is_dead_letter()
    }
}

impl From<String> for OperationStatus {
    fn from(s: String) -> Self {
        Self::from_str(&s)
    }
}

impl From<OperationStatus> for String {
    fn from(status: OperationStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation - dedupe ledger entry recording that a side effect was registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: i64,
    pub dedupe_key: String,
    pub operation_type: String,
    pub status: OperationStatus,
    pub attempts: u32,
    pub payload: serde_json::Value,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an operation.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub dedupe_key: String,
    pub operation_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Outcome of creating an operation under a unique dedupe key.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOperationOutcome {
    Created(Operation),
    /// Another writer registered the key first.
    AlreadyExists(Operation),
}

impl CreateOperationOutcome {
    pub fn operation(&self) -> &Operation {
        match self {
            Self::Created(op) | Self::AlreadyExists(op) => op,
        }
    }

    pub fn into_operation(self) -> Operation {
        match self {
            Self::Created(op) | Self::AlreadyExists(op) => op,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_status_roundtrip() {
        for status in [
            OperationStatus::Pending,
            OperationStatus::Running,
            OperationStatus::Succeeded,
            OperationStatus::Failed,
            OperationStatus::DeadLetter,
        ] {
            assert_eq!(OperationStatus::from_str(status.as_str()), status);
        }
    }

    #[test]
    fn test_unknown_status_is_non_terminal() {
        let status = OperationStatus::from_str("WAITING_ON_PARTNER");
        assert_eq!(status, OperationStatus::Other("WAITING_ON_PARTNER".into()));
        assert_eq!(status.as_str(), "WAITING_ON_PARTNER");
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_operation_status_serializes_as_string() {
        let json = serde_json::to_string(&OperationStatus::DeadLetter).unwrap();
        assert_eq!(json, "\"DEAD_LETTER\"");
        let parsed: OperationStatus = serde_json::from_str("\"SUCCEEDED\"").unwrap();
        assert!(parsed.is_terminal_success());
    }

    #[test]
    fn test_claim_window_stale_boundary() {
        let now = Utc::now();
        let window = ClaimWindow::new(now, Duration::minutes(15), 10);
        assert_eq!(window.stale_before, now - Duration::minutes(15));
        assert_eq!(window.lookahead, 10);
    }
}
