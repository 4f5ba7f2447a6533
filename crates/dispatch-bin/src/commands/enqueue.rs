//! Enqueue command.

use super::{blocking, Context};
use crate::output;
use anyhow::{Context as _, Result};
use dispatch_database::{queries, NewOutboxEvent, OutboxEvent};
use std::fmt;
use uuid::Uuid;

/// Arguments of `enqueue`.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub event_type: String,
    pub payload: String,
    pub event_id: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

impl EnqueueRequest {
    fn into_new_event(self) -> Result<NewOutboxEvent> {
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).context("payload is not valid JSON")?;
        let event_id = self
            .event_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut event = NewOutboxEvent::new(event_id, self.event_type, payload);
        if let Some(correlation_id) = self.correlation_id {
            event = event.with_correlation_id(correlation_id);
        }
        if let Some(causation_id) = self.causation_id {
            event = event.with_causation_id(causation_id);
        }
        Ok(event)
    }
}

#[derive(Debug, serde::Serialize)]
struct Enqueued(OutboxEvent);

impl fmt::Display for Enqueued {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Enqueued outbox event")?;
        writeln!(f, "{}", output::row("event id", &self.0.event_id))?;
        writeln!(f, "{}", output::row("event type", &self.0.event_type))?;
        write!(f, "{}", output::row("created at", self.0.created_at.to_rfc3339()))
    }
}

/// Insert one outbox event. A duplicate event id is an error.
pub async fn enqueue(ctx: &Context, request: EnqueueRequest) -> Result<OutboxEvent> {
    let new_event = request.into_new_event()?;
    let db_ctx = ctx.clone();
    let event = blocking(move || {
        let db = db_ctx.open_database()?;
        queries::insert_outbox_event(db.connection(), &new_event)
            .with_context(|| format!("failed to enqueue event {}", new_event.event_id))
    })
    .await?;

    output::print(&Enqueued(event.clone()), ctx.format);
    Ok(event)
}
