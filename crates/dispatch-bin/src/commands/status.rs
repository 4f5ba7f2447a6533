//! Status command.

use super::{blocking, Context};
use crate::output;
use anyhow::Result;
use dispatch_database::{queries, EventStateCounts, OperationStatus};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterSummary {
    pub event_id: String,
    pub event_type: String,
    pub attempts: u32,
    pub reason_code: Option<String>,
    pub dead_lettered_at: Option<String>,
}

/// Event and operation counts plus the latest dead letters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub database: String,
    pub events: EventStateCounts,
    pub operations: Vec<(OperationStatus, u64)>,
    pub dead_letters: Vec<DeadLetterSummary>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", output::row("database", &self.database))?;
        writeln!(f)?;
        writeln!(f, "{}", output::heading("Outbox events"))?;
        writeln!(f, "{}", output::row("pending", self.events.pending))?;
        writeln!(f, "{}", output::row("published", self.events.published))?;
        writeln!(f, "{}", output::row("dead lettered", self.events.dead_lettered))?;
        writeln!(f)?;
        write!(f, "{}", output::heading("Operations"))?;
        if self.operations.is_empty() {
            write!(f, "\n  (none)")?;
        }
        for (status, count) in &self.operations {
            write!(f, "\n{}", output::row(status.as_str(), count))?;
        }
        if !self.dead_letters.is_empty() {
            write!(f, "\n\n{}", output::heading("Recent dead letters"))?;
            for dead in &self.dead_letters {
                write!(
                    f,
                    "\n  {} {} attempts={} reason={}",
                    dead.event_id,
                    dead.event_type,
                    dead.attempts,
                    dead.reason_code.as_deref().unwrap_or("-")
                )?;
            }
        }
        Ok(())
    }
}

pub async fn status(ctx: &Context, dead_letters: usize) -> Result<StatusReport> {
    let status_ctx = ctx.clone();
    let report = blocking(move || {
        let db = status_ctx.open_database()?;
        let conn = db.connection();
        let dead_letters = queries::list_dead_lettered_events(conn, dead_letters)?
            .into_iter()
            .map(|event| DeadLetterSummary {
                event_id: event.event_id,
                event_type: event.event_type,
                attempts: event.attempts,
                reason_code: event.reason_code,
                dead_lettered_at: event.dead_lettered_at.map(|at| at.to_rfc3339()),
            })
            .collect();
        Ok(StatusReport {
            database: status_ctx.database_path().display().to_string(),
            events: queries::count_events_by_state(conn)?,
            operations: queries::count_operations_by_status(conn)?,
            dead_letters,
        })
    })
    .await?;

    output::print(&report, ctx.format);
    Ok(report)
}
