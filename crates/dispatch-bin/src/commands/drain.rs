//! Operation draining.

use super::{blocking, Context};
use crate::output;
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use tracing::info;

/// Totals over all batches of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub batches: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

impl fmt::Display for DrainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", output::heading("Operations drained"))?;
        writeln!(f, "{}", output::row("batches", self.batches))?;
        writeln!(f, "{}", output::row("succeeded", self.succeeded))?;
        writeln!(f, "{}", output::row("failed", self.failed))?;
        writeln!(f, "{}", output::row("dead lettered", self.dead_lettered))?;
        write!(f, "{}", output::row("skipped", self.skipped))
    }
}

/// Run worker batches until none selects anything or `max_batches` is hit.
///
/// Failed operations are not due again within one drain, so this ends.
pub async fn drain_operations(ctx: &Context, max_batches: usize) -> Result<DrainReport> {
    let drain_ctx = ctx.clone();
    let report = blocking(move || {
        let worker = drain_ctx.worker()?;
        let mut report = DrainReport::default();
        while report.batches < max_batches {
            let batch = worker.run_batch(Utc::now())?;
            if batch.selected == 0 {
                break;
            }
            report.batches += 1;
            report.succeeded += batch.succeeded;
            report.failed += batch.failed;
            report.dead_lettered += batch.dead_lettered;
            report.skipped += batch.skipped;
        }
        Ok(report)
    })
    .await?;

    info!(
        batches = report.batches,
        succeeded = report.succeeded,
        failed = report.failed,
        dead_lettered = report.dead_lettered,
        "operation drain complete"
    );
    output::print(&report, ctx.format);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::context;
    use crate::commands::{enqueue, run_once, EnqueueRequest};
    use crate::output::OutputFormat;

    #[tokio::test]
    async fn drain_completes_registered_operations() {
        let (_dir, ctx) = context(OutputFormat::Text);
        for i in 0..7 {
            enqueue(
                &ctx,
                EnqueueRequest {
                    event_type: "order.paid".into(),
                    payload: "{}".into(),
                    event_id: Some(format!("evt-{i}")),
                    correlation_id: None,
                    causation_id: None,
                },
            )
            .await
            .unwrap();
        }
        run_once(&ctx, None, None).await.unwrap();

        let report = drain_operations(&ctx, 100).await.unwrap();
        assert_eq!(report.succeeded, 7);
        assert_eq!(report.batches, 2);

        let again = drain_operations(&ctx, 100).await.unwrap();
        assert_eq!(again, DrainReport::default());
    }

    #[tokio::test]
    async fn drain_stops_at_batch_limit() {
        let (_dir, ctx) = context(OutputFormat::Json);
        for i in 0..7 {
            enqueue(
                &ctx,
                EnqueueRequest {
                    event_type: "x".into(),
                    payload: "{}".into(),
                    event_id: Some(format!("evt-{i}")),
                    correlation_id: None,
                    causation_id: None,
                },
            )
            .await
            .unwrap();
        }
        run_once(&ctx, None, None).await.unwrap();

        let report = drain_operations(&ctx, 1).await.unwrap();
        assert_eq!(report.batches, 1);
        assert_eq!(report.succeeded, 5);
    }
}
