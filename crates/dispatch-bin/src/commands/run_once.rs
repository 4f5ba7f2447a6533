//! Single dispatch cycle.

use super::{blocking, Context};
use crate::output;
use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use dispatch_engine::{CycleReport, CycleRequest};

/// Parse the `--now` override.
pub(crate) fn parse_now(now: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    now.map(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|parsed| parsed.with_timezone(&Utc))
            .with_context(|| format!("invalid --now timestamp: {value}"))
    })
    .transpose()
}

/// Run one cycle and print its report as JSON.
pub async fn run_once(
    ctx: &Context,
    batch_size: Option<usize>,
    now: Option<&str>,
) -> Result<CycleReport> {
    let request = CycleRequest {
        now: parse_now(now)?,
        batch_size,
    };
    let cycle_ctx = ctx.clone();
    let report = blocking(move || Ok(cycle_ctx.dispatcher()?.run_cycle(request))).await?;

    output::print_json(&report);
    Ok(report)
}
