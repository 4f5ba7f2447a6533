//! Polling service.

use super::{blocking, Context};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use dispatch_database::Database;
use dispatch_engine::{CycleReport, CycleRequest, Dispatcher, OperationRunReport, OperationWorker};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Dispatcher and operation worker, each on its own connection.
pub(crate) struct Runner {
    dispatcher: Dispatcher<Database>,
    worker: OperationWorker<Database>,
}

impl Runner {
    pub(crate) fn open(ctx: &Context) -> Result<Self> {
        Ok(Self {
            dispatcher: ctx.dispatcher()?,
            worker: ctx.worker()?,
        })
    }

    /// One dispatch cycle followed by one operation batch.
    fn tick(&self, now: DateTime<Utc>) -> Result<(CycleReport, OperationRunReport)> {
        let cycle = self.dispatcher.run_cycle(CycleRequest {
            now: Some(now),
            batch_size: None,
        });
        let operations = self.worker.run_batch(now)?;
        Ok((cycle, operations))
    }
}

/// Run one tick on a blocking thread.
pub(crate) async fn run_tick(
    runner: &Arc<Mutex<Runner>>,
    now: DateTime<Utc>,
) -> Result<(CycleReport, OperationRunReport)> {
    let runner = Arc::clone(runner);
    blocking(move || {
        let runner = runner
            .lock()
            .map_err(|_| anyhow!("dispatch runner lock poisoned"))?;
        runner.tick(now)
    })
    .await
}

/// Poll until Ctrl-C. A failed tick is logged and the loop continues.
pub async fn serve(ctx: &Context, interval_ms: Option<u64>) -> Result<()> {
    let interval_ms = interval_ms.unwrap_or(ctx.config.poll_interval_ms).max(1);
    let runner = Arc::new(Mutex::new(Runner::open(ctx)?));

    info!(
        database = %ctx.database_path().display(),
        interval_ms,
        batch_size = ctx.config.dispatch.batch_size,
        claim_capability = ctx.config.dispatch.claim_capability.as_str(),
        "outbox dispatcher serving"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = run_tick(&runner, Utc::now()).await {
                    error!(error = %e, "dispatch tick failed");
                }
            }
            _ = &mut shutdown => {
                info!("Received shutdown signal, exiting...");
                break;
            }
        }
    }

    Ok(())
}
