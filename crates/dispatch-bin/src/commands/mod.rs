//! CLI command implementations.
//!
//! Storage work is synchronous; every command runs it on a blocking thread.

mod drain;
mod enqueue;
mod run_once;
mod serve;
mod status;

pub use drain::drain_operations;
pub use enqueue::{enqueue, EnqueueRequest};
pub use run_once::run_once;
pub use serve::serve;
pub use status::status;

use crate::output::OutputFormat;
use anyhow::{Context as _, Result};
use dispatch_config_and_utils::{Config, Paths};
use dispatch_database::Database;
use dispatch_engine::{
    DispatchSettings, Dispatcher, HandlerRegistry, LogOperationHandler, OperationWorker,
    OperationWorkerSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Resolved paths and configuration shared by all commands.
#[derive(Debug, Clone)]
pub struct Context {
    pub paths: Paths,
    pub config: Config,
    pub format: OutputFormat,
}

impl Context {
    pub fn new(paths: Paths, config: Config, format: OutputFormat) -> Self {
        Self {
            paths,
            config,
            format,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.config.database_path(&self.paths)
    }

    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings::from(&self.config.dispatch)
    }

    /// Open a connection that waits up to the configured max wait for locks.
    pub fn open_database(&self) -> Result<Database> {
        let path = self.database_path();
        let busy_timeout = Duration::from_millis(self.config.dispatch.transaction_max_wait_ms);
        Database::open_with_busy_timeout(&path, busy_timeout)
            .with_context(|| format!("failed to open database at {}", path.display()))
    }

    pub fn dispatcher(&self) -> Result<Dispatcher<Database>> {
        Ok(Dispatcher::new(self.open_database()?, self.settings()))
    }

    /// Operation worker on its own connection with the logging handler for every type.
    pub fn worker(&self) -> Result<OperationWorker<Database>> {
        let registry = HandlerRegistry::new().with_fallback(Arc::new(LogOperationHandler));
        Ok(OperationWorker::new(
            self.open_database()?,
            registry,
            OperationWorkerSettings::default(),
        ))
    }
}

/// Run blocking storage work off the async runtime.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("blocking task panicked")?
}
