//! Configuration, paths, and logging setup for the outbox dispatcher.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{ClaimCapability, Config, DispatchConfig, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
