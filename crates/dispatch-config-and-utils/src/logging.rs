//! Logging initialization for the dispatcher.
//!
//! Thin wrapper over the observability crate. Every dispatcher process
//! writes structured JSONL to `<base>/logs/dispatch.jsonl`.

use crate::Paths;
use observability::LogConfig;

/// Initialize the logging system.
///
/// * `level` - Default log level (trace, debug, info, warn, error);
///   `RUST_LOG` takes precedence when set.
/// * `paths` - Determines the log file location.
/// * `also_stderr` - Mirror compact lines to stderr (foreground runs).
pub fn init_logging(level: &str, paths: &Paths, also_stderr: bool) {
    observability::init_with_config(LogConfig {
        service_name: "outbox-dispatcher".into(),
        default_level: parse_level(level).as_str().to_ascii_lowercase(),
        log_path: Some(paths.log_file()),
        also_stderr,
    });
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
