//! Configuration management for the dispatcher.

use crate::{CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// How the claim manager may lease rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClaimCapability {
    /// The connection can hold a multi-statement write transaction.
    #[default]
    Transactional,
    /// Only single-statement conditional updates are safe.
    ConditionalUpdateOnly,
}

impl ClaimCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transactional => "transactional",
            Self::ConditionalUpdateOnly => "conditional_update_only",
        }
    }
}

impl FromStr for ClaimCapability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transactional" => Ok(Self::Transactional),
            "conditional_update_only" | "conditional-update-only" => {
                Ok(Self::ConditionalUpdateOnly)
            }
            other => Err(format!("unknown claim capability: {other}")),
        }
    }
}

/// Knobs for one dispatch cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum events processed per cycle.
    pub batch_size: usize,
    /// Lookahead window is `batch_size * lookahead_multiplier` candidates.
    pub lookahead_multiplier: usize,
    /// Attempts after which an event is dead-lettered.
    pub max_attempts: u32,
    /// Retry delay per attempt.
    pub base_backoff_ms: u64,
    /// Upper bound on the retry delay.
    pub backoff_cap_ms: u64,
    /// How long a lease is honoured before another cycle may reclaim the row.
    pub stale_claim_window_ms: u64,
    /// Budget for the transactional select-and-mark.
    pub transaction_timeout_ms: u64,
    /// How long to wait for the database write lock.
    pub transaction_max_wait_ms: u64,
    pub claim_capability: ClaimCapability,
    /// Skip the transactional claim even when the connection supports it.
    pub force_fallback: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            lookahead_multiplier: 5,
            max_attempts: 5,
            base_backoff_ms: 5 * 60 * 1000,
            backoff_cap_ms: 30 * 60 * 1000,
            stale_claim_window_ms: 15 * 60 * 1000,
            transaction_timeout_ms: 60_000,
            transaction_max_wait_ms: 5_000,
            claim_capability: ClaimCapability::Transactional,
            force_fallback: false,
        }
    }
}

/// Main dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// SQLite database file. Defaults to `<base>/outbox.sqlite`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Delay between cycles in `serve` mode.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            database_path: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from `<base>/config.json`, falling back to
    /// defaults, then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.normalize();

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.normalize();
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let config_path = paths.config_file();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Resolved database file path.
    pub fn database_path(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(log_level) = lookup("OUTBOX_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(path) = lookup("OUTBOX_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = Some(PathBuf::from(path));
            }
        }

        let dispatch = &mut self.dispatch;
        override_parsed(&lookup, "OUTBOX_BATCH_SIZE", &mut dispatch.batch_size);
        override_parsed(
            &lookup,
            "OUTBOX_LOOKAHEAD_MULTIPLIER",
            &mut dispatch.lookahead_multiplier,
        );
        override_parsed(
            &lookup,
            "OUTBOX_TX_TIMEOUT_MS",
            &mut dispatch.transaction_timeout_ms,
        );
        override_parsed(
            &lookup,
            "OUTBOX_TX_MAX_WAIT_MS",
            &mut dispatch.transaction_max_wait_ms,
        );
        override_parsed(
            &lookup,
            "OUTBOX_CLAIM_CAPABILITY",
            &mut dispatch.claim_capability,
        );
        if let Some(raw) = lookup("OUTBOX_FORCE_FALLBACK") {
            match parse_flag(&raw) {
                Some(flag) => dispatch.force_fallback = flag,
                None => warn!(key = "OUTBOX_FORCE_FALLBACK", value = %raw, "ignoring invalid config override"),
            }
        }
        override_parsed(&lookup, "OUTBOX_POLL_INTERVAL_MS", &mut self.poll_interval_ms);

        self.normalize();
    }

    fn normalize(&mut self) {
        self.dispatch.batch_size = self.dispatch.batch_size.max(1);
        self.dispatch.lookahead_multiplier = self.dispatch.lookahead_multiplier.max(1);
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "ignoring invalid config override"),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.poll_interval_ms, 5_000);
        assert_eq!(config.dispatch.batch_size, 50);
        assert_eq!(config.dispatch.lookahead_multiplier, 5);
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.dispatch.base_backoff_ms, 300_000);
        assert_eq!(config.dispatch.backoff_cap_ms, 1_800_000);
        assert_eq!(config.dispatch.stale_claim_window_ms, 900_000);
        assert_eq!(config.dispatch.transaction_timeout_ms, 60_000);
        assert_eq!(config.dispatch.transaction_max_wait_ms, 5_000);
        assert_eq!(
            config.dispatch.claim_capability,
            ClaimCapability::Transactional
        );
        assert!(!config.dispatch.force_fallback);
    }

    #[test]
    fn test_config_load_from_file_partial_dispatch() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "dispatch": { "batch_size": 10, "claim_capability": "conditional_update_only" }
        }"#;
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.dispatch.batch_size, 10);
        assert_eq!(config.dispatch.lookahead_multiplier, 5);
        assert_eq!(
            config.dispatch.claim_capability,
            ClaimCapability::ConditionalUpdateOnly
        );
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.log_level = "trace".to_string();
        config.dispatch.force_fallback = true;
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded.log_level, "trace");
        assert!(loaded.dispatch.force_fallback);
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"log_level":"info","dispatch":{"batch_size":0}}"#,
        )
        .unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.dispatch.batch_size, 1);
    }

    #[test]
    fn test_env_overrides_apply() {
        let vars = env(&[
            ("OUTBOX_LOG_LEVEL", "warn"),
            ("OUTBOX_DATABASE_PATH", "/tmp/custom.sqlite"),
            ("OUTBOX_BATCH_SIZE", "7"),
            ("OUTBOX_LOOKAHEAD_MULTIPLIER", "3"),
            ("OUTBOX_TX_TIMEOUT_MS", "1000"),
            ("OUTBOX_TX_MAX_WAIT_MS", "250"),
            ("OUTBOX_CLAIM_CAPABILITY", "conditional_update_only"),
            ("OUTBOX_FORCE_FALLBACK", "true"),
            ("OUTBOX_POLL_INTERVAL_MS", "100"),
        ]);

        let mut config = Config::default();
        config.apply_env(|key| vars.get(key).cloned());

        assert_eq!(config.log_level, "warn");
        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/tmp/custom.sqlite"))
        );
        assert_eq!(config.dispatch.batch_size, 7);
        assert_eq!(config.dispatch.lookahead_multiplier, 3);
        assert_eq!(config.dispatch.transaction_timeout_ms, 1000);
        assert_eq!(config.dispatch.transaction_max_wait_ms, 250);
        assert_eq!(
            config.dispatch.claim_capability,
            ClaimCapability::ConditionalUpdateOnly
        );
        assert!(config.dispatch.force_fallback);
        assert_eq!(config.poll_interval_ms, 100);
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let vars = env(&[
            ("OUTBOX_BATCH_SIZE", "lots"),
            ("OUTBOX_CLAIM_CAPABILITY", "pooled"),
            ("OUTBOX_FORCE_FALLBACK", "maybe"),
            ("OUTBOX_TX_TIMEOUT_MS", "-5"),
        ]);

        let mut config = Config::default();
        config.apply_env(|key| vars.get(key).cloned());

        assert_eq!(config.dispatch.batch_size, 50);
        assert_eq!(
            config.dispatch.claim_capability,
            ClaimCapability::Transactional
        );
        assert!(!config.dispatch.force_fallback);
        assert_eq!(config.dispatch.transaction_timeout_ms, 60_000);
    }

    #[test]
    fn test_env_zero_batch_size_is_clamped() {
        let vars = env(&[("OUTBOX_BATCH_SIZE", "0")]);
        let mut config = Config::default();
        config.apply_env(|key| vars.get(key).cloned());
        assert_eq!(config.dispatch.batch_size, 1);
    }

    #[test]
    fn test_database_path_defaults_under_base_dir() {
        let paths = Paths::with_base_dir(PathBuf::from("/tmp/outbox"));
        let config = Config::default();
        assert_eq!(
            config.database_path(&paths),
            PathBuf::from("/tmp/outbox/outbox.sqlite")
        );
    }

    #[test]
    fn test_claim_capability_from_str() {
        assert_eq!(
            "Transactional".parse::<ClaimCapability>().unwrap(),
            ClaimCapability::Transactional
        );
        assert_eq!(
            "conditional-update-only".parse::<ClaimCapability>().unwrap(),
            ClaimCapability::ConditionalUpdateOnly
        );
        assert!("pgbouncer".parse::<ClaimCapability>().is_err());
    }
}
