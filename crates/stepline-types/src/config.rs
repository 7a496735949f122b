//! Engine configuration types for Stepline.
//!
//! `EngineConfig` represents the top-level `config.toml` that sizes the
//! worker pool, tunes job polling and names the database file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a Stepline engine process.
///
/// Loaded from `~/.stepline/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent workers pulling step jobs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Deliveries of one job before the queue discards it.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    /// Timeout applied to steps that do not configure their own.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// How long shutdown waits for in-flight jobs.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// SQLite file name inside the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// How often idle workers look for available jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A job claimed longer ago than this is considered abandoned by its
    /// worker and becomes claimable again. Keep it above the longest step timeout.
    #[serde(default = "default_rescue_after_secs")]
    pub rescue_after_secs: u64,
}

fn default_workers() -> usize {
    4
}

fn default_max_delivery_attempts() -> u32 {
    25
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_database_file() -> String {
    "stepline.db".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_rescue_after_secs() -> u64 {
    900
}

impl EngineConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rescue_after(&self) -> Duration {
        Duration::from_secs(self.rescue_after_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_delivery_attempts: default_max_delivery_attempts(),
            default_step_timeout_secs: default_step_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            database_file: default_database_file(),
            poll_interval_ms: default_poll_interval_ms(),
            rescue_after_secs: default_rescue_after_secs(),
        }
    }
}
