//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.stepline/` unless
//! `STEPLINE_DATA_DIR` says otherwise) into [`EngineConfig`]. A missing or
//! malformed file yields the defaults.

use std::path::{Path, PathBuf};

use stepline_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STEPLINE_DATA_DIR";

/// Resolve the Stepline data directory.
///
/// Checks `STEPLINE_DATA_DIR` first, then `~/.stepline`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepline");
    }

    PathBuf::from(".stepline")
}

/// Load engine configuration from `{data_dir}/config.toml`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Path of the SQLite database for `config` inside `data_dir`.
pub fn database_path(data_dir: &Path, config: &EngineConfig) -> PathBuf {
    data_dir.join(&config.database_file)
}
