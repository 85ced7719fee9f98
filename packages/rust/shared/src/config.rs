//! Application configuration for trawler.
//!
//! User config lives at `~/.trawler/trawler.toml`. CLI flags override
//! config file values, which override defaults. All settings are resolved
//! once at startup into an [`AppConfig`] that is passed by reference into
//! Registry, WorkerPool, and Scheduler construction — there is no ambient
//! mutable singleton.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrawlerError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "trawler.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".trawler";

/// Backend address selecting the in-process backend.
pub const MEMORY_BACKEND: &str = "memory";

// ---------------------------------------------------------------------------
// Config structs (matching trawler.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Process-wide execution settings.
    #[serde(default)]
    pub settings: SettingsConfig,

    /// Backend selection.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Worker/scheduler runtime knobs.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// `[settings]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Verbose logging.
    #[serde(default)]
    pub debug: bool,

    /// Enable response caching in stage execution (consumed by stages,
    /// not the core).
    #[serde(default = "default_true")]
    pub http_cache: bool,

    /// Enable incremental dedup filtering.
    #[serde(default = "default_true")]
    pub incremental: bool,

    /// Keep draining a crawler's queue after a stage failure.
    #[serde(default)]
    pub continue_on_error: bool,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            debug: false,
            http_cache: true,
            incremental: true,
            continue_on_error: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// `[backend]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `"memory"` for the in-process backend, or a path to a SQLite
    /// database file for the durable one.
    #[serde(default = "default_backend_address")]
    pub address: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: default_backend_address(),
        }
    }
}

fn default_backend_address() -> String {
    MEMORY_BACKEND.into()
}

/// `[runtime]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding crawler definition files (`*.toml`).
    #[serde(default = "default_crawlers_dir")]
    pub crawlers_dir: String,

    /// Default worker count when `--threads` is not given.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Upper bound on a single blocking dequeue, in milliseconds.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Interval between scheduler passes, in seconds.
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            crawlers_dir: default_crawlers_dir(),
            threads: default_threads(),
            poll_timeout_ms: default_poll_timeout_ms(),
            scheduler_interval_secs: default_scheduler_interval_secs(),
        }
    }
}

fn default_crawlers_dir() -> String {
    "crawlers".into()
}
fn default_threads() -> usize {
    4
}
fn default_poll_timeout_ms() -> u64 {
    500
}
fn default_scheduler_interval_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.trawler/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TrawlerError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.trawler/trawler.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file
/// does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TrawlerError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TrawlerError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TrawlerError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TrawlerError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TrawlerError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("http_cache"));
        assert!(toml_str.contains("crawlers_dir"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.runtime.threads, 4);
        assert_eq!(parsed.backend.address, MEMORY_BACKEND);
        assert!(parsed.settings.incremental);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[settings]
incremental = false

[backend]
address = "/var/lib/trawler/trawler.db"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert!(!config.settings.incremental);
        assert!(config.settings.http_cache);
        assert_eq!(config.backend.address, "/var/lib/trawler/trawler.db");
        assert_eq!(config.runtime.poll_timeout_ms, 500);
    }
}
