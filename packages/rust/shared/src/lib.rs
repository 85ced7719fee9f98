//! Shared types, error model, and configuration for trawler.
//!
//! This crate is the foundation depended on by all other trawler crates.
//! It provides:
//! - [`TrawlerError`] — the unified error type
//! - Domain types ([`Operation`], [`CrawlerState`], [`Fingerprint`], [`Schedule`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BackendConfig, MEMORY_BACKEND, RuntimeConfig, SettingsConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{Result, TrawlerError};
pub use types::{
    CrawlerState, CrawlerStatus, DerivedOp, Fingerprint, OpId, Operation, Schedule, StageOutput,
    TagWrite,
};
