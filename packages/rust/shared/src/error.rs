//! Error types for trawler.
//!
//! Library crates use [`TrawlerError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::CrawlerState;

/// Top-level error type for all trawler operations.
#[derive(Debug, thiserror::Error)]
pub enum TrawlerError {
    /// Unknown crawler name. Surfaced immediately, no state change.
    #[error("crawler [{0}] not found")]
    NotFound(String),

    /// A state-machine action was requested against an incompatible state.
    #[error("crawler [{crawler}] cannot {action} while {state}")]
    InvalidTransition {
        crawler: String,
        action: &'static str,
        state: CrawlerState,
    },

    /// A pipeline-stage handler failed on an operation.
    #[error("stage [{stage}] failed: {message}")]
    Stage { stage: String, message: String },

    /// The queue/dedup backend cannot be reached or rejected a write.
    /// Fatal for the current run.
    #[error("backend error: {0}")]
    Backend(String),

    /// A multi-worker run was requested against a backend that cannot
    /// safely support it. Refused before any worker starts.
    #[error("backend [{backend}] does not support concurrent workers ({requested} requested)")]
    UnsupportedConcurrency { backend: String, requested: usize },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Crawler definition validation error (bad schedule, dangling stage, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TrawlerError>;

impl TrawlerError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a stage error from any displayable message.
    pub fn stage(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
