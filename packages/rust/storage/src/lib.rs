//! Pluggable durable storage for trawler: operation queues, dedup
//! fingerprints, tags, and run metadata.
//!
//! The [`Backend`] trait is the atomicity primitive the execution engine
//! builds on — queue pops and fingerprint inserts are atomic so callers
//! never need their own locking. Implementations differ in durability and
//! in whether they can serve several concurrent workers; the
//! [`Backend::supports_concurrent_workers`] capability flag carries that
//! distinction and is checked once at pool-start time.

mod memory;
mod migrations;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use trawler_shared::{Fingerprint, MEMORY_BACKEND, Operation, Result};

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstract durable store for operations, fingerprints, tags, and run
/// metadata.
///
/// Delivery contract: at-least-once. A popped operation that is never
/// completed (worker crash mid-operation) is lost from the queue; stage
/// handlers are expected to be idempotent.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name for logs and error messages.
    fn name(&self) -> &'static str;

    /// Whether several worker tasks may safely share this backend.
    fn supports_concurrent_workers(&self) -> bool;

    // -- operation queue ----------------------------------------------------

    /// Append an operation to its crawler's FIFO queue.
    async fn queue_push(&self, op: Operation) -> Result<()>;

    /// Remove and return one operation from the queues of the given
    /// crawlers, blocking up to `timeout`. Round-robin fair across
    /// crawlers; FIFO within each crawler. Returns `None` on timeout.
    async fn queue_pop(
        &self,
        crawlers: &[String],
        timeout: Duration,
    ) -> Result<Option<Operation>>;

    /// Number of operations queued for a crawler.
    async fn queue_len(&self, crawler: &str) -> Result<u64>;

    /// Drop all queued operations for a crawler. Returns the count removed.
    async fn queue_clear(&self, crawler: &str) -> Result<u64>;

    // -- dedup fingerprints -------------------------------------------------

    /// Atomically insert a fingerprint if absent. Returns `true` when the
    /// fingerprint was newly inserted, `false` when it was already present.
    async fn fingerprint_add(&self, crawler: &str, fp: &Fingerprint) -> Result<bool>;

    /// Pure presence check.
    async fn fingerprint_exists(&self, crawler: &str, fp: &Fingerprint) -> Result<bool>;

    /// Remove every fingerprint recorded for a crawler.
    async fn fingerprint_clear(&self, crawler: &str) -> Result<u64>;

    // -- tags ---------------------------------------------------------------

    /// Set a tag value, replacing any previous value for the key.
    async fn tag_set(&self, crawler: &str, key: &str, value: &serde_json::Value) -> Result<()>;

    /// Read a tag value.
    async fn tag_get(&self, crawler: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Remove every tag recorded for a crawler.
    async fn tags_clear(&self, crawler: &str) -> Result<u64>;

    // -- run metadata -------------------------------------------------------

    /// Timestamp of the crawler's last completed run, if any.
    async fn last_run_get(&self, crawler: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record the crawler's last completed run.
    async fn last_run_set(&self, crawler: &str, at: DateTime<Utc>) -> Result<()>;

    // -- destructive scopes -------------------------------------------------

    /// Purge one crawler's queue, fingerprints, tags, and run metadata.
    /// Never touches another crawler's data.
    async fn flush_crawler(&self, crawler: &str) -> Result<()>;

    /// Purge the entire store, across all crawlers.
    async fn flush_all(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Open the backend selected by a config address: `"memory"` for the
/// in-process backend, anything else is treated as a SQLite file path.
pub async fn open_backend(address: &str) -> Result<Arc<dyn Backend>> {
    if address == MEMORY_BACKEND {
        tracing::debug!("using in-memory backend");
        Ok(Arc::new(MemoryBackend::new()))
    } else {
        tracing::debug!(path = address, "using sqlite backend");
        let backend = SqliteBackend::open(std::path::Path::new(address)).await?;
        Ok(Arc::new(backend))
    }
}
