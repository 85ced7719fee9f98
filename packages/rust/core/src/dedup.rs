//! Incremental-mode dedup store: a fingerprint set that suppresses
//! re-enqueuing already-processed units of work.

use std::sync::Arc;

use trawler_shared::{Fingerprint, Result};
use trawler_storage::Backend;

/// Fingerprint set for one crawler. No eviction — entries live until an
/// explicit flush of the crawler clears them.
#[derive(Clone)]
pub struct DedupStore {
    crawler: String,
    backend: Arc<dyn Backend>,
}

impl DedupStore {
    pub fn new(crawler: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            crawler: crawler.into(),
            backend,
        }
    }

    /// Pure presence check.
    pub async fn seen(&self, fp: &Fingerprint) -> Result<bool> {
        self.backend.fingerprint_exists(&self.crawler, fp).await
    }

    /// Record a fingerprint. Returns `true` when it was newly recorded,
    /// `false` when it was already present — the atomic insert-if-absent
    /// lets the dispatcher check-and-mark without a race window.
    /// Marking an already-marked fingerprint is a no-op.
    pub async fn mark(&self, fp: &Fingerprint) -> Result<bool> {
        self.backend.fingerprint_add(&self.crawler, fp).await
    }
}
