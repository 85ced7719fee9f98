//! The per-crawler state machine: run lifecycle, progress counters, and
//! destructive maintenance operations.
//!
//! State lives in a single atomic cell; the `Idle → Running` transition
//! is a compare-and-set, which is what guarantees at most one concurrent
//! run per crawler even when `run()` races between the scheduler and a
//! manual invocation. Counters are atomics mutated by any number of
//! workers; snapshots read the same cells, so `status()` is consistent.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use trawler_shared::{CrawlerState, CrawlerStatus, Operation, Result, Schedule, TrawlerError};
use trawler_storage::Backend;

use crate::dedup::DedupStore;
use crate::definition::CrawlerDefinition;
use crate::queue::OperationQueue;

/// State-machine controller for one crawler definition.
pub struct Crawler {
    definition: CrawlerDefinition,
    backend: Arc<dyn Backend>,
    queue: OperationQueue,
    dedup: DedupStore,
    incremental: bool,

    state: AtomicU8,
    /// Successful operations this run.
    op_count: AtomicU64,
    /// Failed operations this run.
    failed_count: AtomicU64,
    /// enqueued − completed − failed. Never negative.
    pending: AtomicU64,
    /// Operations currently held by workers.
    in_flight: AtomicU64,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for Crawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crawler")
            .field("name", &self.definition.name)
            .field("incremental", &self.incremental)
            .finish_non_exhaustive()
    }
}

impl Crawler {
    /// Build a crawler around its definition, restoring persisted run
    /// metadata from the backend.
    pub async fn open(
        definition: CrawlerDefinition,
        backend: Arc<dyn Backend>,
        incremental: bool,
    ) -> Result<Self> {
        let last_run = backend.last_run_get(&definition.name).await?;
        let queue = OperationQueue::new(&definition.name, backend.clone());
        let dedup = DedupStore::new(&definition.name, backend.clone());

        Ok(Self {
            definition,
            backend,
            queue,
            dedup,
            incremental,
            state: AtomicU8::new(CrawlerState::Idle as u8),
            op_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            last_run: Mutex::new(last_run),
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn description(&self) -> &str {
        &self.definition.description
    }

    pub fn schedule(&self) -> Schedule {
        self.definition.schedule
    }

    pub fn definition(&self) -> &CrawlerDefinition {
        &self.definition
    }

    pub fn state(&self) -> CrawlerState {
        CrawlerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub(crate) fn dedup(&self) -> &DedupStore {
        &self.dedup
    }

    pub(crate) fn incremental(&self) -> bool {
        self.incremental
    }

    /// Pure due check against the schedule expression. No side effects.
    pub fn is_due(&self) -> bool {
        self.definition.schedule.is_due(self.last_run())
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *lock_recovering(&self.last_run)
    }

    /// Consistent read-only snapshot of the crawler.
    pub fn status(&self) -> CrawlerStatus {
        CrawlerStatus {
            name: self.definition.name.clone(),
            description: self.definition.description.clone(),
            state: self.state(),
            last_run: self.last_run(),
            op_count: self.op_count.load(Ordering::SeqCst),
            pending_count: self.pending.load(Ordering::SeqCst),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Start a run: atomically take the `Running` slot, apply optional
    /// pre-run flushes, reset per-run counters, and seed the entry stage.
    ///
    /// Fails with [`TrawlerError::InvalidTransition`] when a run is
    /// already active. `flush` purges this crawler's own queue, dedup,
    /// and tag state first; `flushall` purges the entire backend.
    pub async fn run(&self, flush: bool, flushall: bool) -> Result<()> {
        self.begin()?;

        if let Err(e) = self.start_run(flush, flushall).await {
            // Nothing was seeded; release the run slot.
            self.state
                .store(CrawlerState::Idle as u8, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Request cooperative cancellation. Workers observe the new state
    /// between operation executions; in-flight operations complete.
    pub fn cancel(&self) -> Result<()> {
        match self.state.compare_exchange(
            CrawlerState::Running as u8,
            CrawlerState::Cancelling as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                info!(crawler = self.name(), "cancellation requested");
                Ok(())
            }
            Err(actual) => Err(TrawlerError::InvalidTransition {
                crawler: self.name().to_string(),
                action: "cancel",
                state: CrawlerState::from_u8(actual),
            }),
        }
    }

    /// CAS into `Running` from any startable state.
    fn begin(&self) -> Result<()> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let state = CrawlerState::from_u8(current);
            if !state.can_start() {
                return Err(TrawlerError::InvalidTransition {
                    crawler: self.name().to_string(),
                    action: "run",
                    state,
                });
            }
            match self.state.compare_exchange(
                current,
                CrawlerState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Pre-run side effects and seeding, performed after winning the slot.
    async fn start_run(&self, flush: bool, flushall: bool) -> Result<()> {
        if flushall {
            warn!(crawler = self.name(), "flushing entire backend before run");
            self.backend.flush_all().await?;
            *lock_recovering(&self.last_run) = None;
        } else if flush {
            self.flush_data().await?;
        }

        self.op_count.store(0, Ordering::SeqCst);
        self.failed_count.store(0, Ordering::SeqCst);
        self.in_flight.store(0, Ordering::SeqCst);
        // Operations left over from an aborted run are drained by this
        // one, so they count as pending again.
        let leftovers = self.queue.len().await?;
        self.pending.store(leftovers, Ordering::SeqCst);

        let started = Utc::now();
        *lock_recovering(&self.last_run) = Some(started);
        self.backend.last_run_set(self.name(), started).await?;

        let seed = Operation::new(self.name(), &self.definition.init, serde_json::json!({}));
        self.enqueue(seed).await?;

        info!(
            crawler = self.name(),
            init = %self.definition.init,
            incremental = self.incremental,
            "run started"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Worker hooks
    // -----------------------------------------------------------------------

    /// Enqueue an operation, counting it as pending. The counter is
    /// bumped before the push so a fast concurrent pop can never observe
    /// the operation without its pending slot.
    pub(crate) async fn enqueue(&self, op: Operation) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.queue.enqueue(op).await {
            self.dec_pending(1);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn note_dequeued(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn note_completed(&self) {
        self.op_count.fetch_add(1, Ordering::SeqCst);
        self.dec_pending(1);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn note_failed(&self) {
        self.failed_count.fetch_add(1, Ordering::SeqCst);
        self.dec_pending(1);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Release an operation that was popped but will not be executed
    /// (crawler left `Running` while the pop was in progress).
    pub(crate) fn note_discarded(&self) {
        self.dec_pending(1);
    }

    fn dec_pending(&self, n: u64) {
        // Saturating: the invariant is pending ≥ 0 even if a purge and a
        // completion race.
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(n))
            });
    }

    /// Mark the run failed after an unhandled stage error. Cancellation
    /// in progress takes precedence.
    pub(crate) fn fail_run(&self) {
        if self
            .state
            .compare_exchange(
                CrawlerState::Running as u8,
                CrawlerState::Failed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            warn!(crawler = self.name(), "run failed; leaving remaining operations queued");
        }
    }

    /// Purge the queue of a cancelling crawler so it can settle.
    pub(crate) async fn drain_cancelled(&self) -> Result<()> {
        let purged = self.queue.clear().await?;
        if purged > 0 {
            self.dec_pending(purged);
            debug!(crawler = self.name(), purged, "dropped queued operations on cancel");
        }
        Ok(())
    }

    /// Settle a drained crawler: `Running → Idle` on natural completion,
    /// `Cancelling → Cancelled` once nothing is queued or in flight.
    /// Returns whether a transition happened.
    pub(crate) async fn try_finish(&self) -> Result<bool> {
        if self.in_flight.load(Ordering::SeqCst) != 0 || self.pending.load(Ordering::SeqCst) != 0 {
            return Ok(false);
        }
        if self.queue.len().await? != 0 {
            return Ok(false);
        }

        let to_idle = self.state.compare_exchange(
            CrawlerState::Running as u8,
            CrawlerState::Idle as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let finished = match to_idle {
            Ok(_) => true,
            Err(_) => self
                .state
                .compare_exchange(
                    CrawlerState::Cancelling as u8,
                    CrawlerState::Cancelled as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok(),
        };

        if finished {
            let finished_at = Utc::now();
            *lock_recovering(&self.last_run) = Some(finished_at);
            self.backend.last_run_set(self.name(), finished_at).await?;
            info!(
                crawler = self.name(),
                state = %self.state(),
                ops = self.op_count.load(Ordering::SeqCst),
                failed = self.failed_count.load(Ordering::SeqCst),
                "run finished"
            );
        }
        Ok(finished)
    }

    // -----------------------------------------------------------------------
    // Destructive maintenance
    // -----------------------------------------------------------------------

    /// Delete all data generated by this crawler: queue, fingerprints,
    /// tags, and run metadata. Idempotent; never touches other crawlers.
    pub async fn flush(&self) -> Result<()> {
        self.flush_data().await?;
        info!(crawler = self.name(), "flushed crawler data");
        Ok(())
    }

    /// Delete only this crawler's tags.
    pub async fn flush_tags(&self) -> Result<()> {
        let removed = self.backend.tags_clear(self.name()).await?;
        info!(crawler = self.name(), removed, "flushed crawler tags");
        Ok(())
    }

    async fn flush_data(&self) -> Result<()> {
        self.backend.flush_crawler(self.name()).await?;
        *lock_recovering(&self.last_run) = None;
        self.pending.store(0, Ordering::SeqCst);
        self.op_count.store(0, Ordering::SeqCst);
        self.failed_count.store(0, Ordering::SeqCst);
        Ok(())
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
fn lock_recovering<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawler_storage::MemoryBackend;

    fn definition(name: &str) -> CrawlerDefinition {
        CrawlerDefinition::from_toml(
            r#"
description = "test crawler"
[stages.init]
handler = "seed"
"#,
            name,
        )
        .expect("definition")
    }

    async fn crawler(name: &str) -> Crawler {
        Crawler::open(definition(name), Arc::new(MemoryBackend::new()), true)
            .await
            .expect("open")
    }

    #[tokio::test]
    async fn run_seeds_the_entry_stage() {
        let crawler = crawler("demo").await;
        crawler.run(false, false).await.unwrap();

        assert_eq!(crawler.state(), CrawlerState::Running);
        assert_eq!(crawler.queue().len().await.unwrap(), 1);
        assert_eq!(crawler.status().pending_count, 1);
        assert!(crawler.last_run().is_some());
    }

    #[tokio::test]
    async fn second_run_is_an_invalid_transition() {
        let crawler = crawler("demo").await;
        crawler.run(false, false).await.unwrap();

        let err = crawler.run(false, false).await.unwrap_err();
        assert!(matches!(err, TrawlerError::InvalidTransition { .. }));
        // The active run is untouched.
        assert_eq!(crawler.state(), CrawlerState::Running);
        assert_eq!(crawler.queue().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_requires_a_running_crawler() {
        let crawler = crawler("demo").await;
        assert!(matches!(
            crawler.cancel(),
            Err(TrawlerError::InvalidTransition { .. })
        ));

        crawler.run(false, false).await.unwrap();
        crawler.cancel().unwrap();
        assert_eq!(crawler.state(), CrawlerState::Cancelling);

        // Cancelling twice is refused too.
        assert!(crawler.cancel().is_err());
    }

    #[tokio::test]
    async fn cancelled_crawler_settles_once_drained() {
        let crawler = crawler("demo").await;
        crawler.run(false, false).await.unwrap();
        crawler.cancel().unwrap();

        crawler.drain_cancelled().await.unwrap();
        assert!(crawler.try_finish().await.unwrap());
        assert_eq!(crawler.state(), CrawlerState::Cancelled);
        assert_eq!(crawler.status().pending_count, 0);

        // Terminal states allow a fresh run.
        crawler.run(false, false).await.unwrap();
        assert_eq!(crawler.state(), CrawlerState::Running);
    }

    #[tokio::test]
    async fn try_finish_waits_for_pending_work() {
        let crawler = crawler("demo").await;
        crawler.run(false, false).await.unwrap();

        // Seed operation still queued.
        assert!(!crawler.try_finish().await.unwrap());

        let op = crawler
            .queue()
            .dequeue(std::time::Duration::from_millis(10))
            .await
            .unwrap()
            .expect("seed op");
        crawler.note_dequeued();
        assert!(!crawler.try_finish().await.unwrap());

        assert_eq!(op.stage, "init");
        crawler.note_completed();
        assert!(crawler.try_finish().await.unwrap());
        assert_eq!(crawler.state(), CrawlerState::Idle);
        assert_eq!(crawler.status().op_count, 1);
    }

    #[tokio::test]
    async fn run_with_flush_purges_previous_state() {
        let backend = Arc::new(MemoryBackend::new());
        let crawler = Crawler::open(definition("demo"), backend.clone(), true)
            .await
            .unwrap();

        let fp = trawler_shared::Fingerprint::compute("demo", "x", &serde_json::json!(1));
        backend.fingerprint_add("demo", &fp).await.unwrap();
        backend
            .tag_set("demo", "k", &serde_json::json!("v"))
            .await
            .unwrap();

        crawler.run(true, false).await.unwrap();

        assert!(!backend.fingerprint_exists("demo", &fp).await.unwrap());
        assert!(backend.tag_get("demo", "k").await.unwrap().is_none());
        // Only the fresh seed remains queued.
        assert_eq!(crawler.queue().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flush_twice_leaves_identical_empty_state() {
        let backend = Arc::new(MemoryBackend::new());
        let crawler = Crawler::open(definition("demo"), backend.clone(), true)
            .await
            .unwrap();

        crawler.run(false, false).await.unwrap();
        crawler.flush().await.unwrap();
        crawler.flush().await.unwrap();

        assert_eq!(crawler.queue().len().await.unwrap(), 0);
        assert_eq!(crawler.status().pending_count, 0);
        assert!(crawler.last_run().is_none());
    }

    #[tokio::test]
    async fn pending_never_goes_negative() {
        let crawler = crawler("demo").await;
        crawler.run(false, false).await.unwrap();

        // A purge and a completion racing over the same operation can
        // only saturate at zero.
        crawler.drain_cancelled().await.unwrap();
        crawler.note_discarded();
        crawler.note_discarded();
        assert_eq!(crawler.status().pending_count, 0);
    }

    #[tokio::test]
    async fn last_run_survives_reopen() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let crawler = Crawler::open(definition("demo"), backend.clone(), true)
                .await
                .unwrap();
            crawler.run(false, false).await.unwrap();
        }

        let reopened = Crawler::open(definition("demo"), backend, true)
            .await
            .unwrap();
        assert!(reopened.last_run().is_some());
        // State is process-local; a fresh process starts idle.
        assert_eq!(reopened.state(), CrawlerState::Idle);
    }
}
