//! The worker pool: a fixed-size set of concurrent executors that drain
//! the operation queues of all active crawlers.
//!
//! Each worker independently pops with a bounded timeout, dispatches the
//! operation to its stage handler, fans derived operations back into the
//! queue (through the dedup filter in incremental mode), and keeps the
//! owning crawler's counters straight. Cancellation is cooperative: a
//! worker observes crawler state only between operation executions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use trawler_shared::{CrawlerState, Operation, Result, SettingsConfig, TrawlerError};
use trawler_stages::{StageContext, TagRead};
use trawler_storage::Backend;

use crate::crawler::Crawler;
use crate::registry::Registry;

/// Exit code for a clean drain.
const EXIT_OK: i32 = 0;
/// Exit code when any crawler ended the drain in `Failed`.
const EXIT_FAILED: i32 = 1;

/// Fixed-size pool of concurrent operation executors.
pub struct WorkerPool {
    registry: Arc<Registry>,
    backend: Arc<dyn Backend>,
    settings: SettingsConfig,
    poll_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn Backend>,
        settings: SettingsConfig,
        poll_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            backend,
            settings,
            poll_timeout,
        })
    }

    /// Spawn `num_workers` executors (clamped to at least one) and return
    /// the pool's exit code.
    ///
    /// Fails fast with [`TrawlerError::UnsupportedConcurrency`] — before
    /// any worker is spawned — when more than one worker is requested
    /// against a backend that cannot serve concurrent workers.
    ///
    /// `blocking = true` waits until every crawler has left the
    /// `Running`/`Cancelling` states and reports `1` if any ended up
    /// `Failed`. `blocking = false` returns `0` right after a successful
    /// spawn; the executors keep draining on the runtime.
    pub async fn run(self: &Arc<Self>, num_workers: usize, blocking: bool) -> Result<i32> {
        let workers = num_workers.max(1);
        if workers > 1 && !self.backend.supports_concurrent_workers() {
            return Err(TrawlerError::UnsupportedConcurrency {
                backend: self.backend.name().to_string(),
                requested: workers,
            });
        }

        info!(workers, blocking, backend = self.backend.name(), "starting worker pool");

        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            let pool = self.clone();
            tasks.spawn(async move { pool.worker_loop(worker_id).await });
        }

        if !blocking {
            // Detach: surface worker errors in the log only.
            tokio::spawn(async move {
                while let Some(joined) = tasks.join_next().await {
                    if let Ok(Err(e)) = joined {
                        error!(error = %e, "detached worker aborted");
                    }
                }
            });
            return Ok(EXIT_OK);
        }

        let mut fatal: Option<TrawlerError> = None;
        let mut panicked = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "worker aborted");
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "worker panicked");
                    panicked = true;
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let any_failed = self
            .registry
            .all()
            .iter()
            .any(|c| c.state() == CrawlerState::Failed);
        Ok(if any_failed || panicked {
            EXIT_FAILED
        } else {
            EXIT_OK
        })
    }

    /// One executor: poll, dispatch, settle, until no crawler is active.
    async fn worker_loop(self: Arc<Self>, worker_id: usize) -> Result<()> {
        debug!(worker_id, "worker started");
        loop {
            let mut running: Vec<Arc<Crawler>> = Vec::new();
            let mut any_active = false;

            for crawler in self.registry.all() {
                match crawler.state() {
                    CrawlerState::Running => {
                        any_active = true;
                        running.push(crawler.clone());
                    }
                    CrawlerState::Cancelling => {
                        // No new operations are picked up; drop what is
                        // queued so the crawler can settle once in-flight
                        // work on other workers completes.
                        any_active = true;
                        crawler.drain_cancelled().await?;
                        crawler.try_finish().await?;
                    }
                    _ => {}
                }
            }

            if !any_active {
                break;
            }

            let names: Vec<String> = running.iter().map(|c| c.name().to_string()).collect();
            let popped = self.backend.queue_pop(&names, self.poll_timeout).await?;

            let Some(op) = popped else {
                for crawler in &running {
                    crawler.try_finish().await?;
                }
                continue;
            };

            let crawler = match self.registry.get(&op.crawler) {
                Ok(crawler) => crawler,
                Err(_) => {
                    warn!(crawler = %op.crawler, op = %op.id, "dropping operation for unknown crawler");
                    continue;
                }
            };

            // The crawler may have left Running while the pop was in
            // flight; cancellation never interrupts an operation, but it
            // does stop this one from starting.
            match crawler.state() {
                CrawlerState::Running => {}
                CrawlerState::Failed => {
                    // Leave failed runs resumable: put the operation back.
                    self.backend.queue_push(op).await?;
                    continue;
                }
                _ => {
                    crawler.note_discarded();
                    continue;
                }
            }

            crawler.note_dequeued();
            self.execute(&crawler, op, worker_id).await?;
            crawler.try_finish().await?;
        }
        debug!(worker_id, "worker exiting");
        Ok(())
    }

    /// Dispatch one operation to its stage handler and apply the outcome.
    async fn execute(&self, crawler: &Arc<Crawler>, op: Operation, worker_id: usize) -> Result<()> {
        let outcome = self.dispatch(crawler, &op).await;

        match outcome {
            Ok(output) => {
                for tag in &output.tags {
                    self.backend.tag_set(&op.crawler, &tag.key, &tag.value).await?;
                }

                for derived in output.operations {
                    if !crawler.definition().stages.contains_key(&derived.stage) {
                        warn!(
                            crawler = %op.crawler,
                            stage = %derived.stage,
                            "dropping derived operation for undefined stage"
                        );
                        continue;
                    }

                    let next = Operation::new(&op.crawler, &derived.stage, derived.payload);
                    if crawler.incremental() {
                        let fp = next.fingerprint();
                        if !crawler.dedup().mark(&fp).await? {
                            debug!(
                                crawler = %op.crawler,
                                stage = %next.stage,
                                "suppressing already-seen operation"
                            );
                            continue;
                        }
                    }
                    crawler.enqueue(next).await?;
                }

                crawler.note_completed();
                debug!(
                    worker_id,
                    crawler = %op.crawler,
                    stage = %op.stage,
                    op = %op.id,
                    "operation completed"
                );
            }
            Err(e) => {
                crawler.note_failed();
                if self.settings.continue_on_error {
                    warn!(
                        worker_id,
                        crawler = %op.crawler,
                        stage = %op.stage,
                        op = %op.id,
                        error = %e,
                        "operation failed; continuing"
                    );
                } else {
                    error!(
                        worker_id,
                        crawler = %op.crawler,
                        stage = %op.stage,
                        op = %op.id,
                        error = %e,
                        "operation failed; aborting run"
                    );
                    crawler.fail_run();
                }
            }
        }
        Ok(())
    }

    /// Resolve the stage handler and invoke it.
    async fn dispatch(
        &self,
        crawler: &Arc<Crawler>,
        op: &Operation,
    ) -> Result<trawler_shared::StageOutput> {
        let stage_def = crawler
            .definition()
            .stages
            .get(&op.stage)
            .ok_or_else(|| TrawlerError::stage(&op.stage, "stage not defined for crawler"))?;

        let handler = self
            .registry
            .handlers()
            .resolve(&stage_def.handler)
            .map_err(|e| TrawlerError::stage(&op.stage, e.to_string()))?;

        let ctx = StageContext {
            crawler: op.crawler.clone(),
            stage: op.stage.clone(),
            params: stage_def.params.clone(),
            crawler_config: crawler.definition().config.clone(),
            http_cache: self.settings.http_cache,
            tags: Arc::new(BackendTags {
                backend: self.backend.clone(),
                crawler: op.crawler.clone(),
            }),
        };

        handler.handle(&ctx, op).await
    }
}

/// Tag reads for stage handlers, scoped to the owning crawler.
struct BackendTags {
    backend: Arc<dyn Backend>,
    crawler: String,
}

#[async_trait]
impl TagRead for BackendTags {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.backend.tag_get(&self.crawler, key).await
    }
}
