//! In-process backend: shared maps behind a mutex, with a notifier so
//! blocking pops wake up on push instead of spinning.
//!
//! Nothing survives process exit. Within one process the backend is safe
//! for any number of concurrent workers, so
//! `supports_concurrent_workers = true`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use trawler_shared::{Fingerprint, Operation, Result, TrawlerError};

use crate::Backend;

#[derive(Default)]
struct Store {
    queues: HashMap<String, VecDeque<Operation>>,
    fingerprints: HashMap<String, HashSet<String>>,
    tags: HashMap<String, HashMap<String, serde_json::Value>>,
    last_runs: HashMap<String, DateTime<Utc>>,
}

/// In-process, non-durable backend.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Store>,
    notify: Notify,
    /// Rotating start offset so pops are round-robin fair across crawlers.
    rotation: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex is only held for map operations, never across an await.
    fn store(&self) -> Result<MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|_| TrawlerError::Backend("memory backend lock poisoned".into()))
    }

    fn try_pop(&self, crawlers: &[String]) -> Result<Option<Operation>> {
        if crawlers.is_empty() {
            return Ok(None);
        }
        let offset = self.rotation.fetch_add(1, Ordering::Relaxed);
        let mut store = self.store()?;
        for i in 0..crawlers.len() {
            let name = &crawlers[(offset + i) % crawlers.len()];
            if let Some(queue) = store.queues.get_mut(name) {
                if let Some(op) = queue.pop_front() {
                    return Ok(Some(op));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_concurrent_workers(&self) -> bool {
        true
    }

    async fn queue_push(&self, op: Operation) -> Result<()> {
        {
            let mut store = self.store()?;
            store
                .queues
                .entry(op.crawler.clone())
                .or_default()
                .push_back(op);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn queue_pop(
        &self,
        crawlers: &[String],
        timeout: Duration,
    ) -> Result<Option<Operation>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(op) = self.try_pop(crawlers)? {
                return Ok(Some(op));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // A push racing past here only costs one timed-out wait; the
            // caller's poll loop absorbs that.
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn queue_len(&self, crawler: &str) -> Result<u64> {
        let store = self.store()?;
        Ok(store.queues.get(crawler).map_or(0, |q| q.len() as u64))
    }

    async fn queue_clear(&self, crawler: &str) -> Result<u64> {
        let mut store = self.store()?;
        Ok(store
            .queues
            .remove(crawler)
            .map_or(0, |q| q.len() as u64))
    }

    async fn fingerprint_add(&self, crawler: &str, fp: &Fingerprint) -> Result<bool> {
        let mut store = self.store()?;
        Ok(store
            .fingerprints
            .entry(crawler.to_string())
            .or_default()
            .insert(fp.as_str().to_string()))
    }

    async fn fingerprint_exists(&self, crawler: &str, fp: &Fingerprint) -> Result<bool> {
        let store = self.store()?;
        Ok(store
            .fingerprints
            .get(crawler)
            .is_some_and(|set| set.contains(fp.as_str())))
    }

    async fn fingerprint_clear(&self, crawler: &str) -> Result<u64> {
        let mut store = self.store()?;
        Ok(store
            .fingerprints
            .remove(crawler)
            .map_or(0, |set| set.len() as u64))
    }

    async fn tag_set(&self, crawler: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        let mut store = self.store()?;
        store
            .tags
            .entry(crawler.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn tag_get(&self, crawler: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let store = self.store()?;
        Ok(store
            .tags
            .get(crawler)
            .and_then(|tags| tags.get(key).cloned()))
    }

    async fn tags_clear(&self, crawler: &str) -> Result<u64> {
        let mut store = self.store()?;
        Ok(store.tags.remove(crawler).map_or(0, |t| t.len() as u64))
    }

    async fn last_run_get(&self, crawler: &str) -> Result<Option<DateTime<Utc>>> {
        let store = self.store()?;
        Ok(store.last_runs.get(crawler).copied())
    }

    async fn last_run_set(&self, crawler: &str, at: DateTime<Utc>) -> Result<()> {
        let mut store = self.store()?;
        store.last_runs.insert(crawler.to_string(), at);
        Ok(())
    }

    async fn flush_crawler(&self, crawler: &str) -> Result<()> {
        let mut store = self.store()?;
        store.queues.remove(crawler);
        store.fingerprints.remove(crawler);
        store.tags.remove(crawler);
        store.last_runs.remove(crawler);
        Ok(())
    }

    async fn flush_all(&self) -> Result<()> {
        let mut store = self.store()?;
        *store = Store::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(crawler: &str, stage: &str, n: u64) -> Operation {
        Operation::new(crawler, stage, serde_json::json!({ "n": n }))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn pop_is_fifo_within_a_crawler() {
        let backend = MemoryBackend::new();
        for n in 0..3 {
            backend.queue_push(op("demo", "fetch", n)).await.unwrap();
        }

        for expected in 0..3 {
            let got = backend
                .queue_pop(&names(&["demo"]), Duration::from_millis(10))
                .await
                .unwrap()
                .expect("operation");
            assert_eq!(got.payload["n"], expected);
        }
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let backend = MemoryBackend::new();
        let start = Instant::now();
        let got = backend
            .queue_pop(&names(&["demo"]), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        let popper = {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .queue_pop(&names(&["demo"]), Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.queue_push(op("demo", "fetch", 7)).await.unwrap();

        let got = popper.await.unwrap().expect("operation");
        assert_eq!(got.payload["n"], 7);
    }

    #[tokio::test]
    async fn pop_round_robins_across_crawlers() {
        let backend = MemoryBackend::new();
        for n in 0..4 {
            backend.queue_push(op("a", "fetch", n)).await.unwrap();
            backend.queue_push(op("b", "fetch", n)).await.unwrap();
        }

        let mut seen_a = 0;
        let mut seen_b = 0;
        for _ in 0..8 {
            let got = backend
                .queue_pop(&names(&["a", "b"]), Duration::from_millis(10))
                .await
                .unwrap()
                .expect("operation");
            match got.crawler.as_str() {
                "a" => seen_a += 1,
                _ => seen_b += 1,
            }
        }
        assert_eq!(seen_a, 4);
        assert_eq!(seen_b, 4);
    }

    #[tokio::test]
    async fn fingerprint_add_is_idempotent() {
        let backend = MemoryBackend::new();
        let fp = Fingerprint::compute("demo", "fetch", &serde_json::json!({"u": 1}));

        assert!(backend.fingerprint_add("demo", &fp).await.unwrap());
        assert!(!backend.fingerprint_add("demo", &fp).await.unwrap());
        assert!(backend.fingerprint_exists("demo", &fp).await.unwrap());

        // Same fingerprint under another crawler is independent.
        assert!(backend.fingerprint_add("other", &fp).await.unwrap());
    }

    #[tokio::test]
    async fn flush_is_scoped_to_one_crawler() {
        let backend = MemoryBackend::new();
        let fp = Fingerprint::compute("a", "fetch", &serde_json::json!(1));
        backend.queue_push(op("a", "fetch", 1)).await.unwrap();
        backend.queue_push(op("b", "fetch", 1)).await.unwrap();
        backend.fingerprint_add("a", &fp).await.unwrap();
        backend
            .tag_set("a", "k", &serde_json::json!("v"))
            .await
            .unwrap();

        backend.flush_crawler("a").await.unwrap();

        assert_eq!(backend.queue_len("a").await.unwrap(), 0);
        assert!(!backend.fingerprint_exists("a", &fp).await.unwrap());
        assert!(backend.tag_get("a", "k").await.unwrap().is_none());
        // Crawler b untouched.
        assert_eq!(backend.queue_len("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flush_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.queue_push(op("a", "fetch", 1)).await.unwrap();

        backend.flush_crawler("a").await.unwrap();
        backend.flush_crawler("a").await.unwrap();

        assert_eq!(backend.queue_len("a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flush_all_purges_every_crawler() {
        let backend = MemoryBackend::new();
        backend.queue_push(op("a", "fetch", 1)).await.unwrap();
        backend.queue_push(op("b", "fetch", 1)).await.unwrap();
        backend.last_run_set("a", Utc::now()).await.unwrap();

        backend.flush_all().await.unwrap();

        assert_eq!(backend.queue_len("a").await.unwrap(), 0);
        assert_eq!(backend.queue_len("b").await.unwrap(), 0);
        assert!(backend.last_run_get("a").await.unwrap().is_none());
    }
}
