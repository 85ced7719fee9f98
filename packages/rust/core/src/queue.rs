//! Per-crawler FIFO operation queue, built on the backend's atomic
//! push/pop primitives.

use std::sync::Arc;
use std::time::Duration;

use trawler_shared::{Operation, Result};
use trawler_storage::Backend;

/// FIFO queue of pending work for one crawler.
///
/// Safe for concurrent use from any number of workers: the backend's pop
/// is atomic, so no operation is handed to two workers. Delivery is
/// at-least-once — a worker crash between pop and completion loses the
/// in-flight operation.
#[derive(Clone)]
pub struct OperationQueue {
    crawler: String,
    backend: Arc<dyn Backend>,
}

impl OperationQueue {
    pub fn new(crawler: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            crawler: crawler.into(),
            backend,
        }
    }

    /// Append an operation. Fails only when the backend is unavailable,
    /// which is fatal for the current run.
    pub async fn enqueue(&self, op: Operation) -> Result<()> {
        self.backend.queue_push(op).await
    }

    /// Remove and return one operation, blocking up to `timeout`.
    /// Returns `None` when the queue stayed empty.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Operation>> {
        self.backend
            .queue_pop(std::slice::from_ref(&self.crawler), timeout)
            .await
    }

    /// Number of queued operations.
    pub async fn len(&self) -> Result<u64> {
        self.backend.queue_len(&self.crawler).await
    }

    /// Drop every queued operation. Returns the count removed.
    pub async fn clear(&self) -> Result<u64> {
        self.backend.queue_clear(&self.crawler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawler_storage::MemoryBackend;

    #[tokio::test]
    async fn enqueue_dequeue_is_fifo() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = OperationQueue::new("demo", backend);

        for n in 0..3 {
            queue
                .enqueue(Operation::new("demo", "fetch", serde_json::json!({ "n": n })))
                .await
                .unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), 3);

        for expected in 0..3 {
            let op = queue
                .dequeue(Duration::from_millis(10))
                .await
                .unwrap()
                .expect("operation");
            assert_eq!(op.payload["n"], expected);
        }
        assert!(queue.dequeue(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_reports_removed_count() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = OperationQueue::new("demo", backend);

        for n in 0..4 {
            queue
                .enqueue(Operation::new("demo", "fetch", serde_json::json!({ "n": n })))
                .await
                .unwrap();
        }
        assert_eq!(queue.clear().await.unwrap(), 4);
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
