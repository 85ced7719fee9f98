//! libSQL (SQLite file) backend.
//!
//! Durable across processes, but a single-writer store: the pool refuses
//! to run more than one worker against it
//! (`supports_concurrent_workers = false`).

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tokio::time::Instant;

use trawler_shared::{Fingerprint, OpId, Operation, Result, TrawlerError};

use crate::{Backend, migrations};

/// Interval between queue polls while waiting out a pop timeout.
const POP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Durable SQLite-file backend.
pub struct SqliteBackend {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    rotation: AtomicUsize,
}

impl SqliteBackend {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| TrawlerError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;

        let backend = Self {
            db,
            conn,
            rotation: AtomicUsize::new(0),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    TrawlerError::Backend(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Pop the head of one crawler's queue, if any.
    async fn try_pop_one(&self, crawler: &str) -> Result<Option<Operation>> {
        let mut rows = self
            .conn
            .query(
                "SELECT seq, id, crawler, stage, payload, enqueued_at, attempt
                 FROM operations WHERE crawler = ?1 ORDER BY seq LIMIT 1",
                params![crawler],
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(TrawlerError::Backend(e.to_string())),
        };

        let seq: i64 = row
            .get(0)
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        let op = row_to_operation(&row)?;

        self.conn
            .execute("DELETE FROM operations WHERE seq = ?1", params![seq])
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;

        Ok(Some(op))
    }

    async fn count(&self, sql: &str, crawler: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(sql, params![crawler])
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| TrawlerError::Backend(e.to_string()))?;
                Ok(n.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(TrawlerError::Backend(e.to_string())),
        }
    }
}

/// Decode an `operations` row (starting at column 1; column 0 is `seq`).
fn row_to_operation(row: &libsql::Row) -> Result<Operation> {
    let id: String = row
        .get(1)
        .map_err(|e| TrawlerError::Backend(e.to_string()))?;
    let crawler: String = row
        .get(2)
        .map_err(|e| TrawlerError::Backend(e.to_string()))?;
    let stage: String = row
        .get(3)
        .map_err(|e| TrawlerError::Backend(e.to_string()))?;
    let payload: String = row
        .get(4)
        .map_err(|e| TrawlerError::Backend(e.to_string()))?;
    let enqueued_at: String = row
        .get(5)
        .map_err(|e| TrawlerError::Backend(e.to_string()))?;
    let attempt: u32 = row
        .get(6)
        .map_err(|e| TrawlerError::Backend(e.to_string()))?;

    Ok(Operation {
        id: id
            .parse::<OpId>()
            .map_err(|e| TrawlerError::Backend(format!("bad operation id: {e}")))?,
        crawler,
        stage,
        payload: serde_json::from_str(&payload)
            .map_err(|e| TrawlerError::Backend(format!("bad operation payload: {e}")))?,
        enqueued_at: parse_timestamp(&enqueued_at)?,
        attempt,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TrawlerError::Backend(format!("bad timestamp '{raw}': {e}")))
}

#[async_trait]
impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_concurrent_workers(&self) -> bool {
        false
    }

    async fn queue_push(&self, op: Operation) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO operations (id, crawler, stage, payload, enqueued_at, attempt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    op.id.to_string(),
                    op.crawler.as_str(),
                    op.stage.as_str(),
                    op.payload.to_string(),
                    op.enqueued_at.to_rfc3339(),
                    op.attempt as i64,
                ],
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn queue_pop(
        &self,
        crawlers: &[String],
        timeout: Duration,
    ) -> Result<Option<Operation>> {
        if crawlers.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let offset = self.rotation.fetch_add(1, Ordering::Relaxed);
            for i in 0..crawlers.len() {
                let name = &crawlers[(offset + i) % crawlers.len()];
                if let Some(op) = self.try_pop_one(name).await? {
                    return Ok(Some(op));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(POP_POLL_INTERVAL)).await;
        }
    }

    async fn queue_len(&self, crawler: &str) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM operations WHERE crawler = ?1",
            crawler,
        )
        .await
    }

    async fn queue_clear(&self, crawler: &str) -> Result<u64> {
        self.conn
            .execute("DELETE FROM operations WHERE crawler = ?1", params![crawler])
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))
    }

    async fn fingerprint_add(&self, crawler: &str, fp: &Fingerprint) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO fingerprints (crawler, fingerprint, created_at)
                 VALUES (?1, ?2, ?3)",
                params![crawler, fp.as_str(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        Ok(affected > 0)
    }

    async fn fingerprint_exists(&self, crawler: &str, fp: &Fingerprint) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM fingerprints WHERE crawler = ?1 AND fingerprint = ?2",
                params![crawler, fp.as_str()],
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        match rows.next().await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(TrawlerError::Backend(e.to_string())),
        }
    }

    async fn fingerprint_clear(&self, crawler: &str) -> Result<u64> {
        self.conn
            .execute(
                "DELETE FROM fingerprints WHERE crawler = ?1",
                params![crawler],
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))
    }

    async fn tag_set(&self, crawler: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO tags (crawler, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(crawler, key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![crawler, key, value.to_string(), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn tag_get(&self, crawler: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM tags WHERE crawler = ?1 AND key = ?2",
                params![crawler, key],
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| TrawlerError::Backend(e.to_string()))?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| TrawlerError::Backend(format!("bad tag value: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(TrawlerError::Backend(e.to_string())),
        }
    }

    async fn tags_clear(&self, crawler: &str) -> Result<u64> {
        self.conn
            .execute("DELETE FROM tags WHERE crawler = ?1", params![crawler])
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))
    }

    async fn last_run_get(&self, crawler: &str) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_run FROM crawler_meta WHERE crawler = ?1",
                params![crawler],
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => {
                // NULL decodes as an error here; treat it as absent.
                let raw: Option<String> = row.get::<String>(0).ok();
                raw.map(|s| parse_timestamp(&s)).transpose()
            }
            Ok(None) => Ok(None),
            Err(e) => Err(TrawlerError::Backend(e.to_string())),
        }
    }

    async fn last_run_set(&self, crawler: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO crawler_meta (crawler, last_run) VALUES (?1, ?2)
                 ON CONFLICT(crawler) DO UPDATE SET last_run = excluded.last_run",
                params![crawler, at.to_rfc3339()],
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn flush_crawler(&self, crawler: &str) -> Result<()> {
        self.queue_clear(crawler).await?;
        self.fingerprint_clear(crawler).await?;
        self.tags_clear(crawler).await?;
        self.conn
            .execute(
                "DELETE FROM crawler_meta WHERE crawler = ?1",
                params![crawler],
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn flush_all(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "DELETE FROM operations;
                 DELETE FROM fingerprints;
                 DELETE FROM tags;
                 DELETE FROM crawler_meta;",
            )
            .await
            .map_err(|e| TrawlerError::Backend(e.to_string()))?;
        Ok(())
    }
}
