//! SQLite queue backend.
//!
//! The stream, consumer groups, pending claims, delayed index and dead
//! letters are tables namespaced by the configured stream and index names.
//! Claims carry wall-clock timestamps, so entries a crashed process never
//! acknowledged come back through [`WorkQueue::claim_idle`] after a restart.

use super::{entry_seq, DeadLetter, DelayedEntry, PendingEntry, QueueEntry, WorkQueue};
use crate::db::{self, now_ms};
use crate::error::DispatchError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pushgate_core::config::QueueConfig;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often a blocked read looks for entries appended by other processes.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Work queue persisted in a SQLite database.
pub struct SqliteQueue {
    pool: SqlitePool,
    config: QueueConfig,
    stream_notify: Notify,
    delayed_notify: Arc<Notify>,
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn limit(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            stream_notify: Notify::new(),
            delayed_notify: Arc::new(Notify::new()),
        }
    }

    /// Open the database file at `path` and build a queue on it.
    pub async fn open(path: &Path, config: QueueConfig) -> Result<Self> {
        Ok(Self::new(db::open(path).await?, config))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Entries currently retained in the stream.
    pub async fn stream_len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_stream WHERE stream = ?")
            .bind(&self.config.stream)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn cursor(&self, tx: &mut Transaction<'_, Sqlite>, group: &str) -> Result<i64> {
        let cursor: Option<i64> =
            sqlx::query_scalar("SELECT cursor FROM queue_groups WHERE stream = ? AND name = ?")
                .bind(&self.config.stream)
                .bind(group)
                .fetch_optional(&mut **tx)
                .await?;
        cursor.ok_or_else(|| DispatchError::Queue(format!("consumer group {} does not exist", group)))
    }

    async fn claim_new(&self, group: &str, consumer: &str, count: usize) -> Result<Vec<QueueEntry>> {
        let mut tx = self.pool.begin().await?;
        let cursor = self.cursor(&mut tx, group).await?;

        let rows = sqlx::query(
            "SELECT seq, task_id, created_ms FROM queue_stream \
             WHERE stream = ? AND seq >= ? ORDER BY seq LIMIT ?",
        )
        .bind(&self.config.stream)
        .bind(cursor)
        .bind(limit(count))
        .fetch_all(&mut *tx)
        .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let mut claimed = Vec::with_capacity(rows.len());
        let mut next_cursor = cursor;
        for row in rows {
            let seq: i64 = row.try_get("seq")?;
            let task_id: String = row.try_get("task_id")?;
            let created_ms: i64 = row.try_get("created_ms")?;
            let id = format!("{}-{}", created_ms, seq);

            sqlx::query(
                "INSERT OR REPLACE INTO queue_pending \
                 (stream, grp, seq, entry_id, task_id, consumer, claimed_ms, delivery_count) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
            )
            .bind(&self.config.stream)
            .bind(group)
            .bind(seq)
            .bind(&id)
            .bind(&task_id)
            .bind(consumer)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            next_cursor = seq + 1;
            claimed.push(QueueEntry {
                id,
                task_id,
                delivery_count: 1,
            });
        }

        sqlx::query("UPDATE queue_groups SET cursor = ? WHERE stream = ? AND name = ?")
            .bind(next_cursor)
            .bind(&self.config.stream)
            .bind(group)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(claimed)
    }

    /// Drop stream rows every group has moved past and acknowledged.
    async fn trim(&self, tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
        sqlx::query(
            "DELETE FROM queue_stream WHERE stream = ? AND seq < ( \
                 SELECT MIN(MIN(g.cursor, COALESCE( \
                     (SELECT MIN(p.seq) FROM queue_pending p WHERE p.stream = g.stream AND p.grp = g.name), \
                     g.cursor))) \
                 FROM queue_groups g WHERE g.stream = ?)",
        )
        .bind(&self.config.stream)
        .bind(&self.config.stream)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn enqueue(&self, task_id: &str) -> Result<String> {
        let created_ms = now_ms();
        let seq = sqlx::query("INSERT INTO queue_stream (stream, task_id, created_ms) VALUES (?, ?, ?)")
            .bind(&self.config.stream)
            .bind(task_id)
            .bind(created_ms)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        let id = format!("{}-{}", created_ms, seq);
        debug!(stream = %self.config.stream, entry_id = %id, task_id, "Enqueued task");
        self.stream_notify.notify_waiters();
        Ok(id)
    }

    async fn push_delayed(&self, task_id: &str, due: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO queue_delayed (key, task_id, due_ms) VALUES (?, ?, ?)")
            .bind(&self.config.delayed_key)
            .bind(task_id)
            .bind(due.timestamp_millis())
            .execute(&self.pool)
            .await?;
        debug!(index = %self.config.delayed_key, task_id, due = %due, "Indexed delayed task");
        self.delayed_notify.notify_one();
        Ok(())
    }

    async fn cancel_delayed(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_delayed WHERE key = ? AND task_id = ?")
            .bind(&self.config.delayed_key)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delayed_len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_delayed WHERE key = ?")
            .bind(&self.config.delayed_key)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn due_delayed(&self, now: DateTime<Utc>, limit_to: usize) -> Result<Vec<DelayedEntry>> {
        let rows = sqlx::query(
            "SELECT task_id, due_ms FROM queue_delayed \
             WHERE key = ? AND due_ms <= ? ORDER BY due_ms, task_id LIMIT ?",
        )
        .bind(&self.config.delayed_key)
        .bind(now.timestamp_millis())
        .bind(limit(limit_to))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DelayedEntry> {
                Ok(DelayedEntry {
                    task_id: row.try_get("task_id")?,
                    due: from_ms(row.try_get("due_ms")?),
                })
            })
            .collect()
    }

    async fn remove_delayed(&self, entry: &DelayedEntry) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM queue_delayed WHERE key = ? AND task_id = ? AND due_ms = ?")
                .bind(&self.config.delayed_key)
                .bind(&entry.task_id)
                .bind(entry.due.timestamp_millis())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn next_due(&self) -> Result<Option<DateTime<Utc>>> {
        let due: Option<i64> = sqlx::query_scalar("SELECT MIN(due_ms) FROM queue_delayed WHERE key = ?")
            .bind(&self.config.delayed_key)
            .fetch_one(&self.pool)
            .await?;
        Ok(due.map(from_ms))
    }

    fn delayed_signal(&self) -> Option<Arc<Notify>> {
        Some(self.delayed_notify.clone())
    }

    async fn ensure_group(&self, group: &str) -> Result<()> {
        // Cursor 0 hands out whatever backlog is still retained
        sqlx::query("INSERT OR IGNORE INTO queue_groups (stream, name, cursor) VALUES (?, ?, 0)")
            .bind(&self.config.stream)
            .bind(group)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read_messages(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.stream_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claimed = self.claim_new(group, consumer, count).await?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn ack(&self, group: &str, entry_id: &str) -> Result<bool> {
        let Some(seq) = entry_seq(entry_id) else {
            warn!(entry_id, "Ack for malformed entry id");
            return Ok(false);
        };
        let mut tx = self.pool.begin().await?;
        self.cursor(&mut tx, group).await?;

        let removed = sqlx::query("DELETE FROM queue_pending WHERE stream = ? AND grp = ? AND seq = ?")
            .bind(&self.config.stream)
            .bind(group)
            .bind(seq as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        if removed {
            self.trim(&mut tx).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn pending(&self, group: &str, min_idle: Duration) -> Result<Vec<PendingEntry>> {
        let mut tx = self.pool.begin().await?;
        self.cursor(&mut tx, group).await?;

        let now = now_ms();
        let rows = sqlx::query(
            "SELECT entry_id, task_id, consumer, claimed_ms, delivery_count FROM queue_pending \
             WHERE stream = ? AND grp = ? AND claimed_ms <= ? ORDER BY seq",
        )
        .bind(&self.config.stream)
        .bind(group)
        .bind(now.saturating_sub(millis(min_idle)))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        rows.iter()
            .map(|row| -> Result<PendingEntry> {
                let claimed_ms: i64 = row.try_get("claimed_ms")?;
                let delivery_count: i64 = row.try_get("delivery_count")?;
                Ok(PendingEntry {
                    id: row.try_get("entry_id")?,
                    task_id: row.try_get("task_id")?,
                    consumer: row.try_get("consumer")?,
                    idle: Duration::from_millis(now.saturating_sub(claimed_ms).max(0) as u64),
                    delivery_count: delivery_count as u32,
                })
            })
            .collect()
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>> {
        let mut tx = self.pool.begin().await?;
        self.cursor(&mut tx, group).await?;

        let now = now_ms();
        let rows = sqlx::query(
            "SELECT seq, entry_id, task_id, delivery_count FROM queue_pending \
             WHERE stream = ? AND grp = ? AND claimed_ms <= ? ORDER BY seq LIMIT ?",
        )
        .bind(&self.config.stream)
        .bind(group)
        .bind(now.saturating_sub(millis(min_idle)))
        .bind(limit(count))
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.try_get("seq")?;
            let delivery_count: i64 = row.try_get::<i64, _>("delivery_count")? + 1;
            sqlx::query(
                "UPDATE queue_pending SET consumer = ?, claimed_ms = ?, delivery_count = ? \
                 WHERE stream = ? AND grp = ? AND seq = ?",
            )
            .bind(consumer)
            .bind(now)
            .bind(delivery_count)
            .bind(&self.config.stream)
            .bind(group)
            .bind(seq)
            .execute(&mut *tx)
            .await?;
            claimed.push(QueueEntry {
                id: row.try_get("entry_id")?,
                task_id: row.try_get("task_id")?,
                delivery_count: delivery_count as u32,
            });
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn dead_letter(&self, entry: &QueueEntry, reason: &str) -> Result<()> {
        warn!(
            stream = %self.config.dead_letter_stream,
            entry_id = %entry.id,
            task_id = %entry.task_id,
            reason,
            "Moved entry to dead letter"
        );
        sqlx::query(
            "INSERT INTO queue_dead_letters (stream, entry_id, task_id, delivery_count, reason, failed_ms) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.config.dead_letter_stream)
        .bind(&entry.id)
        .bind(&entry.task_id)
        .bind(i64::from(entry.delivery_count))
        .bind(reason)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT entry_id, task_id, delivery_count, reason, failed_ms FROM queue_dead_letters \
             WHERE stream = ? ORDER BY id",
        )
        .bind(&self.config.dead_letter_stream)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DeadLetter> {
                let delivery_count: i64 = row.try_get("delivery_count")?;
                Ok(DeadLetter {
                    entry: QueueEntry {
                        id: row.try_get("entry_id")?,
                        task_id: row.try_get("task_id")?,
                        delivery_count: delivery_count as u32,
                    },
                    reason: row.try_get("reason")?,
                    failed_at: from_ms(row.try_get("failed_ms")?),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const GROUP: &str = "push-workers";

    async fn queue() -> SqliteQueue {
        SqliteQueue::new(db::open_in_memory().await.unwrap(), QueueConfig::default())
    }

    #[tokio::test]
    async fn test_entries_claimed_once() {
        let queue = queue().await;
        queue.ensure_group(GROUP).await.unwrap();
        for i in 0..3 {
            queue.enqueue(&format!("t{}", i)).await.unwrap();
        }

        let a = queue.read_messages(GROUP, "worker-1", 2, Duration::ZERO).await.unwrap();
        let b = queue.read_messages(GROUP, "worker-2", 2, Duration::ZERO).await.unwrap();

        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].task_id, "t0");
        assert_eq!(b[0].task_id, "t2");
    }

    #[tokio::test]
    async fn test_concurrent_readers_never_share_an_entry() {
        let queue = Arc::new(queue().await);
        queue.ensure_group(GROUP).await.unwrap();
        for i in 0..60 {
            queue.enqueue(&format!("t{}", i)).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..3 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let consumer = format!("worker-{}", w);
                let mut seen = Vec::new();
                loop {
                    let batch = queue
                        .read_messages(GROUP, &consumer, 7, Duration::from_millis(20))
                        .await
                        .unwrap();
                    if batch.is_empty() {
                        return seen;
                    }
                    for entry in batch {
                        queue.ack(GROUP, &entry.id).await.unwrap();
                        seen.push(entry.task_id);
                    }
                }
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 60);
        assert_eq!(unique.len(), 60);
        assert_eq!(queue.stream_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_wakes_on_enqueue() {
        let queue = Arc::new(queue().await);
        queue.ensure_group(GROUP).await.unwrap();

        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .read_messages(GROUP, "worker-1", 10, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue("late").await.unwrap();

        let entries = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, "late");
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let queue = queue().await;
        let err = queue
            .read_messages("nope", "worker-1", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Queue(_)));
        assert!(matches!(
            queue.ack("nope", "1-1").await,
            Err(DispatchError::Queue(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_until_ack_then_trimmed() {
        let queue = queue().await;
        queue.ensure_group(GROUP).await.unwrap();
        queue.enqueue("t1").await.unwrap();
        let entry = queue
            .read_messages(GROUP, "worker-1", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);

        let pending = queue.pending(GROUP, Duration::ZERO).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "worker-1");
        assert!(queue.pending(GROUP, Duration::from_secs(300)).await.unwrap().is_empty());
        assert_eq!(queue.stream_len().await.unwrap(), 1);

        assert!(queue.ack(GROUP, &entry.id).await.unwrap());
        assert!(!queue.ack(GROUP, &entry.id).await.unwrap());
        assert!(queue.pending(GROUP, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(queue.stream_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_group_created_late_sees_backlog() {
        let queue = queue().await;
        queue.enqueue("early").await.unwrap();
        queue.ensure_group(GROUP).await.unwrap();
        queue.ensure_group(GROUP).await.unwrap();

        let entries = queue.read_messages(GROUP, "worker-1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, "early");
    }

    #[tokio::test]
    async fn test_delayed_index() {
        let queue = queue().await;
        let now = Utc::now();
        queue
            .push_delayed("later", now + chrono::Duration::seconds(10))
            .await
            .unwrap();
        queue
            .push_delayed("due", now - chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(queue.delayed_len().await.unwrap(), 2);
        let due = queue.due_delayed(now, 100).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task_id, "due");
        assert_eq!(queue.next_due().await.unwrap(), Some(due[0].due));

        queue.push_delayed("due", now + chrono::Duration::seconds(5)).await.unwrap();
        assert!(!queue.remove_delayed(&due[0]).await.unwrap());
        assert_eq!(queue.delayed_len().await.unwrap(), 2);

        assert!(queue.cancel_delayed("later").await.unwrap());
        assert!(!queue.cancel_delayed("later").await.unwrap());
        assert_eq!(queue.delayed_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let due = Utc::now() + chrono::Duration::minutes(5);

        {
            let queue = SqliteQueue::open(&path, QueueConfig::default()).await.unwrap();
            queue.ensure_group(GROUP).await.unwrap();
            queue.enqueue("claimed").await.unwrap();
            queue.enqueue("waiting").await.unwrap();
            queue.read_messages(GROUP, "worker-1", 1, Duration::ZERO).await.unwrap();
            queue.push_delayed("scheduled", due).await.unwrap();
            let entry = QueueEntry {
                id: "1-99".into(),
                task_id: "broken".into(),
                delivery_count: 3,
            };
            queue.dead_letter(&entry, "no task_id").await.unwrap();
            queue.pool.close().await;
        }

        let queue = SqliteQueue::open(&path, QueueConfig::default()).await.unwrap();
        queue.ensure_group(GROUP).await.unwrap();

        // The claim made before the restart is redelivered to a new consumer
        let reclaimed = queue
            .claim_idle(GROUP, "worker-2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].task_id, "claimed");
        assert_eq!(reclaimed[0].delivery_count, 2);

        let fresh = queue.read_messages(GROUP, "worker-2", 10, Duration::ZERO).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].task_id, "waiting");

        assert_eq!(
            queue.next_due().await.unwrap().map(|d| d.timestamp_millis()),
            Some(due.timestamp_millis())
        );
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].entry.delivery_count, 3);
        assert_eq!(dead[0].reason, "no task_id");
    }

    #[tokio::test]
    async fn test_streams_are_namespaced() {
        let pool = db::open_in_memory().await.unwrap();
        let orders = SqliteQueue::new(
            pool.clone(),
            QueueConfig {
                stream: "orders".into(),
                ..QueueConfig::default()
            },
        );
        let default = SqliteQueue::new(pool, QueueConfig::default());
        orders.ensure_group(GROUP).await.unwrap();
        default.ensure_group(GROUP).await.unwrap();

        orders.enqueue("o1").await.unwrap();
        assert!(default
            .read_messages(GROUP, "worker-1", 10, Duration::ZERO)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(orders.stream_len().await.unwrap(), 1);
    }
}
