//! SQLite database shared by the durable task store, log store and queue.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        provider_msg_id TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        callback_status TEXT NOT NULL,
        updated_ms INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_provider_msg_id ON tasks (provider_msg_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_awaiting ON tasks (status, callback_status, updated_ms)",
    "CREATE TABLE IF NOT EXISTS push_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_push_logs_task ON push_logs (task_id)",
    "CREATE TABLE IF NOT EXISTS callback_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        provider_id TEXT NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_callback_logs_provider ON callback_logs (provider_id)",
    "CREATE TABLE IF NOT EXISTS queue_stream (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        stream TEXT NOT NULL,
        task_id TEXT NOT NULL,
        created_ms INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_queue_stream ON queue_stream (stream, seq)",
    "CREATE TABLE IF NOT EXISTS queue_groups (
        stream TEXT NOT NULL,
        name TEXT NOT NULL,
        cursor INTEGER NOT NULL,
        PRIMARY KEY (stream, name)
    )",
    "CREATE TABLE IF NOT EXISTS queue_pending (
        stream TEXT NOT NULL,
        grp TEXT NOT NULL,
        seq INTEGER NOT NULL,
        entry_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        consumer TEXT NOT NULL,
        claimed_ms INTEGER NOT NULL,
        delivery_count INTEGER NOT NULL,
        PRIMARY KEY (stream, grp, seq)
    )",
    "CREATE TABLE IF NOT EXISTS queue_delayed (
        key TEXT NOT NULL,
        task_id TEXT NOT NULL,
        due_ms INTEGER NOT NULL,
        PRIMARY KEY (key, task_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_queue_delayed_due ON queue_delayed (key, due_ms)",
    "CREATE TABLE IF NOT EXISTS queue_dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stream TEXT NOT NULL,
        entry_id TEXT NOT NULL,
        task_id TEXT NOT NULL,
        delivery_count INTEGER NOT NULL,
        reason TEXT NOT NULL,
        failed_ms INTEGER NOT NULL
    )",
];

/// Open the database file at `path`, creating it and its tables if needed.
///
/// The pool holds a single connection, so every transaction runs alone and
/// queue claims never interleave.
pub async fn open(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    info!(path = %path.display(), "Opened sqlite storage");
    Ok(pool)
}

/// A private in-memory database, gone when the pool closes.
pub async fn open_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let pool = open_in_memory().await.unwrap();
        migrate(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(
            tables,
            vec![
                "callback_logs",
                "push_logs",
                "queue_dead_letters",
                "queue_delayed",
                "queue_groups",
                "queue_pending",
                "queue_stream",
                "tasks"
            ]
        );
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pushgate.db");
        let pool = open(&path).await.unwrap();
        pool.close().await;
        assert!(path.exists());
    }
}
