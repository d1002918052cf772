//! SQLite backed task and log stores.
//!
//! Rows keep the full record as JSON next to the columns that are queried.

use super::{LogStore, TaskStore};
use crate::error::DispatchError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pushgate_core::types::{CallbackLog, CallbackStatus, PushLog, Task, TaskStatus};
use sqlx::SqlitePool;

/// Tasks in the `tasks` table.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn decode_task(body: &str) -> Result<Task> {
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: Task) -> Result<()> {
        let body = serde_json::to_string(&task)?;
        sqlx::query(
            "INSERT OR REPLACE INTO tasks (task_id, provider_msg_id, status, callback_status, updated_ms, body) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.task_id)
        .bind(&task.provider_msg_id)
        .bind(task.status.as_str())
        .bind(task.callback_status.as_str())
        .bind(task.updated_at.timestamp_millis())
        .bind(&body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        body.as_deref().map(decode_task).transpose()
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let body: Option<String> = sqlx::query_scalar("SELECT body FROM tasks WHERE task_id = ?")
            .bind(&task.task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let stored = match body {
            Some(body) => decode_task(&body)?,
            None => return Err(DispatchError::TaskNotFound(task.task_id.clone())),
        };
        if !stored.status.can_transition_to(task.status) {
            return Err(DispatchError::InvalidTransition {
                task_id: task.task_id.clone(),
                from: stored.status,
                to: task.status,
            });
        }

        let mut updated = task.clone();
        updated.updated_at = Utc::now();
        sqlx::query(
            "UPDATE tasks SET provider_msg_id = ?, status = ?, callback_status = ?, updated_ms = ?, body = ? \
             WHERE task_id = ?",
        )
        .bind(&updated.provider_msg_id)
        .bind(updated.status.as_str())
        .bind(updated.callback_status.as_str())
        .bind(updated.updated_at.timestamp_millis())
        .bind(serde_json::to_string(&updated)?)
        .bind(&updated.task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_provider_msg_id(&self, provider_msg_id: &str) -> Result<Option<Task>> {
        if provider_msg_id.is_empty() {
            return Ok(None);
        }
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM tasks WHERE provider_msg_id = ? ORDER BY updated_ms DESC LIMIT 1",
        )
        .bind(provider_msg_id)
        .fetch_optional(&self.pool)
        .await?;
        body.as_deref().map(decode_task).transpose()
    }

    async fn awaiting_callback(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            "SELECT body FROM tasks \
             WHERE status = ? AND callback_status = ? AND updated_ms < ? \
             ORDER BY updated_ms LIMIT ?",
        )
        .bind(TaskStatus::Sent.as_str())
        .bind(CallbackStatus::Pending.as_str())
        .bind(cutoff.timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        bodies.iter().map(|b| decode_task(b)).collect()
    }
}

/// Push and callback logs in insertion order.
#[derive(Debug, Clone)]
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn append_push_log(&self, log: PushLog) -> Result<()> {
        sqlx::query("INSERT INTO push_logs (task_id, body) VALUES (?, ?)")
            .bind(&log.task_id)
            .bind(serde_json::to_string(&log)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_callback_log(&self, log: CallbackLog) -> Result<()> {
        sqlx::query("INSERT INTO callback_logs (provider_id, body) VALUES (?, ?)")
            .bind(&log.provider_id)
            .bind(serde_json::to_string(&log)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn push_logs(&self, task_id: &str) -> Result<Vec<PushLog>> {
        let bodies: Vec<String> =
            sqlx::query_scalar("SELECT body FROM push_logs WHERE task_id = ? ORDER BY id")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(bodies
            .iter()
            .map(|b| serde_json::from_str(b))
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn callback_logs(&self, provider_id: &str) -> Result<Vec<CallbackLog>> {
        let bodies: Vec<String> =
            sqlx::query_scalar("SELECT body FROM callback_logs WHERE provider_id = ? ORDER BY id")
                .bind(provider_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(bodies
            .iter()
            .map(|b| serde_json::from_str(b))
            .collect::<std::result::Result<_, _>>()?)
    }
}
