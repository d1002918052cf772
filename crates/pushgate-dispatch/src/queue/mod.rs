//! Work queue: an append-only stream with consumer groups, a dead-letter
//! stream and a delayed index ordered by due time.

mod memory;
mod scheduler;
mod sqlite;

pub use memory::MemoryQueue;
pub use scheduler::DelayedScanner;
pub use sqlite::SqliteQueue;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pushgate_core::types::Task;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Sequence number of an entry ID shaped `{millis}-{seq}`.
pub(crate) fn entry_seq(id: &str) -> Option<u64> {
    id.rsplit_once('-').and_then(|(_, seq)| seq.parse().ok())
}

/// One stream entry as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Stream entry ID, ordered by insertion.
    pub id: String,
    pub task_id: String,
    /// How many times this entry has been handed out in its group.
    pub delivery_count: u32,
}

/// An entry claimed by a consumer but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub task_id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u32,
}

/// An entry parked in the dead-letter stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry: QueueEntry,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// A task waiting in the delayed index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedEntry {
    pub task_id: String,
    pub due: DateTime<Utc>,
}

/// Durable, at-least-once task queue.
///
/// Within one group an entry is claimed by a single consumer at a time and
/// stays pending until acknowledged.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a task ID to the stream for immediate processing.
    async fn enqueue(&self, task_id: &str) -> Result<String>;

    /// Index a task ID under `due`, replacing any earlier due time.
    async fn push_delayed(&self, task_id: &str, due: DateTime<Utc>) -> Result<()>;

    /// Drop a task from the delayed index.
    async fn cancel_delayed(&self, task_id: &str) -> Result<bool>;

    async fn delayed_len(&self) -> Result<usize>;

    /// Entries due at or before `now`, earliest first.
    async fn due_delayed(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DelayedEntry>>;

    /// Remove an entry only if it is still indexed under the same due time.
    async fn remove_delayed(&self, entry: &DelayedEntry) -> Result<bool>;

    /// Earliest due time in the delayed index.
    async fn next_due(&self) -> Result<Option<DateTime<Utc>>>;

    /// Signalled when a new delayed entry is indexed, if the backend supports it.
    fn delayed_signal(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(&self, group: &str) -> Result<()>;

    /// Claim up to `count` new entries, waiting up to `block` if none exist.
    async fn read_messages(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>>;

    /// Finish an entry for the group.
    async fn ack(&self, group: &str, entry_id: &str) -> Result<bool>;

    /// Entries claimed longer than `min_idle` ago and still unacknowledged.
    async fn pending(&self, group: &str, min_idle: Duration) -> Result<Vec<PendingEntry>>;

    /// Reassign stale pending entries to `consumer` and return them.
    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>>;

    async fn dead_letter(&self, entry: &QueueEntry, reason: &str) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Push a task: into the delayed index if it is scheduled in the future,
    /// onto the stream otherwise.
    async fn push(&self, task: &Task) -> Result<()> {
        match task.scheduled_at {
            Some(at) if at > Utc::now() => self.push_delayed(&task.task_id, at).await,
            _ => self.enqueue(&task.task_id).await.map(|_| ()),
        }
    }

    /// Push each task in turn. Items pushed before a failure stay queued.
    async fn push_batch(&self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            self.push(task).await?;
        }
        Ok(())
    }
}

/// Shareable queue handle.
pub type SharedQueue = Arc<dyn WorkQueue>;
