//! In-process queue backend.

use super::{entry_seq, DeadLetter, DelayedEntry, PendingEntry, QueueEntry, WorkQueue};
use crate::error::DispatchError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pushgate_core::config::QueueConfig;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Stream, consumer groups, dead-letter stream and delayed index kept in
/// memory behind one lock.
pub struct MemoryQueue {
    config: QueueConfig,
    state: Mutex<State>,
    stream_notify: Notify,
    delayed_notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    /// Sequence number of the next appended entry.
    next_seq: u64,
    /// Sequence number of `entries.front()`.
    base: u64,
    entries: VecDeque<StreamEntry>,
    groups: HashMap<String, Group>,
    delayed: BTreeSet<(DateTime<Utc>, String)>,
    delayed_due: HashMap<String, DateTime<Utc>>,
    dead: Vec<DeadLetter>,
}

struct StreamEntry {
    id: String,
    task_id: String,
}

struct Group {
    /// Sequence number of the next entry never handed out in this group.
    cursor: u64,
    pending: BTreeMap<u64, Claim>,
}

struct Claim {
    id: String,
    task_id: String,
    consumer: String,
    claimed_at: Instant,
    delivery_count: u32,
}

impl Claim {
    fn entry(&self) -> QueueEntry {
        QueueEntry {
            id: self.id.clone(),
            task_id: self.task_id.clone(),
            delivery_count: self.delivery_count,
        }
    }
}

impl State {
    fn group_mut(&mut self, name: &str) -> Result<&mut Group> {
        self.groups
            .get_mut(name)
            .ok_or_else(|| DispatchError::Queue(format!("consumer group {} does not exist", name)))
    }

    fn claim_new(&mut self, group: &str, consumer: &str, count: usize) -> Result<Vec<QueueEntry>> {
        let base = self.base;
        let end = self.next_seq;
        let State { entries, groups, .. } = self;
        let group = groups
            .get_mut(group)
            .ok_or_else(|| DispatchError::Queue(format!("consumer group {} does not exist", group)))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        while group.cursor < end && claimed.len() < count {
            let seq = group.cursor;
            group.cursor += 1;
            let Some(entry) = entries.get((seq - base) as usize) else {
                continue;
            };
            let claim = Claim {
                id: entry.id.clone(),
                task_id: entry.task_id.clone(),
                consumer: consumer.to_string(),
                claimed_at: now,
                delivery_count: 1,
            };
            claimed.push(claim.entry());
            group.pending.insert(seq, claim);
        }
        Ok(claimed)
    }

    /// Drop stream entries every group has moved past and acknowledged.
    fn trim(&mut self) {
        if self.groups.is_empty() {
            return;
        }
        let floor = self
            .groups
            .values()
            .map(|g| g.pending.keys().next().copied().unwrap_or(g.cursor).min(g.cursor))
            .min()
            .unwrap_or(self.base);

        while self.base < floor && self.entries.pop_front().is_some() {
            self.base += 1;
        }
    }
}

impl MemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            stream_notify: Notify::new(),
            delayed_notify: Arc::new(Notify::new()),
        }
    }

    /// Entries currently retained in the stream.
    pub fn stream_len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, task_id: &str) -> Result<String> {
        let id = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let id = format!("{}-{}", Utc::now().timestamp_millis(), seq);
            state.entries.push_back(StreamEntry {
                id: id.clone(),
                task_id: task_id.to_string(),
            });
            id
        };
        debug!(stream = %self.config.stream, entry_id = %id, task_id, "Enqueued task");
        self.stream_notify.notify_waiters();
        Ok(id)
    }

    async fn push_delayed(&self, task_id: &str, due: DateTime<Utc>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.delayed_due.insert(task_id.to_string(), due) {
                state.delayed.remove(&(previous, task_id.to_string()));
            }
            state.delayed.insert((due, task_id.to_string()));
        }
        debug!(index = %self.config.delayed_key, task_id, due = %due, "Indexed delayed task");
        self.delayed_notify.notify_one();
        Ok(())
    }

    async fn cancel_delayed(&self, task_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.delayed_due.remove(task_id) {
            Some(due) => {
                state.delayed.remove(&(due, task_id.to_string()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delayed_len(&self) -> Result<usize> {
        Ok(self.state.lock().delayed.len())
    }

    async fn due_delayed(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DelayedEntry>> {
        Ok(self
            .state
            .lock()
            .delayed
            .iter()
            .take_while(|(due, _)| *due <= now)
            .take(limit)
            .map(|(due, task_id)| DelayedEntry {
                task_id: task_id.clone(),
                due: *due,
            })
            .collect())
    }

    async fn remove_delayed(&self, entry: &DelayedEntry) -> Result<bool> {
        let mut state = self.state.lock();
        if state.delayed_due.get(&entry.task_id) != Some(&entry.due) {
            return Ok(false);
        }
        state.delayed_due.remove(&entry.task_id);
        Ok(state.delayed.remove(&(entry.due, entry.task_id.clone())))
    }

    async fn next_due(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().delayed.iter().next().map(|(due, _)| *due))
    }

    fn delayed_signal(&self) -> Option<Arc<Notify>> {
        Some(self.delayed_notify.clone())
    }

    async fn ensure_group(&self, group: &str) -> Result<()> {
        let mut state = self.state.lock();
        let base = state.base;
        state.groups.entry(group.to_string()).or_insert_with(|| Group {
            cursor: base,
            pending: BTreeMap::new(),
        });
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
            // Register interest before looking, so an enqueue in between is not missed
            let notified = self.stream_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claimed = self.state.lock().claim_new(group, consumer, count)?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, group: &str, entry_id: &str) -> Result<bool> {
        let Some(seq) = entry_seq(entry_id) else {
            warn!(entry_id, "Ack for malformed entry id");
            return Ok(false);
        };
        let mut state = self.state.lock();
        let removed = state.group_mut(group)?.pending.remove(&seq).is_some();
        if removed {
            state.trim();
        }
        Ok(removed)
    }

    async fn pending(&self, group: &str, min_idle: Duration) -> Result<Vec<PendingEntry>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        Ok(state
            .group_mut(group)?
            .pending
            .values()
            .filter(|c| now.duration_since(c.claimed_at) >= min_idle)
            .map(|c| PendingEntry {
                id: c.id.clone(),
                task_id: c.task_id.clone(),
                consumer: c.consumer.clone(),
                idle: now.duration_since(c.claimed_at),
                delivery_count: c.delivery_count,
            })
            .collect())
    }

    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<QueueEntry>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let claimed: Vec<QueueEntry> = state
            .group_mut(group)?
            .pending
            .values_mut()
            .filter(|c| now.duration_since(c.claimed_at) >= min_idle)
            .take(count)
            .map(|c| {
                c.consumer = consumer.to_string();
                c.claimed_at = now;
                c.delivery_count += 1;
                c.entry()
            })
            .collect();
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
        self.state.lock().dead.push(DeadLetter {
            entry: entry.clone(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.lock().dead.clone())
    }
}
