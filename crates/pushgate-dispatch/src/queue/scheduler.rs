//! Moves due entries from the delayed index onto the stream.

use super::{SharedQueue, WorkQueue};
use crate::Result;
use chrono::{DateTime, Utc};
use pushgate_core::config::SchedulerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Shortest pause between scans while entries are due.
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Periodic delayed-index scanner.
///
/// Wakes at the configured interval, or earlier when the next due time is
/// closer or a new entry is indexed.
pub struct DelayedScanner {
    queue: SharedQueue,
    interval: Duration,
    batch_size: usize,
}

impl DelayedScanner {
    pub fn new(queue: SharedQueue, config: &SchedulerConfig) -> Self {
        Self {
            queue,
            interval: config.interval(),
            batch_size: config.batch_size,
        }
    }

    /// Move up to one batch of due entries. Returns how many were moved.
    ///
    /// Enqueue happens before removal, so a crash in between re-delivers the
    /// task on the next scan.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.queue.due_delayed(now, self.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }

        debug!(count = due.len(), "Found due delayed tasks");
        let mut moved = 0;
        for entry in due {
            if let Err(e) = self.queue.enqueue(&entry.task_id).await {
                error!(task_id = %entry.task_id, error = %e, "Failed to enqueue delayed task");
                continue;
            }
            self.queue.remove_delayed(&entry).await?;
            moved += 1;
        }

        info!(moved, "Moved delayed tasks to stream");
        Ok(moved)
    }

    async fn next_wait(&self) -> Duration {
        match self.queue.next_due().await {
            Ok(Some(due)) => (due - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_WAIT, self.interval.max(MIN_WAIT)),
            _ => self.interval,
        }
    }

    /// Scan until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Delayed scanner started"
        );
        let signal = self.queue.delayed_signal();

        loop {
            let wait = match self.scan_once(Utc::now()).await {
                Ok(_) => self.next_wait().await,
                Err(e) => {
                    error!(error = %e, "Delayed scan failed");
                    self.interval
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
                _ = wait_for(&signal) => {}
            }
        }

        info!("Delayed scanner stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

async fn wait_for(signal: &Option<Arc<Notify>>) {
    match signal {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}
