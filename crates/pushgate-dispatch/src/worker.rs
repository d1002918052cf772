//! Worker pool consuming the work queue.

use crate::error::DispatchError;
use crate::handler::EntryHandler;
use crate::queue::{QueueEntry, SharedQueue};
use crate::Result;
use futures::FutureExt;
use pushgate_core::config::{QueueConfig, WorkerConfig};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Default)]
struct PoolState {
    cancel: Option<CancellationToken>,
    workers: Vec<(String, JoinHandle<()>)>,
}

/// Fixed set of workers reading the stream through one consumer group.
///
/// Each entry is handled, dead-lettered on error and then acknowledged.
pub struct WorkerPool {
    queue: SharedQueue,
    handler: Arc<dyn EntryHandler>,
    queue_config: QueueConfig,
    config: WorkerConfig,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(
        queue: SharedQueue,
        handler: Arc<dyn EntryHandler>,
        queue_config: QueueConfig,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            queue_config,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Spawn the workers. Calling it on a running pool does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.cancel.is_some() {
            debug!("Worker pool already running");
            return Ok(());
        }

        self.queue.ensure_group(&self.queue_config.group).await?;

        let cancel = CancellationToken::new();
        let count = self.config.count.max(1);
        for n in 1..=count {
            let worker = Worker {
                name: format!("worker-{}", n),
                queue: self.queue.clone(),
                handler: self.handler.clone(),
                config: self.queue_config.clone(),
                cancel: cancel.clone(),
            };
            let name = worker.name.clone();
            state.workers.push((name, tokio::spawn(worker.run())));
        }
        state.cancel = Some(cancel);

        info!(
            workers = count,
            group = %self.queue_config.group,
            "Worker pool started"
        );
        Ok(())
    }

    /// Cancel the workers and wait for in-flight entries, bounded by the
    /// shutdown timeout.
    pub async fn stop(&self) -> Result<()> {
        let (cancel, workers) = {
            let mut state = self.state.lock().await;
            match state.cancel.take() {
                Some(cancel) => (cancel, std::mem::take(&mut state.workers)),
                None => return Ok(()),
            }
        };

        let timeout = self.config.shutdown_timeout();
        info!(workers = workers.len(), timeout = ?timeout, "Stopping worker pool");
        cancel.cancel();

        let aborts: Vec<_> = workers.iter().map(|(_, h)| h.abort_handle()).collect();
        let join = async {
            let mut first_error = None;
            for (name, handle) in workers {
                if let Err(e) = handle.await {
                    error!(worker = %name, error = %e, "Worker task panicked");
                    first_error.get_or_insert(DispatchError::WorkerPanic {
                        worker: name,
                        error: e.to_string(),
                    });
                }
            }
            first_error
        };

        match tokio::time::timeout(timeout, join).await {
            Ok(None) => {
                info!("Worker pool stopped");
                Ok(())
            }
            Ok(Some(e)) => Err(e),
            Err(_) => {
                error!(timeout = ?timeout, "Worker shutdown timed out, aborting workers");
                for abort in aborts {
                    abort.abort();
                }
                Err(DispatchError::ShutdownTimeout(timeout))
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.cancel.is_some()
    }
}

struct Worker {
    name: String,
    queue: SharedQueue,
    handler: Arc<dyn EntryHandler>,
    config: QueueConfig,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = %self.name, "Worker started");

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = self.queue.read_messages(
                    &self.config.group,
                    &self.name,
                    self.config.read_count,
                    self.config.block(),
                ) => read,
            };

            let mut entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Failed to read from queue");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                    }
                }
            };

            if entries.is_empty() {
                entries = self.reclaim().await;
            }

            // In-flight entries finish even when cancellation arrives.
            for entry in entries {
                self.process(&entry).await;
            }
        }

        debug!(worker = %self.name, "Worker stopped");
    }

    /// Take over entries left unacknowledged by a consumer that went away.
    async fn reclaim(&self) -> Vec<QueueEntry> {
        match self
            .queue
            .claim_idle(
                &self.config.group,
                &self.name,
                self.config.pending_idle(),
                self.config.read_count,
            )
            .await
        {
            Ok(entries) => {
                if !entries.is_empty() {
                    info!(worker = %self.name, count = entries.len(), "Reclaimed idle entries");
                }
                entries
            }
            Err(e) => {
                warn!(worker = %self.name, error = %e, "Failed to reclaim idle entries");
                Vec::new()
            }
        }
    }

    async fn process(&self, entry: &QueueEntry) {
        let outcome = AssertUnwindSafe(self.handler.handle(entry))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(DispatchError::Queue("handler panicked".to_string())));

        match outcome {
            Ok(()) => debug!(worker = %self.name, entry = %entry.id, task_id = %entry.task_id, "Entry handled"),
            Err(e) => {
                error!(
                    worker = %self.name,
                    entry = %entry.id,
                    task_id = %entry.task_id,
                    error = %e,
                    "Failed to handle entry"
                );
                if let Err(e) = self.queue.dead_letter(entry, &e.to_string()).await {
                    error!(entry = %entry.id, error = %e, "Failed to dead-letter entry");
                }
            }
        }

        if let Err(e) = self.queue.ack(&self.config.group, &entry.id).await {
            error!(entry = %entry.id, error = %e, "Failed to ack entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueue, WorkQueue};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl EntryHandler for RecordingHandler {
        async fn handle(&self, entry: &QueueEntry) -> Result<()> {
            self.seen.lock().push(entry.task_id.clone());
            match entry.task_id.as_str() {
                "bad" => Err(DispatchError::TaskNotFound("bad".into())),
                "boom" => panic!("handler blew up"),
                _ => Ok(()),
            }
        }
    }

    fn queue_config() -> QueueConfig {
        QueueConfig {
            block_secs: 1,
            ..QueueConfig::default()
        }
    }

    fn pool(queue: Arc<MemoryQueue>, handler: Arc<RecordingHandler>, count: usize) -> WorkerPool {
        WorkerPool::new(
            queue,
            handler,
            queue_config(),
            WorkerConfig {
                count,
                shutdown_timeout_secs: 5,
            },
        )
    }

    async fn wait_for_seen(handler: &RecordingHandler, n: usize) {
        for _ in 0..200 {
            if handler.seen.lock().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("handler saw {} entries, expected {}", handler.seen.lock().len(), n);
    }

    #[tokio::test]
    async fn test_each_entry_handled_once() {
        let queue = Arc::new(MemoryQueue::new(queue_config()));
        let handler = Arc::new(RecordingHandler::default());
        let pool = pool(queue.clone(), handler.clone(), 3);
        pool.start().await.unwrap();

        for i in 0..20 {
            queue.enqueue(&format!("t{}", i)).await.unwrap();
        }
        wait_for_seen(&handler, 20).await;
        pool.stop().await.unwrap();

        let mut seen = handler.seen.lock().clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 20);
        assert_eq!(handler.seen.lock().len(), 20);
        assert!(queue
            .pending(&queue_config().group, Duration::ZERO)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_dead_lettered_and_acked() {
        let queue = Arc::new(MemoryQueue::new(queue_config()));
        let handler = Arc::new(RecordingHandler::default());
        let pool = pool(queue.clone(), handler.clone(), 1);
        pool.start().await.unwrap();

        queue.enqueue("bad").await.unwrap();
        queue.enqueue("boom").await.unwrap();
        queue.enqueue("ok").await.unwrap();
        wait_for_seen(&handler, 3).await;
        pool.stop().await.unwrap();

        let dead = queue.dead_letters().await.unwrap();
        let ids: Vec<_> = dead.iter().map(|d| d.entry.task_id.as_str()).collect();
        assert_eq!(ids, vec!["bad", "boom"]);
        assert!(dead[1].reason.contains("panicked"));
        assert!(queue
            .pending(&queue_config().group, Duration::ZERO)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_safe() {
        let queue = Arc::new(MemoryQueue::new(queue_config()));
        let handler = Arc::new(RecordingHandler::default());
        let pool = pool(queue, handler, 2);

        pool.stop().await.unwrap();
        pool.start().await.unwrap();
        pool.start().await.unwrap();
        assert!(pool.is_running().await);
        assert_eq!(pool.state.lock().await.workers.len(), 2);

        pool.stop().await.unwrap();
        assert!(!pool.is_running().await);
    }
}
