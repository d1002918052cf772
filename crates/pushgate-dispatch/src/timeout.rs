//! Marks sent tasks whose delivery report never arrived.

use crate::store::TaskStore;
use crate::Result;
use chrono::{DateTime, Utc};
use pushgate_core::config::CallbackTimeoutConfig;
use pushgate_core::types::CallbackStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct CallbackTimeoutScanner {
    tasks: Arc<dyn TaskStore>,
    interval: Duration,
    timeout: Duration,
    batch_size: usize,
}

impl CallbackTimeoutScanner {
    pub fn new(tasks: Arc<dyn TaskStore>, config: &CallbackTimeoutConfig) -> Self {
        Self {
            tasks,
            interval: config.interval(),
            timeout: config.timeout(),
            batch_size: config.batch_size,
        }
    }

    /// Mark up to one batch of overdue tasks. Returns how many were marked.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::days(1));
        let overdue = self.tasks.awaiting_callback(now - timeout, self.batch_size).await?;

        let mut marked = 0;
        for mut task in overdue {
            task.callback_status = CallbackStatus::Timeout;
            task.callback_time = Some(now);
            match self.tasks.update(&task).await {
                Ok(()) => marked += 1,
                Err(e) => warn!(task_id = %task.task_id, error = %e, "Failed to mark callback timeout"),
            }
        }

        if marked > 0 {
            info!(marked, "Marked tasks with callback timeout");
        }
        Ok(marked)
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            "Callback timeout scanner started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.scan_once(Utc::now()).await {
                error!(error = %e, "Callback timeout scan failed");
            }
        }

        info!("Callback timeout scanner stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
