//! Dispatch error types.

use pushgate_channels::ChannelError;
use pushgate_core::types::{MessageType, TaskStatus};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the dispatch pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Core error.
    #[error("Core error: {0}")]
    Core(#[from] pushgate_core::Error),

    /// Provider adapter error.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Task does not exist.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Status update would break the task lifecycle.
    #[error("Invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// No selectable provider for the channel and message type.
    #[error("No available channel for {channel_id}:{message_type}")]
    NoChannel {
        channel_id: u64,
        message_type: MessageType,
    },

    /// Provider account referenced by a binding is missing.
    #[error("Provider account not found: {0}")]
    AccountNotFound(u64),

    /// Application unknown or inactive.
    #[error("Application not available: {0}")]
    AppNotAvailable(String),

    /// Submission rejected.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Queue entry could not be interpreted.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Outward notification failed.
    #[error("Notification failed: {0}")]
    Notify(String),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Workers did not stop in time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// A worker task panicked.
    #[error("Worker {worker} panicked: {error}")]
    WorkerPanic { worker: String, error: String },
}

impl DispatchError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Errors a client caused, as opposed to internal failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::AppNotAvailable(_) | Self::NoChannel { .. } | Self::TaskNotFound(_)
        )
    }
}
