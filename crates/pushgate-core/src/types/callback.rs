//! Canonical callback results.

use crate::types::CallbackStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A provider delivery report normalized to the gateway's vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackResult {
    /// Filled in by ingestion once the task is found.
    #[serde(default)]
    pub task_id: String,

    pub provider_id: String,
    pub status: CallbackStatus,

    #[serde(default)]
    pub error_code: String,

    #[serde(default)]
    pub error_message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_time: Option<DateTime<Utc>>,
}

impl CallbackResult {
    pub fn new(provider_id: impl Into<String>, status: CallbackStatus) -> Self {
        Self {
            task_id: String::new(),
            provider_id: provider_id.into(),
            status,
            error_code: String::new(),
            error_message: String::new(),
            report_time: None,
        }
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = code.into();
        self.error_message = message.into();
        self
    }

    pub fn with_report_time(mut self, time: DateTime<Utc>) -> Self {
        self.report_time = Some(time);
        self
    }
}
