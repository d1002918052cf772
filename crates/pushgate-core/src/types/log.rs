//! Append-only audit rows.

use crate::types::CallbackStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome tag of a send attempt audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushLogStatus {
    Success,
    Retry,
    SwitchProvider,
    Failed,
    Alert,
}

impl fmt::Display for PushLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::SwitchProvider => "switch_provider",
            Self::Failed => "failed",
            Self::Alert => "alert",
        };
        f.write_str(s)
    }
}

/// One row per send attempt or recovery action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushLog {
    pub task_id: String,
    pub app_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_account_id: Option<u64>,

    pub status: PushLogStatus,

    #[serde(default)]
    pub provider_msg_id: String,

    pub request_data: String,
    pub response_data: String,

    #[serde(default)]
    pub error_message: String,

    pub created_at: DateTime<Utc>,
}

impl PushLog {
    /// Start a row with empty `{}` payloads.
    pub fn new(task_id: impl Into<String>, app_id: impl Into<String>, status: PushLogStatus) -> Self {
        Self {
            task_id: task_id.into(),
            app_id: app_id.into(),
            provider_account_id: None,
            status,
            provider_msg_id: String::new(),
            request_data: "{}".to_string(),
            response_data: "{}".to_string(),
            error_message: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_account(mut self, account_id: Option<u64>) -> Self {
        self.provider_account_id = account_id;
        self
    }

    pub fn with_payloads(mut self, request: impl Into<String>, response: impl Into<String>) -> Self {
        self.request_data = request.into();
        self.response_data = response.into();
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    pub fn with_provider_msg_id(mut self, id: impl Into<String>) -> Self {
        self.provider_msg_id = id.into();
        self
    }
}

/// One row per received delivery report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackLog {
    /// Empty when no task matched the provider message ID.
    #[serde(default)]
    pub task_id: String,

    #[serde(default)]
    pub app_id: String,

    pub provider_code: String,
    pub provider_id: String,
    pub callback_status: CallbackStatus,

    #[serde(default)]
    pub error_code: String,

    #[serde(default)]
    pub error_message: String,

    pub raw_data: String,
    pub created_at: DateTime<Utc>,
}
