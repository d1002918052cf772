//! Push tasks and their lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Default retry budget for a task when the submitter does not set one.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Kind of message carried by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Sms,
    Email,
    WechatWork,
    Dingtalk,
    Webhook,
    Push,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Email => "email",
            Self::WechatWork => "wechat_work",
            Self::Dingtalk => "dingtalk",
            Self::Webhook => "webhook",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Self::Sms),
            "email" => Ok(Self::Email),
            "wechat_work" => Ok(Self::WechatWork),
            "dingtalk" => Ok(Self::Dingtalk),
            "webhook" => Ok(Self::Webhook),
            "push" => Ok(Self::Push),
            other => Err(Error::invalid("message_type", other)),
        }
    }
}

/// Dispatch status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    /// Accepted by the provider, waiting for a delivery callback.
    Sent,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// A terminal task may only move to another terminal state, which covers
    /// a late delivery report overriding a synchronous result.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return next.is_terminal();
        }
        !(next == Self::Pending && *self != Self::Pending)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    #[default]
    Pending,
    Delivered,
    Failed,
    Rejected,
    Timeout,
    #[serde(other)]
    Unknown,
}

impl CallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Failed and rejected reports go through the callback failure rules.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Rejected)
    }
}

impl fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical send to one receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub app_id: String,
    pub channel_id: u64,
    pub message_type: MessageType,
    pub receiver: String,

    /// Rendered content, used when the provider has no template.
    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub template_code: String,

    #[serde(default)]
    pub template_params: BTreeMap<String, String>,

    /// Signature name, resolved to a provider signature per channel.
    #[serde(default)]
    pub signature: String,

    pub status: TaskStatus,
    pub callback_status: CallbackStatus,
    pub retry_count: u32,
    pub max_retry: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Message ID returned by the provider, used to match callbacks.
    #[serde(default)]
    pub provider_msg_id: String,

    /// Provider account that handled the last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_account_id: Option<u64>,

    /// Provider accounts the selector must avoid for this task.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub excluded_accounts: BTreeSet<u64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_time: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task from a submission.
    pub fn new(task_id: impl Into<String>, request: &SubmitRequest) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            app_id: request.app_id.clone(),
            channel_id: request.channel_id,
            message_type: request.message_type,
            receiver: request.receiver.clone(),
            content: request.content.clone(),
            template_code: request.template_code.clone(),
            template_params: request.template_params.clone(),
            signature: request.signature.clone(),
            status: TaskStatus::Pending,
            callback_status: CallbackStatus::Pending,
            retry_count: 0,
            max_retry: request.max_retry.unwrap_or(DEFAULT_MAX_RETRY),
            scheduled_at: request.scheduled_at,
            provider_msg_id: String::new(),
            provider_account_id: None,
            excluded_accounts: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            callback_time: None,
        }
    }

    /// Whether the task should go to the delayed index instead of the stream.
    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map(|at| at > now).unwrap_or(false)
    }
}

/// Inbound submission from a client application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub app_id: String,
    pub channel_id: u64,
    pub message_type: MessageType,
    pub receiver: String,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub template_code: String,

    #[serde(default)]
    pub template_params: BTreeMap<String, String>,

    #[serde(default)]
    pub signature: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<u32>,
}

/// Acknowledgement returned for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub task_id: String,
    pub status: TaskStatus,
}

/// One submission fanned out to many receivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmitRequest {
    pub app_id: String,
    pub channel_id: u64,
    pub message_type: MessageType,
    pub receivers: Vec<String>,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub template_code: String,

    #[serde(default)]
    pub template_params: BTreeMap<String, String>,

    #[serde(default)]
    pub signature: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<u32>,
}

impl BatchSubmitRequest {
    /// The single-receiver submission for one item.
    pub fn item(&self, receiver: &str) -> SubmitRequest {
        SubmitRequest {
            app_id: self.app_id.clone(),
            channel_id: self.channel_id,
            message_type: self.message_type,
            receiver: receiver.to_string(),
            content: self.content.clone(),
            template_code: self.template_code.clone(),
            template_params: self.template_params.clone(),
            signature: self.signature.clone(),
            scheduled_at: self.scheduled_at,
            max_retry: self.max_retry,
        }
    }
}

/// Per-receiver outcome of a batch submission, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemReceipt {
    pub receiver: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub total_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub items: Vec<BatchItemReceipt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SubmitRequest {
        SubmitRequest {
            app_id: "app1".to_string(),
            channel_id: 7,
            message_type: MessageType::Sms,
            receiver: "13800000000".to_string(),
            content: String::new(),
            template_code: "verify".to_string(),
            template_params: BTreeMap::from([("code".to_string(), "1234".to_string())]),
            signature: "Acme".to_string(),
            scheduled_at: None,
            max_retry: None,
        }
    }

    #[test]
    fn test_batch_item_request() {
        let batch = BatchSubmitRequest {
            app_id: "app1".into(),
            channel_id: 2,
            message_type: MessageType::Sms,
            receivers: vec!["a".into(), "b".into()],
            content: "hi".into(),
            template_code: String::new(),
            template_params: BTreeMap::new(),
            signature: "ACME".into(),
            scheduled_at: None,
            max_retry: Some(1),
        };
        let item = batch.item("b");
        assert_eq!(item.receiver, "b");
        assert_eq!(item.signature, "ACME");
        assert_eq!(item.max_retry, Some(1));
    }

    #[test]
    fn test_task_new_defaults() {
        let task = Task::new("t1", &request());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.callback_status, CallbackStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retry, DEFAULT_MAX_RETRY);
        assert!(task.excluded_accounts.is_empty());
    }

    #[test]
    fn test_terminal_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Sent.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Sent.can_transition_to(TaskStatus::Success));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Success.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn test_scheduled_after() {
        let mut task = Task::new("t1", &request());
        let now = Utc::now();
        assert!(!task.is_scheduled_after(now));
        task.scheduled_at = Some(now + chrono::Duration::seconds(30));
        assert!(task.is_scheduled_after(now));
        task.scheduled_at = Some(now - chrono::Duration::seconds(30));
        assert!(!task.is_scheduled_after(now));
    }

    #[test]
    fn test_message_type_parse() {
        assert_eq!("wechat_work".parse::<MessageType>().unwrap(), MessageType::WechatWork);
        assert!("fax".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_callback_status_unknown() {
        let status: CallbackStatus = serde_json::from_str("\"accepted\"").unwrap();
        assert_eq!(status, CallbackStatus::Unknown);
        assert!(CallbackStatus::Rejected.is_failure());
        assert!(!CallbackStatus::Delivered.is_failure());
    }
}
