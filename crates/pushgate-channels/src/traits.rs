//! Capability traits implemented by provider adapters.

use crate::{ChannelError, Result};
use async_trait::async_trait;
use pushgate_core::types::{
    CallbackResult, ChannelBinding, ProviderAccount, ProviderSignature, Task, TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Optional capabilities a provider declares at registration time.
///
/// The factory only hands out a capability when its flag is set, even if the
/// adapter type happens to implement the trait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Submit many tasks in one provider call.
    pub batch_send: bool,
    /// Parse pushed delivery reports.
    pub callback: bool,
    /// Query delivery status by provider message ID.
    pub status_query: bool,
    /// Pull pending delivery reports in bulk.
    pub status_pull: bool,
}

impl Capabilities {
    /// Capabilities of a plain sender.
    pub fn send_only() -> Self {
        Self::default()
    }

    pub fn with_batch_send(mut self) -> Self {
        self.batch_send = true;
        self
    }

    pub fn with_callback(mut self) -> Self {
        self.callback = true;
        self
    }

    pub fn with_status_query(mut self) -> Self {
        self.status_query = true;
        self
    }

    pub fn with_status_pull(mut self) -> Self {
        self.status_pull = true;
        self
    }
}

/// Everything a sender needs for one task.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// The task being sent.
    pub task: Task,

    /// Account credentials for the selected provider.
    pub account: ProviderAccount,

    /// Binding that selected this provider, with the provider template.
    pub binding: ChannelBinding,

    /// Provider signature, when the task names one and a mapping exists.
    pub signature: Option<ProviderSignature>,
}

impl SendRequest {
    /// Template parameters renamed to the provider's variable names.
    pub fn provider_params(&self) -> std::collections::BTreeMap<String, String> {
        self.binding.map_params(&self.task.template_params)
    }
}

/// Batch variant of [`SendRequest`]; every task shares the same account and binding.
#[derive(Debug, Clone)]
pub struct BatchSendRequest {
    pub tasks: Vec<Task>,
    pub account: ProviderAccount,
    pub binding: ChannelBinding,
    pub signature: Option<ProviderSignature>,
}

impl BatchSendRequest {
    /// Split into per-task requests.
    pub fn individual(&self) -> Vec<SendRequest> {
        self.tasks
            .iter()
            .map(|task| SendRequest {
                task: task.clone(),
                account: self.account.clone(),
                binding: self.binding.clone(),
                signature: self.signature.clone(),
            })
            .collect()
    }
}

/// Canonical result of one provider submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResponse {
    /// Whether the provider accepted the message.
    pub success: bool,

    /// Message ID assigned by the provider.
    pub provider_id: String,

    /// `Sent` when a delivery callback is expected, `Success` when the
    /// provider confirmed delivery synchronously.
    pub status: TaskStatus,

    /// Provider error code, empty on success or transport failure.
    pub error_code: String,

    pub error_message: String,

    /// Task this response belongs to (batch sends).
    pub task_id: String,

    /// Request payload, for the audit trail.
    pub request_data: String,

    /// Response payload, for the audit trail.
    pub response_data: String,
}

impl SendResponse {
    /// Provider accepted the message.
    pub fn accepted(provider_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            success: true,
            provider_id: provider_id.into(),
            status,
            error_code: String::new(),
            error_message: String::new(),
            task_id: String::new(),
            request_data: String::new(),
            response_data: String::new(),
        }
    }

    /// Provider rejected the message.
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_id: String::new(),
            status: TaskStatus::Failed,
            error_code: code.into(),
            error_message: message.into(),
            task_id: String::new(),
            request_data: String::new(),
            response_data: String::new(),
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_payloads(mut self, request: impl Into<String>, response: impl Into<String>) -> Self {
        self.request_data = request.into();
        self.response_data = response.into();
        self
    }
}

/// Raw inbound callback as received by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct CallbackRequest {
    pub provider_code: String,
    pub raw_body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

impl CallbackRequest {
    pub fn new(provider_code: impl Into<String>, raw_body: impl Into<Vec<u8>>) -> Self {
        Self {
            provider_code: provider_code.into(),
            raw_body: raw_body.into(),
            ..Default::default()
        }
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.raw_body).into_owned()
    }
}

/// HTTP response returned verbatim to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReply {
    pub status_code: u16,
    pub content_type: String,
    pub body: String,
}

impl ProviderReply {
    /// JSON reply with status 200.
    pub fn json_ok(body: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            content_type: "application/json".to_string(),
            body: body.into(),
        }
    }

    /// Plain-text reply with status 200.
    pub fn text_ok(body: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            content_type: "text/plain; charset=utf-8".to_string(),
            body: body.into(),
        }
    }
}

impl Default for ProviderReply {
    /// Generic acknowledgement used when no handler is available.
    fn default() -> Self {
        Self::json_ok(r#"{"code":0,"message":"ok"}"#)
    }
}

/// Result of parsing a callback.
///
/// `reply` is always present so the provider stops redelivering, even when
/// parsing failed and `results` is empty.
#[derive(Debug)]
pub struct CallbackOutcome {
    pub reply: ProviderReply,
    pub results: Vec<CallbackResult>,
    pub error: Option<ChannelError>,
}

impl CallbackOutcome {
    pub fn parsed(reply: ProviderReply, results: Vec<CallbackResult>) -> Self {
        Self {
            reply,
            results,
            error: None,
        }
    }

    pub fn failed(reply: ProviderReply, error: ChannelError) -> Self {
        Self {
            reply,
            results: Vec::new(),
            error: Some(error),
        }
    }
}

/// Base capability: send one task.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Provider code this sender is registered under.
    fn provider_code(&self) -> &str;

    /// Capabilities beyond plain sending.
    fn capabilities(&self) -> Capabilities {
        Capabilities::send_only()
    }

    /// Submit a task to the provider.
    ///
    /// A provider-side rejection is `Ok` with `success == false`. `Err` means
    /// no provider response exists (configuration or transport failure).
    async fn send(&self, request: &SendRequest) -> Result<SendResponse>;
}

/// Submit several tasks at once.
#[async_trait]
pub trait BatchSender: Sender {
    /// Returns exactly one response per input task, in input order.
    async fn batch_send(&self, request: &BatchSendRequest) -> Result<Vec<SendResponse>>;
}

/// Parse pushed delivery reports.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    fn provider_code(&self) -> &str;

    async fn handle_callback(&self, request: &CallbackRequest) -> CallbackOutcome;
}

/// Query delivery status by provider message ID.
#[async_trait]
pub trait StatusQuerier: Send + Sync {
    async fn query_status(
        &self,
        account: &ProviderAccount,
        provider_ids: &[String],
    ) -> Result<Vec<CallbackResult>>;
}

/// Pull pending delivery reports.
///
/// The provider purges returned reports, so callers must not pull the same
/// items twice.
#[async_trait]
pub trait StatusPuller: Send + Sync {
    async fn pull_status(&self, account: &ProviderAccount) -> Result<Vec<CallbackResult>>;
}
