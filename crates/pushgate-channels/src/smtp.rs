//! SMTP email adapter.
//!
//! Each task becomes one plain-text message submitted over SMTP. The relay
//! accepting the message is the final send status; bounces arrive later
//! through a webhook in the bounce-report JSON shape most relays emit.

use crate::error::ChannelError;
use crate::factory::ProviderRegistration;
use crate::traits::{
    BatchSendRequest, BatchSender, CallbackHandler, CallbackOutcome, CallbackRequest,
    Capabilities, ProviderReply, SendRequest, SendResponse, Sender,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use pushgate_core::types::{CallbackResult, CallbackStatus, ProviderAccount, TaskStatus};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Provider code.
pub const PROVIDER_CODE: &str = "smtp";

const DEFAULT_PORT: u16 = 587;

/// Subject used when the task carries no `title` parameter.
const DEFAULT_SUBJECT: &str = "通知";

/// Template parameter holding the subject line.
const SUBJECT_PARAM: &str = "title";

const CALLBACK_REPLY: &str = r#"{"code":0,"message":"ok"}"#;

/// Connection security towards the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsMode {
    Starttls,
    Tls,
    None,
}

struct SmtpConfig {
    host: String,
    port: u16,
    username: String,
    password: String,
    from: Mailbox,
    tls: TlsMode,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("from", &self.from)
            .field("tls", &self.tls)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct BounceReport {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    timestamp: String,
}

/// SMTP sender.
pub struct SmtpSender {
    timeout: Duration,
}

impl SmtpSender {
    pub fn new() -> Result<Self> {
        Ok(Self {
            timeout: Duration::from_secs(30),
        })
    }

    /// Set the per-connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Registration with every capability this adapter declares.
    pub fn registration(self: Arc<Self>) -> ProviderRegistration {
        ProviderRegistration::new(self.clone())
            .with_batch_sender(self.clone())
            .with_callback_handler(self)
    }

    fn smtp_config(account: &ProviderAccount) -> Result<SmtpConfig> {
        let (Some(host), Some(username), Some(password), Some(from)) = (
            account.setting("host"),
            account.setting("username"),
            account.setting("password"),
            account.setting("from"),
        ) else {
            return Err(ChannelError::config(
                "missing smtp config: host, username, password or from",
            ));
        };

        let port = match account.setting("port") {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| ChannelError::config(format!("invalid smtp port: {}", port)))?,
            None => DEFAULT_PORT,
        };
        let tls = match account.setting("tls").unwrap_or("starttls") {
            "starttls" => TlsMode::Starttls,
            "tls" => TlsMode::Tls,
            "none" => TlsMode::None,
            other => return Err(ChannelError::config(format!("invalid smtp tls mode: {}", other))),
        };
        let from = from
            .parse::<Mailbox>()
            .map_err(|e| ChannelError::config(format!("invalid smtp from address: {}", e)))?;

        Ok(SmtpConfig {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            from,
            tls,
        })
    }

    fn transport(&self, config: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let builder = match config.tls {
            TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| ChannelError::config(format!("invalid smtp relay: {}", e)))?,
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| ChannelError::config(format!("invalid smtp relay: {}", e)))?,
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };

        Ok(builder
            .port(config.port)
            .timeout(Some(self.timeout))
            .credentials(Credentials::new(config.username.clone(), config.password.clone()))
            .build())
    }

    /// Submit one task over an existing transport.
    async fn deliver(
        &self,
        transport: &AsyncSmtpTransport<Tokio1Executor>,
        config: &SmtpConfig,
        request: &SendRequest,
    ) -> SendResponse {
        let task_id = request.task.task_id.clone();
        let message = match build_message(config, request) {
            Ok(message) => message,
            Err(rejection) => return rejection.for_task(task_id),
        };
        let request_data = message.headers().to_string();

        let response = match transport.send(message).await {
            Ok(reply) => {
                debug!(task_id = %task_id, code = %reply.code(), "SMTP relay accepted message");
                SendResponse::accepted(format!("smtp_{}", task_id), TaskStatus::Success)
            }
            Err(e) => {
                let code = e
                    .status()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "smtp_error".to_string());
                SendResponse::rejected(code, e.to_string())
            }
        };
        response.for_task(task_id).with_payloads(request_data, String::new())
    }
}

fn subject(request: &SendRequest) -> String {
    request
        .task
        .template_params
        .get(SUBJECT_PARAM)
        .filter(|s| !s.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_SUBJECT.to_string())
}

/// Build the message; a bad receiver address is a rejection for that task only.
fn build_message(config: &SmtpConfig, request: &SendRequest) -> std::result::Result<Message, SendResponse> {
    let to = request
        .task
        .receiver
        .parse::<Mailbox>()
        .map_err(|e| SendResponse::rejected("invalid_receiver", format!("invalid email address: {}", e)))?;

    Message::builder()
        .from(config.from.clone())
        .to(to)
        .subject(subject(request))
        .header(ContentType::TEXT_PLAIN)
        .body(request.task.content.clone())
        .map_err(|e| SendResponse::rejected("invalid_message", e.to_string()))
}

#[async_trait]
impl Sender for SmtpSender {
    fn provider_code(&self) -> &str {
        PROVIDER_CODE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::send_only().with_batch_send().with_callback()
    }

    async fn send(&self, request: &SendRequest) -> Result<SendResponse> {
        let config = Self::smtp_config(&request.account)?;
        let transport = self.transport(&config)?;
        Ok(self.deliver(&transport, &config, request).await)
    }
}

#[async_trait]
impl BatchSender for SmtpSender {
    /// Messages go out one by one over a shared transport, since every
    /// receiver gets its own envelope.
    async fn batch_send(&self, request: &BatchSendRequest) -> Result<Vec<SendResponse>> {
        if request.tasks.is_empty() {
            return Ok(Vec::new());
        }
        let config = Self::smtp_config(&request.account)?;
        let transport = self.transport(&config)?;

        let mut responses = Vec::with_capacity(request.tasks.len());
        for single in request.individual() {
            responses.push(self.deliver(&transport, &config, &single).await);
        }
        Ok(responses)
    }
}

#[async_trait]
impl CallbackHandler for SmtpSender {
    fn provider_code(&self) -> &str {
        PROVIDER_CODE
    }

    async fn handle_callback(&self, request: &CallbackRequest) -> CallbackOutcome {
        let reply = ProviderReply::json_ok(CALLBACK_REPLY);
        let report: BounceReport = match serde_json::from_slice(&request.raw_body) {
            Ok(report) => report,
            Err(e) => {
                return CallbackOutcome::failed(reply, ChannelError::InvalidCallback(e.to_string()))
            }
        };

        if report.message_id.is_empty() {
            return CallbackOutcome::failed(
                reply,
                ChannelError::InvalidCallback("bounce report without message_id".to_string()),
            );
        }

        let status = match report.status.as_str() {
            "bounced" | "failed" => CallbackStatus::Failed,
            "complained" => CallbackStatus::Rejected,
            _ => CallbackStatus::Delivered,
        };

        let mut result = CallbackResult::new(report.message_id, status);
        if !report.error_code.is_empty() || !report.error_message.is_empty() {
            result = result.with_error(report.error_code, report.error_message);
        }
        if let Ok(time) = DateTime::parse_from_rfc3339(&report.timestamp) {
            result = result.with_report_time(time.with_timezone(&Utc));
        }

        CallbackOutcome::parsed(reply, vec![result])
    }
}
