//! WeChat Work (企业微信) application message adapter.
//!
//! Every call first obtains an access token via `gettoken`, cached per
//! corp/secret pair until shortly before it expires. Messages are posted as
//! JSON to `message/send`, which confirms delivery synchronously.

use crate::error::ChannelError;
use crate::factory::ProviderRegistration;
use crate::traits::{
    BatchSendRequest, BatchSender, CallbackHandler, CallbackOutcome, CallbackRequest,
    Capabilities, ProviderReply, SendRequest, SendResponse, Sender,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use pushgate_core::types::{CallbackResult, CallbackStatus, ProviderAccount, TaskStatus};
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Provider code.
pub const PROVIDER_CODE: &str = "wechat_work";

/// Default API base URL.
const DEFAULT_API_BASE: &str = "https://qyapi.weixin.qq.com";

/// Tokens are refreshed this long before the provider expires them.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 200;

/// Reply the platform expects for callbacks.
const CALLBACK_REPLY: &str = r#"{"errcode":0,"errmsg":"ok"}"#;

/// Binding template code that switches the message type to markdown.
const MARKDOWN_TEMPLATE: &str = "markdown";

/// WeChat Work sender.
pub struct WechatWorkSender {
    client: Client,
    api_base: String,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

struct AgentConfig {
    corp_id: String,
    agent_secret: String,
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SendReply {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    msgid: String,
    #[serde(default)]
    invaliduser: String,
}

#[derive(Debug, Deserialize)]
struct StatusReport {
    #[serde(default)]
    msgid: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    create_time: i64,
}

impl WechatWorkSender {
    /// Create a sender against the public API.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChannelError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Set the API base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Registration with every capability this adapter declares.
    pub fn registration(self: Arc<Self>) -> ProviderRegistration {
        ProviderRegistration::new(self.clone())
            .with_batch_sender(self.clone())
            .with_callback_handler(self)
    }

    fn agent_config(account: &ProviderAccount) -> Result<AgentConfig> {
        match (
            account.setting("corp_id"),
            account.setting("agent_secret"),
            account.setting("agent_id"),
        ) {
            (Some(corp_id), Some(agent_secret), Some(agent_id)) => Ok(AgentConfig {
                corp_id: corp_id.to_string(),
                agent_secret: agent_secret.to_string(),
                agent_id: agent_id.to_string(),
            }),
            _ => Err(ChannelError::config(
                "missing wechat work config: corp_id, agent_secret or agent_id",
            )),
        }
    }

    async fn access_token(&self, config: &AgentConfig) -> Result<String> {
        let key = format!("{}:{}", config.corp_id, pushgate_core::id::sha256(&config.agent_secret));

        if let Some(token) = self.tokens.lock().get(&key) {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}/cgi-bin/gettoken", self.api_base);
        let reply: TokenReply = self
            .client
            .get(&url)
            .query(&[
                ("corpid", config.corp_id.as_str()),
                ("corpsecret", config.agent_secret.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;

        if reply.errcode != 0 {
            return Err(ChannelError::provider(
                PROVIDER_CODE,
                reply.errcode.to_string(),
                reply.errmsg,
            ));
        }

        let ttl = reply.expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
        debug!(corp_id = %config.corp_id, ttl_secs = ttl, "Fetched wechat work access token");
        self.tokens.lock().insert(
            key,
            CachedToken {
                value: reply.access_token.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );

        Ok(reply.access_token)
    }

    fn payload(config: &AgentConfig, to_user: &str, markdown: bool, content: &str) -> serde_json::Value {
        let to_user = if to_user.is_empty() { "@all" } else { to_user };
        if markdown {
            serde_json::json!({
                "touser": to_user,
                "msgtype": "markdown",
                "agentid": config.agent_id,
                "markdown": { "content": content },
                "safe": 0,
            })
        } else {
            serde_json::json!({
                "touser": to_user,
                "msgtype": "text",
                "agentid": config.agent_id,
                "text": { "content": content },
                "safe": 0,
            })
        }
    }

    async fn post_message(&self, token: &str, payload: &serde_json::Value) -> Result<(SendReply, String)> {
        let url = format!("{}/cgi-bin/message/send", self.api_base);
        let body = self
            .client
            .post(&url)
            .query(&[("access_token", token)])
            .json(payload)
            .send()
            .await?
            .text()
            .await?;
        let reply = serde_json::from_str(&body)?;
        Ok((reply, body))
    }

    /// Token errors carry a provider code, so they become rejections rather
    /// than transport failures.
    async fn token_or_rejection(&self, config: &AgentConfig) -> Result<std::result::Result<String, SendResponse>> {
        match self.access_token(config).await {
            Ok(token) => Ok(Ok(token)),
            Err(ChannelError::Provider { code, message, .. }) => {
                Ok(Err(SendResponse::rejected(code, message)))
            }
            Err(e) => Err(e),
        }
    }
}

/// Task content, or the binding template with `{name}` placeholders filled in.
fn message_content(request: &SendRequest) -> String {
    if !request.task.content.is_empty() {
        return request.task.content.clone();
    }
    request
        .provider_params()
        .iter()
        .fold(request.binding.template_content.clone(), |acc, (k, v)| {
            acc.replace(&format!("{{{}}}", k), v)
        })
}

fn is_markdown(request: &SendRequest) -> bool {
    request.binding.template_code == MARKDOWN_TEMPLATE
}

#[async_trait]
impl Sender for WechatWorkSender {
    fn provider_code(&self) -> &str {
        PROVIDER_CODE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::send_only().with_batch_send().with_callback()
    }

    async fn send(&self, request: &SendRequest) -> Result<SendResponse> {
        let config = Self::agent_config(&request.account)?;
        let task_id = request.task.task_id.clone();

        let token = match self.token_or_rejection(&config).await? {
            Ok(token) => token,
            Err(rejection) => return Ok(rejection.for_task(task_id)),
        };

        let payload = Self::payload(
            &config,
            &request.task.receiver,
            is_markdown(request),
            &message_content(request),
        );
        let (reply, body) = self.post_message(&token, &payload).await?;

        let response = if reply.errcode == 0 {
            SendResponse::accepted(reply.msgid, TaskStatus::Success)
        } else {
            SendResponse::rejected(reply.errcode.to_string(), reply.errmsg)
        };

        Ok(response.for_task(task_id).with_payloads(payload.to_string(), body))
    }
}

#[async_trait]
impl BatchSender for WechatWorkSender {
    async fn batch_send(&self, request: &BatchSendRequest) -> Result<Vec<SendResponse>> {
        let individual = request.individual();
        let Some(first) = individual.first() else {
            return Ok(Vec::new());
        };

        let content = message_content(first);
        let uniform = individual.iter().all(|r| message_content(r) == content);

        if !uniform {
            // One message per receiver, since a message/send call carries one content
            info!(tasks = individual.len(), "Heterogeneous wechat work batch, sending individually");
            let mut responses = Vec::with_capacity(individual.len());
            for single in &individual {
                responses.push(self.send(single).await?);
            }
            return Ok(responses);
        }

        let config = Self::agent_config(&request.account)?;
        let token = match self.token_or_rejection(&config).await? {
            Ok(token) => token,
            Err(rejection) => {
                return Ok(request
                    .tasks
                    .iter()
                    .map(|t| rejection.clone().for_task(t.task_id.clone()))
                    .collect())
            }
        };

        let to_user = request
            .tasks
            .iter()
            .filter(|t| !t.receiver.is_empty())
            .map(|t| t.receiver.as_str())
            .collect::<Vec<_>>()
            .join("|");
        let payload = Self::payload(&config, &to_user, is_markdown(first), &content);
        let (reply, body) = self.post_message(&token, &payload).await?;

        let invalid: HashSet<&str> = reply
            .invaliduser
            .split('|')
            .filter(|u| !u.is_empty())
            .collect();
        let request_data = payload.to_string();

        Ok(request
            .tasks
            .iter()
            .map(|task| {
                let response = if reply.errcode != 0 {
                    SendResponse::rejected(reply.errcode.to_string(), reply.errmsg.clone())
                } else if invalid.contains(task.receiver.as_str()) {
                    SendResponse::rejected("invalid_user", "invalid user id")
                } else {
                    SendResponse::accepted(reply.msgid.clone(), TaskStatus::Success)
                };
                response
                    .for_task(task.task_id.clone())
                    .with_payloads(request_data.clone(), body.clone())
            })
            .collect())
    }
}

#[async_trait]
impl CallbackHandler for WechatWorkSender {
    fn provider_code(&self) -> &str {
        PROVIDER_CODE
    }

    async fn handle_callback(&self, request: &CallbackRequest) -> CallbackOutcome {
        let reply = ProviderReply::json_ok(CALLBACK_REPLY);
        let report: StatusReport = match serde_json::from_slice(&request.raw_body) {
            Ok(report) => report,
            Err(e) => {
                return CallbackOutcome::failed(reply, ChannelError::InvalidCallback(e.to_string()))
            }
        };

        if report.msgid.is_empty() {
            return CallbackOutcome::failed(
                reply,
                ChannelError::InvalidCallback("report without msgid".to_string()),
            );
        }

        let status = if report.status == "SEND_OK" {
            CallbackStatus::Delivered
        } else {
            CallbackStatus::Failed
        };

        let mut result = CallbackResult::new(report.msgid, status);
        if report.errcode != 0 {
            result = result.with_error(report.errcode.to_string(), report.errmsg);
        }
        if let Some(time) = Utc.timestamp_opt(report.create_time, 0).single().filter(|_| report.create_time > 0) {
            result = result.with_report_time(time);
        }

        CallbackOutcome::parsed(reply, vec![result])
    }
}
