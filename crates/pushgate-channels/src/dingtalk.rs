//! DingTalk (钉钉) work notification adapter.
//!
//! Messages go through `asyncsend_v2` with an app access token cached per
//! app key. The returned `task_id` identifies the send in later callbacks.

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
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Provider code.
pub const PROVIDER_CODE: &str = "dingtalk";

const DEFAULT_API_BASE: &str = "https://oapi.dingtalk.com";

const TOKEN_EXPIRY_MARGIN_SECS: u64 = 200;

const CALLBACK_REPLY: &str = "success";

const MARKDOWN_TEMPLATE: &str = "markdown";

/// DingTalk sender.
pub struct DingtalkSender {
    client: Client,
    api_base: String,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

struct AppConfig {
    app_key: String,
    app_secret: String,
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
    task_id: i64,
}

#[derive(Debug, Deserialize)]
struct StatusReport {
    #[serde(default)]
    task_id: i64,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    /// Milliseconds since the epoch.
    #[serde(default)]
    timestamp: i64,
}

impl DingtalkSender {
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

    fn app_config(account: &ProviderAccount) -> Result<AppConfig> {
        match (
            account.setting("app_key"),
            account.setting("app_secret"),
            account.setting("agent_id"),
        ) {
            (Some(app_key), Some(app_secret), Some(agent_id)) => Ok(AppConfig {
                app_key: app_key.to_string(),
                app_secret: app_secret.to_string(),
                agent_id: agent_id.to_string(),
            }),
            _ => Err(ChannelError::config(
                "missing dingtalk config: app_key, app_secret or agent_id",
            )),
        }
    }

    async fn access_token(&self, config: &AppConfig) -> Result<String> {
        if let Some(token) = self.tokens.lock().get(&config.app_key) {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}/gettoken", self.api_base);
        let reply: TokenReply = self
            .client
            .get(&url)
            .query(&[
                ("appkey", config.app_key.as_str()),
                ("appsecret", config.app_secret.as_str()),
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
        debug!(app_key = %config.app_key, ttl_secs = ttl, "Fetched dingtalk access token");
        self.tokens.lock().insert(
            config.app_key.clone(),
            CachedToken {
                value: reply.access_token.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );

        Ok(reply.access_token)
    }

    fn payload(config: &AppConfig, userid_list: &str, markdown: bool, content: &str) -> serde_json::Value {
        let msg = if markdown {
            let title = content.lines().next().unwrap_or_default();
            serde_json::json!({
                "msgtype": "markdown",
                "markdown": { "title": title, "text": content },
            })
        } else {
            serde_json::json!({
                "msgtype": "text",
                "text": { "content": content },
            })
        };
        serde_json::json!({
            "agent_id": config.agent_id,
            "userid_list": userid_list,
            "msg": msg,
        })
    }

    async fn post_message(&self, token: &str, payload: &serde_json::Value) -> Result<(SendReply, String)> {
        let url = format!("{}/topapi/message/corpconversation/asyncsend_v2", self.api_base);
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

    async fn token_or_rejection(&self, config: &AppConfig) -> Result<std::result::Result<String, SendResponse>> {
        match self.access_token(config).await {
            Ok(token) => Ok(Ok(token)),
            Err(ChannelError::Provider { code, message, .. }) => {
                Ok(Err(SendResponse::rejected(code, message)))
            }
            Err(e) => Err(e),
        }
    }
}

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

fn reply_response(reply: &SendReply) -> SendResponse {
    if reply.errcode == 0 {
        SendResponse::accepted(reply.task_id.to_string(), TaskStatus::Success)
    } else {
        SendResponse::rejected(reply.errcode.to_string(), reply.errmsg.clone())
    }
}

#[async_trait]
impl Sender for DingtalkSender {
    fn provider_code(&self) -> &str {
        PROVIDER_CODE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::send_only().with_batch_send().with_callback()
    }

    async fn send(&self, request: &SendRequest) -> Result<SendResponse> {
        let config = Self::app_config(&request.account)?;
        let task_id = request.task.task_id.clone();

        let token = match self.token_or_rejection(&config).await? {
            Ok(token) => token,
            Err(rejection) => return Ok(rejection.for_task(task_id)),
        };

        let payload = Self::payload(
            &config,
            &request.task.receiver,
            request.binding.template_code == MARKDOWN_TEMPLATE,
            &message_content(request),
        );
        let (reply, body) = self.post_message(&token, &payload).await?;

        Ok(reply_response(&reply)
            .for_task(task_id)
            .with_payloads(payload.to_string(), body))
    }
}

#[async_trait]
impl BatchSender for DingtalkSender {
    async fn batch_send(&self, request: &BatchSendRequest) -> Result<Vec<SendResponse>> {
        let individual = request.individual();
        let Some(first) = individual.first() else {
            return Ok(Vec::new());
        };

        let content = message_content(first);
        if individual.iter().any(|r| message_content(r) != content) {
            info!(tasks = individual.len(), "Heterogeneous dingtalk batch, sending individually");
            let mut responses = Vec::with_capacity(individual.len());
            for single in &individual {
                responses.push(self.send(single).await?);
            }
            return Ok(responses);
        }

        let config = Self::app_config(&request.account)?;
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

        let userid_list = request
            .tasks
            .iter()
            .filter(|t| !t.receiver.is_empty())
            .map(|t| t.receiver.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let payload = Self::payload(
            &config,
            &userid_list,
            first.binding.template_code == MARKDOWN_TEMPLATE,
            &content,
        );
        let (reply, body) = self.post_message(&token, &payload).await?;
        let request_data = payload.to_string();

        Ok(request
            .tasks
            .iter()
            .map(|task| {
                reply_response(&reply)
                    .for_task(task.task_id.clone())
                    .with_payloads(request_data.clone(), body.clone())
            })
            .collect())
    }
}

#[async_trait]
impl CallbackHandler for DingtalkSender {
    fn provider_code(&self) -> &str {
        PROVIDER_CODE
    }

    async fn handle_callback(&self, request: &CallbackRequest) -> CallbackOutcome {
        let reply = ProviderReply::text_ok(CALLBACK_REPLY);
        let report: StatusReport = match serde_json::from_slice(&request.raw_body) {
            Ok(report) => report,
            Err(e) => {
                return CallbackOutcome::failed(reply, ChannelError::InvalidCallback(e.to_string()))
            }
        };

        if report.task_id == 0 {
            return CallbackOutcome::failed(
                reply,
                ChannelError::InvalidCallback("report without task_id".to_string()),
            );
        }

        let mut result = if report.errcode == 0 {
            CallbackResult::new(report.task_id.to_string(), CallbackStatus::Delivered)
        } else {
            CallbackResult::new(report.task_id.to_string(), CallbackStatus::Failed)
                .with_error(report.errcode.to_string(), report.errmsg)
        };
        if let Some(time) = Utc.timestamp_millis_opt(report.timestamp).single().filter(|_| report.timestamp > 0) {
            result = result.with_report_time(time);
        }

        CallbackOutcome::parsed(reply, vec![result])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushgate_core::types::{ChannelBinding, MessageType, SubmitRequest, Task};
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn account() -> ProviderAccount {
        ProviderAccount::new(4, PROVIDER_CODE)
            .with_setting("app_key", "dingkey")
            .with_setting("app_secret", "s3cret")
            .with_setting("agent_id", "123456789")
    }

    fn task(id: &str, receiver: &str, content: &str) -> Task {
        let request = SubmitRequest {
            app_id: "app1".to_string(),
            channel_id: 4,
            message_type: MessageType::Dingtalk,
            receiver: receiver.to_string(),
            content: content.to_string(),
            template_code: String::new(),
            template_params: BTreeMap::new(),
            signature: String::new(),
            scheduled_at: None,
            max_retry: None,
        };
        Task::new(id, &request)
    }

    fn binding() -> ChannelBinding {
        ChannelBinding::new(1, 4, MessageType::Dingtalk, 4)
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/gettoken"))
            .and(query_param("appkey", "dingkey"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"errcode":0,"errmsg":"ok","access_token":"DTOKEN","expires_in":7200}"#,
            ))
            .expect(1)
            .mount(server)
            .await;
    }

    fn sender(server: &MockServer) -> DingtalkSender {
        DingtalkSender::new().unwrap().with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_send_uses_task_id_as_provider_id() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/topapi/message/corpconversation/asyncsend_v2"))
            .and(query_param("access_token", "DTOKEN"))
            .and(body_partial_json(serde_json::json!({
                "agent_id": "123456789",
                "userid_list": "u1",
                "msg": { "msgtype": "text", "text": { "content": "hello" } },
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"errcode":0,"errmsg":"ok","task_id":25652,"request_id":"r1"}"#,
            ))
            .mount(&server)
            .await;

        let sender = sender(&server);
        let request = SendRequest {
            task: task("t1", "u1", "hello"),
            account: account(),
            binding: binding(),
            signature: None,
        };

        let first = sender.send(&request).await.unwrap();
        let second = sender.send(&request).await.unwrap();

        assert!(first.success);
        assert_eq!(first.status, TaskStatus::Success);
        assert_eq!(first.provider_id, "25652");
        assert!(second.success);
    }

    #[tokio::test]
    async fn test_token_error_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gettoken"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"errcode":40089,"errmsg":"invalid appkey"}"#),
            )
            .mount(&server)
            .await;

        let request = SendRequest {
            task: task("t1", "u1", "hello"),
            account: account(),
            binding: binding(),
            signature: None,
        };
        let response = sender(&server).send(&request).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error_code, "40089");
        assert_eq!(response.task_id, "t1");
    }

    #[tokio::test]
    async fn test_uniform_batch_is_one_call() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path("/topapi/message/corpconversation/asyncsend_v2"))
            .and(body_partial_json(serde_json::json!({ "userid_list": "u1,u2" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"errcode":0,"errmsg":"ok","task_id":77}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let request = BatchSendRequest {
            tasks: vec![task("t1", "u1", "hi"), task("t2", "u2", "hi")],
            account: account(),
            binding: binding(),
            signature: None,
        };
        let responses = sender(&server).batch_send(&request).await.unwrap();

        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| r.success && r.provider_id == "77"));
        assert_eq!(responses[1].task_id, "t2");
    }

    #[tokio::test]
    async fn test_missing_config() {
        let server = MockServer::start().await;
        let request = SendRequest {
            task: task("t1", "u1", "hi"),
            account: ProviderAccount::new(4, PROVIDER_CODE).with_setting("app_key", "k"),
            binding: binding(),
            signature: None,
        };
        let err = sender(&server).send(&request).await.unwrap_err();
        assert!(err.is_pre_send());
    }

    #[tokio::test]
    async fn test_callback_mapping() {
        let sender = DingtalkSender::new().unwrap();
        let outcome = sender
            .handle_callback(&CallbackRequest::new(
                PROVIDER_CODE,
                r#"{"EventType":"message_status","task_id":25652,"errcode":33012,"errmsg":"user not found","timestamp":1700000000000}"#,
            ))
            .await;

        assert_eq!(outcome.reply.body, "success");
        assert!(outcome.reply.content_type.starts_with("text/plain"));
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].provider_id, "25652");
        assert_eq!(outcome.results[0].status, CallbackStatus::Failed);
        assert_eq!(outcome.results[0].error_code, "33012");
        assert!(outcome.results[0].report_time.is_some());

        let delivered = sender
            .handle_callback(&CallbackRequest::new(PROVIDER_CODE, r#"{"task_id":1,"errcode":0}"#))
            .await;
        assert_eq!(delivered.results[0].status, CallbackStatus::Delivered);
        assert!(delivered.results[0].error_code.is_empty());

        let garbage = sender.handle_callback(&CallbackRequest::new(PROVIDER_CODE, "not json")).await;
        assert!(garbage.error.is_some());
        assert_eq!(garbage.reply.status_code, 200);
    }
}
