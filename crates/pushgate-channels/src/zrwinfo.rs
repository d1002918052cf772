//! Zrwinfo (1cloudsp) SMS gateway adapter.
//!
//! Submissions are form-encoded POSTs. Template variables are sent as a
//! `##`-joined value list in the order their `{name}` placeholders appear
//! in the template content. Delivery reports arrive as JSON callbacks.

use crate::error::ChannelError;
use crate::factory::ProviderRegistration;
use crate::traits::{
    BatchSendRequest, BatchSender, CallbackHandler, CallbackOutcome, CallbackRequest,
    Capabilities, ProviderReply, SendRequest, SendResponse, Sender,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use pushgate_core::id::batch_item_id;
use pushgate_core::types::{CallbackResult, CallbackStatus, ProviderAccount, TaskStatus};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Provider code.
pub const PROVIDER_CODE: &str = "zrwinfo";

/// Default API base URL.
const DEFAULT_API_BASE: &str = "http://api.1cloudsp.com";

/// Delivery result meaning the handset received the message.
const DELIVERED: &str = "DELIVRD";

/// Success code in submission responses.
const OK_CODE: &str = "0";

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("invalid regex"));

/// Zrwinfo SMS sender.
pub struct ZrwinfoSender {
    /// HTTP client.
    client: Client,

    /// API base URL.
    api_base: String,
}

impl ZrwinfoSender {
    /// Create a sender against the public API.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChannelError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
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

    fn credentials(account: &ProviderAccount) -> Result<Credentials> {
        let access_key = account
            .setting("access_key")
            .ok_or_else(|| ChannelError::config("zrwinfo account is missing access_key"))?;
        let secret = account
            .setting("secret")
            .ok_or_else(|| ChannelError::config("zrwinfo account is missing secret"))?;
        Ok(Credentials {
            access_key: access_key.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Base form fields shared by every submission.
    fn base_form(
        credentials: &Credentials,
        sign: Option<String>,
        template_id: &str,
    ) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("accesskey", credentials.access_key.clone()),
            ("secret", credentials.secret.clone()),
            ("templateId", template_id.to_string()),
        ];
        if let Some(sign) = sign {
            form.push(("sign", sign));
        }
        form
    }

    async fn post_form(&self, path: &str, form: &[(&'static str, String)]) -> Result<String> {
        let url = format!("{}{}", self.api_base, path);
        debug!(url = %url, "Submitting zrwinfo request");
        let response = self
            .client
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded;charset=utf-8",
            )
            .form(form)
            .send()
            .await?;
        Ok(response.text().await?)
    }
}

struct Credentials {
    access_key: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct SubmitReply {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default, rename = "smUuid")]
    sm_uuid: String,
    #[serde(default, rename = "batchId")]
    batch_id: String,
}

#[derive(Debug, Deserialize)]
struct DeliveryReport {
    #[serde(default, rename = "smUuid")]
    sm_uuid: String,
    #[serde(default, rename = "deliverResult")]
    deliver_result: String,
    #[serde(default, rename = "deliverTime")]
    deliver_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeliveryPayload {
    One(DeliveryReport),
    Many(Vec<DeliveryReport>),
}

/// Wrap a signature code in the 【】 brackets the gateway expects.
fn format_sign(code: &str) -> String {
    if code.starts_with('【') {
        code.to_string()
    } else {
        format!("【{}】", code)
    }
}

/// Build the `##`-joined variable list for a template.
///
/// Values follow placeholder order in `template_content`. Missing values
/// become empty strings. Without template content the values are joined in
/// key order.
pub fn template_values(template_content: &str, params: &BTreeMap<String, String>) -> String {
    if params.is_empty() {
        return String::new();
    }

    if template_content.is_empty() {
        return params.values().cloned().collect::<Vec<_>>().join("##");
    }

    PLACEHOLDER
        .captures_iter(template_content)
        .map(|caps| params.get(&caps[1]).cloned().unwrap_or_default())
        .collect::<Vec<_>>()
        .join("##")
}

fn parse_report_time(raw: &str) -> Option<chrono::DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

fn to_result(report: DeliveryReport) -> CallbackResult {
    let status = if report.deliver_result == DELIVERED {
        CallbackStatus::Delivered
    } else {
        CallbackStatus::Failed
    };
    let mut result = CallbackResult::new(report.sm_uuid, status).with_error(report.deliver_result, "");
    if let Some(time) = parse_report_time(&report.deliver_time) {
        result = result.with_report_time(time);
    }
    result
}

fn interpret(reply_text: &str) -> std::result::Result<SubmitReply, String> {
    serde_json::from_str::<SubmitReply>(reply_text)
        .map_err(|e| format!("failed to parse response: {}, body: {}", e, reply_text))
}

#[async_trait]
impl Sender for ZrwinfoSender {
    fn provider_code(&self) -> &str {
        PROVIDER_CODE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::send_only().with_batch_send().with_callback()
    }

    async fn send(&self, request: &SendRequest) -> Result<SendResponse> {
        let credentials = Self::credentials(&request.account)?;
        let sign = request.signature.as_ref().map(|s| format_sign(&s.signature_code));
        let content = template_values(&request.binding.template_content, &request.provider_params());

        let mut form = Self::base_form(&credentials, sign, &request.binding.template_code);
        form.push(("mobile", request.task.receiver.clone()));
        form.push(("content", content.clone()));

        let request_data = serde_json::json!({
            "mobile": request.task.receiver,
            "templateId": request.binding.template_code,
            "content": content,
        })
        .to_string();

        let body = self.post_form("/api/v2/single_send", &form).await?;
        let task_id = request.task.task_id.clone();

        let response = match interpret(&body) {
            Ok(reply) if reply.code == OK_CODE => SendResponse::accepted(reply.sm_uuid, TaskStatus::Sent),
            Ok(reply) => SendResponse::rejected(reply.code, reply.msg),
            Err(message) => SendResponse::rejected("", message),
        };

        Ok(response.for_task(task_id).with_payloads(request_data, body))
    }
}

#[async_trait]
impl BatchSender for ZrwinfoSender {
    async fn batch_send(&self, request: &BatchSendRequest) -> Result<Vec<SendResponse>> {
        if request.tasks.is_empty() {
            return Ok(Vec::new());
        }

        let credentials = Self::credentials(&request.account)?;
        let sign = request.signature.as_ref().map(|s| format_sign(&s.signature_code));
        let mut form = Self::base_form(&credentials, sign, &request.binding.template_code);

        let contents: Vec<String> = request
            .tasks
            .iter()
            .map(|task| {
                let params = request.binding.map_params(&task.template_params);
                template_values(&request.binding.template_content, &params)
            })
            .collect();

        let uniform = contents.windows(2).all(|pair| pair[0] == pair[1]);
        let request_data = if uniform {
            let mobiles = request
                .tasks
                .iter()
                .map(|t| t.receiver.as_str())
                .collect::<Vec<_>>()
                .join(",");
            form.push(("mobile", mobiles.clone()));
            form.push(("content", contents[0].clone()));
            serde_json::json!({ "mobile": mobiles, "content": contents[0] }).to_string()
        } else {
            // Individualized mode: one content per receiver
            let data: HashMap<&str, &str> = request
                .tasks
                .iter()
                .zip(contents.iter())
                .map(|(task, content)| (task.receiver.as_str(), content.as_str()))
                .collect();
            let data = serde_json::to_string(&data)?;
            form.push(("data", data.clone()));
            data
        };

        debug!(
            tasks = request.tasks.len(),
            uniform, "Submitting zrwinfo batch"
        );
        let body = self.post_form("/api/v2/send", &form).await?;

        let responses = match interpret(&body) {
            Ok(reply) if reply.code == OK_CODE => request
                .tasks
                .iter()
                .enumerate()
                .map(|(i, task)| {
                    SendResponse::accepted(batch_item_id(&reply.batch_id, i), TaskStatus::Sent)
                        .for_task(task.task_id.clone())
                        .with_payloads(request_data.clone(), body.clone())
                })
                .collect(),
            Ok(reply) => request
                .tasks
                .iter()
                .map(|task| {
                    SendResponse::rejected(reply.code.clone(), reply.msg.clone())
                        .for_task(task.task_id.clone())
                        .with_payloads(request_data.clone(), body.clone())
                })
                .collect(),
            Err(message) => {
                warn!(error = %message, "Unreadable zrwinfo batch response");
                request
                    .tasks
                    .iter()
                    .map(|task| {
                        SendResponse::rejected("", message.clone())
                            .for_task(task.task_id.clone())
                            .with_payloads(request_data.clone(), body.clone())
                    })
                    .collect()
            }
        };

        Ok(responses)
    }
}

#[async_trait]
impl CallbackHandler for ZrwinfoSender {
    fn provider_code(&self) -> &str {
        PROVIDER_CODE
    }

    async fn handle_callback(&self, request: &CallbackRequest) -> CallbackOutcome {
        let reply = ProviderReply::default();
        match serde_json::from_slice::<DeliveryPayload>(&request.raw_body) {
            Ok(DeliveryPayload::One(report)) if !report.sm_uuid.is_empty() => {
                CallbackOutcome::parsed(reply, vec![to_result(report)])
            }
            Ok(DeliveryPayload::Many(reports)) => {
                let results = reports
                    .into_iter()
                    .filter(|r| !r.sm_uuid.is_empty())
                    .map(to_result)
                    .collect();
                CallbackOutcome::parsed(reply, results)
            }
            Ok(DeliveryPayload::One(_)) => CallbackOutcome::failed(
                reply,
                ChannelError::InvalidCallback("report without smUuid".to_string()),
            ),
            Err(e) => CallbackOutcome::failed(reply, ChannelError::InvalidCallback(e.to_string())),
        }
    }
}
