//! Outward task status notifications.

use crate::error::DispatchError;
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use pushgate_core::config::NotifyConfig;
use pushgate_core::types::{Application, CallbackResult, Task};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};

const USER_AGENT: &str = "MessagePush-Webhook/1.0";

/// Payload delivered to an application's notify URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotification {
    /// Callback status that triggered the notification.
    pub event: String,
    pub task_id: String,
    pub app_id: String,
    pub status: String,
    pub receiver: String,
    pub error_code: String,
    pub error_msg: String,
    pub timestamp: i64,
    pub extra: NotificationExtra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationExtra {
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_time: Option<String>,
}

impl StatusNotification {
    pub fn new(task: &Task, result: &CallbackResult) -> Self {
        Self {
            event: result.status.as_str().to_string(),
            task_id: task.task_id.clone(),
            app_id: task.app_id.clone(),
            status: task.status.as_str().to_string(),
            receiver: task.receiver.clone(),
            error_code: result.error_code.clone(),
            error_msg: result.error_message.clone(),
            timestamp: Utc::now().timestamp(),
            extra: NotificationExtra {
                provider_id: result.provider_id.clone(),
                report_time: result.report_time.map(|t| t.to_rfc3339()),
            },
        }
    }
}

/// Delivers status changes to client applications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, app: &Application, notification: &StatusNotification) -> Result<()>;
}

/// Signs `"{timestamp}.{body}"` with HMAC-SHA256, hex encoded.
pub fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Signed JSON webhook with linear retries.
pub struct WebhookNotifier {
    client: Client,
    config: NotifyConfig,
}

impl WebhookNotifier {
    pub fn new(config: NotifyConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, app: &Application, notification: &StatusNotification) -> Result<()> {
        let Some(url) = app.notify_url.as_deref().filter(|u| !u.is_empty()) else {
            debug!(app_id = %app.app_id, "No notify url, skipping notification");
            return Ok(());
        };

        let body = serde_json::to_string(notification)?;
        let secret = app.app_secret.expose_secret();
        let signature = (!secret.is_empty()).then(|| sign(secret, notification.timestamp, &body));

        let mut last_error = String::new();
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay() * attempt).await;
                info!(task_id = %notification.task_id, attempt, "Retrying status notification");
            }

            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header("X-Webhook-Event", &notification.event)
                .header("X-Webhook-Timestamp", notification.timestamp.to_string())
                .body(body.clone());
            if let Some(signature) = &signature {
                request = request.header("X-Webhook-Signature", signature);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!(task_id = %notification.task_id, url, "Status notification delivered");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    last_error = format!("webhook returned status {}: {}", status.as_u16(), text);
                }
                Err(e) => last_error = e.to_string(),
            }
            warn!(task_id = %notification.task_id, error = %last_error, "Status notification failed");
        }

        Err(DispatchError::Notify(format!(
            "webhook failed after {} retries: {}",
            self.config.max_retries, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushgate_core::types::{CallbackStatus, MessageType, SubmitRequest, TaskStatus};
    use pushgate_core::SecretString;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app(url: Option<String>) -> Application {
        Application {
            app_id: "app1".into(),
            name: "demo".into(),
            app_secret: SecretString::new("s3cret"),
            notify_url: url,
            active: true,
        }
    }

    fn notification() -> StatusNotification {
        let request = SubmitRequest {
            app_id: "app1".into(),
            channel_id: 1,
            message_type: MessageType::Sms,
            receiver: "13800000000".into(),
            content: String::new(),
            template_code: String::new(),
            template_params: BTreeMap::new(),
            signature: String::new(),
            scheduled_at: None,
            max_retry: None,
        };
        let mut task = Task::new("t1", &request);
        task.status = TaskStatus::Success;
        StatusNotification::new(&task, &CallbackResult::new("p1", CallbackStatus::Delivered))
    }

    fn notifier() -> WebhookNotifier {
        WebhookNotifier::new(NotifyConfig {
            max_retries: 2,
            retry_delay_ms: 10,
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_sign_is_stable() {
        let a = sign("key", 1700000000, "{}");
        assert_eq!(a.len(), 64);
        assert_eq!(a, sign("key", 1700000000, "{}"));
        assert_ne!(a, sign("other", 1700000000, "{}"));
        assert_ne!(a, sign("key", 1700000001, "{}"));
    }

    #[tokio::test]
    async fn test_signed_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Webhook-Event", "delivered"))
            .and(header_exists("X-Webhook-Signature"))
            .and(header_exists("X-Webhook-Timestamp"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let n = notification();
        notifier()
            .notify(&app(Some(format!("{}/hook", server.uri()))), &n)
            .await
            .unwrap();

        let received = server.received_requests().await.unwrap();
        let body = String::from_utf8(received[0].body.clone()).unwrap();
        let signature = received[0]
            .headers
            .get("X-Webhook-Signature")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(signature, sign("s3cret", n.timestamp, &body));

        let payload: StatusNotification = serde_json::from_str(&body).unwrap();
        assert_eq!(payload.status, "success");
        assert_eq!(payload.extra.provider_id, "p1");
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        notifier()
            .notify(&app(Some(server.uri())), &notification())
            .await
            .unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = notifier()
            .notify(&app(Some(server.uri())), &notification())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Notify(_)));
    }

    #[tokio::test]
    async fn test_skipped_without_url() {
        notifier().notify(&app(None), &notification()).await.unwrap();
    }
}
