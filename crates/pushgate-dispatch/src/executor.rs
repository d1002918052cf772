//! Executes the recovery action chosen by the rule engine.

use crate::error::DispatchError;
use crate::queue::SharedQueue;
use crate::rules::EvaluateResult;
use crate::store::{LogStore, TaskStore};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use pushgate_core::types::{PushLog, PushLogStatus, RuleAction, Task, TaskStatus};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const ALERT_USER_AGENT: &str = "MessagePush-Alert/1.0";
const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for any rule-configured delay, in seconds (7 days).
pub const MAX_DELAY_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// What went wrong, as seen by the caller that hit the failure.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    pub provider_account_id: Option<u64>,
    pub provider_code: String,
    pub error_code: String,
    pub error_message: String,
    pub request_data: String,
    pub response_data: String,
}

/// Outcome of [`ActionExecutor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteResult {
    /// Action actually carried out, after any degradation to fail.
    pub action: RuleAction,
    pub should_retry: bool,
    pub retry_delay: Duration,
    pub task_updated: bool,
    pub alert_sent: bool,
    pub error_message: String,
}

impl ExecuteResult {
    fn new(action: RuleAction) -> Self {
        Self {
            action,
            should_retry: false,
            retry_delay: Duration::ZERO,
            task_updated: false,
            alert_sent: false,
            error_message: String::new(),
        }
    }
}

/// Settings of a `retry` rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_retry: u32,
    pub delay_seconds: f64,
    pub backoff_rate: f64,
    pub max_delay: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            delay_seconds: 2.0,
            backoff_rate: 2.0,
            max_delay: 60.0,
        }
    }
}

impl RetryConfig {
    /// Read a rule's action config. Zero, missing or malformed values fall
    /// back to the defaults.
    pub fn from_value(value: &Value) -> Self {
        let defaults = Self::default();
        Self {
            max_retry: positive_u64(value, "max_retry")
                .map(|v| v.min(u32::MAX as u64) as u32)
                .unwrap_or(defaults.max_retry),
            delay_seconds: delay_secs(value, "delay_seconds").unwrap_or(defaults.delay_seconds),
            backoff_rate: positive_f64(value, "backoff_rate").unwrap_or(defaults.backoff_rate),
            max_delay: delay_secs(value, "max_delay").unwrap_or(defaults.max_delay),
        }
    }

    /// Delay before attempt `retry_count + 1`, never above [`MAX_DELAY_SECS`].
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let secs = (self.delay_seconds * self.backoff_rate.powi(exponent)).min(self.max_delay);
        bounded_delay(secs)
    }
}

/// Settings of a `switch_provider` rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwitchConfig {
    pub max_retry: u32,
    pub exclude_current: bool,
    pub delay_seconds: f64,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            max_retry: 1,
            exclude_current: true,
            delay_seconds: 1.0,
        }
    }
}

impl SwitchConfig {
    pub fn from_value(value: &Value) -> Self {
        let defaults = Self::default();
        Self {
            max_retry: positive_u64(value, "max_retry")
                .map(|v| v.min(u32::MAX as u64) as u32)
                .unwrap_or(defaults.max_retry),
            exclude_current: value
                .get("exclude_current")
                .and_then(lenient_bool)
                .unwrap_or(defaults.exclude_current),
            delay_seconds: delay_secs(value, "delay_seconds").unwrap_or(defaults.delay_seconds),
        }
    }

    pub fn delay(&self) -> Duration {
        bounded_delay(self.delay_seconds)
    }
}

/// Settings of an `alert` rule.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertConfig {
    pub webhook_url: String,
    pub alert_level: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            alert_level: "warning".to_string(),
        }
    }
}

impl AlertConfig {
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let defaults = Self::default();
        Self {
            webhook_url: text("webhook_url").unwrap_or(defaults.webhook_url),
            alert_level: text("alert_level").unwrap_or(defaults.alert_level),
        }
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn positive_f64(config: &Value, key: &str) -> Option<f64> {
    config
        .get(key)
        .and_then(lenient_f64)
        .filter(|v| v.is_finite() && *v > 0.0)
}

fn delay_secs(config: &Value, key: &str) -> Option<f64> {
    positive_f64(config, key).map(|v| v.min(MAX_DELAY_SECS))
}

/// NaN, negative and overflowing inputs map into `[0, MAX_DELAY_SECS]`.
fn bounded_delay(secs: f64) -> Duration {
    let cap = Duration::from_secs_f64(MAX_DELAY_SECS);
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs.min(MAX_DELAY_SECS)).unwrap_or(cap)
}

fn positive_u64(config: &Value, key: &str) -> Option<u64> {
    positive_f64(config, key).map(|v| v as u64).filter(|v| *v > 0)
}

/// Alert payload posted to an operator webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub alert_type: &'static str,
    pub alert_level: String,
    pub task_id: String,
    pub app_id: String,
    pub receiver: String,
    pub message_type: String,
    pub provider: String,
    pub error_code: String,
    pub error_msg: String,
    pub timestamp: i64,
}

impl Alert {
    pub fn new(level: &str, task: &Task, ctx: &FailureContext) -> Self {
        Self {
            alert_type: "message_push_failure",
            alert_level: level.to_string(),
            task_id: task.task_id.clone(),
            app_id: task.app_id.clone(),
            receiver: task.receiver.clone(),
            message_type: task.message_type.as_str().to_string(),
            provider: ctx.provider_code.clone(),
            error_code: ctx.error_code.clone(),
            error_msg: ctx.error_message.clone(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Delivers operator alerts.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send_alert(&self, webhook_url: &str, alert: &Alert) -> Result<()>;
}

/// Posts alerts as JSON over HTTP.
pub struct WebhookAlertSender {
    client: Client,
}

impl WebhookAlertSender {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(ALERT_TIMEOUT)
            .user_agent(ALERT_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AlertSender for WebhookAlertSender {
    async fn send_alert(&self, webhook_url: &str, alert: &Alert) -> Result<()> {
        let response = self.client.post(webhook_url).json(alert).send().await?;
        let status = response.status();
        if status.as_u16() >= 300 {
            return Err(DispatchError::Notify(format!(
                "alert webhook returned status {}",
                status.as_u16()
            )));
        }
        Ok(())
    }
}

/// Applies retry, switch_provider, fail and alert to a task.
///
/// Every path persists the task and appends exactly one push log row.
pub struct ActionExecutor {
    tasks: Arc<dyn TaskStore>,
    logs: Arc<dyn LogStore>,
    queue: SharedQueue,
    alerts: Arc<dyn AlertSender>,
}

impl ActionExecutor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        logs: Arc<dyn LogStore>,
        queue: SharedQueue,
        alerts: Arc<dyn AlertSender>,
    ) -> Self {
        Self {
            tasks,
            logs,
            queue,
            alerts,
        }
    }

    pub async fn execute(
        &self,
        result: &EvaluateResult,
        task: &mut Task,
        ctx: &FailureContext,
    ) -> ExecuteResult {
        match result.action {
            RuleAction::Retry => self.retry(result, task, ctx).await,
            RuleAction::SwitchProvider => self.switch_provider(result, task, ctx).await,
            RuleAction::Fail => self.fail(result, task, ctx).await,
            RuleAction::Alert => self.alert(result, task, ctx).await,
        }
    }

    async fn retry(&self, result: &EvaluateResult, task: &mut Task, ctx: &FailureContext) -> ExecuteResult {
        let config = match &result.matched_rule {
            Some(rule) => RetryConfig::from_value(&rule.action_config),
            None => RetryConfig {
                max_retry: task.max_retry,
                ..RetryConfig::default()
            },
        };

        if task.status.is_terminal() || task.retry_count >= config.max_retry {
            info!(
                task_id = %task.task_id,
                retry_count = task.retry_count,
                max_retry = config.max_retry,
                "Max retry exceeded, marking as failed"
            );
            return self.fail(result, task, ctx).await;
        }

        let delay = config.backoff(task.retry_count);
        task.retry_count += 1;
        let task_updated = self.persist(task).await;

        self.log(
            PushLog::new(&task.task_id, &task.app_id, PushLogStatus::Retry)
                .with_account(ctx.provider_account_id)
                .with_payloads(&ctx.request_data, &ctx.response_data)
                .with_error(&ctx.error_message),
        )
        .await;

        self.schedule(task, delay).await;
        info!(
            task_id = %task.task_id,
            retry_count = task.retry_count,
            delay = ?delay,
            "Task scheduled for retry"
        );

        ExecuteResult {
            should_retry: true,
            retry_delay: delay,
            task_updated,
            error_message: ctx.error_message.clone(),
            ..ExecuteResult::new(RuleAction::Retry)
        }
    }

    async fn switch_provider(
        &self,
        result: &EvaluateResult,
        task: &mut Task,
        ctx: &FailureContext,
    ) -> ExecuteResult {
        let config = result
            .matched_rule
            .as_ref()
            .map(|rule| SwitchConfig::from_value(&rule.action_config))
            .unwrap_or_default();

        if task.status.is_terminal() || task.retry_count >= config.max_retry {
            info!(
                task_id = %task.task_id,
                retry_count = task.retry_count,
                "Switch provider max retry exceeded, marking as failed"
            );
            return self.fail(result, task, ctx).await;
        }

        let delay = config.delay();
        task.retry_count += 1;
        if config.exclude_current {
            if let Some(account) = ctx.provider_account_id.or(task.provider_account_id) {
                task.excluded_accounts.insert(account);
            }
        }
        let task_updated = self.persist(task).await;

        self.log(
            PushLog::new(&task.task_id, &task.app_id, PushLogStatus::SwitchProvider)
                .with_account(ctx.provider_account_id)
                .with_payloads(&ctx.request_data, &ctx.response_data)
                .with_error(format!(
                    "switching provider, exclude current: {}",
                    config.exclude_current
                )),
        )
        .await;

        self.schedule(task, delay).await;
        info!(
            task_id = %task.task_id,
            exclude_current = config.exclude_current,
            "Task scheduled for switch provider retry"
        );

        ExecuteResult {
            should_retry: true,
            retry_delay: delay,
            task_updated,
            error_message: ctx.error_message.clone(),
            ..ExecuteResult::new(RuleAction::SwitchProvider)
        }
    }

    async fn fail(&self, result: &EvaluateResult, task: &mut Task, ctx: &FailureContext) -> ExecuteResult {
        task.status = TaskStatus::Failed;
        let task_updated = self.persist(task).await;

        self.log(
            PushLog::new(&task.task_id, &task.app_id, PushLogStatus::Failed)
                .with_account(ctx.provider_account_id)
                .with_payloads(&ctx.request_data, &ctx.response_data)
                .with_error(&ctx.error_message),
        )
        .await;

        info!(
            task_id = %task.task_id,
            rule = result.rule_name(),
            error = %ctx.error_message,
            "Task marked as failed"
        );

        ExecuteResult {
            task_updated,
            error_message: ctx.error_message.clone(),
            ..ExecuteResult::new(RuleAction::Fail)
        }
    }

    async fn alert(&self, result: &EvaluateResult, task: &mut Task, ctx: &FailureContext) -> ExecuteResult {
        let config = result
            .matched_rule
            .as_ref()
            .map(|rule| AlertConfig::from_value(&rule.action_config))
            .unwrap_or_default();

        let mut alert_sent = false;
        if !config.webhook_url.is_empty() {
            let alert = Alert::new(&config.alert_level, task, ctx);
            match self.alerts.send_alert(&config.webhook_url, &alert).await {
                Ok(()) => alert_sent = true,
                Err(e) => error!(task_id = %task.task_id, error = %e, "Failed to send alert webhook"),
            }
        }

        self.log(
            PushLog::new(&task.task_id, &task.app_id, PushLogStatus::Alert)
                .with_account(ctx.provider_account_id)
                .with_payloads(&ctx.request_data, &ctx.response_data)
                .with_error(format!(
                    "alert sent: {}, level: {}, error: {}",
                    alert_sent, config.alert_level, ctx.error_message
                )),
        )
        .await;

        task.status = TaskStatus::Failed;
        let task_updated = self.persist(task).await;

        info!(
            task_id = %task.task_id,
            alert_level = %config.alert_level,
            alert_sent,
            "Alert processed and task marked as failed"
        );

        ExecuteResult {
            task_updated,
            alert_sent,
            error_message: ctx.error_message.clone(),
            ..ExecuteResult::new(RuleAction::Alert)
        }
    }

    async fn persist(&self, task: &Task) -> bool {
        match self.tasks.update(task).await {
            Ok(()) => true,
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "Failed to update task");
                false
            }
        }
    }

    async fn log(&self, row: PushLog) {
        if let Err(e) = self.logs.append_push_log(row).await {
            warn!(error = %e, "Failed to append push log");
        }
    }

    async fn schedule(&self, task: &Task, delay: Duration) {
        let due = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        if let Err(e) = self.queue.push_delayed(&task.task_id, due).await {
            error!(task_id = %task.task_id, error = %e, "Failed to schedule task");
        }
    }
}
