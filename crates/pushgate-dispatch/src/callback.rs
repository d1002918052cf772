//! Delivery report ingestion.

use crate::executor::{ActionExecutor, FailureContext};
use crate::notify::{Notifier, StatusNotification};
use crate::rules::{EvaluateRequest, RuleEngine};
use crate::store::{AppStore, ChannelStore, LogStore, TaskStore};
use crate::Result;
use chrono::Utc;
use pushgate_channels::{CallbackRequest, ProviderReply, SenderFactory};
use pushgate_core::types::{CallbackLog, CallbackResult, CallbackStatus, RuleScene, Task, TaskStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Applies provider delivery reports to tasks.
pub struct CallbackService {
    tasks: Arc<dyn TaskStore>,
    logs: Arc<dyn LogStore>,
    apps: Arc<dyn AppStore>,
    channels: Arc<dyn ChannelStore>,
    factory: Arc<SenderFactory>,
    rules: Arc<RuleEngine>,
    executor: Arc<ActionExecutor>,
    notifier: Arc<dyn Notifier>,
}

impl CallbackService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        logs: Arc<dyn LogStore>,
        apps: Arc<dyn AppStore>,
        channels: Arc<dyn ChannelStore>,
        factory: Arc<SenderFactory>,
        rules: Arc<RuleEngine>,
        executor: Arc<ActionExecutor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            tasks,
            logs,
            apps,
            channels,
            factory,
            rules,
            executor,
            notifier,
        }
    }

    /// Parse a pushed report and apply every result in it.
    ///
    /// Always returns the reply the provider expects, even when nothing
    /// could be applied.
    pub async fn handle_callback(&self, provider_code: &str, request: CallbackRequest) -> ProviderReply {
        let handler = match self.factory.callback_handler(provider_code) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(provider = provider_code, error = %e, "No callback handler");
                return ProviderReply::default();
            }
        };

        let outcome = handler.handle_callback(&request).await;
        if let Some(e) = &outcome.error {
            warn!(provider = provider_code, error = %e, "Failed to parse callback");
            return outcome.reply;
        }

        let raw = raw_data(&request);
        info!(provider = provider_code, results = outcome.results.len(), "Callback received");
        for result in outcome.results {
            if let Err(e) = self.apply(provider_code, result, &raw).await {
                error!(provider = provider_code, error = %e, "Failed to apply callback result");
            }
        }
        outcome.reply
    }

    /// Pull pending reports for every active account of a provider and apply
    /// them. Returns how many results were applied.
    pub async fn apply_pulled(&self, provider_code: &str) -> Result<usize> {
        let puller = self.factory.status_puller(provider_code)?;
        let accounts = self.channels.accounts().await?;

        let mut applied = 0;
        for account in accounts
            .iter()
            .filter(|a| a.active && a.provider_code == provider_code)
        {
            let results = match puller.pull_status(account).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(provider = provider_code, account_id = account.id, error = %e, "Status pull failed");
                    continue;
                }
            };
            for result in results {
                let raw = serde_json::to_string(&result)?;
                match self.apply(provider_code, result, &raw).await {
                    Ok(()) => applied += 1,
                    Err(e) => error!(provider = provider_code, error = %e, "Failed to apply pulled result"),
                }
            }
        }

        debug!(provider = provider_code, applied, "Applied pulled reports");
        Ok(applied)
    }

    async fn apply(&self, provider_code: &str, mut result: CallbackResult, raw: &str) -> Result<()> {
        let task = self.tasks.find_by_provider_msg_id(&result.provider_id).await?;
        if let Some(task) = &task {
            result.task_id = task.task_id.clone();
        }

        let row = CallbackLog {
            task_id: result.task_id.clone(),
            app_id: task.as_ref().map(|t| t.app_id.clone()).unwrap_or_default(),
            provider_code: provider_code.to_string(),
            provider_id: result.provider_id.clone(),
            callback_status: result.status,
            error_code: result.error_code.clone(),
            error_message: result.error_message.clone(),
            raw_data: raw.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.logs.append_callback_log(row).await {
            warn!(error = %e, "Failed to append callback log");
        }

        let Some(mut task) = task else {
            warn!(provider = provider_code, provider_id = %result.provider_id, "Callback for unknown message");
            return Ok(());
        };

        let previous = (task.status, task.callback_status);
        task.callback_status = result.status;
        task.callback_time = Some(result.report_time.unwrap_or_else(Utc::now));

        match result.status {
            CallbackStatus::Delivered => {
                task.status = TaskStatus::Success;
                self.tasks.update(&task).await?;
            }
            status if status.is_failure() => {
                self.tasks.update(&task).await?;
                let evaluation = self
                    .rules
                    .evaluate(&EvaluateRequest {
                        scene: RuleScene::CallbackFailure,
                        provider_code,
                        message_type: task.message_type.as_str(),
                        error_code: &result.error_code,
                        error_message: &result.error_message,
                    })
                    .await;
                let ctx = FailureContext {
                    provider_account_id: task.provider_account_id,
                    provider_code: provider_code.to_string(),
                    error_code: result.error_code.clone(),
                    error_message: result.error_message.clone(),
                    request_data: raw.to_string(),
                    response_data: "{}".to_string(),
                };
                let executed = self.executor.execute(&evaluation, &mut task, &ctx).await;
                if executed.should_retry {
                    info!(task_id = %task.task_id, action = %executed.action, "Delivery failed, task rescheduled");
                    return Ok(());
                }
            }
            _ => self.tasks.update(&task).await?,
        }

        info!(
            task_id = %task.task_id,
            status = %task.status,
            callback_status = %task.callback_status,
            "Callback applied"
        );

        if (task.status, task.callback_status) != previous {
            self.spawn_notify(task, result);
        }
        Ok(())
    }

    fn spawn_notify(&self, task: Task, result: CallbackResult) {
        let apps = self.apps.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let app = match apps.app(&task.app_id).await {
                Ok(Some(app)) => app,
                Ok(None) => {
                    debug!(app_id = %task.app_id, "Unknown app, skipping notification");
                    return;
                }
                Err(e) => {
                    warn!(app_id = %task.app_id, error = %e, "Failed to load app");
                    return;
                }
            };
            let notification = StatusNotification::new(&task, &result);
            if let Err(e) = notifier.notify(&app, &notification).await {
                warn!(task_id = %task.task_id, error = %e, "Status notification failed");
            }
        });
    }
}

/// The body itself when it is JSON, otherwise a JSON envelope around it.
fn raw_data(request: &CallbackRequest) -> String {
    if serde_json::from_slice::<Value>(&request.raw_body).is_ok() {
        return request.body_str();
    }
    json!({
        "raw_body": request.body_str(),
        "headers": request.headers,
        "query": request.query,
    })
    .to_string()
}
