//! Processes one queue entry: select a provider, send, and route failures.

use crate::error::DispatchError;
use crate::executor::{ActionExecutor, FailureContext};
use crate::queue::QueueEntry;
use crate::rules::{EvaluateRequest, RuleEngine};
use crate::selector::{ChannelSelector, Selection};
use crate::store::{ChannelStore, LogStore, TaskStore};
use crate::Result;
use async_trait::async_trait;
use pushgate_channels::{ChannelError, SendRequest, SendResponse, SenderFactory};
use pushgate_core::types::{
    CallbackStatus, ProviderSignature, PushLog, PushLogStatus, RuleScene, Task, TaskStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consumer of queue entries.
///
/// An `Err` sends the entry to the dead-letter stream.
#[async_trait]
pub trait EntryHandler: Send + Sync {
    async fn handle(&self, entry: &QueueEntry) -> Result<()>;
}

/// Sends tasks through the selected provider.
pub struct MessageHandler {
    tasks: Arc<dyn TaskStore>,
    logs: Arc<dyn LogStore>,
    channels: Arc<dyn ChannelStore>,
    factory: Arc<SenderFactory>,
    selector: Arc<ChannelSelector>,
    rules: Arc<RuleEngine>,
    executor: Arc<ActionExecutor>,
    send_timeout: Duration,
}

impl MessageHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        logs: Arc<dyn LogStore>,
        channels: Arc<dyn ChannelStore>,
        factory: Arc<SenderFactory>,
        selector: Arc<ChannelSelector>,
        rules: Arc<RuleEngine>,
        executor: Arc<ActionExecutor>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            tasks,
            logs,
            channels,
            factory,
            selector,
            rules,
            executor,
            send_timeout,
        }
    }

    /// Run one attempt for a task.
    pub async fn process(&self, task_id: &str) -> Result<()> {
        let mut task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(task_id.to_string()))?;

        if task.status.is_terminal() {
            debug!(task_id, status = %task.status, "Skipping terminal task");
            return Ok(());
        }

        task.status = TaskStatus::Processing;
        self.tasks.update(&task).await?;

        let selection = match self
            .selector
            .select(
                task.channel_id,
                task.message_type,
                &task.app_id,
                &task.receiver,
                &task.excluded_accounts,
            )
            .await
        {
            Ok(selection) => selection,
            Err(e) => {
                self.fail_early(&mut task, None, &e.to_string()).await;
                return Err(e);
            }
        };
        let account_id = selection.account.id;

        let sender = match self.factory.sender(&selection.account.provider_code) {
            Ok(sender) => sender,
            Err(e) => {
                self.selector.report(&selection, false);
                self.fail_early(&mut task, Some(account_id), &e.to_string()).await;
                return Err(e.into());
            }
        };

        let signature = self.resolve_signature(&task, account_id).await;
        let request = SendRequest {
            task: task.clone(),
            account: selection.account.clone(),
            binding: selection.binding.clone(),
            signature,
        };

        let outcome = match tokio::time::timeout(self.send_timeout, sender.send(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ChannelError::Timeout),
        };

        match outcome {
            Ok(response) if response.success => self.on_success(&mut task, &selection, response).await,
            Ok(response) => {
                self.on_send_failure(&mut task, &selection, response).await;
                Ok(())
            }
            Err(e) if e.is_pre_send() => {
                self.selector.report(&selection, false);
                self.fail_early(&mut task, Some(account_id), &e.to_string()).await;
                Err(e.into())
            }
            Err(e) => {
                warn!(task_id, account_id, error = %e, "Send failed without provider response");
                let response = SendResponse::rejected("", e.to_string())
                    .with_payloads("{}", "{}");
                self.on_send_failure(&mut task, &selection, response).await;
                Ok(())
            }
        }
    }

    async fn resolve_signature(&self, task: &Task, account_id: u64) -> Option<ProviderSignature> {
        if task.signature.is_empty() {
            return None;
        }
        match self
            .channels
            .signature(task.channel_id, &task.signature, account_id)
            .await
        {
            Ok(Some(signature)) => Some(signature),
            Ok(None) => {
                warn!(
                    task_id = %task.task_id,
                    signature = %task.signature,
                    account_id,
                    "No provider signature mapped, sending without"
                );
                None
            }
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Failed to resolve signature");
                None
            }
        }
    }

    async fn on_success(
        &self,
        task: &mut Task,
        selection: &Selection,
        response: SendResponse,
    ) -> Result<()> {
        task.provider_msg_id = response.provider_id.clone();
        task.provider_account_id = Some(selection.account.id);
        task.status = match response.status {
            TaskStatus::Success => TaskStatus::Success,
            _ => TaskStatus::Sent,
        };
        task.callback_status = CallbackStatus::Pending;
        task.callback_time = None;
        // The provider accepted the message whatever happens to the task row
        self.selector.report(selection, true);
        self.tasks.update(task).await?;

        let row = PushLog::new(&task.task_id, &task.app_id, PushLogStatus::Success)
            .with_account(Some(selection.account.id))
            .with_payloads(response.request_data, response.response_data)
            .with_provider_msg_id(&response.provider_id);
        if let Err(e) = self.logs.append_push_log(row).await {
            warn!(error = %e, "Failed to append push log");
        }

        info!(
            task_id = %task.task_id,
            provider = %selection.account.provider_code,
            provider_msg_id = %task.provider_msg_id,
            status = %task.status,
            "Message sent"
        );
        Ok(())
    }

    async fn on_send_failure(&self, task: &mut Task, selection: &Selection, response: SendResponse) {
        self.selector.report(selection, false);
        task.provider_account_id = Some(selection.account.id);

        let provider_code = selection.account.provider_code.as_str();
        let result = self
            .rules
            .evaluate(&EvaluateRequest {
                scene: RuleScene::SendFailure,
                provider_code,
                message_type: task.message_type.as_str(),
                error_code: &response.error_code,
                error_message: &response.error_message,
            })
            .await;

        info!(
            task_id = %task.task_id,
            provider = provider_code,
            error_code = %response.error_code,
            error = %response.error_message,
            rule = result.rule_name(),
            action = %result.action,
            "Send failed"
        );

        let ctx = FailureContext {
            provider_account_id: Some(selection.account.id),
            provider_code: provider_code.to_string(),
            error_code: response.error_code,
            error_message: response.error_message,
            request_data: response.request_data,
            response_data: response.response_data,
        };
        self.executor.execute(&result, task, &ctx).await;
    }

    /// Terminal failure before any provider call; the rule engine is not consulted.
    async fn fail_early(&self, task: &mut Task, account_id: Option<u64>, message: &str) {
        error!(task_id = %task.task_id, error = message, "Task failed before sending");
        task.status = TaskStatus::Failed;
        if let Err(e) = self.tasks.update(task).await {
            error!(task_id = %task.task_id, error = %e, "Failed to mark task failed");
        }
        let row = PushLog::new(&task.task_id, &task.app_id, PushLogStatus::Failed)
            .with_account(account_id)
            .with_error(message);
        if let Err(e) = self.logs.append_push_log(row).await {
            warn!(error = %e, "Failed to append push log");
        }
    }
}

#[async_trait]
impl EntryHandler for MessageHandler {
    async fn handle(&self, entry: &QueueEntry) -> Result<()> {
        if entry.task_id.is_empty() {
            return Err(DispatchError::Queue(format!("entry {} has no task_id", entry.id)));
        }
        self.process(&entry.task_id).await
    }
}
