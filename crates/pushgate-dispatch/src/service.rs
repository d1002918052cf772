//! Composition root for the dispatch pipeline.

use crate::callback::CallbackService;
use crate::error::DispatchError;
use crate::executor::{ActionExecutor, WebhookAlertSender};
use crate::handler::MessageHandler;
use crate::notify::{Notifier, WebhookNotifier};
use crate::db;
use crate::queue::{DelayedScanner, MemoryQueue, SharedQueue, SqliteQueue};
use crate::rules::RuleEngine;
use crate::selector::ChannelSelector;
use crate::status_pull::StatusPullScanner;
use crate::store::Stores;
use crate::timeout::CallbackTimeoutScanner;
use crate::worker::WorkerPool;
use crate::Result;
use pushgate_channels::{CallbackRequest, ProviderReply, SenderFactory};
use pushgate_core::id;
use pushgate_core::types::{
    BatchItemReceipt, BatchReceipt, BatchSubmitRequest, SubmitReceipt, SubmitRequest, Task,
    TaskStatus,
};
use pushgate_core::config::StorageBackend;
use pushgate_core::Config;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Background {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Owns every pipeline component and exposes the submission, callback and
/// admin operations.
pub struct Dispatcher {
    config: Config,
    stores: Stores,
    queue: SharedQueue,
    factory: Arc<SenderFactory>,
    selector: Arc<ChannelSelector>,
    rules: Arc<RuleEngine>,
    callbacks: Arc<CallbackService>,
    pool: WorkerPool,
    background: Mutex<Option<Background>>,
}

impl Dispatcher {
    /// Build a dispatcher on an in-process queue.
    pub fn new(config: Config, factory: Arc<SenderFactory>, stores: Stores) -> Result<Self> {
        let queue: SharedQueue = Arc::new(MemoryQueue::new(config.queue.clone()));
        let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(config.notify.clone())?);
        Self::with_parts(config, factory, stores, queue, notifier)
    }

    /// Build a dispatcher on the storage backend the config names.
    pub async fn open(config: Config, factory: Arc<SenderFactory>) -> Result<Self> {
        match config.storage.backend {
            StorageBackend::Memory => {
                let stores = Stores::in_memory(&config);
                Self::new(config, factory, stores)
            }
            StorageBackend::Sqlite => {
                let pool = db::open(&config.storage.path).await?;
                let stores = Stores::sqlite(&config, pool.clone());
                let queue: SharedQueue = Arc::new(SqliteQueue::new(pool, config.queue.clone()));
                let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(config.notify.clone())?);
                Self::with_parts(config, factory, stores, queue, notifier)
            }
        }
    }

    /// Build a dispatcher on caller-provided queue and notifier.
    pub fn with_parts(
        config: Config,
        factory: Arc<SenderFactory>,
        stores: Stores,
        queue: SharedQueue,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let selector = Arc::new(ChannelSelector::new(stores.channels.clone(), &config.selector));
        let rules = Arc::new(RuleEngine::new(stores.rules.clone()));
        let executor = Arc::new(ActionExecutor::new(
            stores.tasks.clone(),
            stores.logs.clone(),
            queue.clone(),
            Arc::new(WebhookAlertSender::new()?),
        ));

        let handler = Arc::new(MessageHandler::new(
            stores.tasks.clone(),
            stores.logs.clone(),
            stores.channels.clone(),
            factory.clone(),
            selector.clone(),
            rules.clone(),
            executor.clone(),
            config.send_timeout(),
        ));
        let pool = WorkerPool::new(
            queue.clone(),
            handler,
            config.queue.clone(),
            config.worker.clone(),
        );

        let callbacks = Arc::new(CallbackService::new(
            stores.tasks.clone(),
            stores.logs.clone(),
            stores.apps.clone(),
            stores.channels.clone(),
            factory.clone(),
            rules.clone(),
            executor,
            notifier,
        ));

        Ok(Self {
            config,
            stores,
            queue,
            factory,
            selector,
            rules,
            callbacks,
            pool,
            background: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn factory(&self) -> &Arc<SenderFactory> {
        &self.factory
    }

    /// Validate, persist and enqueue one task.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt> {
        self.validate_target(&request).await?;
        validate_receiver(&request.receiver)?;

        let task = Task::new(id::uuid(), &request);
        self.enqueue_new(task).await
    }

    /// Submit one task per receiver. Item failures are reported per item.
    pub async fn submit_batch(&self, request: BatchSubmitRequest) -> Result<BatchReceipt> {
        if request.receivers.is_empty() {
            return Err(DispatchError::validation("receivers must not be empty"));
        }
        let template = request.item("");
        self.validate_target(&template).await?;

        let batch_id = id::timestamp_id();
        let mut items = Vec::with_capacity(request.receivers.len());
        for (i, receiver) in request.receivers.iter().enumerate() {
            let outcome = match validate_receiver(receiver) {
                Ok(()) => {
                    let task = Task::new(id::batch_item_id(&batch_id, i), &request.item(receiver));
                    self.enqueue_new(task).await
                }
                Err(e) => Err(e),
            };
            items.push(match outcome {
                Ok(receipt) => BatchItemReceipt {
                    receiver: receiver.clone(),
                    task_id: Some(receipt.task_id),
                    error: None,
                },
                Err(e) => BatchItemReceipt {
                    receiver: receiver.clone(),
                    task_id: None,
                    error: Some(e.to_string()),
                },
            });
        }

        let success_count = items.iter().filter(|i| i.task_id.is_some()).count();
        info!(
            batch_id = %batch_id,
            total = items.len(),
            success = success_count,
            "Batch submitted"
        );
        Ok(BatchReceipt {
            batch_id,
            total_count: items.len(),
            success_count,
            failed_count: items.len() - success_count,
            items,
        })
    }

    pub async fn task(&self, task_id: &str) -> Result<Task> {
        self.stores
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(task_id.to_string()))
    }

    /// Start the workers and the background scanners. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Ok(());
        }

        if let Err(e) = self.rules.refresh().await {
            warn!(error = %e, "Initial rule load failed, rules load on first use");
        }
        self.pool.start().await?;

        let cancel = CancellationToken::new();
        let mut handles = vec![DelayedScanner::new(self.queue.clone(), &self.config.scheduler)
            .spawn(cancel.child_token())];
        if self.config.callback_timeout.enabled {
            handles.push(
                CallbackTimeoutScanner::new(self.stores.tasks.clone(), &self.config.callback_timeout)
                    .spawn(cancel.child_token()),
            );
        }
        if self.config.status_pull.enabled {
            handles.push(
                StatusPullScanner::new(self.callbacks.clone(), self.factory.clone(), &self.config.status_pull)
                    .spawn(cancel.child_token()),
            );
        }
        *background = Some(Background { cancel, handles });

        info!(
            workers = self.config.worker.count,
            providers = ?self.factory.provider_codes(),
            "Dispatcher started"
        );
        Ok(())
    }

    /// Stop the scanners, then drain the workers.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(background) = self.background.lock().await.take() {
            background.cancel.cancel();
            for handle in background.handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Background task panicked");
                }
            }
        }
        self.pool.stop().await?;
        info!("Dispatcher stopped");
        Ok(())
    }

    pub async fn handle_callback(&self, provider_code: &str, request: CallbackRequest) -> ProviderReply {
        self.callbacks.handle_callback(provider_code, request).await
    }

    pub async fn apply_pulled(&self, provider_code: &str) -> Result<usize> {
        self.callbacks.apply_pulled(provider_code).await
    }

    pub async fn refresh_rules(&self) -> Result<()> {
        self.rules.refresh().await
    }

    /// Drop cached channel nodes, for one channel or all of them.
    pub fn clear_selector(&self, channel_id: Option<u64>) {
        match channel_id {
            Some(channel_id) => self.selector.clear_cache_by_channel(channel_id),
            None => self.selector.clear_cache(),
        }
    }

    async fn validate_target(&self, request: &SubmitRequest) -> Result<()> {
        let app_id = request.app_id.as_str();
        if app_id.trim().is_empty() {
            return Err(DispatchError::validation("app_id is required"));
        }
        match self.stores.apps.app(app_id).await? {
            Some(app) if app.active => {}
            _ => return Err(DispatchError::AppNotAvailable(app_id.to_string())),
        }
        if !self
            .selector
            .has_candidates(request.channel_id, request.message_type)
            .await?
        {
            return Err(DispatchError::NoChannel {
                channel_id: request.channel_id,
                message_type: request.message_type,
            });
        }
        Ok(())
    }

    async fn enqueue_new(&self, mut task: Task) -> Result<SubmitReceipt> {
        self.stores.tasks.insert(task.clone()).await?;
        if let Err(e) = self.queue.push(&task).await {
            error!(task_id = %task.task_id, error = %e, "Failed to enqueue task");
            task.status = TaskStatus::Failed;
            if let Err(e) = self.stores.tasks.update(&task).await {
                error!(task_id = %task.task_id, error = %e, "Failed to mark task failed");
            }
            return Err(e);
        }
        info!(
            task_id = %task.task_id,
            app_id = %task.app_id,
            channel_id = task.channel_id,
            message_type = %task.message_type,
            "Task submitted"
        );
        Ok(SubmitReceipt {
            task_id: task.task_id,
            status: TaskStatus::Pending,
        })
    }
}

fn validate_receiver(receiver: &str) -> Result<()> {
    if receiver.trim().is_empty() {
        return Err(DispatchError::validation("receiver is required"));
    }
    Ok(())
}
