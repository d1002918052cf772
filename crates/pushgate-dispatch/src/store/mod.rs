//! Persistence collaborators.
//!
//! The dispatch pipeline only talks to storage through these traits. The
//! in-memory implementations in [`memory`] back tests and throwaway
//! deployments; [`sqlite`] keeps tasks and logs across restarts. Channels,
//! rules and applications are always seeded from the config file.

mod memory;
mod sqlite;

pub use memory::{
    MemoryAppStore, MemoryChannelStore, MemoryLogStore, MemoryRuleStore, MemoryTaskStore,
};
pub use sqlite::{SqliteLogStore, SqliteTaskStore};

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pushgate_core::types::{
    Application, CallbackLog, ChannelBinding, FailureRule, MessageType, ProviderAccount,
    ProviderSignature, PushLog, RuleScene, Task,
};
use pushgate_core::Config;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task) -> Result<()>;

    async fn get(&self, task_id: &str) -> Result<Option<Task>>;

    /// Replace the stored task and bump `updated_at`.
    ///
    /// Fails with `InvalidTransition` when the stored status may not move to
    /// the new one.
    async fn update(&self, task: &Task) -> Result<()>;

    /// Find the task a provider message ID belongs to.
    async fn find_by_provider_msg_id(&self, provider_msg_id: &str) -> Result<Option<Task>>;

    /// Sent tasks still waiting for a callback, last updated before `cutoff`.
    async fn awaiting_callback(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>>;
}

/// Append-only audit trail.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_push_log(&self, log: PushLog) -> Result<()>;

    async fn append_callback_log(&self, log: CallbackLog) -> Result<()>;

    async fn push_logs(&self, task_id: &str) -> Result<Vec<PushLog>>;

    async fn callback_logs(&self, provider_id: &str) -> Result<Vec<CallbackLog>>;
}

/// Provider accounts, channel bindings and signature mappings.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Every binding for the channel and message type, enabled or not.
    async fn bindings(&self, channel_id: u64, message_type: MessageType) -> Result<Vec<ChannelBinding>>;

    async fn account(&self, id: u64) -> Result<Option<ProviderAccount>>;

    async fn accounts(&self) -> Result<Vec<ProviderAccount>>;

    async fn signature(
        &self,
        channel_id: u64,
        signature_name: &str,
        account_id: u64,
    ) -> Result<Option<ProviderSignature>>;
}

/// Failure rule records.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn enabled_rules(&self, scene: RuleScene) -> Result<Vec<FailureRule>>;
}

/// Client applications.
#[async_trait]
pub trait AppStore: Send + Sync {
    async fn app(&self, app_id: &str) -> Result<Option<Application>>;
}

/// All stores the pipeline needs, shared behind `Arc`s.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<dyn TaskStore>,
    pub logs: Arc<dyn LogStore>,
    pub channels: Arc<dyn ChannelStore>,
    pub rules: Arc<dyn RuleStore>,
    pub apps: Arc<dyn AppStore>,
}

impl Stores {
    /// In-memory stores seeded from the config file.
    pub fn in_memory(config: &Config) -> Self {
        Self {
            tasks: Arc::new(MemoryTaskStore::new()),
            logs: Arc::new(MemoryLogStore::new()),
            channels: Arc::new(MemoryChannelStore::from_config(config)),
            rules: Arc::new(MemoryRuleStore::new(config.rules.clone())),
            apps: Arc::new(MemoryAppStore::new(config.applications.clone())),
        }
    }

    /// Tasks and logs in the database, everything else seeded from the config file.
    pub fn sqlite(config: &Config, pool: SqlitePool) -> Self {
        Self {
            tasks: Arc::new(SqliteTaskStore::new(pool.clone())),
            logs: Arc::new(SqliteLogStore::new(pool)),
            ..Self::in_memory(config)
        }
    }
}
