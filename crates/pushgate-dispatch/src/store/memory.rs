use super::{AppStore, ChannelStore, LogStore, RuleStore, TaskStore};
use crate::error::DispatchError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use pushgate_core::types::{
    Application, CallbackLog, CallbackStatus, ChannelBinding, FailureRule, MessageType,
    ProviderAccount, ProviderSignature, PushLog, RuleScene, Task, TaskStatus,
};
use pushgate_core::Config;
use std::collections::HashMap;

/// Tasks keyed by ID, with a provider message ID index.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: DashMap<String, Task>,
    by_provider_msg_id: DashMap<String, String>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<()> {
        if !task.provider_msg_id.is_empty() {
            self.by_provider_msg_id
                .insert(task.provider_msg_id.clone(), task.task_id.clone());
        }
        self.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.get(task_id).map(|t| t.value().clone()))
    }

    async fn update(&self, task: &Task) -> Result<()> {
        {
            let mut stored = self
                .tasks
                .get_mut(&task.task_id)
                .ok_or_else(|| DispatchError::TaskNotFound(task.task_id.clone()))?;

            if !stored.status.can_transition_to(task.status) {
                return Err(DispatchError::InvalidTransition {
                    task_id: task.task_id.clone(),
                    from: stored.status,
                    to: task.status,
                });
            }

            let mut updated = task.clone();
            updated.updated_at = Utc::now();
            *stored = updated;
        }

        if !task.provider_msg_id.is_empty() {
            self.by_provider_msg_id
                .insert(task.provider_msg_id.clone(), task.task_id.clone());
        }
        Ok(())
    }

    async fn find_by_provider_msg_id(&self, provider_msg_id: &str) -> Result<Option<Task>> {
        let task_id = match self.by_provider_msg_id.get(provider_msg_id) {
            Some(id) => id.value().clone(),
            None => return Ok(None),
        };
        self.get(&task_id).await
    }

    async fn awaiting_callback(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Sent
                    && t.callback_status == CallbackStatus::Pending
                    && t.updated_at < cutoff
            })
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.updated_at);
        tasks.truncate(limit);
        Ok(tasks)
    }
}

/// Audit rows in insertion order.
#[derive(Default)]
pub struct MemoryLogStore {
    push_logs: RwLock<Vec<PushLog>>,
    callback_logs: RwLock<Vec<CallbackLog>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append_push_log(&self, log: PushLog) -> Result<()> {
        self.push_logs.write().push(log);
        Ok(())
    }

    async fn append_callback_log(&self, log: CallbackLog) -> Result<()> {
        self.callback_logs.write().push(log);
        Ok(())
    }

    async fn push_logs(&self, task_id: &str) -> Result<Vec<PushLog>> {
        Ok(self
            .push_logs
            .read()
            .iter()
            .filter(|l| l.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn callback_logs(&self, provider_id: &str) -> Result<Vec<CallbackLog>> {
        Ok(self
            .callback_logs
            .read()
            .iter()
            .filter(|l| l.provider_id == provider_id)
            .cloned()
            .collect())
    }
}

/// Accounts, bindings and signatures.
#[derive(Default)]
pub struct MemoryChannelStore {
    accounts: RwLock<HashMap<u64, ProviderAccount>>,
    bindings: RwLock<Vec<ChannelBinding>>,
    signatures: RwLock<Vec<ProviderSignature>>,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let store = Self::new();
        for account in &config.providers {
            store.upsert_account(account.clone());
        }
        for binding in &config.channels {
            store.upsert_binding(binding.clone());
        }
        store.signatures.write().extend(config.signatures.iter().cloned());
        store
    }

    pub fn upsert_account(&self, account: ProviderAccount) {
        self.accounts.write().insert(account.id, account);
    }

    pub fn upsert_binding(&self, binding: ChannelBinding) {
        let mut bindings = self.bindings.write();
        match bindings.iter_mut().find(|b| b.id == binding.id) {
            Some(existing) => *existing = binding,
            None => bindings.push(binding),
        }
    }

    pub fn remove_binding(&self, id: u64) -> bool {
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|b| b.id != id);
        bindings.len() != before
    }

    pub fn add_signature(&self, signature: ProviderSignature) {
        self.signatures.write().push(signature);
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn bindings(&self, channel_id: u64, message_type: MessageType) -> Result<Vec<ChannelBinding>> {
        Ok(self
            .bindings
            .read()
            .iter()
            .filter(|b| b.channel_id == channel_id && b.message_type == message_type)
            .cloned()
            .collect())
    }

    async fn account(&self, id: u64) -> Result<Option<ProviderAccount>> {
        Ok(self.accounts.read().get(&id).cloned())
    }

    async fn accounts(&self) -> Result<Vec<ProviderAccount>> {
        let mut accounts: Vec<_> = self.accounts.read().values().cloned().collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn signature(
        &self,
        channel_id: u64,
        signature_name: &str,
        account_id: u64,
    ) -> Result<Option<ProviderSignature>> {
        Ok(self
            .signatures
            .read()
            .iter()
            .find(|s| {
                s.channel_id == channel_id
                    && s.signature_name == signature_name
                    && s.provider_account_id == account_id
            })
            .cloned())
    }
}

/// Failure rules.
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: RwLock<Vec<FailureRule>>,
}

impl MemoryRuleStore {
    pub fn new(rules: Vec<FailureRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Insert or replace a rule by ID.
    pub fn upsert(&self, rule: FailureRule) {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn enabled_rules(&self, scene: RuleScene) -> Result<Vec<FailureRule>> {
        Ok(self
            .rules
            .read()
            .iter()
            .filter(|r| r.enabled && r.scene == scene)
            .cloned()
            .collect())
    }
}

/// Client applications.
#[derive(Default)]
pub struct MemoryAppStore {
    apps: RwLock<HashMap<String, Application>>,
}

impl MemoryAppStore {
    pub fn new(apps: Vec<Application>) -> Self {
        Self {
            apps: RwLock::new(apps.into_iter().map(|a| (a.app_id.clone(), a)).collect()),
        }
    }

    pub fn upsert(&self, app: Application) {
        self.apps.write().insert(app.app_id.clone(), app);
    }
}

#[async_trait]
impl AppStore for MemoryAppStore {
    async fn app(&self, app_id: &str) -> Result<Option<Application>> {
        Ok(self.apps.read().get(app_id).cloned())
    }
}
