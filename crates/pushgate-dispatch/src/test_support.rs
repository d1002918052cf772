//! Fixtures shared by the dispatch unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use pushgate_channels::{ChannelError, SendRequest, SendResponse, Sender};
use pushgate_core::types::{
    ChannelBinding, MessageType, ProviderAccount, SubmitRequest, TaskStatus,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::store::MemoryChannelStore;

pub const PROVIDER: &str = "fake";

/// Sender that replays queued outcomes, then accepts everything.
pub struct ScriptedSender {
    script: Mutex<VecDeque<pushgate_channels::Result<SendResponse>>>,
    calls: AtomicUsize,
    accounts: Mutex<Vec<u64>>,
    hang: bool,
}

impl ScriptedSender {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            accounts: Mutex::new(Vec::new()),
            hang: false,
        }
    }

    /// Never answers, so the send timeout fires.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new()
        }
    }

    pub fn then(self, outcome: pushgate_channels::Result<SendResponse>) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Account IDs used, in call order.
    pub fn accounts(&self) -> Vec<u64> {
        self.accounts.lock().clone()
    }
}

#[async_trait]
impl Sender for ScriptedSender {
    fn provider_code(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, request: &SendRequest) -> pushgate_channels::Result<SendResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.accounts.lock().push(request.account.id);
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Err(ChannelError::Timeout);
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(SendResponse::accepted(format!("msg-{}", n), TaskStatus::Sent)
                .with_payloads(r#"{"to":"x"}"#, r#"{"ok":true}"#))
        })
    }
}

/// Two active `fake` accounts bound to channel 1 for SMS, weights 1:1.
pub fn channel_store() -> MemoryChannelStore {
    let store = MemoryChannelStore::new();
    for id in [1, 2] {
        store.upsert_account(ProviderAccount::new(id, PROVIDER));
        store.upsert_binding(ChannelBinding::new(id, 1, MessageType::Sms, id));
    }
    store
}

pub fn sms_request(receiver: &str) -> SubmitRequest {
    SubmitRequest {
        app_id: "app1".into(),
        channel_id: 1,
        message_type: MessageType::Sms,
        receiver: receiver.into(),
        content: "hello".into(),
        template_code: String::new(),
        template_params: BTreeMap::new(),
        signature: String::new(),
        scheduled_at: None,
        max_retry: None,
    }
}
