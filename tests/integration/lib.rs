//! Shared fixtures for pushgate integration tests.

use async_trait::async_trait;
use pushgate_channels::{
    CallbackHandler, CallbackOutcome, CallbackRequest, Capabilities, ChannelError,
    ProviderRegistration, ProviderReply, SendRequest, SendResponse, Sender, SenderFactory,
};
use pushgate_core::types::{
    Application, CallbackResult, CallbackStatus, ChannelBinding, MessageType, ProviderAccount,
    SubmitRequest, Task, TaskStatus,
};
use pushgate_core::{Config, SecretString};
use pushgate_dispatch::{Dispatcher, Stores};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PROVIDER: &str = "loopback";
pub const APP_ID: &str = "shop";
pub const APP_SECRET: &str = "shop-secret";

/// In-process provider: accepts every send and parses JSON delivery reports.
#[derive(Default)]
pub struct LoopbackProvider {
    sent: AtomicUsize,
}

impl LoopbackProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn register(self: &Arc<Self>, factory: &SenderFactory) {
        factory.register(
            ProviderRegistration::new(self.clone())
                .with_capabilities(Capabilities::send_only().with_callback())
                .with_callback_handler(self.clone()),
        );
    }
}

#[async_trait]
impl Sender for LoopbackProvider {
    fn provider_code(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, request: &SendRequest) -> pushgate_channels::Result<SendResponse> {
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendResponse::accepted(format!("lb-{}", n), TaskStatus::Sent)
            .with_payloads(format!(r#"{{"to":"{}"}}"#, request.task.receiver), "{}"))
    }
}

#[derive(Deserialize)]
struct Report {
    msg_id: String,
    status: CallbackStatus,
    #[serde(default)]
    code: String,
}

#[async_trait]
impl CallbackHandler for LoopbackProvider {
    fn provider_code(&self) -> &str {
        PROVIDER
    }

    async fn handle_callback(&self, request: &CallbackRequest) -> CallbackOutcome {
        let reply = ProviderReply::json_ok(r#"{"result":"received"}"#);
        match serde_json::from_slice::<Vec<Report>>(&request.raw_body) {
            Ok(reports) => {
                let results = reports
                    .into_iter()
                    .map(|r| CallbackResult::new(r.msg_id, r.status).with_error(r.code, ""))
                    .collect();
                CallbackOutcome::parsed(reply, results)
            }
            Err(e) => CallbackOutcome::failed(reply, ChannelError::InvalidCallback(e.to_string())),
        }
    }
}

/// One application, one account on the loopback provider, one SMS binding on channel 1.
pub fn config(notify_url: Option<String>) -> Config {
    let mut config = Config::default();
    config.queue.block_secs = 1;
    config.worker.count = 2;
    config.scheduler.interval_secs = 1;
    config.notify.retry_delay_ms = 10;
    config.applications.push(Application {
        app_id: APP_ID.to_string(),
        name: "Shop".to_string(),
        app_secret: SecretString::new(APP_SECRET),
        notify_url,
        active: true,
    });
    config.providers.push(ProviderAccount::new(1, PROVIDER));
    config
        .channels
        .push(ChannelBinding::new(1, 1, MessageType::Sms, 1));
    config
}

/// Dispatcher over in-memory stores with the loopback provider registered.
pub fn dispatcher(config: Config, provider: &Arc<LoopbackProvider>) -> Arc<Dispatcher> {
    let factory = Arc::new(SenderFactory::new());
    provider.register(&factory);
    let stores = Stores::in_memory(&config);
    match Dispatcher::new(config, factory, stores) {
        Ok(d) => Arc::new(d),
        Err(e) => panic!("dispatcher: {}", e),
    }
}

pub fn sms(receiver: &str) -> SubmitRequest {
    SubmitRequest {
        app_id: APP_ID.to_string(),
        channel_id: 1,
        message_type: MessageType::Sms,
        receiver: receiver.to_string(),
        content: "your code is 1234".to_string(),
        template_code: String::new(),
        template_params: Default::default(),
        signature: String::new(),
        scheduled_at: None,
        max_retry: None,
    }
}

/// Poll until the task matches `done`, panicking after about five seconds.
pub async fn wait_for<F>(dispatcher: &Dispatcher, task_id: &str, done: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    for _ in 0..500 {
        if let Ok(task) = dispatcher.task(task_id).await {
            if done(&task) {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached the expected state", task_id);
}
