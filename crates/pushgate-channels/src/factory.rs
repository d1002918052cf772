//! Provider registry with capability-checked lookups.

use crate::error::ChannelError;
use crate::traits::{
    BatchSender, CallbackHandler, Capabilities, Sender, StatusPuller, StatusQuerier,
};
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One provider's adapters and declared capabilities.
pub struct ProviderRegistration {
    capabilities: Capabilities,
    sender: Arc<dyn Sender>,
    batch_sender: Option<Arc<dyn BatchSender>>,
    callback_handler: Option<Arc<dyn CallbackHandler>>,
    status_querier: Option<Arc<dyn StatusQuerier>>,
    status_puller: Option<Arc<dyn StatusPuller>>,
}

impl ProviderRegistration {
    /// Start a registration; capabilities default to what the sender declares.
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self {
            capabilities: sender.capabilities(),
            sender,
            batch_sender: None,
            callback_handler: None,
            status_querier: None,
            status_puller: None,
        }
    }

    /// Override the declared capabilities.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_batch_sender(mut self, adapter: Arc<dyn BatchSender>) -> Self {
        self.batch_sender = Some(adapter);
        self
    }

    pub fn with_callback_handler(mut self, adapter: Arc<dyn CallbackHandler>) -> Self {
        self.callback_handler = Some(adapter);
        self
    }

    pub fn with_status_querier(mut self, adapter: Arc<dyn StatusQuerier>) -> Self {
        self.status_querier = Some(adapter);
        self
    }

    pub fn with_status_puller(mut self, adapter: Arc<dyn StatusPuller>) -> Self {
        self.status_puller = Some(adapter);
        self
    }

    pub fn provider_code(&self) -> &str {
        self.sender.provider_code()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

/// Resolves provider codes to adapters.
///
/// Built once by the composition root and shared; providers may still be
/// added or removed at runtime.
#[derive(Default)]
pub struct SenderFactory {
    providers: RwLock<HashMap<String, ProviderRegistration>>,
}

impl SenderFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory with the built-in provider adapters registered.
    pub fn with_builtin_providers() -> Result<Self> {
        let factory = Self::new();

        #[cfg(feature = "zrwinfo")]
        factory.register(Arc::new(crate::zrwinfo::ZrwinfoSender::new()?).registration());

        #[cfg(feature = "wechat-work")]
        factory.register(Arc::new(crate::wechat_work::WechatWorkSender::new()?).registration());

        #[cfg(feature = "dingtalk")]
        factory.register(Arc::new(crate::dingtalk::DingtalkSender::new()?).registration());

        #[cfg(feature = "smtp")]
        factory.register(Arc::new(crate::smtp::SmtpSender::new()?).registration());

        Ok(factory)
    }

    /// Register a provider, replacing any previous registration for its code.
    pub fn register(&self, registration: ProviderRegistration) {
        let code = registration.provider_code().to_string();
        info!(
            provider = %code,
            capabilities = ?registration.capabilities,
            "Registered provider"
        );
        self.providers.write().insert(code, registration);
    }

    /// Remove a provider.
    pub fn unregister(&self, code: &str) -> bool {
        self.providers.write().remove(code).is_some()
    }

    /// Look up the base sender.
    pub fn sender(&self, code: &str) -> Result<Arc<dyn Sender>> {
        let providers = self.providers.read();
        let registration = lookup(&providers, code)?;
        Ok(registration.sender.clone())
    }

    /// Look up the batch sender, if declared.
    pub fn batch_sender(&self, code: &str) -> Result<Arc<dyn BatchSender>> {
        let providers = self.providers.read();
        let registration = lookup(&providers, code)?;
        gated(
            code,
            "batch send",
            registration.capabilities.batch_send,
            &registration.batch_sender,
        )
    }

    /// Look up the callback handler, if declared.
    pub fn callback_handler(&self, code: &str) -> Result<Arc<dyn CallbackHandler>> {
        let providers = self.providers.read();
        let registration = lookup(&providers, code)?;
        gated(
            code,
            "callbacks",
            registration.capabilities.callback,
            &registration.callback_handler,
        )
    }

    /// Look up the status querier, if declared.
    pub fn status_querier(&self, code: &str) -> Result<Arc<dyn StatusQuerier>> {
        let providers = self.providers.read();
        let registration = lookup(&providers, code)?;
        gated(
            code,
            "status query",
            registration.capabilities.status_query,
            &registration.status_querier,
        )
    }

    /// Look up the status puller, if declared.
    pub fn status_puller(&self, code: &str) -> Result<Arc<dyn StatusPuller>> {
        let providers = self.providers.read();
        let registration = lookup(&providers, code)?;
        gated(
            code,
            "status pull",
            registration.capabilities.status_pull,
            &registration.status_puller,
        )
    }

    /// Declared capabilities of a provider.
    pub fn capabilities(&self, code: &str) -> Option<Capabilities> {
        self.providers.read().get(code).map(|r| r.capabilities)
    }

    /// All registered provider codes, sorted.
    pub fn provider_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.providers.read().keys().cloned().collect();
        codes.sort();
        codes
    }
}

fn lookup<'a>(
    providers: &'a HashMap<String, ProviderRegistration>,
    code: &str,
) -> Result<&'a ProviderRegistration> {
    providers
        .get(code)
        .ok_or_else(|| ChannelError::UnknownProvider(code.to_string()))
}

fn gated<T: ?Sized>(
    code: &str,
    capability: &'static str,
    declared: bool,
    slot: &Option<Arc<T>>,
) -> Result<Arc<T>> {
    match (declared, slot) {
        (true, Some(adapter)) => Ok(adapter.clone()),
        (true, None) => Err(ChannelError::config(format!(
            "provider {} declares {} but registered no adapter",
            code, capability
        ))),
        (false, _) => Err(ChannelError::unsupported(code, capability)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{BatchSendRequest, CallbackOutcome, CallbackRequest, ProviderReply, SendRequest, SendResponse};
    use async_trait::async_trait;
    use pushgate_core::types::TaskStatus;

    struct EchoSender {
        capabilities: Capabilities,
    }

    #[async_trait]
    impl Sender for EchoSender {
        fn provider_code(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> Capabilities {
            self.capabilities
        }

        async fn send(&self, request: &SendRequest) -> Result<SendResponse> {
            Ok(SendResponse::accepted(request.task.task_id.clone(), TaskStatus::Success))
        }
    }

    #[async_trait]
    impl BatchSender for EchoSender {
        async fn batch_send(&self, request: &BatchSendRequest) -> Result<Vec<SendResponse>> {
            Ok(request
                .tasks
                .iter()
                .map(|t| SendResponse::accepted(t.task_id.clone(), TaskStatus::Success))
                .collect())
        }
    }

    #[async_trait]
    impl CallbackHandler for EchoSender {
        fn provider_code(&self) -> &str {
            "echo"
        }

        async fn handle_callback(&self, _request: &CallbackRequest) -> CallbackOutcome {
            CallbackOutcome::parsed(ProviderReply::default(), Vec::new())
        }
    }

    #[test]
    fn test_unknown_provider() {
        let factory = SenderFactory::new();
        let err = factory.sender("nope").err().unwrap();
        assert!(matches!(err, ChannelError::UnknownProvider(code) if code == "nope"));
    }

    #[test]
    fn test_capability_flag_gates_lookup() {
        let factory = SenderFactory::new();
        let echo = Arc::new(EchoSender {
            capabilities: Capabilities::send_only(),
        });
        // Implements BatchSender but does not declare it
        factory.register(ProviderRegistration::new(echo.clone()).with_batch_sender(echo.clone()));

        assert!(factory.sender("echo").is_ok());
        let err = factory.batch_sender("echo").err().unwrap();
        assert!(matches!(err, ChannelError::Unsupported { capability: "batch send", .. }));
    }

    #[test]
    fn test_declared_capabilities_resolve() {
        let factory = SenderFactory::new();
        let echo = Arc::new(EchoSender {
            capabilities: Capabilities::send_only().with_batch_send().with_callback(),
        });
        factory.register(
            ProviderRegistration::new(echo.clone())
                .with_batch_sender(echo.clone())
                .with_callback_handler(echo.clone()),
        );

        assert!(factory.batch_sender("echo").is_ok());
        assert!(factory.callback_handler("echo").is_ok());
        assert!(factory.status_puller("echo").is_err());
        assert_eq!(factory.provider_codes(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_declared_without_adapter_is_config_error() {
        let factory = SenderFactory::new();
        let echo = Arc::new(EchoSender {
            capabilities: Capabilities::send_only().with_callback(),
        });
        factory.register(ProviderRegistration::new(echo));

        let err = factory.callback_handler("echo").err().unwrap();
        assert!(matches!(err, ChannelError::Config(_)));
    }

    #[test]
    fn test_builtin_providers() {
        let factory = SenderFactory::with_builtin_providers().unwrap();
        let codes = factory.provider_codes();
        assert!(codes.contains(&"zrwinfo".to_string()));
        assert!(codes.contains(&"wechat_work".to_string()));
        assert!(factory.batch_sender("zrwinfo").is_ok());
        assert!(factory.callback_handler("wechat_work").is_ok());
        assert!(factory.batch_sender("dingtalk").is_ok());
        assert!(factory.callback_handler("smtp").is_ok());
        assert!(factory.status_puller("smtp").is_err());
    }
}
