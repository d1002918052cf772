//! Polls delivery reports from providers that offer pulling instead of, or
//! next to, pushed callbacks.

use crate::callback::CallbackService;
use pushgate_channels::SenderFactory;
use pushgate_core::config::StatusPullConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct StatusPullScanner {
    callbacks: Arc<CallbackService>,
    factory: Arc<SenderFactory>,
    interval: Duration,
}

impl StatusPullScanner {
    pub fn new(callbacks: Arc<CallbackService>, factory: Arc<SenderFactory>, config: &StatusPullConfig) -> Self {
        Self {
            callbacks,
            factory,
            interval: config.interval(),
        }
    }

    /// Registered providers that declare status pull.
    pub fn pullable_providers(&self) -> Vec<String> {
        self.factory
            .provider_codes()
            .into_iter()
            .filter(|code| self.factory.capabilities(code).is_some_and(|c| c.status_pull))
            .collect()
    }

    /// Pull once from every pullable provider. Returns how many reports were applied.
    pub async fn scan_once(&self) -> usize {
        let mut applied = 0;
        for code in self.pullable_providers() {
            match self.callbacks.apply_pulled(&code).await {
                Ok(n) => applied += n,
                Err(e) => warn!(provider = %code, error = %e, "Status pull failed"),
            }
        }
        if applied > 0 {
            info!(applied, "Applied pulled delivery reports");
        } else {
            debug!("No pulled delivery reports");
        }
        applied
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            providers = ?self.pullable_providers(),
            "Status pull scanner started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.scan_once().await;
        }

        info!("Status pull scanner stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
