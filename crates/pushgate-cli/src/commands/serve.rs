//! Gateway server command.

use anyhow::Context;
use clap::Args;
use pushgate_channels::SenderFactory;
use pushgate_core::config::Config;
use pushgate_dispatch::Dispatcher;
use pushgate_gateway::Gateway;
use std::sync::Arc;
use tracing::{info, warn};

/// Serve command arguments.
#[derive(Args)]
pub struct ServeArgs {
    /// Bind host, overriding the config file
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port, overriding the config file
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Worker count, overriding the config file
    #[arg(short, long)]
    pub workers: Option<usize>,
}

impl ServeArgs {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(workers) = self.workers {
            config.worker.count = workers;
        }
    }
}

/// Run the dispatcher and HTTP gateway until Ctrl-C.
pub async fn run(args: ServeArgs, mut config: Config) -> anyhow::Result<()> {
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let factory = Arc::new(SenderFactory::with_builtin_providers()?);
    let known = factory.provider_codes();
    for account in config.providers.iter().filter(|a| a.active) {
        if !known.contains(&account.provider_code) {
            warn!(
                account_id = account.id,
                provider = %account.provider_code,
                "No adapter registered for provider account"
            );
        }
    }

    let server_config = config.server.clone();
    let workers = config.worker.count;
    let backend = config.storage.backend;
    let dispatcher = Arc::new(Dispatcher::open(config, factory).await?);
    dispatcher.start().await?;
    info!(workers, ?backend, providers = ?known, "Dispatcher started");

    let served = Gateway::new(server_config, dispatcher.clone()).run().await;

    // Drain workers even when the server failed to bind
    dispatcher.shutdown().await?;
    served?;
    Ok(())
}
