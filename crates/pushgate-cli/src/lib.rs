//! pushgate command-line interface.

pub mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pushgate_core::config::{Config, LogFormat, LoggingConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "pushgate.json5";

/// pushgate - multi-channel message dispatch gateway
#[derive(Parser)]
#[command(name = "pushgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to config file
    #[arg(short, long, env = "PUSHGATE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the dispatch gateway
    Serve(commands::serve::ServeArgs),

    /// Configuration management
    Config(commands::config::ConfigArgs),

    /// Show version information
    Version,
}

/// Run the CLI with the given arguments.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => {
            let config = load_config(cli.config.as_deref())?;
            init_tracing(cli.verbose, &config.logging);
            commands::serve::run(args, config).await
        }
        Commands::Config(args) => {
            init_tracing(cli.verbose, &LoggingConfig::default());
            commands::config::run(args, config_path(cli.config.as_deref())).await
        }
        Commands::Version => {
            println!("pushgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Resolve the config path, falling back to [`DEFAULT_CONFIG_FILE`].
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load the config file.
///
/// An explicitly named file must exist. When no path is given and the
/// default file is absent, built-in defaults are used.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = config_path(explicit);
    if explicit.is_none() && !path.exists() {
        return Ok(Config::default());
    }
    Config::load(&path).with_context(|| format!("failed to load config from {}", path.display()))
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over everything; otherwise `-v` raises the configured level.
pub fn init_tracing(verbose: u8, logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, &logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    // A subscriber may already be installed when running under a test harness
    let _ = match logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
}

fn default_directive(verbose: u8, level: &str) -> String {
    match verbose {
        0 => format!("pushgate={}", level),
        1 => "pushgate=debug".to_string(),
        _ => "pushgate=trace".to_string(),
    }
}
