//! Configuration management commands.

use anyhow::Context;
use clap::Args;
use pushgate_core::config::Config;
use pushgate_core::SecretString;
use std::path::{Path, PathBuf};

/// Config command arguments.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(clap::Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration with secrets masked
    Show {
        /// Print credentials in clear text
        #[arg(long)]
        reveal: bool,
    },

    /// Validate configuration
    Validate,

    /// Write a default configuration file
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Show configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, path: PathBuf) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Show { reveal } => {
            let mut config = load_or_default(&path)?;
            if !reveal {
                mask_secrets(&mut config);
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        ConfigCommand::Validate => {
            let config = Config::load(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            match config.validate() {
                Ok(()) => println!(
                    "Configuration is valid: {} application(s), {} provider account(s), {} channel binding(s), {} rule(s)",
                    config.applications.len(),
                    config.providers.len(),
                    config.channels.len(),
                    config.rules.len()
                ),
                Err(e) => anyhow::bail!("Configuration error: {}", e),
            }
        }

        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {}. Use --force to overwrite.",
                    path.display()
                );
            }
            Config::default().save(&path)?;
            println!("Created config file: {}", path.display());
        }

        ConfigCommand::Path => {
            println!("{}", path.display());
        }
    }

    Ok(())
}

fn load_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        Ok(Config::load(path)?)
    } else {
        Ok(Config::default())
    }
}

/// Replace every credential with its masked form.
fn mask_secrets(config: &mut Config) {
    for app in &mut config.applications {
        if !app.app_secret.is_empty() {
            app.app_secret = SecretString::new(app.app_secret.masked());
        }
    }
    for account in &mut config.providers {
        for value in account.config.values_mut() {
            *value = SecretString::new(value.masked());
        }
    }
}
