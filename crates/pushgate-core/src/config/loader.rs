//! Configuration loading and persistence.

use super::{Config, StorageBackend};
use crate::error::ConfigError;
use crate::types::RuleAction;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        debug!(path = %path.display(), "Loading configuration");
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Json5(e.to_string()))
    }

    /// Save configuration to a file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_json5()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write atomically
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Serialize to JSON5 string.
    pub fn to_json5(&self) -> Result<String, ConfigError> {
        // json5 has no serializer; plain JSON is valid JSON5
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the configuration, collecting all errors before returning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        // 1. Runtime knobs
        if self.server.port == 0 {
            errors.push("Server port cannot be 0".to_string());
        }
        if self.worker.count == 0 {
            errors.push("Worker count must be at least 1".to_string());
        }
        if self.queue.read_count == 0 {
            errors.push("Queue read_count must be at least 1".to_string());
        }
        if self.queue.block_secs == 0 {
            errors.push("Queue block_secs must be at least 1".to_string());
        }
        if self.scheduler.interval_secs == 0 || self.scheduler.batch_size == 0 {
            errors.push("Scheduler interval_secs and batch_size must be positive".to_string());
        }
        if self.send_timeout_secs == 0 {
            errors.push("send_timeout_secs must be positive".to_string());
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.as_os_str().is_empty() {
            errors.push("Storage path is required for the sqlite backend".to_string());
        }
        if self.status_pull.enabled && self.status_pull.interval_secs == 0 {
            errors.push("Status pull interval_secs must be positive".to_string());
        }

        // 2. Circuit breaker thresholds
        let circuit = &self.selector.circuit;
        if !(circuit.failure_threshold > 0.0 && circuit.failure_threshold <= 1.0) {
            errors.push(format!(
                "Circuit failure_threshold must be in (0, 1], got {}",
                circuit.failure_threshold
            ));
        }
        if circuit.max_requests == 0 {
            errors.push("Circuit max_requests must be at least 1".to_string());
        }

        // 3. Applications
        let mut app_ids = HashSet::new();
        for app in &self.applications {
            if !app_ids.insert(app.app_id.as_str()) {
                errors.push(format!("Duplicate application '{}'", app.app_id));
            }
            if let Some(notify_url) = &app.notify_url {
                if let Err(e) = check_http_url(notify_url) {
                    errors.push(format!("Application '{}': notify_url {}", app.app_id, e));
                }
            }
        }

        // 4. Provider accounts
        let mut account_ids = HashSet::new();
        for account in &self.providers {
            if !account_ids.insert(account.id) {
                errors.push(format!("Duplicate provider account id {}", account.id));
            }
            if account.provider_code.is_empty() {
                errors.push(format!("Provider account {} has no provider_code", account.id));
            }
        }

        // 5. Channel bindings must point at known accounts
        let mut binding_ids = HashSet::new();
        for binding in &self.channels {
            if !binding_ids.insert(binding.id) {
                errors.push(format!("Duplicate channel binding id {}", binding.id));
            }
            if !account_ids.contains(&binding.provider_account_id) {
                errors.push(format!(
                    "Channel binding {}: unknown provider account {}",
                    binding.id, binding.provider_account_id
                ));
            }
        }

        for signature in &self.signatures {
            if !account_ids.contains(&signature.provider_account_id) {
                errors.push(format!(
                    "Signature '{}': unknown provider account {}",
                    signature.signature_name, signature.provider_account_id
                ));
            }
        }

        // 6. Rules
        let mut rule_ids = HashSet::new();
        for rule in &self.rules {
            if !rule_ids.insert(rule.id) {
                errors.push(format!("Duplicate rule id {}", rule.id));
            }
            if !(rule.action_config.is_null() || rule.action_config.is_object()) {
                errors.push(format!("Rule {}: action_config must be an object", rule.id));
            }
            if rule.action == RuleAction::Alert {
                if let Some(url) = rule.action_config.get("webhook_url").and_then(|v| v.as_str()) {
                    if let Err(e) = check_http_url(url) {
                        errors.push(format!("Rule {}: webhook_url {}", rule.id, e));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }
}

fn check_http_url(raw: &str) -> Result<(), String> {
    let parsed = url::Url::parse(raw).map_err(|e| format!("is invalid: {}", e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("has unsupported scheme '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelBinding, FailureRule, MessageType, ProviderAccount, RuleScene};

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_parse_json5_with_comments() {
        let config = Config::parse(
            r#"{
                // local development
                server: { port: 9000 },
                worker: { count: 2 },
                providers: [{ id: 1, provider_code: "zrwinfo", config: { access_key: "ak" } }],
                channels: [{ id: 10, channel_id: 1, message_type: "sms", provider_account_id: 1, weight: 5 }],
                rules: [{ id: 1, scene: "send_failure", action: "fail", error_keyword: "invalid phone", priority: 100 }],
            }"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.worker.count, 2);
        assert_eq!(config.queue.stream, "push:stream:messages");
        assert_eq!(config.channels[0].weight, 5);
        assert_eq!(config.channels[0].priority, 1);
        assert!(config.rules[0].enabled);
        assert_eq!(config.providers[0].setting("access_key"), Some("ak"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.worker.count = 0;
        config.channels.push(ChannelBinding::new(1, 1, MessageType::Sms, 42));
        config.rules.push(FailureRule::new(1, RuleScene::SendFailure, RuleAction::Retry));
        config.rules.push(FailureRule::new(1, RuleScene::SendFailure, RuleAction::Fail));

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("port"));
        assert!(err.contains("Worker count"));
        assert!(err.contains("unknown provider account 42"));
        assert!(err.contains("Duplicate rule id 1"));
    }

    #[test]
    fn test_validate_alert_webhook_scheme() {
        let mut config = Config::default();
        config.providers.push(ProviderAccount::new(1, "zrwinfo"));
        config.rules.push(
            FailureRule::new(3, RuleScene::SendFailure, RuleAction::Alert)
                .with_config(serde_json::json!({ "webhook_url": "ftp://alerts.local" })),
        );
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unsupported scheme"));
    }

    #[test]
    fn test_parse_sqlite_storage() {
        let config = Config::parse(
            r#"{
                storage: { backend: "sqlite", path: "/var/lib/pushgate/queue.db" },
                status_pull: { interval_secs: 30 },
            }"#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(
            config.storage.path,
            std::path::PathBuf::from("/var/lib/pushgate/queue.db")
        );
        assert!(config.status_pull.enabled);
        assert_eq!(config.status_pull.interval_secs, 30);

        assert_eq!(Config::default().storage.backend, StorageBackend::Memory);
    }
}
