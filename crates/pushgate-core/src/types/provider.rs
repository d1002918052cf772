//! Provider accounts, channel bindings, signatures and applications.

use crate::secret::SecretString;
use crate::types::MessageType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Credentials and settings for one account at a third-party provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAccount {
    pub id: u64,

    /// Provider code used to find the sender, e.g. `zrwinfo`.
    pub provider_code: String,

    #[serde(default)]
    pub name: String,

    /// Provider specific settings such as access keys and agent IDs.
    #[serde(default)]
    pub config: BTreeMap<String, SecretString>,

    #[serde(default = "default_true")]
    pub active: bool,
}

impl ProviderAccount {
    pub fn new(id: u64, provider_code: impl Into<String>) -> Self {
        Self {
            id,
            provider_code: provider_code.into(),
            name: String::new(),
            config: BTreeMap::new(),
            active: true,
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), SecretString::new(value));
        self
    }

    /// Read a setting, treating empty values as missing.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(|v| v.expose_secret())
            .filter(|v| !v.is_empty())
    }
}

/// Weighted, prioritized binding between a logical channel and a provider
/// account, with the provider-side template to use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub id: u64,
    pub channel_id: u64,
    pub message_type: MessageType,
    pub provider_account_id: u64,

    /// Template code on the provider side.
    #[serde(default)]
    pub template_code: String,

    /// Template content with `{name}` placeholders, if the provider needs it.
    #[serde(default)]
    pub template_content: String,

    /// System variable name to provider variable name.
    #[serde(default)]
    pub param_mapping: BTreeMap<String, String>,

    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Bindings with priority <= 0 are never selected.
    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ChannelBinding {
    pub fn new(id: u64, channel_id: u64, message_type: MessageType, provider_account_id: u64) -> Self {
        Self {
            id,
            channel_id,
            message_type,
            provider_account_id,
            template_code: String::new(),
            template_content: String::new(),
            param_mapping: BTreeMap::new(),
            weight: default_weight(),
            priority: default_priority(),
            enabled: true,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_template(mut self, code: impl Into<String>, content: impl Into<String>) -> Self {
        self.template_code = code.into();
        self.template_content = content.into();
        self
    }

    /// Rename template parameters to the provider's variable names.
    ///
    /// Parameters without a mapping keep their system name.
    pub fn map_params(&self, params: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        params
            .iter()
            .map(|(k, v)| {
                let key = self.param_mapping.get(k).cloned().unwrap_or_else(|| k.clone());
                (key, v.clone())
            })
            .collect()
    }
}

/// Provider-side signature registered under a channel signature name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSignature {
    pub channel_id: u64,
    pub signature_name: String,
    pub provider_account_id: u64,
    pub signature_code: String,
}

/// A client application allowed to submit tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub app_id: String,

    #[serde(default)]
    pub name: String,

    /// Key used to sign outward status notifications.
    #[serde(default)]
    pub app_secret: SecretString,

    /// Where task status changes are delivered, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,

    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_priority() -> i32 {
    1
}
