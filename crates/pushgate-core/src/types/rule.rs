//! Failure rules: declarative match/action records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure context a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScene {
    SendFailure,
    CallbackFailure,
}

impl RuleScene {
    pub const ALL: [RuleScene; 2] = [RuleScene::SendFailure, RuleScene::CallbackFailure];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendFailure => "send_failure",
            Self::CallbackFailure => "callback_failure",
        }
    }

    /// Action taken when no rule matches.
    ///
    /// A message that was physically sent is never retried automatically.
    pub fn default_action(&self) -> RuleAction {
        match self {
            Self::SendFailure => RuleAction::Retry,
            Self::CallbackFailure => RuleAction::Fail,
        }
    }
}

impl fmt::Display for RuleScene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery action selected by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Retry,
    SwitchProvider,
    Fail,
    Alert,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::SwitchProvider => "switch_provider",
            Self::Fail => "fail",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure rule as configured by operators.
///
/// Empty filter fields match everything. `error_code` and `error_keyword`
/// hold comma separated lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRule {
    pub id: u64,

    #[serde(default)]
    pub name: String,

    pub scene: RuleScene,

    #[serde(default)]
    pub provider_code: String,

    #[serde(default)]
    pub message_type: String,

    #[serde(default)]
    pub error_code: String,

    #[serde(default)]
    pub error_keyword: String,

    pub action: RuleAction,

    /// Action specific settings, decoded by the executor.
    #[serde(default)]
    pub action_config: serde_json::Value,

    /// Higher priorities are evaluated first.
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl FailureRule {
    /// Create an enabled rule with no filters.
    pub fn new(id: u64, scene: RuleScene, action: RuleAction) -> Self {
        Self {
            id,
            name: String::new(),
            scene,
            provider_code: String::new(),
            message_type: String::new(),
            error_code: String::new(),
            error_keyword: String::new(),
            action,
            action_config: serde_json::Value::Null,
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_provider(mut self, provider_code: impl Into<String>) -> Self {
        self.provider_code = provider_code.into();
        self
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    pub fn with_error_codes(mut self, codes: impl Into<String>) -> Self {
        self.error_code = codes.into();
        self
    }

    pub fn with_keywords(mut self, keywords: impl Into<String>) -> Self {
        self.error_keyword = keywords.into();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.action_config = config;
        self
    }
}
