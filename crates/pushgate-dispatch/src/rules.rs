//! Failure rule engine.

use crate::store::RuleStore;
use crate::Result;
use parking_lot::RwLock;
use pushgate_core::types::{FailureRule, RuleAction, RuleScene};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Failure context to match rules against.
#[derive(Debug, Clone, Copy)]
pub struct EvaluateRequest<'a> {
    pub scene: RuleScene,
    pub provider_code: &'a str,
    pub message_type: &'a str,
    pub error_code: &'a str,
    pub error_message: &'a str,
}

/// Selected action and the rule that chose it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateResult {
    pub action: RuleAction,
    pub matched_rule: Option<FailureRule>,
}

impl EvaluateResult {
    /// Scene default, used when nothing matched.
    pub fn default_for(scene: RuleScene) -> Self {
        Self {
            action: scene.default_action(),
            matched_rule: None,
        }
    }

    pub fn rule_name(&self) -> &str {
        self.matched_rule
            .as_ref()
            .map(|r| r.name.as_str())
            .unwrap_or("default")
    }
}

/// Scene-keyed cache of enabled rules, highest priority first.
pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    cache: RwLock<HashMap<RuleScene, Arc<Vec<FailureRule>>>>,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// First matching rule's action, or the scene default.
    pub async fn evaluate(&self, request: &EvaluateRequest<'_>) -> EvaluateResult {
        let mut rules = self.cached(request.scene);
        if rules.is_empty() {
            if let Err(e) = self.refresh().await {
                warn!(scene = %request.scene, error = %e, "Failed to reload failure rules");
            }
            rules = self.cached(request.scene);
        }

        match rules.iter().find(|rule| matches(rule, request)) {
            Some(rule) => {
                info!(
                    rule_id = rule.id,
                    rule_name = %rule.name,
                    action = %rule.action,
                    scene = %request.scene,
                    provider = request.provider_code,
                    error_code = request.error_code,
                    "Failure rule matched"
                );
                EvaluateResult {
                    action: rule.action,
                    matched_rule: Some(rule.clone()),
                }
            }
            None => {
                debug!(
                    scene = %request.scene,
                    provider = request.provider_code,
                    error_code = request.error_code,
                    "No failure rule matched, using scene default"
                );
                EvaluateResult::default_for(request.scene)
            }
        }
    }

    fn cached(&self, scene: RuleScene) -> Arc<Vec<FailureRule>> {
        self.cache.read().get(&scene).cloned().unwrap_or_default()
    }

    /// Reload every scene and swap the whole cache in one step.
    pub async fn refresh(&self) -> Result<()> {
        let mut loaded = HashMap::with_capacity(RuleScene::ALL.len());
        for scene in RuleScene::ALL {
            let mut rules = self.store.enabled_rules(scene).await?;
            rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
            info!(scene = %scene, count = rules.len(), "Loaded failure rules");
            loaded.insert(scene, Arc::new(rules));
        }
        *self.cache.write() = loaded;
        Ok(())
    }

    /// Empty the cache; the next evaluation reloads.
    pub fn invalidate(&self) {
        self.cache.write().clear();
    }
}

fn matches(rule: &FailureRule, request: &EvaluateRequest<'_>) -> bool {
    if !rule.provider_code.is_empty() && rule.provider_code != request.provider_code {
        return false;
    }
    if !rule.message_type.is_empty() && rule.message_type != request.message_type {
        return false;
    }
    if !rule.error_code.is_empty()
        && !rule
            .error_code
            .split(',')
            .any(|code| code.trim() == request.error_code)
    {
        return false;
    }
    if !rule.error_keyword.is_empty() {
        let message = request.error_message.to_lowercase();
        let hit = rule
            .error_keyword
            .split(',')
            .map(|k| k.trim().to_lowercase())
            .any(|k| !k.is_empty() && message.contains(&k));
        if !hit {
            return false;
        }
    }
    true
}
