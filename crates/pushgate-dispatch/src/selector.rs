//! Weighted channel selection.
//!
//! Candidates for a `(channel, message type)` pair are loaded once and cached
//! together with their round-robin state. Selection runs smooth weighted
//! round robin over the best priority tier that survives exclusion and
//! circuit gating.

use crate::circuit::{CircuitBreakers, CircuitState};
use crate::error::DispatchError;
use crate::store::ChannelStore;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use pushgate_core::config::SelectorConfig;
use pushgate_core::types::{ChannelBinding, MessageType, ProviderAccount};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A selectable binding with its account and round-robin state.
#[derive(Debug, Clone)]
pub struct ChannelNode {
    pub binding: ChannelBinding,
    pub account: ProviderAccount,
    pub current_weight: i64,
}

impl ChannelNode {
    fn weight(&self) -> i64 {
        i64::from(self.binding.weight)
    }
}

/// Result of a selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub binding: ChannelBinding,
    pub account: ProviderAccount,
    /// Circuit window the attempt was counted in.
    pub generation: u64,
}

type CacheEntry = Arc<Mutex<Vec<ChannelNode>>>;

/// Channel selector with per-account circuit breakers.
pub struct ChannelSelector {
    store: Arc<dyn ChannelStore>,
    breakers: CircuitBreakers,
    circuit_gating: bool,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

fn cache_key(channel_id: u64, message_type: MessageType) -> String {
    format!("{}:{}", channel_id, message_type)
}

impl ChannelSelector {
    pub fn new(store: Arc<dyn ChannelStore>, config: &SelectorConfig) -> Self {
        Self {
            store,
            breakers: CircuitBreakers::new(config.circuit.clone()),
            circuit_gating: config.circuit_gating,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Pick a provider for one attempt.
    ///
    /// Accounts in `excluded` are avoided unless nothing else is left.
    pub async fn select(
        &self,
        channel_id: u64,
        message_type: MessageType,
        app_id: &str,
        receiver: &str,
        excluded: &BTreeSet<u64>,
    ) -> Result<Selection> {
        let entry = self
            .entry(channel_id, message_type)
            .await?
            .ok_or(DispatchError::NoChannel {
                channel_id,
                message_type,
            })?;

        let (binding, account) = {
            let mut nodes = entry.lock();
            let candidates = self.candidates(&nodes, excluded);
            let index = smooth_weighted_round_robin(&mut nodes, &candidates).ok_or(
                DispatchError::NoChannel {
                    channel_id,
                    message_type,
                },
            )?;
            (nodes[index].binding.clone(), nodes[index].account.clone())
        };

        let generation = self.breakers.begin(account.id);
        debug!(
            channel_id,
            message_type = %message_type,
            app_id,
            receiver,
            binding_id = binding.id,
            account_id = account.id,
            provider = %account.provider_code,
            "Selected channel"
        );

        Ok(Selection {
            binding,
            account,
            generation,
        })
    }

    /// Whether at least one binding is selectable for the pair.
    pub async fn has_candidates(&self, channel_id: u64, message_type: MessageType) -> Result<bool> {
        Ok(self.entry(channel_id, message_type).await?.is_some())
    }

    /// Indices of the nodes eligible for this attempt.
    fn candidates(&self, nodes: &[ChannelNode], excluded: &BTreeSet<u64>) -> Vec<usize> {
        let all: Vec<usize> = (0..nodes.len()).collect();

        let mut candidates: Vec<usize> = all
            .iter()
            .copied()
            .filter(|&i| !excluded.contains(&nodes[i].account.id))
            .collect();
        if candidates.is_empty() {
            debug!(excluded = ?excluded, "Every candidate excluded, ignoring exclusion");
            candidates = all;
        }

        if self.circuit_gating {
            let closed: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|&i| self.breakers.admits(nodes[i].account.id))
                .collect();
            if closed.is_empty() {
                warn!("Every candidate circuit is open, ignoring circuit gating");
            } else {
                candidates = closed;
            }
        }

        // Lowest priority value is the preferred tier
        let best = candidates.iter().map(|&i| nodes[i].binding.priority).min();
        candidates.retain(|&i| Some(nodes[i].binding.priority) == best);
        candidates
    }

    async fn entry(&self, channel_id: u64, message_type: MessageType) -> Result<Option<CacheEntry>> {
        let key = cache_key(channel_id, message_type);
        if let Some(entry) = self.cache.read().get(&key) {
            return Ok(Some(entry.clone()));
        }

        let nodes = self.load(channel_id, message_type).await?;
        if nodes.is_empty() {
            return Ok(None);
        }

        let mut cache = self.cache.write();
        let entry = cache
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(nodes)))
            .clone();
        Ok(Some(entry))
    }

    async fn load(&self, channel_id: u64, message_type: MessageType) -> Result<Vec<ChannelNode>> {
        let bindings = self.store.bindings(channel_id, message_type).await?;
        let mut nodes = Vec::with_capacity(bindings.len());

        for binding in bindings {
            if !binding.enabled || binding.priority <= 0 {
                continue;
            }
            match self.store.account(binding.provider_account_id).await? {
                Some(account) if account.active => nodes.push(ChannelNode {
                    binding,
                    account,
                    current_weight: 0,
                }),
                Some(_) => {
                    debug!(binding_id = binding.id, "Skipping binding with inactive account");
                }
                None => {
                    warn!(
                        binding_id = binding.id,
                        account_id = binding.provider_account_id,
                        "Binding references a missing provider account"
                    );
                }
            }
        }

        debug!(
            channel_id,
            message_type = %message_type,
            nodes = nodes.len(),
            "Loaded channel nodes"
        );
        Ok(nodes)
    }

    /// Feed an attempt outcome back into its circuit window.
    pub fn report(&self, selection: &Selection, success: bool) {
        self.breakers
            .finish(selection.account.id, selection.generation, success);
    }

    pub fn report_success(&self, account_id: u64) {
        self.breakers.record(account_id, true);
    }

    pub fn report_failure(&self, account_id: u64) {
        self.breakers.record(account_id, false);
    }

    pub fn circuit_state(&self, account_id: u64) -> CircuitState {
        self.breakers.state(account_id)
    }

    /// Drop every cached candidate list and its round-robin state.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
        info!("Channel selector cache cleared");
    }

    /// Drop cached candidate lists for one channel.
    pub fn clear_cache_by_channel(&self, channel_id: u64) {
        let prefix = format!("{}:", channel_id);
        self.cache.write().retain(|key, _| !key.starts_with(&prefix));
        info!(channel_id, "Channel selector cache cleared for channel");
    }
}

/// One round of smooth weighted round robin over `candidates`.
///
/// Every candidate gains its weight, the largest running weight wins (first
/// in list order on ties) and the winner gives back the total.
fn smooth_weighted_round_robin(nodes: &mut [ChannelNode], candidates: &[usize]) -> Option<usize> {
    let mut total = 0;
    let mut selected: Option<usize> = None;

    for &i in candidates {
        let weight = nodes[i].weight();
        nodes[i].current_weight += weight;
        total += weight;
        if selected.map_or(true, |s| nodes[i].current_weight > nodes[s].current_weight) {
            selected = Some(i);
        }
    }

    let winner = selected?;
    nodes[winner].current_weight -= total;
    Some(winner)
}
