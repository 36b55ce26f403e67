use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use super::circuit::{CircuitBreaker, CircuitState};
use crate::config::{CircuitBreakerConfig, EngineConfig};
use crate::error::EngineError;
use crate::models::{ModelTier, ProviderConfig};

/// Resolves "a model of tier X with capabilities Y" to a concrete provider.
///
/// Providers are indexed by tier and kept sorted by `cost_per_unit`
/// (configuration order breaks ties), so the first eligible entry is always
/// the cheapest one.
pub struct ProviderRegistry {
    by_tier: RwLock<HashMap<ModelTier, Vec<ProviderConfig>>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    breaker_config: CircuitBreakerConfig,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderConfig>, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            by_tier: RwLock::new(index_by_tier(providers)),
            breakers: Mutex::new(HashMap::new()),
            breaker_config,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.providers.clone(), config.circuit_breaker.clone())
    }

    /// Replace the provider table (periodic reload). Circuit state is kept.
    pub fn reload(&self, providers: Vec<ProviderConfig>) {
        let index = index_by_tier(providers);
        let mut guard = self.by_tier.write().unwrap_or_else(|e| e.into_inner());
        *guard = index;
        tracing::info!("[Registry] Provider table reloaded");
    }

    /// All configured providers, cheapest first within each tier.
    pub fn providers(&self) -> Vec<ProviderConfig> {
        let guard = self.by_tier.read().unwrap_or_else(|e| e.into_inner());
        ModelTier::ALL
            .iter()
            .filter_map(|t| guard.get(t))
            .flat_map(|list| list.iter().cloned())
            .collect()
    }

    pub fn resolve(
        &self,
        tier: ModelTier,
        required_capabilities: &BTreeSet<String>,
    ) -> Result<ProviderConfig, EngineError> {
        self.resolve_at(tier, required_capabilities, Utc::now())
    }

    /// Cheapest provider at `tier` with every required capability whose
    /// circuit admits a request; otherwise the same search down the tier's
    /// fallback chain. Returning a half-open provider claims its trial.
    pub fn resolve_at(
        &self,
        tier: ModelTier,
        required_capabilities: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<ProviderConfig, EngineError> {
        let table = self.by_tier.read().unwrap_or_else(|e| e.into_inner());
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());

        for candidate_tier in tier.fallback_chain() {
            let Some(candidates) = table.get(&candidate_tier) else {
                continue;
            };
            for provider in candidates {
                if !provider.has_all(required_capabilities) {
                    continue;
                }
                let allowed = breakers
                    .get_mut(&provider.provider_name)
                    .map_or(true, |b| b.allows_at(now));
                if !allowed {
                    tracing::debug!(
                        "[Registry] Skipping {} (circuit not admitting)",
                        provider.id()
                    );
                    continue;
                }
                if candidate_tier != tier {
                    tracing::info!(
                        "[Registry] No {} provider for {:?}; falling back to {} ({})",
                        tier,
                        required_capabilities,
                        candidate_tier,
                        provider.id()
                    );
                }
                return Ok(provider.clone());
            }
        }

        Err(EngineError::NoProviderAvailable(format!(
            "tier={} capabilities={:?}",
            tier, required_capabilities
        )))
    }

    /// Feed the provider's circuit breaker.
    pub fn record_outcome(&self, provider_name: &str, success: bool) {
        self.record_outcome_at(provider_name, success, Utc::now());
    }

    pub fn record_outcome_at(&self, provider_name: &str, success: bool, now: DateTime<Utc>) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = breakers
            .entry(provider_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(&self.breaker_config));
        if success {
            breaker.record_success();
        } else if breaker.record_failure_at(now) {
            tracing::warn!(
                "[Registry] Circuit opened for provider '{}' after {} consecutive failures",
                provider_name,
                breaker.consecutive_failures()
            );
        }
    }

    pub fn circuit_state(&self, provider_name: &str) -> CircuitState {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .get_mut(provider_name)
            .map_or(CircuitState::Closed, |b| b.state_at(Utc::now()))
    }
}

fn index_by_tier(providers: Vec<ProviderConfig>) -> HashMap<ModelTier, Vec<ProviderConfig>> {
    let mut index: HashMap<ModelTier, Vec<ProviderConfig>> = HashMap::new();
    for p in providers {
        index.entry(p.tier).or_default().push(p);
    }
    for list in index.values_mut() {
        // stable sort keeps configuration order on equal cost
        list.sort_by(|a, b| a.cost_per_unit.cmp(&b.cost_per_unit));
    }
    index
}
