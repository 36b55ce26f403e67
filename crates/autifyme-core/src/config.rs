//! Engine configuration: loaded from YAML and passed explicitly into each
//! component at construction time.
//!
//! ```yaml
//! providers:
//!   - provider_name: openai
//!     model_name: gpt-4o
//!     tier: BALANCED
//!     cost_per_unit: "0.000005"
//!     capabilities: [vision, function_calling]
//!
//! budget:
//!   default_limit: "50.00"
//!   window_hours: 24
//!   policy: block_costly      # block_costly | alert_only
//!   per_business:
//!     acme: "120.00"
//!
//! retry:
//!   default:
//!     strategy: exponential
//!     base_delay_ms: 200
//!     max_delay_ms: 2000
//!     max_retries: 3
//!   classes:
//!     validation:
//!       strategy: no_retry
//!
//! circuit_breaker:
//!   failure_threshold: 3
//!   cooldown_secs: 60
//!
//! audit:
//!   journal_dir: ".autifyme/audit"
//!
//! engine:
//!   max_concurrent_workflows: 5
//!   workflow_timeout_minutes: 30   # null disables the deadline
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{ModelTier, ProviderConfig, CAP_FUNCTION_CALLING, CAP_VISION};
use crate::retry::RetryStrategy;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Provider table consulted by the `ProviderRegistry`
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub engine: EngineSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            budget: BudgetConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            audit: AuditConfig::default(),
            engine: EngineSettings::default(),
        }
    }
}

/// What happens to AI-costly steps once a tenant is over budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPolicy {
    /// Refuse AI-costly steps; free steps continue (default)
    #[default]
    BlockCostly,
    /// Warn and audit, but let every step run
    AlertOnly,
}

/// Per-tenant rolling-window budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_budget_limit")]
    pub default_limit: Decimal,

    #[serde(default = "default_window_hours")]
    pub window_hours: u32,

    /// Overrides keyed by business id
    #[serde(default)]
    pub per_business: HashMap<String, Decimal>,

    #[serde(default)]
    pub policy: BudgetPolicy,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_limit: default_budget_limit(),
            window_hours: default_window_hours(),
            per_business: HashMap::new(),
            policy: BudgetPolicy::default(),
        }
    }
}

fn default_budget_limit() -> Decimal {
    Decimal::new(5000, 2)
}

fn default_window_hours() -> u32 {
    24
}

/// Retry strategies keyed by error class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Strategy for classes not listed in `classes`
    #[serde(default = "default_retry_strategy")]
    pub default: RetryStrategy,

    #[serde(default = "default_retry_classes")]
    pub classes: HashMap<String, RetryStrategy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default: default_retry_strategy(),
            classes: default_retry_classes(),
        }
    }
}

fn default_retry_strategy() -> RetryStrategy {
    RetryStrategy::Exponential {
        base_delay_ms: 200,
        max_delay_ms: 2_000,
        max_retries: 2,
    }
}

fn default_retry_classes() -> HashMap<String, RetryStrategy> {
    let mut classes = HashMap::new();
    classes.insert(
        "timeout".to_string(),
        RetryStrategy::Linear {
            delay_ms: 1_000,
            max_retries: 2,
        },
    );
    classes.insert(
        "provider_error".to_string(),
        RetryStrategy::Exponential {
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            max_retries: 3,
        },
    );
    classes.insert(
        "rate_limit".to_string(),
        RetryStrategy::Exponential {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            max_retries: 5,
        },
    );
    classes.insert("validation".to_string(), RetryStrategy::NoRetry);
    classes.insert("no_provider".to_string(), RetryStrategy::NoRetry);
    classes
}

/// Per-provider circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds a tripped provider is skipped
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditConfig {
    /// When set, every audit entry is mirrored to a JSONL journal here.
    #[serde(default)]
    pub journal_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Actor name recorded on engine-originated audit entries
    #[serde(default = "default_actor")]
    pub actor: String,

    /// Timeout applied to steps that do not declare their own
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: Option<u64>,

    /// Workflows whose step executors may run at the same time
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Deadline measured from creation; a workflow past it fails at its next advance
    #[serde(default = "default_workflow_timeout")]
    pub workflow_timeout_minutes: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            actor: default_actor(),
            default_step_timeout_secs: default_step_timeout(),
            max_concurrent_workflows: default_max_concurrent_workflows(),
            workflow_timeout_minutes: default_workflow_timeout(),
        }
    }
}

fn default_actor() -> String {
    "workflow-engine".to_string()
}

fn default_step_timeout() -> Option<u64> {
    Some(300)
}

fn default_max_concurrent_workflows() -> usize {
    5
}

fn default_workflow_timeout() -> Option<u64> {
    Some(30)
}

/// The stock provider table: two vendors per tier, priced per token.
fn default_providers() -> Vec<ProviderConfig> {
    let fc = CAP_FUNCTION_CALLING;
    let vision = CAP_VISION;
    let table = [
        ("openai", "gpt-4o-mini", ModelTier::Fast, Decimal::new(15, 8), vec![fc]),
        ("anthropic", "claude-3-haiku-20240307", ModelTier::Fast, Decimal::new(25, 8), vec![fc]),
        ("openai", "gpt-4o", ModelTier::Balanced, Decimal::new(5, 6), vec![fc, vision]),
        ("anthropic", "claude-3-sonnet-20240229", ModelTier::Balanced, Decimal::new(3, 6), vec![fc, vision]),
        ("openai", "gpt-4-turbo", ModelTier::Premium, Decimal::new(1, 5), vec![fc, vision]),
        ("anthropic", "claude-3-opus-20240229", ModelTier::Premium, Decimal::new(15, 6), vec![fc, vision]),
    ];
    table
        .into_iter()
        .map(|(provider, model, tier, cost, caps)| {
            let mut p = ProviderConfig::new(provider, model, tier, cost, &caps);
            p.max_tokens = Some(4000);
            p.temperature = Some(0.1);
            p
        })
        .collect()
}

impl EngineConfig {
    /// Parse a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Config(format!("Failed to parse config YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file '{}': {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.providers.is_empty() {
            return Err(EngineError::Config("provider table is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for p in &self.providers {
            if p.cost_per_unit.is_sign_negative() {
                return Err(EngineError::Config(format!(
                    "provider '{}' has a negative cost_per_unit",
                    p.id()
                )));
            }
            if !seen.insert(p.id()) {
                return Err(EngineError::Config(format!("duplicate provider '{}'", p.id())));
            }
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(EngineError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.engine.max_concurrent_workflows == 0 {
            return Err(EngineError::Config(
                "engine.max_concurrent_workflows must be at least 1".to_string(),
            ));
        }
        if self.engine.workflow_timeout_minutes == Some(0) {
            return Err(EngineError::Config(
                "engine.workflow_timeout_minutes must be at least 1 (or null)".to_string(),
            ));
        }
        if self.budget.window_hours == 0 {
            return Err(EngineError::Config("budget.window_hours must be at least 1".to_string()));
        }
        if self.budget.default_limit.is_sign_negative()
            || self.budget.per_business.values().any(|l| l.is_sign_negative())
        {
            return Err(EngineError::Config("budget limits must not be negative".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.providers.len(), 6);
        assert_eq!(config.budget.default_limit, Decimal::new(50, 0));
        assert_eq!(config.budget.policy, BudgetPolicy::BlockCostly);
        assert_eq!(config.engine.max_concurrent_workflows, 5);
        assert_eq!(config.engine.workflow_timeout_minutes, Some(30));
    }

    #[test]
    fn test_engine_limits() {
        let config = EngineConfig::from_yaml(
            "engine:\n  max_concurrent_workflows: 2\n  workflow_timeout_minutes: null\n",
        )
        .unwrap();
        assert_eq!(config.engine.max_concurrent_workflows, 2);
        assert_eq!(config.engine.workflow_timeout_minutes, None);
        assert_eq!(config.engine.actor, "workflow-engine");

        assert!(EngineConfig::from_yaml("engine:\n  max_concurrent_workflows: 0\n").is_err());
        assert!(EngineConfig::from_yaml("engine:\n  workflow_timeout_minutes: 0\n").is_err());
    }

    #[test]
    fn test_parse_partial_yaml_keeps_defaults() {
        let yaml = r#"
budget:
  default_limit: "10.00"
  policy: alert_only
  per_business:
    acme: "99.50"
circuit_breaker:
  failure_threshold: 5
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.budget.default_limit, Decimal::new(10, 0));
        assert_eq!(config.budget.policy, BudgetPolicy::AlertOnly);
        assert_eq!(config.budget.per_business.get("acme"), Some(&Decimal::new(9950, 2)));
        assert_eq!(config.budget.window_hours, 24);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.cooldown_secs, 60);
        assert_eq!(config.providers.len(), 6);
        assert!(config.retry.classes.contains_key("validation"));
    }

    #[test]
    fn test_parse_providers_and_retry() {
        let yaml = r#"
providers:
  - provider_name: google
    model_name: gemini-pro-vision
    tier: premium
    cost_per_unit: "0.00001"
    capabilities: [vision]
retry:
  default:
    strategy: linear
    delay_ms: 100
    max_retries: 1
  classes:
    flaky:
      strategy: exponential
      base_delay_ms: 10
      max_delay_ms: 100
      max_retries: 2
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].tier, ModelTier::Premium);
        assert!(config.providers[0].capabilities.contains("vision"));
        assert_eq!(
            config.retry.default,
            RetryStrategy::Linear {
                delay_ms: 100,
                max_retries: 1
            }
        );
        // explicit classes replace the built-in table
        assert!(!config.retry.classes.contains_key("validation"));
    }

    #[test]
    fn test_rejects_empty_providers() {
        let err = EngineConfig::from_yaml("providers: []").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_rejects_duplicate_provider() {
        let yaml = r#"
providers:
  - { provider_name: openai, model_name: gpt-4o, tier: BALANCED, cost_per_unit: "0.1" }
  - { provider_name: openai, model_name: gpt-4o, tier: PREMIUM, cost_per_unit: "0.2" }
"#;
        assert!(EngineConfig::from_yaml(yaml).is_err());
    }
}
