use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

pub const CAP_VISION: &str = "vision";
pub const CAP_FUNCTION_CALLING: &str = "function_calling";

/// Cost/quality class of an AI model provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelTier {
    #[serde(alias = "fast")]
    Fast,
    #[serde(alias = "balanced")]
    Balanced,
    #[serde(alias = "premium")]
    Premium,
}

impl ModelTier {
    pub const ALL: [ModelTier; 3] = [ModelTier::Fast, ModelTier::Balanced, ModelTier::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "FAST",
            Self::Balanced => "BALANCED",
            Self::Premium => "PREMIUM",
        }
    }

    /// Tiers to try, in order, for a request at `self`: the tier itself, then
    /// higher tiers nearest-first, then lower tiers nearest-first.
    ///
    /// `BALANCED → PREMIUM → FAST`, `FAST → BALANCED → PREMIUM`,
    /// `PREMIUM → BALANCED → FAST`.
    pub fn fallback_chain(&self) -> Vec<ModelTier> {
        let mut chain = vec![*self];
        chain.extend(Self::ALL.iter().copied().filter(|t| t > self));
        chain.extend(Self::ALL.iter().rev().copied().filter(|t| t < self));
        chain
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FAST" => Ok(Self::Fast),
            "BALANCED" => Ok(Self::Balanced),
            "PREMIUM" => Ok(Self::Premium),
            other => Err(EngineError::Config(format!("unknown model tier '{}'", other))),
        }
    }
}

/// Static configuration for one provider/model pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// e.g. "openai", "anthropic"
    pub provider_name: String,
    pub model_name: String,
    pub tier: ModelTier,
    /// Currency amount charged per unit (token)
    pub cost_per_unit: Decimal,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Executor hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Executor hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl ProviderConfig {
    pub fn new(
        provider_name: impl Into<String>,
        model_name: impl Into<String>,
        tier: ModelTier,
        cost_per_unit: Decimal,
        capabilities: &[&str],
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            model_name: model_name.into(),
            tier,
            cost_per_unit,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn has_all(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Normalized id in format "provider/model".
    pub fn id(&self) -> String {
        format!("{}/{}", self.provider_name, self.model_name)
    }

    pub fn cost_for(&self, units: u64) -> Decimal {
        self.cost_per_unit * Decimal::from(units)
    }
}
