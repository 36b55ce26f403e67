//! `autifyme provider`: inspect the provider table and routing.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use autifyme_core::models::ModelTier;

use super::{to_json, AppContext};

pub fn list(ctx: &AppContext) -> Result<Value, String> {
    let registry = ctx.engine.registry();
    let providers: Vec<Value> = registry
        .providers()
        .iter()
        .map(|p| {
            json!({
                "id": p.id(),
                "tier": p.tier.as_str(),
                "costPerUnit": p.cost_per_unit.normalize().to_string(),
                "capabilities": p.capabilities,
                "circuit": registry.circuit_state(&p.provider_name).to_string(),
            })
        })
        .collect();
    Ok(json!({ "providers": providers }))
}

/// Show which provider a step at `tier` needing `capabilities` would get.
pub fn resolve(ctx: &AppContext, tier: &str, capabilities: &[String]) -> Result<Value, String> {
    let tier = tier.parse::<ModelTier>().map_err(|e| e.to_string())?;
    let required: BTreeSet<String> = capabilities.iter().cloned().collect();
    let provider = ctx
        .engine
        .registry()
        .resolve(tier, &required)
        .map_err(|e| e.to_string())?;
    Ok(json!({
        "requestedTier": tier.as_str(),
        "fellBack": provider.tier != tier,
        "provider": to_json(&provider)?,
    }))
}
