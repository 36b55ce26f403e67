//! `autifyme cost`: spend per business.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde_json::{json, Value};

use super::AppContext;

/// Lifetime total, rolling-window spend against budget, and a per-provider
/// breakdown.
pub async fn summary(ctx: &AppContext, business_id: &str) -> Result<Value, String> {
    let ledger = ctx.engine.ledger();
    let entries = ledger.entries(business_id).await.map_err(|e| e.to_string())?;
    let window_spend = ledger.spend(business_id).await.map_err(|e| e.to_string())?;
    let limit = ledger.budget_for(business_id);

    let mut by_provider: BTreeMap<String, Decimal> = BTreeMap::new();
    let mut units: u64 = 0;
    for entry in &entries {
        *by_provider
            .entry(format!("{}/{}", entry.provider, entry.model))
            .or_default() += entry.cost;
        units += entry.units_used;
    }
    let total: Decimal = entries.iter().map(|e| e.cost).sum();
    let by_provider: BTreeMap<String, String> = by_provider
        .into_iter()
        .map(|(k, v)| (k, v.normalize().to_string()))
        .collect();

    Ok(json!({
        "businessId": business_id,
        "entries": entries.len(),
        "unitsUsed": units,
        "total": total.normalize().to_string(),
        "windowHours": ctx.config.budget.window_hours,
        "windowSpend": window_spend.normalize().to_string(),
        "budget": limit.normalize().to_string(),
        "overBudget": window_spend > limit,
        "byProvider": by_provider,
    }))
}
