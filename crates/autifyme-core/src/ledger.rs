//! CostLedger: per-tenant spend against a rolling-window budget.
//!
//! Recording always persists. Crossing the budget is reported back to the
//! caller as [`BudgetExceeded`]; what happens next is decided by the
//! configured [`BudgetPolicy`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::{BudgetConfig, BudgetPolicy};
use crate::error::EngineError;
use crate::models::{timestamp_now, CostEntry, CostQuery, ProviderConfig};
use crate::store::WorkflowStore;

/// Advisory: the tenant's rolling-window spend is above its budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetExceeded {
    pub business_id: String,
    pub spend: Decimal,
    pub limit: Decimal,
}

impl std::fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "business {} spent {} of a {} budget",
            self.business_id, self.spend, self.limit
        )
    }
}

#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub entry: CostEntry,
    pub exceeded: Option<BudgetExceeded>,
}

pub struct CostLedger {
    store: Arc<dyn WorkflowStore>,
    budget: BudgetConfig,
}

impl CostLedger {
    pub fn new(store: Arc<dyn WorkflowStore>, budget: BudgetConfig) -> Self {
        Self { store, budget }
    }

    pub fn policy(&self) -> BudgetPolicy {
        self.budget.policy
    }

    pub fn window(&self) -> Duration {
        Duration::hours(i64::from(self.budget.window_hours))
    }

    pub fn budget_for(&self, business_id: &str) -> Decimal {
        self.budget
            .per_business
            .get(business_id)
            .copied()
            .unwrap_or(self.budget.default_limit)
    }

    /// `units × cost_per_unit` for the given provider.
    pub fn cost_for(provider: &ProviderConfig, units: u64) -> Decimal {
        provider.cost_for(units)
    }

    pub async fn record(
        &self,
        business_id: &str,
        provider: &str,
        model: &str,
        units_used: u64,
        cost: Decimal,
        workflow_id: Option<&str>,
    ) -> Result<RecordOutcome, EngineError> {
        if cost.is_sign_negative() {
            return Err(EngineError::Internal(format!(
                "refusing to record negative cost {} for {}",
                cost, business_id
            )));
        }
        let entry = CostEntry::new(
            business_id.to_string(),
            provider.to_string(),
            model.to_string(),
            units_used,
            cost,
            workflow_id.map(str::to_string),
        );
        self.store.append_cost(&entry).await?;
        tracing::debug!(
            "[Ledger] {} charged {} ({} units on {}/{})",
            business_id,
            cost,
            units_used,
            provider,
            model
        );

        let exceeded = self.check_budget(business_id, timestamp_now()).await?;
        if let Some(ref alert) = exceeded {
            tracing::warn!("[Ledger] Budget exceeded: {}", alert);
        }
        Ok(RecordOutcome { entry, exceeded })
    }

    /// Spend inside the rolling window ending now.
    pub async fn spend(&self, business_id: &str) -> Result<Decimal, EngineError> {
        self.spend_at(business_id, timestamp_now()).await
    }

    pub async fn spend_at(&self, business_id: &str, now: DateTime<Utc>) -> Result<Decimal, EngineError> {
        let query = CostQuery::for_business(business_id).since(now - self.window());
        let entries = self.store.query_costs(&query).await?;
        Ok(entries
            .iter()
            .filter(|e| e.timestamp <= now)
            .map(|e| e.cost)
            .sum())
    }

    pub async fn is_over_budget(&self, business_id: &str) -> Result<bool, EngineError> {
        Ok(self.check_budget(business_id, timestamp_now()).await?.is_some())
    }

    pub async fn check_budget(
        &self,
        business_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BudgetExceeded>, EngineError> {
        let spend = self.spend_at(business_id, now).await?;
        let limit = self.budget_for(business_id);
        if spend > limit {
            Ok(Some(BudgetExceeded {
                business_id: business_id.to_string(),
                spend,
                limit,
            }))
        } else {
            Ok(None)
        }
    }

    /// Every entry ever charged to the tenant, oldest first.
    pub async fn entries(&self, business_id: &str) -> Result<Vec<CostEntry>, EngineError> {
        self.store.query_costs(&CostQuery::for_business(business_id)).await
    }

    /// All-time total for the tenant. Never decreases.
    pub async fn total(&self, business_id: &str) -> Result<Decimal, EngineError> {
        Ok(self.entries(business_id).await?.iter().map(|e| e.cost).sum())
    }
}
