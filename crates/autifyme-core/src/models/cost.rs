use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One provider invocation, charged to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub business_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub provider: String,
    pub model: String,
    /// e.g. token count
    pub units_used: u64,
    pub cost: Decimal,
}

impl CostEntry {
    pub fn new(
        business_id: String,
        provider: String,
        model: String,
        units_used: u64,
        cost: Decimal,
        workflow_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: super::timestamp_now(),
            business_id,
            workflow_id,
            provider,
            model,
            units_used,
            cost,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CostQuery {
    pub business_id: String,
    pub workflow_id: Option<String>,
    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,
}

impl CostQuery {
    pub fn for_business(business_id: impl Into<String>) -> Self {
        Self {
            business_id: business_id.into(),
            ..Default::default()
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, entry: &CostEntry) -> bool {
        entry.business_id == self.business_id
            && self
                .workflow_id
                .as_ref()
                .map_or(true, |wf| entry.workflow_id.as_deref() == Some(wf.as_str()))
            && self.since.map_or(true, |since| entry.timestamp >= since)
    }
}
