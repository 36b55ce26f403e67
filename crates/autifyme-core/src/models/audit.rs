use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::WorkflowData;

/// Resource name used for entries about a workflow instance.
pub const RESOURCE_WORKFLOW: &str = "workflow";
/// Resource name used for entries about an approval request.
pub const RESOURCE_APPROVAL: &str = "approval";

/// An immutable record of one observable action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Human identifier or engine/agent name
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub business_id: String,
    #[serde(default)]
    pub details: WorkflowData,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource: impl Into<String>,
        resource_id: impl Into<String>,
        business_id: impl Into<String>,
        details: WorkflowData,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: super::timestamp_now(),
            actor: actor.into(),
            action: action.into(),
            resource: resource.into(),
            resource_id: resource_id.into(),
            business_id: business_id.into(),
            details,
        }
    }

    /// The workflow this entry belongs to, if any.
    ///
    /// Workflow entries use the workflow id as `resource_id`; other resources
    /// carry it in `details.workflowId`.
    pub fn workflow_id(&self) -> Option<&str> {
        if self.resource == RESOURCE_WORKFLOW {
            return Some(self.resource_id.as_str());
        }
        self.details.get("workflowId").and_then(|v| v.as_str())
    }
}

/// Query parameters for reading the audit trail.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub business_id: String,
    pub workflow_id: Option<String>,
    /// Inclusive lower bound
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub until: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn for_business(business_id: impl Into<String>) -> Self {
        Self {
            business_id: business_id.into(),
            ..Default::default()
        }
    }

    pub fn workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if entry.business_id != self.business_id {
            return false;
        }
        if let Some(ref wf) = self.workflow_id {
            if entry.workflow_id() != Some(wf.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_id_from_details() {
        let mut details = WorkflowData::new();
        details.insert("workflowId".into(), json!("wf-1"));
        let entry = AuditEntry::new("engine", "approval_requested", RESOURCE_APPROVAL, "ap-1", "biz", details);
        assert_eq!(entry.workflow_id(), Some("wf-1"));

        let entry = AuditEntry::new("engine", "workflow_started", RESOURCE_WORKFLOW, "wf-2", "biz", WorkflowData::new());
        assert_eq!(entry.workflow_id(), Some("wf-2"));
    }

    #[test]
    fn test_query_filters_tenant() {
        let entry = AuditEntry::new("engine", "x", RESOURCE_WORKFLOW, "wf", "biz-a", WorkflowData::new());
        assert!(AuditQuery::for_business("biz-a").matches(&entry));
        assert!(!AuditQuery::for_business("biz-b").matches(&entry));
        assert!(!AuditQuery::for_business("biz-a").workflow("other").matches(&entry));
    }
}
