//! AuditTrail: append-only record of every state transition and external action.

mod journal;

pub use journal::{AuditJournal, JournalError};

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::models::{AuditEntry, AuditQuery, WorkflowData};
use crate::store::WorkflowStore;

pub struct AuditTrail {
    store: Arc<dyn WorkflowStore>,
    journal: Option<AuditJournal>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            store,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: AuditJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn journal(&self) -> Option<&AuditJournal> {
        self.journal.as_ref()
    }

    /// Persist the entry. The journal mirror is best-effort.
    pub async fn append(&self, entry: &AuditEntry) -> Result<(), EngineError> {
        self.store.append_audit(entry).await?;
        if let Some(ref journal) = self.journal {
            journal.append_safe(entry).await;
        }
        Ok(())
    }

    /// Build, append and return an entry.
    pub async fn record(
        &self,
        actor: &str,
        action: &str,
        resource: &str,
        resource_id: &str,
        business_id: &str,
        details: WorkflowData,
    ) -> Result<AuditEntry, EngineError> {
        let entry = AuditEntry::new(actor, action, resource, resource_id, business_id, details);
        self.append(&entry).await?;
        Ok(entry)
    }

    /// Entries for a tenant, ascending by timestamp.
    pub async fn query(
        &self,
        business_id: &str,
        workflow_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        let mut query = AuditQuery::for_business(business_id).between(since, until);
        query.workflow_id = workflow_id.map(str::to_string);
        self.store.query_audit(&query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RESOURCE_APPROVAL, RESOURCE_WORKFLOW};
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_query_by_workflow_includes_approval_entries() {
        let trail = AuditTrail::new(Arc::new(MemoryStore::new()));
        trail
            .record("engine", "workflow.created", RESOURCE_WORKFLOW, "wf-1", "biz", WorkflowData::new())
            .await
            .unwrap();
        let mut details = WorkflowData::new();
        details.insert("workflowId".to_string(), json!("wf-1"));
        trail
            .record("alice", "approval.approved", RESOURCE_APPROVAL, "req-1", "biz", details)
            .await
            .unwrap();
        trail
            .record("engine", "workflow.created", RESOURCE_WORKFLOW, "wf-2", "biz", WorkflowData::new())
            .await
            .unwrap();

        let entries = trail.query("biz", Some("wf-1"), None, None).await.unwrap();
        let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["workflow.created", "approval.approved"]);
        assert!(trail.query("elsewhere", None, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_journal_mirrors_appends() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::new(Arc::new(MemoryStore::new()))
            .with_journal(AuditJournal::new(dir.path()));
        let entry = trail
            .record("engine", "workflow.created", RESOURCE_WORKFLOW, "wf-1", "biz", WorkflowData::new())
            .await
            .unwrap();
        let mirrored = trail.journal().unwrap().read_all().await.unwrap();
        assert_eq!(mirrored, vec![entry]);
    }
}
