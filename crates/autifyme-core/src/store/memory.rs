use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::WorkflowStore;
use crate::error::EngineError;
use crate::models::{
    ApprovalDecision, ApprovalRequest, AuditEntry, AuditQuery, CostEntry, CostQuery,
    WorkflowState, WorkflowStatus,
};

/// In-process store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<String, WorkflowState>>,
    approvals: RwLock<Vec<ApprovalRequest>>,
    audit: RwLock<Vec<AuditEntry>>,
    costs: RwLock<Vec<CostEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, EngineError> {
        Ok(self.workflows.read().await.get(workflow_id).cloned())
    }

    async fn save(&self, state: &WorkflowState) -> Result<(), EngineError> {
        let mut workflows = self.workflows.write().await;
        if let Some(existing) = workflows.get(&state.workflow_id) {
            if existing.version + 1 != state.version {
                return Err(EngineError::ConcurrentModification(format!(
                    "workflow {} is at version {}, refusing to write version {}",
                    state.workflow_id, existing.version, state.version
                )));
            }
        }
        workflows.insert(state.workflow_id.clone(), state.clone());
        Ok(())
    }

    async fn list_workflows(
        &self,
        business_id: &str,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowState>, EngineError> {
        let workflows = self.workflows.read().await;
        let mut result: Vec<WorkflowState> = workflows
            .values()
            .filter(|w| w.business_id == business_id)
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        Ok(result)
    }

    async fn create_approval(&self, request: &ApprovalRequest) -> Result<(), EngineError> {
        let mut approvals = self.approvals.write().await;
        if let Some(existing) = approvals
            .iter()
            .find(|a| a.workflow_id == request.workflow_id && a.is_pending())
        {
            return Err(EngineError::ApprovalAlreadyPending(format!(
                "workflow {} already awaits approval {}",
                request.workflow_id, existing.id
            )));
        }
        approvals.push(request.clone());
        Ok(())
    }

    async fn get_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>, EngineError> {
        Ok(self
            .approvals
            .read()
            .await
            .iter()
            .find(|a| a.id == request_id)
            .cloned())
    }

    async fn pending_approval(&self, workflow_id: &str) -> Result<Option<ApprovalRequest>, EngineError> {
        Ok(self
            .approvals
            .read()
            .await
            .iter()
            .find(|a| a.workflow_id == workflow_id && a.is_pending())
            .cloned())
    }

    async fn list_approvals(&self, workflow_id: &str) -> Result<Vec<ApprovalRequest>, EngineError> {
        Ok(self
            .approvals
            .read()
            .await
            .iter()
            .filter(|a| a.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn resolve_approval(
        &self,
        request_id: &str,
        approved_by: &str,
        decision: &ApprovalDecision,
        at: DateTime<Utc>,
    ) -> Result<ApprovalRequest, EngineError> {
        let mut approvals = self.approvals.write().await;
        let request = approvals
            .iter_mut()
            .find(|a| a.id == request_id)
            .ok_or_else(|| EngineError::NotFound(format!("approval request {}", request_id)))?;
        if !request.is_pending() {
            return Err(EngineError::AlreadyResolved(format!(
                "approval request {} is already {}",
                request_id,
                request.status.as_str()
            )));
        }
        request.status = decision.status();
        request.approved_by = Some(approved_by.to_string());
        request.approved_at = Some(at);
        request.decision_reason = decision.reason().map(str::to_string);
        Ok(request.clone())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), EngineError> {
        self.audit.write().await.push(entry.clone());
        Ok(())
    }

    async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, EngineError> {
        let mut result: Vec<AuditEntry> = self
            .audit
            .read()
            .await
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        // stable: insertion order on equal timestamps
        result.sort_by_key(|e| e.timestamp);
        Ok(result)
    }

    async fn append_cost(&self, entry: &CostEntry) -> Result<(), EngineError> {
        self.costs.write().await.push(entry.clone());
        Ok(())
    }

    async fn query_costs(&self, query: &CostQuery) -> Result<Vec<CostEntry>, EngineError> {
        let mut result: Vec<CostEntry> = self
            .costs
            .read()
            .await
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        result.sort_by_key(|e| e.timestamp);
        Ok(result)
    }
}
