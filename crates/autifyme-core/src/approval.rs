//! ApprovalGate: suspends a workflow pending a human decision.
//!
//! At most one request per workflow may be PENDING, and each request is
//! resolved exactly once. Both rules are enforced atomically by the store.

use std::sync::Arc;

use serde_json::json;

use crate::audit::AuditTrail;
use crate::error::EngineError;
use crate::models::{
    timestamp_now, ApprovalDecision, ApprovalRequest, WorkflowData, RESOURCE_APPROVAL,
};
use crate::store::WorkflowStore;

pub struct ApprovalGate {
    store: Arc<dyn WorkflowStore>,
    audit: Arc<AuditTrail>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn WorkflowStore>, audit: Arc<AuditTrail>) -> Self {
        Self { store, audit }
    }

    pub async fn request(
        &self,
        workflow_id: &str,
        step_name: &str,
        description: &str,
        data_to_approve: WorkflowData,
        requested_by: &str,
    ) -> Result<ApprovalRequest, EngineError> {
        let business_id = self.business_of(workflow_id).await?;
        let request = ApprovalRequest::new(
            workflow_id.to_string(),
            step_name.to_string(),
            description.to_string(),
            data_to_approve,
            requested_by.to_string(),
        );
        self.store.create_approval(&request).await?;

        let mut details = WorkflowData::new();
        details.insert("workflowId".to_string(), json!(workflow_id));
        details.insert("stepName".to_string(), json!(step_name));
        details.insert("description".to_string(), json!(description));
        self.audit
            .record(
                requested_by,
                "approval.requested",
                RESOURCE_APPROVAL,
                &request.id,
                &business_id,
                details,
            )
            .await?;

        tracing::info!(
            "[ApprovalGate] Approval {} requested for {} step '{}'",
            request.id,
            workflow_id,
            step_name
        );
        Ok(request)
    }

    pub async fn resolve(
        &self,
        request_id: &str,
        approved_by: &str,
        decision: &ApprovalDecision,
    ) -> Result<ApprovalRequest, EngineError> {
        decision.validate()?;
        let resolved = self
            .store
            .resolve_approval(request_id, approved_by, decision, timestamp_now())
            .await?;
        let business_id = self.business_of(&resolved.workflow_id).await?;

        let mut details = WorkflowData::new();
        details.insert("workflowId".to_string(), json!(resolved.workflow_id));
        details.insert("stepName".to_string(), json!(resolved.step_name));
        if let Some(reason) = decision.reason() {
            details.insert("reason".to_string(), json!(reason));
        }
        let action = format!("approval.{}", decision.status().as_str().to_ascii_lowercase());
        self.audit
            .record(
                approved_by,
                &action,
                RESOURCE_APPROVAL,
                &resolved.id,
                &business_id,
                details,
            )
            .await?;

        tracing::info!(
            "[ApprovalGate] Approval {} {} by {}",
            resolved.id,
            resolved.status.as_str(),
            approved_by
        );
        Ok(resolved)
    }

    pub async fn get(&self, request_id: &str) -> Result<Option<ApprovalRequest>, EngineError> {
        self.store.get_approval(request_id).await
    }

    pub async fn pending_for(&self, workflow_id: &str) -> Result<Option<ApprovalRequest>, EngineError> {
        self.store.pending_approval(workflow_id).await
    }

    pub async fn list_for(&self, workflow_id: &str) -> Result<Vec<ApprovalRequest>, EngineError> {
        self.store.list_approvals(workflow_id).await
    }

    async fn business_of(&self, workflow_id: &str) -> Result<String, EngineError> {
        self.store
            .load(workflow_id)
            .await?
            .map(|w| w.business_id)
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))
    }
}
