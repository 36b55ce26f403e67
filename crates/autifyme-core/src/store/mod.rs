//! Persistence seam for workflow state, approvals, audit and cost records.
//!
//! `MemoryStore` backs tests and embedded use; `SqliteStore` persists to a
//! [`Database`](crate::db::Database).

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::models::{
    ApprovalDecision, ApprovalRequest, AuditEntry, AuditQuery, CostEntry, CostQuery,
    WorkflowState, WorkflowStatus,
};

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, EngineError>;

    /// Insert or update a workflow.
    ///
    /// Updates are a compare-and-set on `version`: the stored row must be at
    /// `state.version - 1`, otherwise `ConcurrentModification` is returned
    /// and nothing is written.
    async fn save(&self, state: &WorkflowState) -> Result<(), EngineError>;

    /// Workflows of one tenant, newest first.
    async fn list_workflows(
        &self,
        business_id: &str,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowState>, EngineError>;

    /// Fails with `ApprovalAlreadyPending` if the workflow already has a
    /// pending request. The check and the insert are atomic.
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<(), EngineError>;

    async fn get_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>, EngineError>;

    async fn pending_approval(&self, workflow_id: &str) -> Result<Option<ApprovalRequest>, EngineError>;

    /// All requests for a workflow, oldest first.
    async fn list_approvals(&self, workflow_id: &str) -> Result<Vec<ApprovalRequest>, EngineError>;

    /// Move a PENDING request to APPROVED/REJECTED exactly once.
    ///
    /// `NotFound` for unknown ids, `AlreadyResolved` when the request is no
    /// longer pending.
    async fn resolve_approval(
        &self,
        request_id: &str,
        approved_by: &str,
        decision: &ApprovalDecision,
        at: DateTime<Utc>,
    ) -> Result<ApprovalRequest, EngineError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), EngineError>;

    /// Ascending by timestamp, insertion order on ties.
    async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, EngineError>;

    async fn append_cost(&self, entry: &CostEntry) -> Result<(), EngineError>;

    /// Ascending by timestamp, insertion order on ties.
    async fn query_costs(&self, query: &CostQuery) -> Result<Vec<CostEntry>, EngineError>;
}
