use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// Opaque mapping of step-produced values.
pub type WorkflowData = serde_json::Map<String, serde_json::Value>;

/// Key under which granted approvals are recorded in `WorkflowState::data`.
pub const APPROVALS_KEY: &str = "approvals";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    PausedForApproval,
    Failed,
    Completed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::PausedForApproval => "PAUSED_FOR_APPROVAL",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// COMPLETED, FAILED and CANCELLED accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The engine's state machine.
    ///
    /// ```text
    /// PENDING → RUNNING → {PAUSED_FOR_APPROVAL ⇄ RUNNING} → {COMPLETED | FAILED | CANCELLED}
    /// ```
    ///
    /// Any non-terminal state may be cancelled; a paused workflow may fail
    /// (rejection) but never complete without passing through RUNNING.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, PausedForApproval)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (PausedForApproval, Running)
                | (PausedForApproval, Failed)
                | (PausedForApproval, Cancelled)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED_FOR_APPROVAL" => Ok(Self::PausedForApproval),
            "FAILED" => Ok(Self::Failed),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(EngineError::InvalidState(format!(
                "unknown workflow status '{}'",
                other
            ))),
        }
    }
}

/// One running instance of a multi-step business process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub workflow_id: String,
    pub business_id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    /// Step about to run, or awaiting resumption.
    pub current_step: String,
    #[serde(default)]
    pub data: WorkflowData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Retries already spent on `current_step`.
    #[serde(default)]
    pub retry_count: u32,
    /// Scheduling directive: do not re-invoke `current_step` before this instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_not_before: Option<DateTime<Utc>>,
    /// Bumped on every persisted mutation.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(
        workflow_id: String,
        business_id: String,
        workflow_type: String,
        first_step: String,
        data: WorkflowData,
    ) -> Self {
        let now = super::timestamp_now();
        Self {
            workflow_id,
            business_id,
            workflow_type,
            status: WorkflowStatus::Pending,
            current_step: first_step,
            data,
            error_message: None,
            retry_count: 0,
            retry_not_before: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Approval request id recorded as the grant for `step`, if any.
    ///
    /// The engine only honours a grant whose request is APPROVED in the store.
    pub fn approval_grant(&self, step: &str) -> Option<&str> {
        self.data
            .get(APPROVALS_KEY)
            .and_then(|v| v.get(step))
            .and_then(|grant| grant.get("approvalId"))
            .and_then(|id| id.as_str())
    }

    /// Whether `step` carries a grant in `data`.
    pub fn is_step_approved(&self, step: &str) -> bool {
        self.approval_grant(step).is_some()
    }

    /// Drop the grant for `step`; a grant covers one completed run.
    pub fn revoke_approval(&mut self, step: &str) -> bool {
        self.data
            .get_mut(APPROVALS_KEY)
            .and_then(|v| v.as_object_mut())
            .and_then(|grants| grants.remove(step))
            .is_some()
    }

    /// Merge a step's data patch. Keys are added or overwritten, never removed.
    pub fn merge_data(&mut self, patch: WorkflowData) {
        for (key, value) in patch {
            self.data.insert(key, value);
        }
    }
}
