use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::EngineError;
use crate::models::WorkflowData;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(EngineError::InvalidState(format!(
                "unknown approval status '{}'",
                other
            ))),
        }
    }
}

/// The approver's verdict on a pending request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected { reason: String },
}

impl ApprovalDecision {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> ApprovalStatus {
        match self {
            Self::Approved => ApprovalStatus::Approved,
            Self::Rejected { .. } => ApprovalStatus::Rejected,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Approved => None,
            Self::Rejected { reason } => Some(reason.as_str()),
        }
    }

    /// A rejection must say why.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            Self::Rejected { reason } if reason.trim().is_empty() => Err(EngineError::InvalidState(
                "a rejection needs a non-empty reason".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// A pause point awaiting an external human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub workflow_id: String,
    pub step_name: String,
    pub description: String,
    /// Snapshot of the `data` subset the approver is asked to sign off.
    #[serde(default)]
    pub data_to_approve: WorkflowData,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    pub status: ApprovalStatus,
}

impl ApprovalRequest {
    pub fn new(
        workflow_id: String,
        step_name: String,
        description: String,
        data_to_approve: WorkflowData,
        requested_by: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id,
            step_name,
            description,
            data_to_approve,
            requested_by,
            requested_at: super::timestamp_now(),
            approved_by: None,
            approved_at: None,
            decision_reason: None,
            status: ApprovalStatus::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}
