//! The seam between the engine and the code that actually performs a step.
//!
//! The engine treats steps as opaque: it hands an executor a
//! [`StepContext`] and applies whatever [`StepOutcome`] comes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ProviderConfig, WorkflowData};

/// Error class for executor `Err`s and panics. Never retried.
pub const CLASS_EXECUTOR_ERROR: &str = "executor_error";
/// Error class for steps that exceeded their timeout. Retryable.
pub const CLASS_TIMEOUT: &str = "timeout";
/// Error class used when no provider could be resolved for a step.
pub const CLASS_NO_PROVIDER: &str = "no_provider";
/// Error class for structurally invalid outcomes (e.g. an unknown next step).
pub const CLASS_VALIDATION: &str = "validation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// Key into the retry policy's class table
    pub class: String,
    pub message: String,
}

impl StepError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// What a step asks the engine to do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Merge `data_patch`; move to `next_step`, or finish the workflow when `None`.
    Completed {
        next_step: Option<String>,
        #[serde(default)]
        data_patch: WorkflowData,
    },
    /// Suspend until a human signs off on `data_to_approve`.
    RequiresApproval {
        description: String,
        #[serde(default)]
        data_to_approve: WorkflowData,
    },
    Failed { error: StepError, retryable: bool },
}

impl StepOutcome {
    pub fn next(step: impl Into<String>, data_patch: WorkflowData) -> Self {
        Self::Completed {
            next_step: Some(step.into()),
            data_patch,
        }
    }

    pub fn finish(data_patch: WorkflowData) -> Self {
        Self::Completed {
            next_step: None,
            data_patch,
        }
    }

    pub fn approval(description: impl Into<String>, data_to_approve: WorkflowData) -> Self {
        Self::RequiresApproval {
            description: description.into(),
            data_to_approve,
        }
    }

    pub fn failed(class: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Failed {
            error: StepError::new(class, message),
            retryable,
        }
    }

    /// Whether this outcome should count against the provider's circuit.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::Failed { retryable: true, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub units_used: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub outcome: StepOutcome,
    /// Charged against the resolved provider through the cost ledger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StepResponse {
    pub fn new(outcome: StepOutcome) -> Self {
        Self { outcome, usage: None }
    }

    pub fn with_usage(mut self, units_used: u64) -> Self {
        self.usage = Some(Usage { units_used });
        self
    }
}

impl From<StepOutcome> for StepResponse {
    fn from(outcome: StepOutcome) -> Self {
        Self::new(outcome)
    }
}

/// Everything an executor gets to see about the step it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: String,
    pub business_id: String,
    pub workflow_type: String,
    pub step_name: String,
    /// Snapshot of workflow data at the time the step was dispatched
    pub data: WorkflowData,
    /// True when a human approved this step
    pub approved: bool,
    /// 1 on the first run, incremented per retry
    pub attempt: u32,
    /// Provider resolved for AI steps; `None` for steps that need no model
    pub provider: Option<ProviderConfig>,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run one step. `Err` is treated as a non-retryable `executor_error`.
    async fn execute(&self, ctx: StepContext) -> Result<StepResponse, String>;
}
