//! Core error type for the AutifyME engine.
//!
//! `EngineError` is returned by every public API in this crate: stores,
//! registry, ledger, approval gate and the workflow engine itself.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow type: {0}")]
    InvalidWorkflowType(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Approval already pending: {0}")]
    ApprovalAlreadyPending(String),

    #[error("Approval already resolved: {0}")]
    AlreadyResolved(String),

    #[error("No provider available: {0}")]
    NoProviderAvailable(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Retry not due: {0}")]
    RetryNotDue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Programmer/usage errors returned synchronously to the caller.
    /// The engine never retries these on its own.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidState(_)
                | EngineError::ConcurrentModification(_)
                | EngineError::ApprovalAlreadyPending(_)
                | EngineError::AlreadyResolved(_)
                | EngineError::InvalidWorkflowType(_)
                | EngineError::RetryNotDue(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("JSON error: {}", e))
    }
}
