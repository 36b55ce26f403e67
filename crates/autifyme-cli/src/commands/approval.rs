//! `autifyme approval`: inspect approval requests.

use serde_json::{json, Value};

use autifyme_core::models::WorkflowStatus;

use super::{to_json, AppContext};

/// Every request of one workflow, or the pending requests of a business.
pub async fn list(
    ctx: &AppContext,
    business_id: Option<&str>,
    workflow_id: Option<&str>,
) -> Result<Value, String> {
    let approvals = match (workflow_id, business_id) {
        (Some(wf), _) => ctx
            .engine
            .approvals()
            .list_for(wf)
            .await
            .map_err(|e| e.to_string())?,
        (None, Some(biz)) => {
            let paused = ctx
                .engine
                .list(biz, Some(WorkflowStatus::PausedForApproval))
                .await
                .map_err(|e| e.to_string())?;
            let mut pending = Vec::new();
            for state in paused {
                if let Some(request) = ctx
                    .engine
                    .pending_approval(&state.workflow_id)
                    .await
                    .map_err(|e| e.to_string())?
                {
                    pending.push(request);
                }
            }
            pending
        }
        (None, None) => return Err("pass --business or --workflow".to_string()),
    };
    Ok(json!({ "approvals": to_json(&approvals)? }))
}
