//! `autifyme workflow`: start, drive and inspect workflow instances.

use serde_json::{json, Value};

use autifyme_core::engine::WorkflowDefinition;
use autifyme_core::models::{ApprovalDecision, WorkflowState, WorkflowStatus};

use super::{parse_data, to_json, AppContext};

/// Upper bound on steps taken by `advance --all`.
const MAX_STEPS: usize = 100;

pub async fn start(
    ctx: &AppContext,
    business_id: &str,
    workflow_type: &str,
    data: Option<&str>,
) -> Result<Value, String> {
    let data = parse_data(data)?;
    let id = ctx
        .engine
        .start(business_id, workflow_type, data)
        .await
        .map_err(|e| e.to_string())?;
    let state = ctx.engine.get(&id).await.map_err(|e| e.to_string())?;
    Ok(json!({ "workflowId": id, "state": to_json(&state)? }))
}

/// Run one step, or with `all` keep going until the workflow stops running
/// or waits on a scheduled retry.
pub async fn advance(ctx: &AppContext, workflow_id: &str, all: bool) -> Result<Value, String> {
    let mut steps = Vec::new();
    let mut state = step_once(ctx, workflow_id, &mut steps).await?;
    if all {
        while keeps_running(&state) && steps.len() < MAX_STEPS {
            state = step_once(ctx, workflow_id, &mut steps).await?;
        }
    }
    Ok(json!({ "steps": steps, "state": to_json(&state)? }))
}

async fn step_once(
    ctx: &AppContext,
    workflow_id: &str,
    steps: &mut Vec<String>,
) -> Result<WorkflowState, String> {
    let before = ctx.engine.get(workflow_id).await.map_err(|e| e.to_string())?;
    let state = ctx.engine.advance(workflow_id).await.map_err(|e| e.to_string())?;
    steps.push(before.current_step);
    Ok(state)
}

fn keeps_running(state: &WorkflowState) -> bool {
    state.status == WorkflowStatus::Running && state.retry_not_before.is_none()
}

pub async fn resume(
    ctx: &AppContext,
    workflow_id: &str,
    reject: Option<&str>,
    approver: &str,
) -> Result<Value, String> {
    let decision = match reject {
        Some(reason) => ApprovalDecision::rejected(reason),
        None => ApprovalDecision::Approved,
    };
    let state = ctx
        .engine
        .resume(workflow_id, decision, approver)
        .await
        .map_err(|e| e.to_string())?;
    to_json(&state)
}

pub async fn cancel(ctx: &AppContext, workflow_id: &str, actor: &str) -> Result<Value, String> {
    let state = ctx.engine.cancel(workflow_id, actor).await.map_err(|e| e.to_string())?;
    to_json(&state)
}

pub async fn get(ctx: &AppContext, workflow_id: &str) -> Result<Value, String> {
    let state = ctx.engine.get(workflow_id).await.map_err(|e| e.to_string())?;
    let pending = ctx
        .engine
        .pending_approval(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "state": to_json(&state)?, "pendingApproval": to_json(&pending)? }))
}

pub async fn list(ctx: &AppContext, business_id: &str, status: Option<&str>) -> Result<Value, String> {
    let status = status
        .map(|s| s.parse::<WorkflowStatus>())
        .transpose()
        .map_err(|e| e.to_string())?;
    let workflows = ctx
        .engine
        .list(business_id, status)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "workflows": to_json(&workflows)? }))
}

pub fn types(ctx: &AppContext) -> Result<Value, String> {
    let definitions = ctx.engine.definitions();
    let types: Vec<Value> = definitions
        .types()
        .iter()
        .filter_map(|name| definitions.get(name))
        .map(summarize)
        .collect();
    Ok(json!({ "types": types }))
}

/// Validate a workflow YAML file without registering it.
pub fn validate(file: &str) -> Result<Value, String> {
    let definition = WorkflowDefinition::from_file(file).map_err(|e| e.to_string())?;
    Ok(json!({ "valid": true, "definition": summarize(&definition) }))
}

fn summarize(definition: &WorkflowDefinition) -> Value {
    let steps: Vec<Value> = definition
        .steps
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "highRisk": s.high_risk,
                "aiCostly": s.ai_costly,
                "tier": s.model_tier().map(|t| t.as_str()),
                "capabilities": s.capabilities,
                "next": definition.successor(&s.name).map(|n| n.name.clone()),
            })
        })
        .collect();
    json!({
        "name": definition.name,
        "description": definition.description,
        "version": definition.version,
        "steps": steps,
    })
}
