//! `autifyme audit`: query the audit trail.

use serde_json::{json, Value};

use super::{parse_time, to_json, AppContext};

pub async fn query(
    ctx: &AppContext,
    business_id: &str,
    workflow_id: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
) -> Result<Value, String> {
    let entries = ctx
        .engine
        .audit()
        .query(business_id, workflow_id, parse_time(since)?, parse_time(until)?)
        .await
        .map_err(|e| e.to_string())?;
    Ok(json!({ "count": entries.len(), "entries": to_json(&entries)? }))
}
