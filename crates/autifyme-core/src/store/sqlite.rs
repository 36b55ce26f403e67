use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{OptionalExtension, Row};
use rust_decimal::Decimal;

use super::WorkflowStore;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{
    from_millis, ApprovalDecision, ApprovalRequest, ApprovalStatus, AuditEntry, AuditQuery,
    CostEntry, CostQuery, WorkflowData, WorkflowState, WorkflowStatus,
};

const WORKFLOW_COLUMNS: &str = "workflow_id, business_id, workflow_type, status, current_step, data, error_message, retry_count, retry_not_before, version, created_at, updated_at";
const APPROVAL_COLUMNS: &str = "id, workflow_id, step_name, description, data_to_approve, requested_by, requested_at, approved_by, approved_at, decision_reason, status";
const AUDIT_COLUMNS: &str = "id, timestamp, actor, action, resource, resource_id, business_id, details";
const COST_COLUMNS: &str = "id, timestamp, business_id, workflow_id, provider, model, units_used, cost";

#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, EngineError> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_states WHERE workflow_id = ?1",
                    WORKFLOW_COLUMNS
                ))?;
                Ok(stmt
                    .query_row(rusqlite::params![id], row_to_workflow)
                    .optional()?)
            })
            .await
    }

    async fn save(&self, state: &WorkflowState) -> Result<(), EngineError> {
        let s = state.clone();
        let data = serde_json::to_string(&s.data)?;
        self.db
            .with_conn_async(move |conn| {
                let changed = conn.execute(
                    "INSERT INTO workflow_states (workflow_id, business_id, workflow_type, status, current_step, data, error_message, retry_count, retry_not_before, version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(workflow_id) DO UPDATE SET
                       status = excluded.status,
                       current_step = excluded.current_step,
                       data = excluded.data,
                       error_message = excluded.error_message,
                       retry_count = excluded.retry_count,
                       retry_not_before = excluded.retry_not_before,
                       version = excluded.version,
                       updated_at = excluded.updated_at
                     WHERE workflow_states.version = excluded.version - 1",
                    rusqlite::params![
                        s.workflow_id,
                        s.business_id,
                        s.workflow_type,
                        s.status.as_str(),
                        s.current_step,
                        data,
                        s.error_message,
                        s.retry_count,
                        s.retry_not_before.map(|t| t.timestamp_millis()),
                        s.version as i64,
                        s.created_at.timestamp_millis(),
                        s.updated_at.timestamp_millis(),
                    ],
                )?;
                if changed == 0 {
                    return Err(EngineError::ConcurrentModification(format!(
                        "workflow {} changed underneath version {}",
                        s.workflow_id, s.version
                    )));
                }
                Ok(())
            })
            .await
    }

    async fn list_workflows(
        &self,
        business_id: &str,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowState>, EngineError> {
        let mut sql = format!(
            "SELECT {} FROM workflow_states WHERE business_id = ?1",
            WORKFLOW_COLUMNS
        );
        let mut params: Vec<Value> = vec![business_id.to_string().into()];
        if let Some(status) = status {
            params.push(status.as_str().to_string().into());
            sql.push_str(" AND status = ?2");
        }
        sql.push_str(" ORDER BY created_at DESC, workflow_id ASC");
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params), row_to_workflow)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn create_approval(&self, request: &ApprovalRequest) -> Result<(), EngineError> {
        let r = request.clone();
        let data = serde_json::to_string(&r.data_to_approve)?;
        self.db
            .with_conn_async(move |conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT id FROM approval_requests WHERE workflow_id = ?1 AND status = 'PENDING'",
                        rusqlite::params![r.workflow_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(existing) = existing {
                    return Err(already_pending(&r.workflow_id, &existing));
                }
                let inserted = conn.execute(
                    "INSERT INTO approval_requests (id, workflow_id, step_name, description, data_to_approve, requested_by, requested_at, approved_by, approved_at, decision_reason, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        r.id,
                        r.workflow_id,
                        r.step_name,
                        r.description,
                        data,
                        r.requested_by,
                        r.requested_at.timestamp_millis(),
                        r.approved_by,
                        r.approved_at.map(|t| t.timestamp_millis()),
                        r.decision_reason,
                        r.status.as_str(),
                    ],
                );
                match inserted {
                    Ok(_) => Ok(()),
                    // another process won the race on the partial unique index
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Err(already_pending(&r.workflow_id, "unknown"))
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn get_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>, EngineError> {
        let id = request_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM approval_requests WHERE id = ?1",
                    APPROVAL_COLUMNS
                ))?;
                Ok(stmt
                    .query_row(rusqlite::params![id], row_to_approval)
                    .optional()?)
            })
            .await
    }

    async fn pending_approval(&self, workflow_id: &str) -> Result<Option<ApprovalRequest>, EngineError> {
        let wf_id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM approval_requests WHERE workflow_id = ?1 AND status = 'PENDING'",
                    APPROVAL_COLUMNS
                ))?;
                Ok(stmt
                    .query_row(rusqlite::params![wf_id], row_to_approval)
                    .optional()?)
            })
            .await
    }

    async fn list_approvals(&self, workflow_id: &str) -> Result<Vec<ApprovalRequest>, EngineError> {
        let wf_id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM approval_requests WHERE workflow_id = ?1 ORDER BY requested_at ASC, rowid ASC",
                    APPROVAL_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![wf_id], row_to_approval)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn resolve_approval(
        &self,
        request_id: &str,
        approved_by: &str,
        decision: &ApprovalDecision,
        at: DateTime<Utc>,
    ) -> Result<ApprovalRequest, EngineError> {
        let id = request_id.to_string();
        let approver = approved_by.to_string();
        let decision = decision.clone();
        self.db
            .with_conn_async(move |conn| {
                let select = format!("SELECT {} FROM approval_requests WHERE id = ?1", APPROVAL_COLUMNS);
                let current = conn
                    .query_row(&select, rusqlite::params![id], row_to_approval)
                    .optional()?
                    .ok_or_else(|| EngineError::NotFound(format!("approval request {}", id)))?;
                if !current.is_pending() {
                    return Err(EngineError::AlreadyResolved(format!(
                        "approval request {} is already {}",
                        id,
                        current.status.as_str()
                    )));
                }
                conn.execute(
                    "UPDATE approval_requests
                     SET status = ?1, approved_by = ?2, approved_at = ?3, decision_reason = ?4
                     WHERE id = ?5 AND status = 'PENDING'",
                    rusqlite::params![
                        decision.status().as_str(),
                        approver,
                        at.timestamp_millis(),
                        decision.reason(),
                        id,
                    ],
                )?;
                Ok(conn.query_row(&select, rusqlite::params![id], row_to_approval)?)
            })
            .await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), EngineError> {
        let e = entry.clone();
        let details = serde_json::to_string(&e.details)?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO audit_entries (id, timestamp, actor, action, resource, resource_id, business_id, workflow_id, details)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        e.id,
                        e.timestamp.timestamp_millis(),
                        e.actor,
                        e.action,
                        e.resource,
                        e.resource_id,
                        e.business_id,
                        e.workflow_id(),
                        details,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, EngineError> {
        let mut sql = format!("SELECT {} FROM audit_entries WHERE business_id = ?1", AUDIT_COLUMNS);
        let mut params: Vec<Value> = vec![query.business_id.clone().into()];
        if let Some(ref wf) = query.workflow_id {
            params.push(wf.clone().into());
            sql.push_str(&format!(" AND workflow_id = ?{}", params.len()));
        }
        if let Some(since) = query.since {
            params.push(since.timestamp_millis().into());
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        if let Some(until) = query.until {
            params.push(until.timestamp_millis().into());
            sql.push_str(&format!(" AND timestamp <= ?{}", params.len()));
        }
        sql.push_str(" ORDER BY timestamp ASC, seq ASC");
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params), row_to_audit)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn append_cost(&self, entry: &CostEntry) -> Result<(), EngineError> {
        let e = entry.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO cost_entries (id, timestamp, business_id, workflow_id, provider, model, units_used, cost)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        e.id,
                        e.timestamp.timestamp_millis(),
                        e.business_id,
                        e.workflow_id,
                        e.provider,
                        e.model,
                        e.units_used.min(i64::MAX as u64) as i64,
                        e.cost.to_string(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn query_costs(&self, query: &CostQuery) -> Result<Vec<CostEntry>, EngineError> {
        let mut sql = format!("SELECT {} FROM cost_entries WHERE business_id = ?1", COST_COLUMNS);
        let mut params: Vec<Value> = vec![query.business_id.clone().into()];
        if let Some(ref wf) = query.workflow_id {
            params.push(wf.clone().into());
            sql.push_str(&format!(" AND workflow_id = ?{}", params.len()));
        }
        if let Some(since) = query.since {
            params.push(since.timestamp_millis().into());
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        sql.push_str(" ORDER BY timestamp ASC, seq ASC");
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params), row_to_cost)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn already_pending(workflow_id: &str, existing: &str) -> EngineError {
    EngineError::ApprovalAlreadyPending(format!(
        "workflow {} already awaits approval {}",
        workflow_id, existing
    ))
}

/// Parse a TEXT column through `FromStr`, surfacing bad values as conversion errors.
fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<WorkflowData> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_workflow(row: &Row<'_>) -> rusqlite::Result<WorkflowState> {
    let retry_not_before: Option<i64> = row.get(8)?;
    let version: i64 = row.get(9)?;
    Ok(WorkflowState {
        workflow_id: row.get(0)?,
        business_id: row.get(1)?,
        workflow_type: row.get(2)?,
        status: parse_col::<WorkflowStatus>(row, 3)?,
        current_step: row.get(4)?,
        data: json_col(row, 5)?,
        error_message: row.get(6)?,
        retry_count: row.get(7)?,
        retry_not_before: retry_not_before.map(from_millis),
        version: version.max(0) as u64,
        created_at: from_millis(row.get(10)?),
        updated_at: from_millis(row.get(11)?),
    })
}

fn row_to_approval(row: &Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    let approved_at: Option<i64> = row.get(8)?;
    Ok(ApprovalRequest {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        step_name: row.get(2)?,
        description: row.get(3)?,
        data_to_approve: json_col(row, 4)?,
        requested_by: row.get(5)?,
        requested_at: from_millis(row.get(6)?),
        approved_by: row.get(7)?,
        approved_at: approved_at.map(from_millis),
        decision_reason: row.get(9)?,
        status: parse_col::<ApprovalStatus>(row, 10)?,
    })
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        timestamp: from_millis(row.get(1)?),
        actor: row.get(2)?,
        action: row.get(3)?,
        resource: row.get(4)?,
        resource_id: row.get(5)?,
        business_id: row.get(6)?,
        details: json_col(row, 7)?,
    })
}

fn row_to_cost(row: &Row<'_>) -> rusqlite::Result<CostEntry> {
    let units: i64 = row.get(6)?;
    Ok(CostEntry {
        id: row.get(0)?,
        timestamp: from_millis(row.get(1)?),
        business_id: row.get(2)?,
        workflow_id: row.get(3)?,
        provider: row.get(4)?,
        model: row.get(5)?,
        units_used: units.max(0) as u64,
        cost: parse_col::<Decimal>(row, 7)?,
    })
}
