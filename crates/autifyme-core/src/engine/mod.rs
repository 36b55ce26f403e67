//! WorkflowEngine: drives workflow instances through their steps.
//!
//! One `advance` runs one step:
//!
//!   1. workflow deadline (`workflow_timeout_minutes`)
//!   2. high-risk gate (pause at the ApprovalGate unless an APPROVED request
//!      backs the step's grant)
//!   3. budget gate for AI-costly steps
//!   4. provider resolution for AI steps
//!   5. the external `StepExecutor`, outside the workflow's critical section
//!      and within the `max_concurrent_workflows` execution slots
//!   6. cost recording, outcome application, one audit entry, persist
//!
//! The executor's result is discarded if the workflow changed while the
//! step was running (e.g. it was cancelled).

pub mod definition;
pub mod executor;
mod locks;

pub use definition::{DefinitionRegistry, StepDefinition, WorkflowDefinition, CATALOGING};
pub use executor::{
    StepContext, StepError, StepExecutor, StepOutcome, StepResponse, Usage, CLASS_EXECUTOR_ERROR,
    CLASS_NO_PROVIDER, CLASS_TIMEOUT, CLASS_VALIDATION,
};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::approval::ApprovalGate;
use crate::audit::{AuditJournal, AuditTrail};
use crate::config::{BudgetPolicy, EngineConfig, EngineSettings};
use crate::error::EngineError;
use crate::ledger::CostLedger;
use crate::models::{
    timestamp_now, ApprovalDecision, ApprovalRequest, ApprovalStatus, ProviderConfig, WorkflowData,
    WorkflowState, WorkflowStatus, APPROVALS_KEY, RESOURCE_WORKFLOW,
};
use crate::providers::ProviderRegistry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::WorkflowStore;
use locks::WorkflowLocks;

pub mod actions {
    //! Audit action names written by the engine.
    pub const CREATED: &str = "workflow.created";
    pub const STARTED: &str = "workflow.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const RETRY_SCHEDULED: &str = "step.retry_scheduled";
    pub const RESULT_DISCARDED: &str = "step.result_discarded";
    pub const PAUSED: &str = "workflow.paused";
    pub const RESUMED: &str = "workflow.resumed";
    pub const REJECTED: &str = "workflow.rejected";
    pub const COMPLETED: &str = "workflow.completed";
    pub const FAILED: &str = "workflow.failed";
    pub const CANCELLED: &str = "workflow.cancelled";
    pub const BUDGET_BLOCKED: &str = "budget.blocked";
    pub const BUDGET_ALERT: &str = "budget.alert";
}

pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    definitions: DefinitionRegistry,
    registry: Arc<ProviderRegistry>,
    ledger: Arc<CostLedger>,
    audit: Arc<AuditTrail>,
    approvals: ApprovalGate,
    retry: RetryPolicy,
    executor: Arc<dyn StepExecutor>,
    settings: EngineSettings,
    locks: Arc<WorkflowLocks>,
    /// Execution slots shared by all workflows
    slots: Semaphore,
}

/// Everything phase one of `advance` decided, handed to the executor phase.
struct Dispatch {
    state: WorkflowState,
    step: StepDefinition,
    provider: Option<ProviderConfig>,
    approved: bool,
}

enum Prepared {
    Dispatch(Box<Dispatch>),
    /// The step was gated or failed before it could run.
    Settled(WorkflowState),
}

impl WorkflowEngine {
    /// Build an engine and its collaborators from configuration.
    ///
    /// Starts with the built-in definitions; see [`Self::with_definitions`].
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn WorkflowStore>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        let mut audit = AuditTrail::new(store.clone());
        if let Some(ref dir) = config.audit.journal_dir {
            audit = audit.with_journal(AuditJournal::new(dir));
        }
        let audit = Arc::new(audit);
        Self {
            definitions: DefinitionRegistry::with_builtins(),
            registry: Arc::new(ProviderRegistry::from_config(config)),
            ledger: Arc::new(CostLedger::new(store.clone(), config.budget.clone())),
            approvals: ApprovalGate::new(store.clone(), audit.clone()),
            audit,
            retry: RetryPolicy::new(&config.retry),
            executor,
            settings: config.engine.clone(),
            locks: WorkflowLocks::new(),
            slots: Semaphore::new(config.engine.max_concurrent_workflows.max(1)),
            store,
        }
    }

    pub fn with_definitions(mut self, definitions: DefinitionRegistry) -> Self {
        self.definitions = definitions;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Create a workflow and position it RUNNING at its first step.
    pub async fn start(
        &self,
        business_id: &str,
        workflow_type: &str,
        mut initial_data: WorkflowData,
    ) -> Result<String, EngineError> {
        let definition = self.definition(workflow_type)?;
        if initial_data.remove(APPROVALS_KEY).is_some() {
            tracing::warn!(
                "[Engine] Ignoring reserved '{}' key in initial data for {} workflow",
                APPROVALS_KEY,
                workflow_type
            );
        }
        let first = definition.first_step().ok_or_else(|| {
            EngineError::InvalidWorkflowType(format!("workflow type '{}' has no steps", workflow_type))
        })?;

        let mut state = WorkflowState::new(
            uuid::Uuid::new_v4().to_string(),
            business_id.to_string(),
            workflow_type.to_string(),
            first.name.clone(),
            initial_data,
        );
        let _section = self.locks.section(&state.workflow_id).await;

        self.commit(&mut state, WorkflowStatus::Pending, actions::CREATED, &self.settings.actor, WorkflowData::new())
            .await?;

        state.status = WorkflowStatus::Running;
        self.commit(&mut state, WorkflowStatus::Pending, actions::STARTED, &self.settings.actor, WorkflowData::new())
            .await?;

        tracing::info!(
            "[Engine] Started {} workflow {} for {} at '{}'",
            workflow_type,
            state.workflow_id,
            business_id,
            state.current_step
        );
        Ok(state.workflow_id)
    }

    /// Run the current step once and apply its outcome.
    pub async fn advance(&self, workflow_id: &str) -> Result<WorkflowState, EngineError> {
        let _in_flight = self.locks.begin(workflow_id)?;

        let dispatch = {
            let _section = self.locks.section(workflow_id).await;
            match self.prepare(workflow_id).await? {
                Prepared::Settled(state) => return Ok(state),
                Prepared::Dispatch(d) => *d,
            }
        };

        let timeout = dispatch
            .step
            .timeout_secs
            .or(self.settings.default_step_timeout_secs)
            .map(Duration::from_secs);
        let ctx = StepContext {
            workflow_id: dispatch.state.workflow_id.clone(),
            business_id: dispatch.state.business_id.clone(),
            workflow_type: dispatch.state.workflow_type.clone(),
            step_name: dispatch.step.name.clone(),
            data: dispatch.state.data.clone(),
            approved: dispatch.approved,
            attempt: dispatch.state.retry_count + 1,
            provider: dispatch.provider.clone(),
        };
        tracing::debug!(
            "[Engine] Executing {} step '{}' (attempt {})",
            workflow_id,
            ctx.step_name,
            ctx.attempt
        );
        let response = {
            if self.slots.available_permits() == 0 {
                tracing::debug!(
                    "[Engine] {} waiting for one of {} execution slots",
                    workflow_id,
                    self.settings.max_concurrent_workflows
                );
            }
            let _slot = self
                .slots
                .acquire()
                .await
                .map_err(|e| EngineError::Internal(format!("execution slots closed: {}", e)))?;
            self.run_executor(ctx, timeout).await
        };

        let _section = self.locks.section(workflow_id).await;
        self.apply(dispatch, response).await
    }

    /// Resolve the pending approval of a paused workflow.
    ///
    /// When the request was already resolved through the ApprovalGate, the
    /// recorded decision is applied instead of `decision`.
    pub async fn resume(
        &self,
        workflow_id: &str,
        decision: ApprovalDecision,
        approver: &str,
    ) -> Result<WorkflowState, EngineError> {
        decision.validate()?;
        let _in_flight = self.locks.begin(workflow_id)?;
        let _section = self.locks.section(workflow_id).await;

        let mut state = self.load_required(workflow_id).await?;
        if state.status != WorkflowStatus::PausedForApproval {
            return Err(EngineError::InvalidState(format!(
                "workflow {} is {}, not {}",
                workflow_id,
                state.status,
                WorkflowStatus::PausedForApproval
            )));
        }
        let resolved = match self.approvals.pending_for(workflow_id).await? {
            Some(pending) => self.approvals.resolve(&pending.id, approver, &decision).await?,
            None => {
                let settled = self.settled_request(&state).await?.ok_or_else(|| {
                    EngineError::InvalidState(format!("workflow {} has no pending approval", workflow_id))
                })?;
                if settled.status != decision.status() {
                    tracing::warn!(
                        "[Engine] Approval {} for {} was already {}; applying it instead of {}",
                        settled.id,
                        workflow_id,
                        settled.status.as_str(),
                        decision.status().as_str()
                    );
                }
                settled
            }
        };
        self.apply_resolution(&mut state, &resolved, approver).await?;
        Ok(state)
    }

    /// Cancel a non-terminal workflow. Terminal workflows are returned unchanged.
    pub async fn cancel(&self, workflow_id: &str, actor: &str) -> Result<WorkflowState, EngineError> {
        let _section = self.locks.section(workflow_id).await;
        let mut state = self.load_required(workflow_id).await?;
        if state.status.is_terminal() {
            return Ok(state);
        }
        let from = state.status;
        state.status = WorkflowStatus::Cancelled;
        state.retry_not_before = None;
        self.commit(&mut state, from, actions::CANCELLED, actor, WorkflowData::new())
            .await?;
        tracing::info!("[Engine] Workflow {} cancelled by {}", workflow_id, actor);
        Ok(state)
    }

    // ─── Queries ───────────────────────────────────────────────────────────

    pub async fn get(&self, workflow_id: &str) -> Result<WorkflowState, EngineError> {
        self.load_required(workflow_id).await
    }

    pub async fn list(
        &self,
        business_id: &str,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowState>, EngineError> {
        self.store.list_workflows(business_id, status).await
    }

    pub async fn pending_approval(&self, workflow_id: &str) -> Result<Option<ApprovalRequest>, EngineError> {
        self.approvals.pending_for(workflow_id).await
    }

    // ─── Advance phases ────────────────────────────────────────────────────

    async fn prepare(&self, workflow_id: &str) -> Result<Prepared, EngineError> {
        let mut state = self.load_required(workflow_id).await?;
        if state.status != WorkflowStatus::Running {
            return Err(EngineError::InvalidState(format!(
                "cannot advance workflow {} in status {}",
                workflow_id, state.status
            )));
        }
        if let Some(not_before) = state.retry_not_before {
            if timestamp_now() < not_before {
                return Err(EngineError::RetryNotDue(format!(
                    "workflow {} may retry '{}' at {}",
                    workflow_id,
                    state.current_step,
                    not_before.to_rfc3339()
                )));
            }
        }

        if let Some(minutes) = self.settings.workflow_timeout_minutes {
            let limit = chrono::Duration::minutes(minutes.min(u32::MAX as u64) as i64);
            if timestamp_now() - state.created_at > limit {
                let error = StepError::new(
                    CLASS_TIMEOUT,
                    format!(
                        "workflow exceeded its {}-minute deadline at '{}'",
                        minutes, state.current_step
                    ),
                );
                self.fail_or_retry(&mut state, &error, false, WorkflowData::new()).await?;
                return Ok(Prepared::Settled(state));
            }
        }

        let definition = self.definition(&state.workflow_type)?;
        let step = match definition.step(&state.current_step) {
            Some(step) => step.clone(),
            None => {
                let error = StepError::new(
                    CLASS_VALIDATION,
                    format!("step '{}' is not part of '{}'", state.current_step, state.workflow_type),
                );
                self.fail_or_retry(&mut state, &error, false, WorkflowData::new()).await?;
                return Ok(Prepared::Settled(state));
            }
        };
        let approved = self.holds_grant(&state, &step.name).await?;

        if step.high_risk && !approved {
            let description = step
                .description
                .clone()
                .unwrap_or_else(|| format!("Approve high-risk step '{}'", step.name));
            let data_to_approve = state.data.clone();
            self.pause(&mut state, &description, data_to_approve).await?;
            return Ok(Prepared::Settled(state));
        }

        if step.ai_costly {
            if let Some(alert) = self.ledger.check_budget(&state.business_id, timestamp_now()).await? {
                let mut details = WorkflowData::new();
                details.insert("step".to_string(), json!(step.name));
                details.insert("budget".to_string(), serde_json::to_value(&alert)?);
                match self.ledger.policy() {
                    BudgetPolicy::BlockCostly => {
                        self.audit
                            .record(
                                &self.settings.actor,
                                actions::BUDGET_BLOCKED,
                                RESOURCE_WORKFLOW,
                                &state.workflow_id,
                                &state.business_id,
                                details,
                            )
                            .await?;
                        tracing::warn!("[Engine] Refusing '{}' for {}: {}", step.name, workflow_id, alert);
                        return Err(EngineError::BudgetExceeded(alert.to_string()));
                    }
                    BudgetPolicy::AlertOnly => {
                        self.audit
                            .record(
                                &self.settings.actor,
                                actions::BUDGET_ALERT,
                                RESOURCE_WORKFLOW,
                                &state.workflow_id,
                                &state.business_id,
                                details,
                            )
                            .await?;
                        tracing::warn!("[Engine] Over budget, continuing '{}' for {}: {}", step.name, workflow_id, alert);
                    }
                }
            }
        }

        let provider = match step.model_tier() {
            None => None,
            Some(tier) => match self.registry.resolve(tier, &step.capabilities) {
                Ok(p) => Some(p),
                Err(EngineError::NoProviderAvailable(msg)) => {
                    let error = StepError::new(CLASS_NO_PROVIDER, msg);
                    self.fail_or_retry(&mut state, &error, false, WorkflowData::new()).await?;
                    return Ok(Prepared::Settled(state));
                }
                Err(e) => return Err(e),
            },
        };

        Ok(Prepared::Dispatch(Box::new(Dispatch {
            state,
            step,
            provider,
            approved,
        })))
    }

    /// A recorded grant counts only when its request is APPROVED for this
    /// workflow and step.
    async fn holds_grant(&self, state: &WorkflowState, step: &str) -> Result<bool, EngineError> {
        let Some(request_id) = state.approval_grant(step) else {
            return Ok(false);
        };
        let request = self.approvals.get(request_id).await?;
        let valid = matches!(
            request,
            Some(ref r) if r.status == ApprovalStatus::Approved
                && r.workflow_id == state.workflow_id
                && r.step_name == step
        );
        if !valid {
            tracing::warn!(
                "[Engine] Ignoring unbacked approval grant for '{}' in {}",
                step,
                state.workflow_id
            );
        }
        Ok(valid)
    }

    /// Latest request for the paused step, if it is already resolved.
    async fn settled_request(&self, state: &WorkflowState) -> Result<Option<ApprovalRequest>, EngineError> {
        let requests = self.approvals.list_for(&state.workflow_id).await?;
        Ok(requests
            .into_iter()
            .rev()
            .find(|r| r.step_name == state.current_step)
            .filter(|r| !r.is_pending()))
    }

    async fn run_executor(&self, ctx: StepContext, timeout: Option<Duration>) -> StepResponse {
        let executor = self.executor.clone();
        let step_name = ctx.step_name.clone();
        let mut handle = tokio::spawn(async move { executor.execute(ctx).await });

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return StepOutcome::failed(
                        CLASS_TIMEOUT,
                        format!("step '{}' timed out after {}s", step_name, limit.as_secs_f64()),
                        true,
                    )
                    .into();
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(response)) => response,
            Ok(Err(message)) => StepOutcome::failed(CLASS_EXECUTOR_ERROR, message, false).into(),
            Err(join_error) => StepOutcome::failed(
                CLASS_EXECUTOR_ERROR,
                format!("executor panicked in '{}': {}", step_name, join_error),
                false,
            )
            .into(),
        }
    }

    async fn apply(&self, dispatch: Dispatch, response: StepResponse) -> Result<WorkflowState, EngineError> {
        let Dispatch {
            state: dispatched,
            step,
            provider,
            ..
        } = dispatch;
        let mut state = self.load_required(&dispatched.workflow_id).await?;

        let mut details = WorkflowData::new();
        details.insert("step".to_string(), json!(step.name));

        // the provider was invoked either way, so charge and feed the circuit first
        if let Some(ref provider) = provider {
            self.registry
                .record_outcome(&provider.provider_name, !response.outcome.is_provider_failure());
            details.insert("provider".to_string(), json!(provider.id()));
            if let Some(usage) = response.usage {
                let cost = CostLedger::cost_for(provider, usage.units_used);
                let recorded = self
                    .ledger
                    .record(
                        &state.business_id,
                        &provider.provider_name,
                        &provider.model_name,
                        usage.units_used,
                        cost,
                        Some(&state.workflow_id),
                    )
                    .await?;
                details.insert("unitsUsed".to_string(), json!(usage.units_used));
                details.insert("cost".to_string(), json!(cost.to_string()));
                if let Some(alert) = recorded.exceeded {
                    details.insert("budgetExceeded".to_string(), serde_json::to_value(&alert)?);
                }
            }
        }

        if state.version != dispatched.version || state.status != WorkflowStatus::Running {
            tracing::warn!(
                "[Engine] Discarding result of '{}' for {}: workflow moved to {} (v{} → v{})",
                step.name,
                state.workflow_id,
                state.status,
                dispatched.version,
                state.version
            );
            details.insert("status".to_string(), json!(state.status.as_str()));
            self.audit
                .record(
                    &self.settings.actor,
                    actions::RESULT_DISCARDED,
                    RESOURCE_WORKFLOW,
                    &state.workflow_id,
                    &state.business_id,
                    details,
                )
                .await?;
            return Ok(state);
        }

        let definition = self.definition(&state.workflow_type)?;
        match response.outcome {
            StepOutcome::Completed {
                next_step,
                mut data_patch,
            } => {
                if data_patch.remove(APPROVALS_KEY).is_some() {
                    tracing::warn!(
                        "[Engine] Ignoring reserved '{}' key in patch from '{}'",
                        APPROVALS_KEY,
                        step.name
                    );
                }
                state.merge_data(data_patch);
                if state.revoke_approval(&step.name) {
                    tracing::debug!(
                        "[Engine] Approval grant for '{}' in {} consumed",
                        step.name,
                        state.workflow_id
                    );
                }
                match next_step {
                    None => {
                        state.status = WorkflowStatus::Completed;
                        state.retry_count = 0;
                        state.retry_not_before = None;
                        self.commit(&mut state, WorkflowStatus::Running, actions::COMPLETED, &self.settings.actor, details)
                            .await?;
                        tracing::info!("[Engine] Workflow {} completed", state.workflow_id);
                    }
                    Some(next) if definition.step(&next).is_some() => {
                        details.insert("next".to_string(), json!(next));
                        state.current_step = next;
                        state.retry_count = 0;
                        state.retry_not_before = None;
                        self.commit(&mut state, WorkflowStatus::Running, actions::STEP_COMPLETED, &self.settings.actor, details)
                            .await?;
                    }
                    Some(next) => {
                        let error = StepError::new(
                            CLASS_VALIDATION,
                            format!("step '{}' named unknown next step '{}'", step.name, next),
                        );
                        self.fail_or_retry(&mut state, &error, false, details).await?;
                    }
                }
            }
            StepOutcome::RequiresApproval {
                description,
                data_to_approve,
            } => {
                self.pause(&mut state, &description, data_to_approve).await?;
            }
            StepOutcome::Failed { error, retryable } => {
                self.fail_or_retry(&mut state, &error, retryable, details).await?;
            }
        }
        Ok(state)
    }

    // ─── Transitions ───────────────────────────────────────────────────────

    /// Move a paused workflow on according to a resolved request.
    async fn apply_resolution(
        &self,
        state: &mut WorkflowState,
        resolved: &ApprovalRequest,
        approver: &str,
    ) -> Result<(), EngineError> {
        let actor = resolved.approved_by.as_deref().unwrap_or(approver).to_string();
        let mut details = WorkflowData::new();
        details.insert("approvalId".to_string(), json!(resolved.id));
        match resolved.status {
            ApprovalStatus::Approved => {
                record_approval(state, resolved, &actor);
                state.status = WorkflowStatus::Running;
                self.commit(state, WorkflowStatus::PausedForApproval, actions::RESUMED, &actor, details)
                    .await?;
                tracing::info!(
                    "[Engine] Workflow {} approved by {}; '{}' will re-run",
                    state.workflow_id,
                    actor,
                    state.current_step
                );
            }
            ApprovalStatus::Rejected => {
                let reason = resolved
                    .decision_reason
                    .as_deref()
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("rejected by {}", actor));
                details.insert("reason".to_string(), json!(reason));
                state.status = WorkflowStatus::Failed;
                state.error_message = Some(reason);
                self.commit(state, WorkflowStatus::PausedForApproval, actions::REJECTED, &actor, details)
                    .await?;
                tracing::info!("[Engine] Workflow {} rejected by {}", state.workflow_id, actor);
            }
            ApprovalStatus::Pending => {
                return Err(EngineError::Internal(format!(
                    "approval {} is still pending",
                    resolved.id
                )));
            }
        }
        Ok(())
    }

    async fn pause(
        &self,
        state: &mut WorkflowState,
        description: &str,
        data_to_approve: WorkflowData,
    ) -> Result<(), EngineError> {
        let request = self
            .approvals
            .request(
                &state.workflow_id,
                &state.current_step,
                description,
                data_to_approve,
                &self.settings.actor,
            )
            .await?;
        let mut details = WorkflowData::new();
        details.insert("step".to_string(), json!(state.current_step));
        details.insert("approvalId".to_string(), json!(request.id));
        state.status = WorkflowStatus::PausedForApproval;
        state.retry_not_before = None;
        self.commit(state, WorkflowStatus::Running, actions::PAUSED, &self.settings.actor, details)
            .await?;
        tracing::info!(
            "[Engine] Workflow {} paused for approval at '{}'",
            state.workflow_id,
            state.current_step
        );
        Ok(())
    }

    /// Schedule a retry when the policy allows one, otherwise fail the workflow.
    async fn fail_or_retry(
        &self,
        state: &mut WorkflowState,
        error: &StepError,
        retryable: bool,
        mut details: WorkflowData,
    ) -> Result<(), EngineError> {
        details.insert("errorClass".to_string(), json!(error.class));
        details.insert("error".to_string(), json!(error.message));

        if retryable {
            if let RetryDecision::Retry { attempt, not_before } =
                self.retry.decide(&error.class, state.retry_count, timestamp_now())
            {
                state.retry_count = attempt;
                state.retry_not_before = Some(not_before);
                details.insert("retry".to_string(), json!(attempt));
                details.insert("notBefore".to_string(), json!(not_before.to_rfc3339()));
                self.commit(state, WorkflowStatus::Running, actions::RETRY_SCHEDULED, &self.settings.actor, details)
                    .await?;
                tracing::warn!(
                    "[Engine] '{}' failed for {} ({}); retry {} not before {}",
                    state.current_step,
                    state.workflow_id,
                    error,
                    attempt,
                    not_before.to_rfc3339()
                );
                return Ok(());
            }
        }

        state.status = WorkflowStatus::Failed;
        state.error_message = Some(error.to_string());
        state.retry_not_before = None;
        self.commit(state, WorkflowStatus::Running, actions::FAILED, &self.settings.actor, details)
            .await?;
        tracing::warn!(
            "[Engine] Workflow {} failed at '{}': {}",
            state.workflow_id,
            state.current_step,
            error
        );
        Ok(())
    }

    /// Persist a mutation and write its audit entry.
    ///
    /// `from` is the status before the mutation; a changed status must be a
    /// legal transition.
    async fn commit(
        &self,
        state: &mut WorkflowState,
        from: WorkflowStatus,
        action: &str,
        actor: &str,
        mut details: WorkflowData,
    ) -> Result<(), EngineError> {
        if from != state.status && !from.can_transition_to(state.status) {
            return Err(EngineError::Internal(format!(
                "illegal transition {} → {} for workflow {}",
                from, state.status, state.workflow_id
            )));
        }
        state.version += 1;
        state.updated_at = timestamp_now();
        self.store.save(state).await?;

        details.insert("from".to_string(), json!(from.as_str()));
        details.insert("to".to_string(), json!(state.status.as_str()));
        details
            .entry("step".to_string())
            .or_insert_with(|| json!(state.current_step));
        self.audit
            .record(
                actor,
                action,
                RESOURCE_WORKFLOW,
                &state.workflow_id,
                &state.business_id,
                details,
            )
            .await?;
        Ok(())
    }

    // ─── Helpers ───────────────────────────────────────────────────────────

    fn definition(&self, workflow_type: &str) -> Result<&WorkflowDefinition, EngineError> {
        self.definitions.get(workflow_type).ok_or_else(|| {
            EngineError::InvalidWorkflowType(format!("'{}' is not a registered workflow type", workflow_type))
        })
    }

    async fn load_required(&self, workflow_id: &str) -> Result<WorkflowState, EngineError> {
        self.store
            .load(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))
    }
}

/// Mark the paused step as approved in `data["approvals"]`.
fn record_approval(state: &mut WorkflowState, request: &ApprovalRequest, approver: &str) {
    let grant = json!({
        "approvalId": request.id,
        "approvedBy": approver,
        "approvedAt": request.approved_at.map(|t| t.to_rfc3339()),
    });
    let approvals = state
        .data
        .entry(APPROVALS_KEY.to_string())
        .or_insert_with(|| Value::Object(WorkflowData::new()));
    if !approvals.is_object() {
        tracing::warn!(
            "[Engine] '{}' in workflow {} is not an object; replacing it",
            APPROVALS_KEY,
            state.workflow_id
        );
        *approvals = Value::Object(WorkflowData::new());
    }
    if let Some(map) = approvals.as_object_mut() {
        map.insert(request.step_name.clone(), grant);
    }
}
