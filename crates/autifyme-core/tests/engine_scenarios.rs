//! End-to-end engine behaviour against both store backends.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::Notify;

use autifyme_core::config::{BudgetPolicy, EngineConfig};
use autifyme_core::engine::{
    actions, DefinitionRegistry, StepContext, StepExecutor, StepOutcome, StepResponse,
    WorkflowDefinition, CATALOGING, CLASS_EXECUTOR_ERROR, CLASS_NO_PROVIDER, CLASS_TIMEOUT,
    CLASS_VALIDATION,
};
use autifyme_core::models::{
    ApprovalDecision, ApprovalStatus, ModelTier, ProviderConfig, WorkflowData, WorkflowStatus,
    APPROVALS_KEY, CAP_VISION, RESOURCE_WORKFLOW,
};
use autifyme_core::retry::RetryStrategy;
use autifyme_core::{Database, EngineError, MemoryStore, SqliteStore, WorkflowEngine, WorkflowStore};

// ─── Test executor ─────────────────────────────────────────────────────────

enum Script {
    Respond(StepResponse),
    Fail(String),
    Panic,
    Block {
        started: Arc<Notify>,
        release: Arc<Notify>,
        then: StepResponse,
    },
    Sleep(Duration),
}

/// Plays queued scripts per step; unscripted steps walk the cataloging flow.
#[derive(Default)]
struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    calls: Mutex<Vec<StepContext>>,
}

impl ScriptedExecutor {
    fn push(&self, step: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(step.to_string())
            .or_default()
            .push_back(script);
    }

    fn calls_for(&self, step: &str) -> Vec<StepContext> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.step_name == step)
            .cloned()
            .collect()
    }
}

fn walk(step: &str) -> StepResponse {
    let next = match step {
        "intake" => Some("classify"),
        "classify" => Some("enrich"),
        "enrich" => Some("publish"),
        _ => None,
    };
    let mut patch = WorkflowData::new();
    patch.insert(format!("{}_done", step), json!(true));
    match next {
        Some(n) => StepOutcome::next(n, patch).into(),
        None => StepOutcome::finish(patch).into(),
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: StepContext) -> Result<StepResponse, String> {
        self.calls.lock().unwrap().push(ctx.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&ctx.step_name)
            .and_then(|q| q.pop_front());
        match script {
            None => Ok(walk(&ctx.step_name)),
            Some(Script::Respond(r)) => Ok(r),
            Some(Script::Fail(message)) => Err(message),
            Some(Script::Panic) => panic!("executor blew up"),
            Some(Script::Block {
                started,
                release,
                then,
            }) => {
                started.notify_one();
                release.notified().await;
                Ok(then)
            }
            Some(Script::Sleep(d)) => {
                tokio::time::sleep(d).await;
                Ok(walk(&ctx.step_name))
            }
        }
    }
}

// ─── Fixtures ──────────────────────────────────────────────────────────────

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    let immediate = RetryStrategy::Exponential {
        base_delay_ms: 0,
        max_delay_ms: 0,
        max_retries: 2,
    };
    config.retry.default = immediate.clone();
    config.retry.classes.insert("provider_error".to_string(), immediate);
    config.retry.classes.insert(
        "timeout".to_string(),
        RetryStrategy::Linear {
            delay_ms: 0,
            max_retries: 1,
        },
    );
    config
}

fn backends() -> Vec<(&'static str, Arc<dyn WorkflowStore>)> {
    let memory: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
    let sqlite: Arc<dyn WorkflowStore> =
        Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
    vec![("memory", memory), ("sqlite", sqlite)]
}

fn engine_with(
    config: &EngineConfig,
    store: Arc<dyn WorkflowStore>,
) -> (Arc<WorkflowEngine>, Arc<ScriptedExecutor>) {
    let executor = Arc::new(ScriptedExecutor::default());
    let engine = WorkflowEngine::new(config, store, executor.clone());
    (Arc::new(engine), executor)
}

fn image_data() -> WorkflowData {
    let mut data = WorkflowData::new();
    data.insert("image_url".to_string(), json!("https://cdn.example/p1.png"));
    data
}

/// Workflow-resource entries that record a state mutation.
async fn transitions(engine: &WorkflowEngine, business: &str, id: &str) -> Vec<String> {
    engine
        .audit()
        .query(business, Some(id), None, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.resource == RESOURCE_WORKFLOW)
        .filter(|e| {
            !matches!(
                e.action.as_str(),
                actions::BUDGET_BLOCKED | actions::BUDGET_ALERT | actions::RESULT_DISCARDED
            )
        })
        .map(|e| e.action)
        .collect()
}

fn approval_needed() -> Script {
    let mut snapshot = WorkflowData::new();
    snapshot.insert("category".to_string(), json!("sneakers"));
    Script::Respond(StepOutcome::approval("Confirm the detected category", snapshot).into())
}

// ─── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_start_and_advance_to_classify() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();

        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Running, "{}", name);
        assert_eq!(state.current_step, "classify", "{}", name);
        assert_eq!(state.data.get("intake_done"), Some(&json!(true)));
        assert_eq!(state.data.get("image_url"), Some(&json!("https://cdn.example/p1.png")));

        let intake = executor.calls_for("intake");
        assert_eq!(intake.len(), 1);
        assert!(intake[0].provider.is_none());
        assert_eq!(intake[0].attempt, 1);
        assert!(!intake[0].approved);

        assert_eq!(
            transitions(&engine, "biz-1", &id).await,
            vec![actions::CREATED, actions::STARTED, actions::STEP_COMPLETED]
        );
        assert_eq!(state.version, 3);
    }
}

#[tokio::test]
async fn scenario_b_requires_approval_pauses_with_one_request() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        engine.advance(&id).await.unwrap();

        executor.push("classify", approval_needed());
        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::PausedForApproval, "{}", name);
        assert_eq!(state.current_step, "classify");

        let approvals = engine.approvals().list_for(&id).await.unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].step_name, "classify");
        assert_eq!(approvals[0].status, ApprovalStatus::Pending);
        assert_eq!(approvals[0].data_to_approve.get("category"), Some(&json!("sneakers")));

        let err = engine.advance(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)), "{}", name);
    }
}

#[tokio::test]
async fn scenario_c_rejection_fails_with_reason() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        engine.advance(&id).await.unwrap();
        executor.push("classify", approval_needed());
        engine.advance(&id).await.unwrap();

        let state = engine
            .resume(&id, ApprovalDecision::rejected("photo is blurry"), "alice")
            .await
            .unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed, "{}", name);
        assert_eq!(state.error_message.as_deref(), Some("photo is blurry"));

        let request = &engine.approvals().list_for(&id).await.unwrap()[0];
        assert_eq!(request.status, ApprovalStatus::Rejected);
        assert_eq!(request.approved_by.as_deref(), Some("alice"));

        // terminal: no more transitions
        assert!(matches!(engine.advance(&id).await, Err(EngineError::InvalidState(_))));
        assert!(matches!(
            engine.resume(&id, ApprovalDecision::Approved, "bob").await,
            Err(EngineError::InvalidState(_))
        ));
    }
}

#[tokio::test]
async fn scenario_d_approval_reexecutes_step_with_flag() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        engine.advance(&id).await.unwrap();
        executor.push("classify", approval_needed());
        engine.advance(&id).await.unwrap();

        let state = engine.resume(&id, ApprovalDecision::Approved, "alice").await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Running, "{}", name);
        assert_eq!(state.current_step, "classify");
        assert!(state.is_step_approved("classify"));
        assert_eq!(
            state.data[APPROVALS_KEY]["classify"]["approvedBy"],
            json!("alice")
        );

        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.current_step, "enrich");

        let calls = executor.calls_for("classify");
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].approved);
        assert!(calls[1].approved);
        assert!(calls[1].data.contains_key(APPROVALS_KEY));

        assert_eq!(
            transitions(&engine, "biz-1", &id).await,
            vec![
                actions::CREATED,
                actions::STARTED,
                actions::STEP_COMPLETED,
                actions::PAUSED,
                actions::RESUMED,
                actions::STEP_COMPLETED,
            ]
        );
        assert_eq!(state.version, 6);
    }
}

#[tokio::test]
async fn scenario_e_retries_then_fails() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        engine.advance(&id).await.unwrap();

        for _ in 0..3 {
            executor.push(
                "classify",
                Script::Respond(StepOutcome::failed("provider_error", "upstream 502", true).into()),
            );
        }

        let first = engine.advance(&id).await.unwrap();
        assert_eq!(first.status, WorkflowStatus::Running, "{}", name);
        assert_eq!(first.retry_count, 1);
        assert!(first.retry_not_before.is_some());

        let second = engine.advance(&id).await.unwrap();
        assert_eq!(second.status, WorkflowStatus::Running);
        assert_eq!(second.retry_count, 2);

        let third = engine.advance(&id).await.unwrap();
        assert_eq!(third.status, WorkflowStatus::Failed, "{}", name);
        assert!(third.error_message.unwrap().contains("upstream 502"));

        let attempts: Vec<u32> = executor.calls_for("classify").iter().map(|c| c.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }
}

#[tokio::test]
async fn scenario_f_vision_falls_back_to_premium() {
    let mut config = test_config();
    config.providers = vec![
        ProviderConfig::new("openai", "gpt-4o-mini", ModelTier::Fast, Decimal::new(15, 8), &[]),
        ProviderConfig::new("openai", "gpt-4o", ModelTier::Balanced, Decimal::new(5, 6), &[]),
        ProviderConfig::new("anthropic", "claude-3-opus", ModelTier::Premium, Decimal::new(15, 6), &[CAP_VISION]),
    ];
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&config, store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        engine.advance(&id).await.unwrap();

        executor.push("classify", Script::Respond(walk("classify").with_usage(1000)));
        engine.advance(&id).await.unwrap();

        let provider = executor.calls_for("classify")[0].provider.clone().unwrap();
        assert_eq!(provider.tier, ModelTier::Premium, "{}", name);
        assert_eq!(provider.model_name, "claude-3-opus");

        let entries = engine.ledger().entries("biz-1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].units_used, 1000);
        assert_eq!(entries[0].cost, Decimal::new(15, 3));
        assert_eq!(entries[0].workflow_id.as_deref(), Some(id.as_str()));
    }
}

// ─── Gates ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn high_risk_step_pauses_before_execution() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        for _ in 0..3 {
            engine.advance(&id).await.unwrap();
        }
        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.current_step, "publish");
        assert_eq!(state.status, WorkflowStatus::PausedForApproval, "{}", name);
        assert!(executor.calls_for("publish").is_empty());

        let pending = engine.pending_approval(&id).await.unwrap().unwrap();
        assert_eq!(pending.step_name, "publish");

        engine.resume(&id, ApprovalDecision::Approved, "ops").await.unwrap();
        let done = engine.advance(&id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed, "{}", name);
        assert_eq!(executor.calls_for("publish").len(), 1);
        assert!(executor.calls_for("publish")[0].approved);
    }
}

#[tokio::test]
async fn over_budget_blocks_costly_steps_only() {
    let mut config = test_config();
    config.budget.default_limit = Decimal::new(1, 2);
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&config, store);
        engine
            .ledger()
            .record("biz-1", "openai", "gpt-4o", 10_000, Decimal::new(5, 2), None)
            .await
            .unwrap();

        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        // intake is free and still runs
        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.current_step, "classify", "{}", name);

        let err = engine.advance(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded(_)), "{}", name);
        assert!(executor.calls_for("classify").is_empty());

        let after = engine.get(&id).await.unwrap();
        assert_eq!(after.status, WorkflowStatus::Running);
        assert_eq!(after.version, state.version);

        let audit = engine.audit().query("biz-1", Some(&id), None, None).await.unwrap();
        assert!(audit.iter().any(|e| e.action == actions::BUDGET_BLOCKED));

        // another tenant is unaffected
        let other = engine.start("biz-2", CATALOGING, image_data()).await.unwrap();
        engine.advance(&other).await.unwrap();
        assert_eq!(engine.advance(&other).await.unwrap().current_step, "enrich");
    }
}

#[tokio::test]
async fn alert_only_budget_continues_and_audits() {
    let mut config = test_config();
    config.budget.default_limit = Decimal::ZERO;
    config.budget.policy = BudgetPolicy::AlertOnly;
    let (engine, _) = engine_with(&config, Arc::new(MemoryStore::new()));
    engine
        .ledger()
        .record("biz-1", "openai", "gpt-4o", 1, Decimal::new(1, 2), None)
        .await
        .unwrap();

    let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
    engine.advance(&id).await.unwrap();
    let state = engine.advance(&id).await.unwrap();
    assert_eq!(state.current_step, "enrich");

    let audit = engine.audit().query("biz-1", Some(&id), None, None).await.unwrap();
    assert!(audit.iter().any(|e| e.action == actions::BUDGET_ALERT));
}

#[tokio::test]
async fn missing_capability_fails_with_no_provider() {
    let yaml = r#"
name: transcribe
steps:
  - name: listen
    ai_costly: true
    capabilities: [audio]
"#;
    let mut definitions = DefinitionRegistry::with_builtins();
    definitions.register(WorkflowDefinition::from_yaml(yaml).unwrap()).unwrap();
    for (name, store) in backends() {
        let executor = Arc::new(ScriptedExecutor::default());
        let engine = WorkflowEngine::new(&test_config(), store, executor.clone())
            .with_definitions(definitions.clone());
        let id = engine.start("biz-1", "transcribe", WorkflowData::new()).await.unwrap();
        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed, "{}", name);
        assert!(state.error_message.unwrap().starts_with(CLASS_NO_PROVIDER));
        assert!(executor.calls_for("listen").is_empty());
    }
}

// ─── Outcome handling ──────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_next_step_is_a_validation_failure() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        executor.push(
            "intake",
            Script::Respond(StepOutcome::next("teleport", WorkflowData::new()).into()),
        );
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed, "{}", name);
        let message = state.error_message.unwrap();
        assert!(message.starts_with(CLASS_VALIDATION));
        assert!(message.contains("teleport"));
    }
}

#[tokio::test]
async fn executor_errors_and_panics_fail_the_workflow() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);

        executor.push("intake", Script::Fail("database offline".to_string()));
        let a = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        let state = engine.advance(&a).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed, "{}", name);
        assert!(state.error_message.unwrap().starts_with(CLASS_EXECUTOR_ERROR));

        executor.push("intake", Script::Panic);
        let b = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        let state = engine.advance(&b).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed, "{}", name);
        assert!(state.error_message.unwrap().contains("panicked"));
    }
}

#[tokio::test]
async fn timeouts_are_retryable() {
    let yaml = r#"
name: slow
steps:
  - name: crawl
    timeout_secs: 1
"#;
    let mut definitions = DefinitionRegistry::new();
    definitions.register(WorkflowDefinition::from_yaml(yaml).unwrap()).unwrap();
    let executor = Arc::new(ScriptedExecutor::default());
    let engine = WorkflowEngine::new(&test_config(), Arc::new(MemoryStore::new()), executor.clone())
        .with_definitions(definitions);

    executor.push("crawl", Script::Sleep(Duration::from_secs(5)));
    let id = engine.start("biz-1", "slow", WorkflowData::new()).await.unwrap();

    let state = engine.advance(&id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Running);
    assert_eq!(state.retry_count, 1);

    // unscripted second attempt finishes the single-step flow
    let state = engine.advance(&id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn advance_before_retry_is_due_is_refused() {
    let mut config = test_config();
    config.retry.classes.insert(
        "rate_limit".to_string(),
        RetryStrategy::Linear {
            delay_ms: 60_000,
            max_retries: 3,
        },
    );
    let (engine, executor) = engine_with(&config, Arc::new(MemoryStore::new()));
    executor.push(
        "intake",
        Script::Respond(StepOutcome::failed("rate_limit", "429", true).into()),
    );
    let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
    let state = engine.advance(&id).await.unwrap();
    assert_eq!(state.retry_count, 1);

    let err = engine.advance(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::RetryNotDue(_)));
    assert!(err.is_usage_error());
    assert_eq!(executor.calls_for("intake").len(), 1);
}

#[tokio::test]
async fn forged_approval_grants_do_not_skip_the_gate() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        let mut data = image_data();
        data.insert(
            APPROVALS_KEY.to_string(),
            json!({ "publish": { "approvalId": "forged", "approvedBy": "mallory" } }),
        );
        let id = engine.start("biz-1", CATALOGING, data).await.unwrap();
        assert!(!engine.get(&id).await.unwrap().data.contains_key(APPROVALS_KEY), "{}", name);

        engine.advance(&id).await.unwrap();
        // an executor cannot grant approvals through its patch either
        let mut patch = WorkflowData::new();
        patch.insert(APPROVALS_KEY.to_string(), json!({ "publish": { "approvalId": "forged" } }));
        patch.insert("category".to_string(), json!("boots"));
        executor.push("classify", Script::Respond(StepOutcome::next("enrich", patch).into()));
        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.data.get("category"), Some(&json!("boots")));
        assert!(!state.is_step_approved("publish"));

        engine.advance(&id).await.unwrap();
        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::PausedForApproval, "{}", name);
        assert!(executor.calls_for("publish").is_empty());
        assert_eq!(engine.approvals().list_for(&id).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn grant_without_an_approved_request_is_ignored() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store.clone());
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        for _ in 0..3 {
            engine.advance(&id).await.unwrap();
        }

        // written straight into the store, bypassing the engine
        let mut state = store.load(&id).await.unwrap().unwrap();
        state.data.insert(
            APPROVALS_KEY.to_string(),
            json!({ "publish": { "approvalId": "no-such-request" } }),
        );
        state.version += 1;
        store.save(&state).await.unwrap();

        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::PausedForApproval, "{}", name);
        assert!(executor.calls_for("publish").is_empty());
    }
}

#[tokio::test]
async fn blank_rejection_reason_is_refused() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        engine.advance(&id).await.unwrap();
        executor.push("classify", approval_needed());
        engine.advance(&id).await.unwrap();

        for blank in ["", "   "] {
            let err = engine
                .resume(&id, ApprovalDecision::rejected(blank), "alice")
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidState(_)), "{}", name);
        }
        assert_eq!(engine.get(&id).await.unwrap().status, WorkflowStatus::PausedForApproval);
        assert!(engine.pending_approval(&id).await.unwrap().is_some());

        let state = engine
            .resume(&id, ApprovalDecision::rejected("wrong product"), "alice")
            .await
            .unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("wrong product"));
    }
}

#[tokio::test]
async fn approval_resolved_at_the_gate_is_applied_on_resume() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        engine.advance(&id).await.unwrap();
        executor.push("classify", approval_needed());
        engine.advance(&id).await.unwrap();

        let pending = engine.pending_approval(&id).await.unwrap().unwrap();
        engine
            .approvals()
            .resolve(&pending.id, "alice", &ApprovalDecision::Approved)
            .await
            .unwrap();
        assert_eq!(engine.get(&id).await.unwrap().status, WorkflowStatus::PausedForApproval);

        let state = engine.resume(&id, ApprovalDecision::Approved, "bob").await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Running, "{}", name);
        assert_eq!(state.data[APPROVALS_KEY]["classify"]["approvedBy"], json!("alice"));

        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.current_step, "enrich");
        assert!(executor.calls_for("classify")[1].approved);
    }
}

#[tokio::test]
async fn recorded_rejection_wins_over_a_later_resume() {
    let (engine, executor) = engine_with(&test_config(), Arc::new(MemoryStore::new()));
    let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
    engine.advance(&id).await.unwrap();
    executor.push("classify", approval_needed());
    engine.advance(&id).await.unwrap();

    let pending = engine.pending_approval(&id).await.unwrap().unwrap();
    engine
        .approvals()
        .resolve(&pending.id, "alice", &ApprovalDecision::rejected("duplicate listing"))
        .await
        .unwrap();

    let state = engine.resume(&id, ApprovalDecision::Approved, "bob").await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.error_message.as_deref(), Some("duplicate listing"));

    let rejected = engine
        .audit()
        .query("biz-1", Some(&id), None, None)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.action == actions::REJECTED)
        .unwrap();
    assert_eq!(rejected.actor, "alice");
}

#[tokio::test]
async fn looping_back_to_a_high_risk_step_needs_fresh_approval() {
    let yaml = r#"
name: moderation
steps:
  - name: check
  - name: post
    high_risk: true
"#;
    let mut definitions = DefinitionRegistry::new();
    definitions.register(WorkflowDefinition::from_yaml(yaml).unwrap()).unwrap();
    let executor = Arc::new(ScriptedExecutor::default());
    let engine = WorkflowEngine::new(&test_config(), Arc::new(MemoryStore::new()), executor.clone())
        .with_definitions(definitions);

    for _ in 0..2 {
        executor.push("check", Script::Respond(StepOutcome::next("post", WorkflowData::new()).into()));
    }
    executor.push("post", Script::Respond(StepOutcome::next("check", WorkflowData::new()).into()));

    let id = engine.start("biz-1", "moderation", WorkflowData::new()).await.unwrap();
    engine.advance(&id).await.unwrap();
    let paused = engine.advance(&id).await.unwrap();
    assert_eq!(paused.status, WorkflowStatus::PausedForApproval);
    engine.resume(&id, ApprovalDecision::Approved, "alice").await.unwrap();

    let state = engine.advance(&id).await.unwrap();
    assert_eq!(state.current_step, "check");
    assert!(!state.is_step_approved("post"));

    engine.advance(&id).await.unwrap();
    let state = engine.advance(&id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::PausedForApproval);
    assert_eq!(state.current_step, "post");
    assert_eq!(executor.calls_for("post").len(), 1);
    assert_eq!(engine.approvals().list_for(&id).await.unwrap().len(), 2);
}

/// Executor that does the expensive work once and replays it after approval.
#[derive(Default)]
struct CachingClassifier {
    computed: Mutex<HashMap<String, String>>,
    computations: Mutex<u32>,
}

#[async_trait]
impl StepExecutor for CachingClassifier {
    async fn execute(&self, ctx: StepContext) -> Result<StepResponse, String> {
        if ctx.step_name != "classify" {
            return Ok(walk(&ctx.step_name));
        }
        let cached = self.computed.lock().unwrap().get(&ctx.workflow_id).cloned();
        let category = match cached {
            Some(c) => c,
            None => {
                *self.computations.lock().unwrap() += 1;
                let c = "sneakers".to_string();
                self.computed.lock().unwrap().insert(ctx.workflow_id.clone(), c.clone());
                c
            }
        };
        let mut patch = WorkflowData::new();
        patch.insert("category".to_string(), json!(category));
        if ctx.approved {
            Ok(StepOutcome::next("enrich", patch).into())
        } else {
            Ok(StepOutcome::approval("Confirm category", patch).into())
        }
    }
}

#[tokio::test]
async fn approved_step_can_reuse_cached_result() {
    let executor = Arc::new(CachingClassifier::default());
    let engine = WorkflowEngine::new(&test_config(), Arc::new(MemoryStore::new()), executor.clone());
    let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
    engine.advance(&id).await.unwrap();
    let paused = engine.advance(&id).await.unwrap();
    assert_eq!(paused.status, WorkflowStatus::PausedForApproval);

    engine.resume(&id, ApprovalDecision::Approved, "alice").await.unwrap();
    let state = engine.advance(&id).await.unwrap();
    assert_eq!(state.current_step, "enrich");
    assert_eq!(state.data.get("category"), Some(&json!("sneakers")));
    assert_eq!(*executor.computations.lock().unwrap(), 1);
}

// ─── Cancellation & concurrency ────────────────────────────────────────────

#[tokio::test]
async fn cancel_is_idempotent() {
    for (name, store) in backends() {
        let (engine, _) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();

        let first = engine.cancel(&id, "ops").await.unwrap();
        let second = engine.cancel(&id, "ops").await.unwrap();
        assert_eq!(first.status, WorkflowStatus::Cancelled, "{}", name);
        assert_eq!(second.status, WorkflowStatus::Cancelled);
        assert_eq!(first.version, second.version);

        let cancels = transitions(&engine, "biz-1", &id)
            .await
            .into_iter()
            .filter(|a| a == actions::CANCELLED)
            .count();
        assert_eq!(cancels, 1);
        assert!(matches!(engine.advance(&id).await, Err(EngineError::InvalidState(_))));
    }
}

#[tokio::test]
async fn cancel_while_paused_leaves_workflow_cancelled() {
    let (engine, executor) = engine_with(&test_config(), Arc::new(MemoryStore::new()));
    let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
    engine.advance(&id).await.unwrap();
    executor.push("classify", approval_needed());
    engine.advance(&id).await.unwrap();

    let state = engine.cancel(&id, "ops").await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    let err = engine
        .resume(&id, ApprovalDecision::Approved, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_advance_fails_fast_and_stale_result_is_discarded() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();

        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        executor.push(
            "intake",
            Script::Block {
                started: started.clone(),
                release: release.clone(),
                then: walk("intake"),
            },
        );

        let running = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.advance(&id).await })
        };
        started.notified().await;

        let err = engine.advance(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::ConcurrentModification(_)), "{}", name);
        let err = engine
            .resume(&id, ApprovalDecision::Approved, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConcurrentModification(_)));

        // cancellation is still possible and wins over the in-flight step
        let cancelled = engine.cancel(&id, "ops").await.unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Cancelled);

        release.notify_one();
        let finished = running.await.unwrap().unwrap();
        assert_eq!(finished.status, WorkflowStatus::Cancelled, "{}", name);
        assert_eq!(finished.current_step, "intake");
        assert!(!finished.data.contains_key("intake_done"));

        let audit = engine.audit().query("biz-1", Some(&id), None, None).await.unwrap();
        assert!(audit.iter().any(|e| e.action == actions::RESULT_DISCARDED));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_workflows_advance_concurrently() {
    let (engine, _) = engine_with(&test_config(), Arc::new(MemoryStore::new()));
    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(engine.start(&format!("biz-{}", i % 2), CATALOGING, image_data()).await.unwrap());
    }
    let mut handles = Vec::new();
    for id in ids.clone() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.advance(&id).await }));
    }
    for h in handles {
        assert_eq!(h.await.unwrap().unwrap().current_step, "classify");
    }
    assert_eq!(engine.list("biz-0", None).await.unwrap().len(), 4);
    assert_eq!(
        engine.list("biz-1", Some(WorkflowStatus::Running)).await.unwrap().len(),
        4
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn execution_slots_cap_concurrent_steps() {
    let mut config = test_config();
    config.engine.max_concurrent_workflows = 1;
    let (engine, executor) = engine_with(&config, Arc::new(MemoryStore::new()));
    let a = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
    let b = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    executor.push(
        "intake",
        Script::Block {
            started: started.clone(),
            release: release.clone(),
            then: walk("intake"),
        },
    );

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.advance(&a).await })
    };
    started.notified().await;
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.advance(&b).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(executor.calls_for("intake").len(), 1);
    assert!(!second.is_finished());

    release.notify_one();
    assert_eq!(first.await.unwrap().unwrap().current_step, "classify");
    assert_eq!(second.await.unwrap().unwrap().current_step, "classify");
    assert_eq!(executor.calls_for("intake").len(), 2);
}

#[tokio::test]
async fn workflow_past_its_deadline_fails_with_timeout() {
    for (name, store) in backends() {
        let (engine, executor) = engine_with(&test_config(), store.clone());
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();

        let mut state = store.load(&id).await.unwrap().unwrap();
        state.created_at = state.created_at - chrono::Duration::minutes(31);
        state.version += 1;
        store.save(&state).await.unwrap();

        let state = engine.advance(&id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed, "{}", name);
        let message = state.error_message.unwrap();
        assert!(message.starts_with(CLASS_TIMEOUT), "{}", message);
        assert!(message.contains("30-minute"));
        assert!(executor.calls_for("intake").is_empty());
    }
}

#[tokio::test]
async fn disabled_deadline_lets_old_workflows_advance() {
    let mut config = test_config();
    config.engine.workflow_timeout_minutes = None;
    let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
    let (engine, _) = engine_with(&config, store.clone());
    let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();

    let mut state = store.load(&id).await.unwrap().unwrap();
    state.created_at = state.created_at - chrono::Duration::days(2);
    state.version += 1;
    store.save(&state).await.unwrap();

    assert_eq!(engine.advance(&id).await.unwrap().current_step, "classify");
}

// ─── Durability ────────────────────────────────────────────────────────────

#[tokio::test]
async fn sqlite_restart_resumes_paused_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autifyme.db").to_str().unwrap().to_string();

    let id = {
        let store = Arc::new(SqliteStore::new(Database::open(&path).unwrap()));
        let (engine, executor) = engine_with(&test_config(), store);
        let id = engine.start("biz-1", CATALOGING, image_data()).await.unwrap();
        engine.advance(&id).await.unwrap();
        executor.push("classify", approval_needed());
        engine.advance(&id).await.unwrap();
        id
    };

    let store = Arc::new(SqliteStore::new(Database::open(&path).unwrap()));
    let (engine, executor) = engine_with(&test_config(), store);
    let state = engine.get(&id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::PausedForApproval);
    assert_eq!(state.data.get("intake_done"), Some(&json!(true)));

    engine.resume(&id, ApprovalDecision::Approved, "alice").await.unwrap();
    let state = engine.advance(&id).await.unwrap();
    assert_eq!(state.current_step, "enrich");
    assert!(executor.calls_for("classify")[0].approved);

    let history = transitions(&engine, "biz-1", &id).await;
    assert_eq!(history.len() as u64, state.version);
}
