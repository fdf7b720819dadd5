//! End-to-end kernel tests: flow execution through the dispatcher, fan-in,
//! idempotent retries, hard-stop, FSM races, and webhook callbacks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use tempo_domain::config::RetryConfig;
use tempo_domain::event::{
    ABORT, EVENT_ABORTED, EVENT_ERROR, EVENT_RESULT, NEED_USER_INPUT, SESSION_COMPLETE,
    SESSION_START, STATE_TRANSITION, STEP_DONE,
};
use tempo_domain::{NodeResult, Result, TenantContext};
use tempo_clients::webhook::WebhookCaller;
use tempo_kernel::dispatcher::Disposition;
use tempo_kernel::metrics::Metrics;
use tempo_kernel::node::{Node, NodeContext};
use tempo_kernel::reliability::{HardStopper, IdempotencyGuard, RetryPolicy};
use tempo_kernel::{
    Blackboard, Dispatcher, EventBus, FastStore, FlowCatalog, FlowDefinition, SessionManager,
};
use tempo_storage::{Database, EventRepo, IdempotencyRepo, SessionRepo, SnapshotRepo};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stub nodes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CountingNode {
    id: &'static str,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Node for CountingNode {
    fn node_id(&self) -> &str {
        self.id
    }
    fn name(&self) -> &str {
        self.id
    }
    async fn execute(&self, ctx: NodeContext) -> Result<NodeResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(NodeResult::success(json!({ "call": call }))
            .with_artifact(format!("{}_result", self.id), json!({ "call": call }))
            .with_ui_schema(json!({
                "component": "smart_table",
                "title": self.id,
                "data": { "columns": [], "rows": [] },
            })))
    }
}

/// Fails until `succeed_on`, then returns success.
struct FlakyNode {
    calls: Arc<AtomicUsize>,
    succeed_on: usize,
}

#[async_trait]
impl Node for FlakyNode {
    fn node_id(&self) -> &str {
        "flaky"
    }
    fn name(&self) -> &str {
        "flaky"
    }
    async fn execute(&self, _ctx: NodeContext) -> Result<NodeResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on {
            Ok(NodeResult::error(format!("transient failure {call}")))
        } else {
            Ok(NodeResult::success(json!({ "call": call })))
        }
    }
}

/// Spins at its cancellation point until the abort signal flips.
struct AbortAwareNode;

#[async_trait]
impl Node for AbortAwareNode {
    fn node_id(&self) -> &str {
        "long_runner"
    }
    fn name(&self) -> &str {
        "long_runner"
    }
    async fn execute(&self, ctx: NodeContext) -> Result<NodeResult> {
        for _ in 0..200 {
            if ctx.aborted() {
                return Ok(NodeResult::aborted());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(NodeResult::success(json!({ "finished": true })))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Fixture {
    store: Arc<FastStore>,
    blackboard: Arc<Blackboard>,
    registry: Arc<tempo_kernel::NodeRegistry>,
    flows: Arc<FlowCatalog>,
    events: EventRepo,
    sessions: SessionRepo,
    stopper: Arc<HardStopper>,
    dispatcher: Arc<Dispatcher>,
    manager: SessionManager,
}

async fn fixture() -> Fixture {
    let store = Arc::new(FastStore::new());
    let bus = Arc::new(EventBus::new());
    let blackboard = Arc::new(Blackboard::with_defaults(store.clone()));
    let registry = Arc::new(tempo_kernel::NodeRegistry::new());
    let flows = Arc::new(FlowCatalog::new());
    let metrics = Arc::new(Metrics::new());

    let db = Database::in_memory().await.unwrap();
    let sessions = SessionRepo::new(db.pool().clone());
    let events = EventRepo::new(db.pool().clone());
    let snapshots = SnapshotRepo::new(db.pool().clone());
    let idempotency = Arc::new(IdempotencyGuard::new(IdempotencyRepo::new(db.pool().clone())));
    let stopper = Arc::new(HardStopper::new(
        store.clone(),
        bus.clone(),
        blackboard.clone(),
        events.clone(),
        sessions.clone(),
    ));

    let retry = RetryPolicy::from_config(&RetryConfig {
        max_attempts: 3,
        backoff_base_secs: 0.005,
        backoff_multiplier: 2.0,
        max_backoff_secs: 0.02,
    });

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        bus.clone(),
        blackboard.clone(),
        registry.clone(),
        flows.clone(),
        sessions.clone(),
        events.clone(),
        idempotency,
        stopper.clone(),
        retry,
        Arc::new(WebhookCaller::new(Duration::from_secs(1)).unwrap()),
        metrics,
        3,
        Duration::from_secs(1800),
        "http://127.0.0.1:8000".into(),
    ));

    let manager = SessionManager::new(
        store.clone(),
        bus,
        blackboard.clone(),
        flows.clone(),
        sessions.clone(),
        snapshots,
        events.clone(),
        Duration::from_secs(1800),
    );

    Fixture {
        store,
        blackboard,
        registry,
        flows,
        events,
        sessions,
        stopper,
        dispatcher,
        manager,
    }
}

fn tenant() -> TenantContext {
    TenantContext::new("t1", Some("u1".into()), "tr-test").unwrap()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn flow_runs_to_user_input_then_completes() {
    let fx = fixture().await;
    let calls = Arc::new(AtomicUsize::new(0));
    fx.registry.register_builtin(Arc::new(CountingNode {
        id: "search",
        calls: calls.clone(),
    }));

    fx.flows.register(
        "demo",
        FlowDefinition::from_yaml(
            r#"
name: demo
states: [search, quote_done, end, error]
initial_state: search
transitions:
  - { from: search, event: STEP_DONE, to: quote_done }
  - { from: quote_done, event: USER_CONFIRM, to: end }
state_node_map:
  search: builtin://search
user_input_states: [quote_done]
"#,
        )
        .unwrap(),
        None,
    );

    let session_id = fx.manager.start_flow(&tenant(), "demo", &json!({})).await.unwrap();
    let outcome = fx.dispatcher.run_current(&tenant(), &session_id).await.unwrap();

    assert_eq!(outcome.disposition, Disposition::WaitingUser);
    assert_eq!(outcome.state, "quote_done");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // The node's artifact landed in the blackboard under its declared id.
    assert_eq!(
        fx.blackboard.list_artifacts("t1", &session_id),
        vec!["search_result"]
    );
    // The ui_schema rode along on the outcome.
    assert_eq!(
        outcome.result.unwrap().ui_schema.unwrap()["component"],
        "smart_table"
    );

    // Audit: insertion order, non-decreasing ticks, expected shape.
    let replayed = fx.events.replay(&session_id).await.unwrap();
    let kinds: Vec<&str> = replayed.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        kinds,
        vec![SESSION_START, EVENT_RESULT, STEP_DONE, STATE_TRANSITION, NEED_USER_INPUT]
    );
    assert!(replayed.windows(2).all(|w| w[0].tick <= w[1].tick));
    let transition = replayed.iter().find(|e| e.event_type == STATE_TRANSITION).unwrap();
    assert_eq!(transition.from_state.as_deref(), Some("search"));
    assert_eq!(transition.to_state.as_deref(), Some("quote_done"));

    // User confirms: flow completes.
    let outcome = fx
        .dispatcher
        .dispatch(&tenant(), &session_id, "USER_CONFIRM")
        .await
        .unwrap();
    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(outcome.state, "end");
    let record = fx.sessions.get(&session_id).await.unwrap().unwrap();
    assert_eq!(record.status, "completed");
    assert!(record.completed_at.is_some());

    let kinds: Vec<String> = fx
        .events
        .replay(&session_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(kinds.contains(&SESSION_COMPLETE.to_string()));
}

#[tokio::test]
async fn flaky_node_retries_then_succeeds_with_one_durable_success() {
    let fx = fixture().await;
    let calls = Arc::new(AtomicUsize::new(0));
    fx.registry.register_builtin(Arc::new(FlakyNode {
        calls: calls.clone(),
        succeed_on: 3,
    }));
    fx.flows.register(
        "flaky_flow",
        FlowDefinition::from_yaml(
            r#"
name: flaky_flow
states: [work, end, error]
initial_state: work
transitions:
  - { from: work, event: STEP_DONE, to: end }
state_node_map:
  work: builtin://flaky
"#,
        )
        .unwrap(),
        None,
    );

    let session_id = fx
        .manager
        .start_flow(&tenant(), "flaky_flow", &json!({}))
        .await
        .unwrap();
    let outcome = fx.dispatcher.run_current(&tenant(), &session_id).await.unwrap();

    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let replayed = fx.events.replay(&session_id).await.unwrap();
    let errors = replayed.iter().filter(|e| e.event_type == EVENT_ERROR).count();
    let results = replayed.iter().filter(|e| e.event_type == EVENT_RESULT).count();
    assert_eq!(errors, 2);
    // Exactly one successful result despite three attempts.
    assert_eq!(results, 1);
}

#[tokio::test]
async fn retry_exhaustion_fails_the_session() {
    let fx = fixture().await;
    fx.registry.register_builtin(Arc::new(FlakyNode {
        calls: Arc::new(AtomicUsize::new(0)),
        succeed_on: 99,
    }));
    fx.flows.register(
        "doomed",
        FlowDefinition::from_yaml(
            r#"
name: doomed
states: [work, end, error]
initial_state: work
transitions:
  - { from: work, event: STEP_DONE, to: end }
  - { from: work, event: ERROR, to: error }
state_node_map:
  work: builtin://flaky
"#,
        )
        .unwrap(),
        None,
    );

    let session_id = fx.manager.start_flow(&tenant(), "doomed", &json!({})).await.unwrap();
    let outcome = fx.dispatcher.run_current(&tenant(), &session_id).await.unwrap();

    assert!(matches!(outcome.disposition, Disposition::Failed { .. }));
    // The flow routed to its error state.
    let record = fx.sessions.get(&session_id).await.unwrap().unwrap();
    assert_eq!(record.status, "error");
}

#[tokio::test]
async fn duplicate_single_execution_is_skipped() {
    let fx = fixture().await;
    let calls = Arc::new(AtomicUsize::new(0));
    fx.registry.register_builtin(Arc::new(CountingNode {
        id: "echo",
        calls: calls.clone(),
    }));

    let session_id = fx
        .manager
        .start_single_node(&tenant(), "echo", &json!({}))
        .await
        .unwrap();

    let first = fx
        .dispatcher
        .execute_single(&tenant(), &session_id, "builtin://echo", "echo:call_1", &json!({}))
        .await
        .unwrap();
    assert!(first.is_success());
    assert_eq!(first.result["call"], 1);

    // Same step key again (e.g. a reconnect replays the turn): skipped.
    let second = fx
        .dispatcher
        .execute_single(&tenant(), &session_id, "builtin://echo", "echo:call_1", &json!({}))
        .await
        .unwrap();
    assert_eq!(second.result["skipped"], true);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A different step key runs.
    let third = fx
        .dispatcher
        .execute_single(&tenant(), &session_id, "builtin://echo", "echo:call_2", &json!({}))
        .await
        .unwrap();
    assert_eq!(third.result["call"], 2);
}

#[tokio::test]
async fn fan_in_waits_for_all_branches() {
    let fx = fixture().await;
    let calls = Arc::new(AtomicUsize::new(0));
    fx.registry.register_builtin(Arc::new(CountingNode {
        id: "merge_writer",
        calls: calls.clone(),
    }));

    fx.flows.register(
        "fanin",
        FlowDefinition::from_yaml(
            r#"
name: fanin
states: [branch_a, branch_b, merge, end, error]
initial_state: branch_a
transitions:
  - { from: branch_a, event: STEP_DONE, to: merge, fan_in: true }
  - { from: branch_b, event: STEP_DONE, to: merge, fan_in: true }
  - { from: merge, event: STEP_DONE, to: end }
state_node_map:
  merge: builtin://merge_writer
"#,
        )
        .unwrap(),
        None,
    );

    let session_id = fx.manager.start_flow(&tenant(), "fanin", &json!({})).await.unwrap();

    // Branch A completes first: fan-in unmet (branch_b pending), the node is
    // not invoked and the FSM is not rolled back.
    let outcome = fx
        .dispatcher
        .dispatch(&tenant(), &session_id, STEP_DONE)
        .await
        .unwrap();
    assert_eq!(
        outcome.disposition,
        Disposition::PendingFanIn {
            missing: vec!["branch_a".into(), "branch_b".into()]
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Both branches record completion; the merge step may now proceed. The
    // branches completed "elsewhere" — only their audit rows matter.
    for branch in ["branch_a", "branch_b"] {
        let mut done = tempo_domain::EventEnvelope::new(STEP_DONE, "dispatcher", "t1", &session_id).unwrap();
        done.from_state = Some(branch.into());
        fx.events.append(&done).await.unwrap();
    }

    // Re-seed the machine to branch_b and let its completion trigger the
    // merge again.
    let machine = fx.manager.machine("t1", &session_id);
    machine
        .set_state(&fx.store, "t1", &session_id, "branch_b", Duration::from_secs(1800))
        .unwrap();
    let outcome = fx
        .dispatcher
        .dispatch(&tenant(), &session_id, STEP_DONE)
        .await
        .unwrap();
    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hard_stop_interrupts_running_node() {
    let fx = fixture().await;
    fx.registry.register_builtin(Arc::new(AbortAwareNode));
    fx.flows.register(
        "long",
        FlowDefinition::from_yaml(
            r#"
name: long
states: [run, end, error]
initial_state: run
transitions:
  - { from: run, event: STEP_DONE, to: end }
state_node_map:
  run: builtin://long_runner
"#,
        )
        .unwrap(),
        None,
    );

    let session_id = fx.manager.start_flow(&tenant(), "long", &json!({})).await.unwrap();

    let dispatcher = fx.dispatcher.clone();
    let sid = session_id.clone();
    let handle = tokio::spawn(async move { dispatcher.run_current(&tenant(), &sid).await });

    // Give the node time to start its loop, then pull the plug.
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.stopper
        .abort("t1", &session_id, "user requested termination", None)
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.disposition, Disposition::Aborted);

    let replayed = fx.events.replay(&session_id).await.unwrap();
    let kinds: Vec<&str> = replayed.iter().map(|e| e.event_type.as_str()).collect();
    assert!(kinds.contains(&ABORT));
    assert!(kinds.contains(&EVENT_ABORTED));
    // No successful result may follow the abort.
    let abort_idx = kinds.iter().position(|k| *k == ABORT).unwrap();
    assert!(!kinds[abort_idx..].contains(&EVENT_RESULT));
}

#[tokio::test]
async fn concurrent_dispatch_admits_exactly_one_transition() {
    let fx = fixture().await;
    fx.flows.register(
        "race",
        FlowDefinition::from_yaml(
            r#"
name: race
states: [waiting, end, error]
initial_state: waiting
transitions:
  - { from: waiting, event: USER_CONFIRM, to: end }
"#,
        )
        .unwrap(),
        None,
    );
    let session_id = fx.manager.start_flow(&tenant(), "race", &json!({})).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let dispatcher = fx.dispatcher.clone();
        let sid = session_id.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.dispatch(&tenant(), &sid, "USER_CONFIRM").await
        }));
    }
    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);

    let transitions = fx
        .events
        .replay(&session_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == STATE_TRANSITION)
        .count();
    assert_eq!(transitions, 1);
}

#[tokio::test]
async fn webhook_callback_resumes_flow_and_post_abort_results_are_dropped() {
    let fx = fixture().await;
    fx.flows.register(
        "hooked",
        FlowDefinition::from_yaml(
            r#"
name: hooked
states: [approve, end, error]
initial_state: approve
transitions:
  - { from: approve, event: STEP_DONE, to: end }
state_node_map:
  approve: https://erp.example.com/approve
"#,
        )
        .unwrap(),
        None,
    );
    let session_id = fx.manager.start_flow(&tenant(), "hooked", &json!({})).await.unwrap();

    // The webhook answers through the callback channel.
    let result = NodeResult::success(json!({ "approved": true }))
        .with_artifact("approval_result", json!({ "approved": true }));
    let outcome = fx
        .dispatcher
        .handle_callback(&tenant(), &session_id, "approve", result)
        .await
        .unwrap();
    assert_eq!(outcome.disposition, Disposition::Completed);
    assert_eq!(
        fx.blackboard.list_artifacts("t1", &session_id),
        vec!["approval_result"]
    );

    // A late callback after abort is recorded but changes nothing.
    let session2 = fx.manager.start_flow(&tenant(), "hooked", &json!({})).await.unwrap();
    fx.stopper.abort("t1", &session2, "stop", None).await.unwrap();
    let late = NodeResult::success(json!({ "approved": true }));
    let outcome = fx
        .dispatcher
        .handle_callback(&tenant(), &session2, "approve", late)
        .await
        .unwrap();
    assert_eq!(outcome.disposition, Disposition::Aborted);

    let replayed = fx.events.replay(&session2).await.unwrap();
    let recorded = replayed
        .iter()
        .find(|e| e.event_type == EVENT_RESULT)
        .expect("late result is still audited");
    let payload: Value = serde_json::from_str(&recorded.payload).unwrap();
    assert_eq!(payload["post_abort"], true);
    // Session state still reflects the abort, not the late success.
    let record = fx.sessions.get(&session2).await.unwrap().unwrap();
    assert_eq!(record.status, "aborted");
}
