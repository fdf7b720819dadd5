//! The dispatcher — sole writer of state transitions and event records.
//!
//! For each `(session, trigger)` it runs the full cycle: abort check, atomic
//! FSM advance, node resolution, fan-in gate, idempotency gate, execution
//! (in-process or webhook hand-off), result fan-out, and retry. Within a
//! session the audit append and the bus publish are serialized so insertion
//! order equals publish order.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

use tempo_domain::event::{
    CMD_EXECUTE, EVENT_ABORTED, EVENT_ERROR, EVENT_PENDING_FANIN, EVENT_RESULT, ERROR,
    NEED_USER_INPUT, SESSION_COMPLETE, STATE_TRANSITION, STEP_DONE,
};
use tempo_domain::node::NodeStatus;
use tempo_domain::{Error, EventEnvelope, NodeResult, Result, TenantContext};
use tempo_clients::webhook::{WebhookCall, WebhookCaller};
use tempo_storage::{EventRepo, SessionRepo};

use crate::blackboard::Blackboard;
use crate::bus::EventBus;
use crate::flow::{FlowCatalog, FlowDefinition};
use crate::fsm::FlowMachine;
use crate::keys;
use crate::metrics::Metrics;
use crate::node::NodeContext;
use crate::registry::{NodeRegistry, ResolvedNode};
use crate::reliability::{FanInChecker, Gate, HardStopper, IdempotencyGuard, RetryPolicy};
use crate::store::FastStore;

const SOURCE: &str = "dispatcher";

/// Chained auto-advances per external trigger. Flows may be cyclic; this
/// bounds one trigger's cascade, not the flow.
const MAX_CHAIN_DEPTH: u32 = 16;

/// Next value of the per-session monotonic tick counter.
pub fn next_tick(store: &FastStore, tenant_id: &str, session_id: &str) -> u64 {
    store.incr(&keys::tick(tenant_id, session_id), None)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// FSM advanced; no node ran in the final state.
    Advanced,
    /// The session reached a terminal state.
    Completed,
    /// The new state waits for human input.
    WaitingUser,
    /// Fan-in prerequisites unmet; state kept, nothing executed.
    PendingFanIn { missing: Vec<String> },
    /// Hand-off to a webhook accepted; progress resumes on callback.
    WebhookPending,
    /// Idempotency gate refused re-execution.
    Skipped,
    /// The session carries the abort flag.
    Aborted,
    /// Node failed and the retry budget is spent.
    Failed { message: String },
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub state: String,
    pub disposition: Disposition,
    /// Result of the last node executed in this cascade, if any.
    pub result: Option<NodeResult>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Dispatcher {
    store: Arc<FastStore>,
    bus: Arc<EventBus>,
    blackboard: Arc<Blackboard>,
    registry: Arc<NodeRegistry>,
    flows: Arc<FlowCatalog>,
    sessions: SessionRepo,
    events: EventRepo,
    idempotency: Arc<IdempotencyGuard>,
    fan_in: FanInChecker,
    stopper: Arc<HardStopper>,
    retry: RetryPolicy,
    webhooks: Arc<WebhookCaller>,
    metrics: Arc<Metrics>,
    /// Serializes audit-append + bus-publish per session.
    publish_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    fsm_advance_retries: u32,
    session_ttl: Duration,
    /// Base URL webhook nodes call back to, e.g. `http://host:port`.
    callback_base: String,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<FastStore>,
        bus: Arc<EventBus>,
        blackboard: Arc<Blackboard>,
        registry: Arc<NodeRegistry>,
        flows: Arc<FlowCatalog>,
        sessions: SessionRepo,
        events: EventRepo,
        idempotency: Arc<IdempotencyGuard>,
        stopper: Arc<HardStopper>,
        retry: RetryPolicy,
        webhooks: Arc<WebhookCaller>,
        metrics: Arc<Metrics>,
        fsm_advance_retries: u32,
        session_ttl: Duration,
        callback_base: String,
    ) -> Self {
        let fan_in = FanInChecker::new(events.clone());
        Self {
            store,
            bus,
            blackboard,
            registry,
            flows,
            sessions,
            events,
            idempotency,
            fan_in,
            stopper,
            retry,
            webhooks,
            metrics,
            publish_locks: Mutex::new(HashMap::new()),
            fsm_advance_retries,
            session_ttl,
            callback_base,
        }
    }

    // ── Entry points ────────────────────────────────────────────

    /// Run one full dispatch cycle for a trigger event, cascading through
    /// automatic transitions until the flow waits, completes, or fails.
    pub async fn dispatch(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        trigger: &str,
    ) -> Result<DispatchOutcome> {
        self.metrics.inc("events_processed");
        self.dispatch_inner(tenant, session_id, trigger, 0).await
    }

    /// Execute the node mapped to the session's *current* state without an
    /// FSM advance — how a freshly started flow runs its initial step. The
    /// cascade continues through automatic transitions from there.
    pub async fn run_current(
        &self,
        tenant: &TenantContext,
        session_id: &str,
    ) -> Result<DispatchOutcome> {
        let tenant_id = tenant.tenant_id.as_str();
        if self.stopper.is_aborted(tenant_id, session_id) {
            return self.finish_aborted(tenant, session_id, "pre-dispatch").await;
        }

        let machine = self.machine(tenant_id, session_id);
        let flow = self.flow(tenant_id, session_id);
        let state = machine.current_state(&self.store, tenant_id, session_id);

        if FlowMachine::is_terminal(&state) {
            return Ok(DispatchOutcome {
                state,
                disposition: Disposition::Completed,
                result: None,
            });
        }
        if flow
            .as_ref()
            .map(|f| f.is_user_input_state(&state))
            .unwrap_or(false)
        {
            self.set_status(tenant_id, session_id, &state, "waiting_user").await?;
            self.record_and_publish(
                EventEnvelope::new(NEED_USER_INPUT, SOURCE, tenant_id, session_id)?
                    .with_trace(Some(tenant.trace_id.clone()))
                    .with_states(Some(state.clone()), None),
            )
            .await?;
            return Ok(DispatchOutcome {
                state,
                disposition: Disposition::WaitingUser,
                result: None,
            });
        }

        let Some(node_ref) = self.node_ref_for(flow.as_ref(), tenant_id, session_id, &state)
        else {
            return Ok(DispatchOutcome {
                state,
                disposition: Disposition::Advanced,
                result: None,
            });
        };

        let params = self
            .blackboard
            .get_state(tenant_id, session_id, "_params")
            .unwrap_or_else(|| json!({}));
        self.run_step(tenant, session_id, &state, &node_ref, &params, 0).await
    }

    fn dispatch_inner<'a>(
        &'a self,
        tenant: &'a TenantContext,
        session_id: &'a str,
        trigger: &'a str,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = Result<DispatchOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let tenant_id = tenant.tenant_id.as_str();

            // 1. Abort check.
            if self.stopper.is_aborted(tenant_id, session_id) {
                return self.finish_aborted(tenant, session_id, "pre-dispatch").await;
            }

            let machine = self.machine(tenant_id, session_id);
            let flow = self.flow(tenant_id, session_id);

            // 2. Atomic FSM advance, retried on CAS conflict.
            let from_state = machine.current_state(&self.store, tenant_id, session_id);
            let new_state = self
                .advance_with_retries(&machine, tenant_id, session_id, trigger)
                .await?;

            self.record_and_publish(
                EventEnvelope::new(STATE_TRANSITION, SOURCE, tenant_id, session_id)?
                    .with_trace(Some(tenant.trace_id.clone()))
                    .with_states(Some(from_state.clone()), Some(new_state.clone()))
                    .with_payload(json!({ "triggered_by": trigger })),
            )
            .await?;
            self.metrics.inc("state_transitions");

            // Terminal states end the cascade.
            if FlowMachine::is_terminal(&new_state) {
                return self.finish_terminal(tenant, session_id, &new_state).await;
            }

            // 3. User-input states pause without executing a node.
            if flow
                .as_ref()
                .map(|f| f.is_user_input_state(&new_state))
                .unwrap_or(false)
            {
                self.set_status(tenant_id, session_id, &new_state, "waiting_user")
                    .await?;
                self.record_and_publish(
                    EventEnvelope::new(NEED_USER_INPUT, SOURCE, tenant_id, session_id)?
                        .with_trace(Some(tenant.trace_id.clone()))
                        .with_states(Some(new_state.clone()), None),
                )
                .await?;
                return Ok(DispatchOutcome {
                    state: new_state,
                    disposition: Disposition::WaitingUser,
                    result: None,
                });
            }

            // 4. Fan-in gate: unmet prerequisites leave the state as is; the
            //    missing branches will eventually trigger again.
            if let Some(flow) = flow.as_ref() {
                let fan_in = flow
                    .transition(&from_state, trigger)
                    .map(|t| t.fan_in)
                    .unwrap_or(false);
                if fan_in {
                    let prerequisites = flow.fan_in_prerequisites(&new_state);
                    let missing = self.fan_in.pending(session_id, &prerequisites).await?;
                    if !missing.is_empty() {
                        self.record_and_publish(
                            EventEnvelope::new(
                                EVENT_PENDING_FANIN,
                                SOURCE,
                                tenant_id,
                                session_id,
                            )?
                            .with_states(Some(new_state.clone()), None)
                            .with_payload(json!({ "missing": &missing })),
                        )
                        .await?;
                        return Ok(DispatchOutcome {
                            state: new_state,
                            disposition: Disposition::PendingFanIn { missing },
                            result: None,
                        });
                    }
                }
            }

            // Resolve the node mapped to the new state.
            let Some(node_ref) = self.node_ref_for(flow.as_ref(), tenant_id, session_id, &new_state)
            else {
                self.set_status(tenant_id, session_id, &new_state, "running").await?;
                return Ok(DispatchOutcome {
                    state: new_state,
                    disposition: Disposition::Advanced,
                    result: None,
                });
            };
            self.set_status(tenant_id, session_id, &new_state, "running").await?;

            // 5–8. Idempotency-gated execution with retry.
            let params = self
                .blackboard
                .get_state(tenant_id, session_id, "_params")
                .unwrap_or_else(|| json!({}));
            self.run_step(tenant, session_id, &new_state, &node_ref, &params, depth)
                .await
        })
    }

    /// Execute one node outside any flow advance — the agent controller's
    /// path for tool calls on implicit sessions. `step` identifies the unit
    /// of work for the idempotency gate.
    pub async fn execute_single(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        node_ref: &str,
        step: &str,
        params: &Value,
    ) -> Result<NodeResult> {
        let tenant_id = tenant.tenant_id.as_str();
        if self.stopper.is_aborted(tenant_id, session_id) {
            return Ok(NodeResult::aborted());
        }

        let attempt = self
            .idempotency
            .next_attempt(session_id, step, self.retry.max_attempts)
            .await?
            .unwrap_or(self.retry.max_attempts);
        match self.idempotency.before_execute(session_id, step, attempt).await? {
            Gate::Proceed => {}
            Gate::SkipCompleted | Gate::SkipClaimed => {
                self.metrics.inc("idempotency_skips");
                return Ok(NodeResult::success(json!({ "skipped": true, "step": step })));
            }
        }

        let result = self
            .invoke(tenant, session_id, step, node_ref, params, attempt)
            .await;
        self.record_result(tenant, session_id, step, attempt, &result).await?;
        Ok(result)
    }

    /// Webhook return channel. Late results after an abort are recorded for
    /// audit but do not alter session state.
    pub async fn handle_callback(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        step: &str,
        result: NodeResult,
    ) -> Result<DispatchOutcome> {
        let tenant_id = tenant.tenant_id.as_str();
        let attempt = self
            .idempotency
            .next_attempt(session_id, step, u32::MAX)
            .await?
            .map(|next| next.saturating_sub(1).max(1))
            .unwrap_or(1);

        if self.stopper.is_aborted(tenant_id, session_id) {
            self.record_and_publish(
                EventEnvelope::new(EVENT_RESULT, SOURCE, tenant_id, session_id)?
                    .with_states(Some(step.to_owned()), None)
                    .with_payload(json!({
                        "status": result.status.as_str(),
                        "post_abort": true,
                        "result": result.result,
                    })),
            )
            .await?;
            return Ok(DispatchOutcome {
                state: step.to_owned(),
                disposition: Disposition::Aborted,
                result: Some(result),
            });
        }

        self.record_result(tenant, session_id, step, attempt, &result).await?;

        if result.is_success() {
            let outcome = self.dispatch_inner(tenant, session_id, STEP_DONE, 0).await?;
            return Ok(DispatchOutcome {
                result: outcome.result.or(Some(result)),
                ..outcome
            });
        }
        Ok(DispatchOutcome {
            state: step.to_owned(),
            disposition: Disposition::Failed {
                message: result.error_message.clone().unwrap_or_default(),
            },
            result: Some(result),
        })
    }

    // ── Step execution ──────────────────────────────────────────

    async fn run_step(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        state: &str,
        node_ref: &str,
        params: &Value,
        depth: u32,
    ) -> Result<DispatchOutcome> {
        let tenant_id = tenant.tenant_id.as_str();

        loop {
            // 5. Idempotency gate.
            let Some(attempt) = self
                .idempotency
                .next_attempt(session_id, state, self.retry.max_attempts)
                .await?
            else {
                return self.finish_failed(tenant, session_id, state, "retry budget exhausted").await;
            };
            match self.idempotency.before_execute(session_id, state, attempt).await? {
                Gate::Proceed => {}
                Gate::SkipCompleted | Gate::SkipClaimed => {
                    self.metrics.inc("idempotency_skips");
                    return Ok(DispatchOutcome {
                        state: state.to_owned(),
                        disposition: Disposition::Skipped,
                        result: None,
                    });
                }
            }

            // 6. Execute. Webhooks hand off and return immediately.
            if let ResolvedNode::Webhook(webhook) = self.registry.resolve(node_ref)? {
                let call = WebhookCall {
                    session_id: session_id.to_owned(),
                    tenant_id: tenant_id.to_owned(),
                    step: state.to_owned(),
                    attempt,
                    params: params.clone(),
                    callback_url: format!(
                        "{}/api/workflow/{}/callback",
                        self.callback_base, session_id
                    ),
                    trace_id: Some(tenant.trace_id.clone()),
                };
                let accepted = self.webhooks.call(&webhook.endpoint, &call).await;
                match accepted {
                    Ok(handoff) if handoff.accepted => {
                        self.record_and_publish(
                            EventEnvelope::new(CMD_EXECUTE, SOURCE, tenant_id, session_id)?
                                .with_target(webhook.node_id.clone())
                                .with_states(Some(state.to_owned()), None)
                                .with_payload(json!({ "endpoint": webhook.endpoint })),
                        )
                        .await?;
                        return Ok(DispatchOutcome {
                            state: state.to_owned(),
                            disposition: Disposition::WebhookPending,
                            result: None,
                        });
                    }
                    Ok(handoff) => {
                        let message = format!("webhook refused: {}", handoff.status_code);
                        self.idempotency
                            .after_execute(session_id, state, attempt, false, None)
                            .await?;
                        if self.retry.should_retry(attempt) {
                            self.retry.wait_before_retry(attempt).await;
                            continue;
                        }
                        return self.finish_failed(tenant, session_id, state, &message).await;
                    }
                    Err(e) => {
                        self.idempotency
                            .after_execute(session_id, state, attempt, false, None)
                            .await?;
                        if self.retry.should_retry(attempt) {
                            self.retry.wait_before_retry(attempt).await;
                            continue;
                        }
                        return self.finish_failed(tenant, session_id, state, &e.to_string()).await;
                    }
                }
            }

            let result = self
                .invoke(tenant, session_id, state, node_ref, params, attempt)
                .await;

            // 7–8. Record, fan out, and act on the result status.
            self.record_result(tenant, session_id, state, attempt, &result).await?;

            match result.status {
                NodeStatus::Success => {
                    if depth >= MAX_CHAIN_DEPTH {
                        tracing::warn!(
                            session_id = %session_id,
                            depth,
                            "dispatch cascade depth limit reached"
                        );
                        return Ok(DispatchOutcome {
                            state: state.to_owned(),
                            disposition: Disposition::Advanced,
                            result: Some(result),
                        });
                    }
                    let outcome = self
                        .dispatch_inner(tenant, session_id, STEP_DONE, depth + 1)
                        .await?;
                    return Ok(DispatchOutcome {
                        result: outcome.result.or(Some(result)),
                        ..outcome
                    });
                }
                NodeStatus::NeedUserInput => {
                    self.set_status(tenant_id, session_id, state, "waiting_user").await?;
                    // Feed the trigger when the flow routes it; otherwise the
                    // waiting status alone holds the session.
                    match self.dispatch_inner(tenant, session_id, NEED_USER_INPUT, depth + 1).await
                    {
                        Ok(outcome) => {
                            return Ok(DispatchOutcome {
                                result: outcome.result.or(Some(result)),
                                ..outcome
                            })
                        }
                        Err(Error::InvalidTransition { .. }) => {
                            return Ok(DispatchOutcome {
                                state: state.to_owned(),
                                disposition: Disposition::WaitingUser,
                                result: Some(result),
                            })
                        }
                        Err(e) => return Err(e),
                    }
                }
                NodeStatus::Aborted => {
                    return self.finish_aborted(tenant, session_id, state).await;
                }
                NodeStatus::Error => {
                    let message = result
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "node execution failed".into());
                    if self.retry.should_retry(attempt) {
                        self.metrics.inc("node_retries");
                        self.retry.wait_before_retry(attempt).await;
                        continue;
                    }
                    return self.finish_failed(tenant, session_id, state, &message).await;
                }
            }
        }
    }

    /// Invoke a builtin node, mapping panics-by-error into an error result.
    async fn invoke(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        step: &str,
        node_ref: &str,
        params: &Value,
        attempt: u32,
    ) -> NodeResult {
        let node = match self.registry.resolve(node_ref) {
            Ok(ResolvedNode::Builtin(node)) => node,
            Ok(ResolvedNode::Webhook(_)) => {
                return NodeResult::error(format!("{node_ref} is a webhook, not a builtin"))
            }
            Err(e) => return NodeResult::error(e.to_string()),
        };

        let node_id = node.node_id().to_owned();
        self.metrics.inc(&format!("node_exec:{node_id}"));
        tracing::debug!(
            session_id = %session_id,
            node_id = %node_id,
            step = %step,
            attempt,
            "node execute"
        );

        let started = Instant::now();
        let result = node
            .execute(NodeContext {
                tenant_id: tenant.tenant_id.clone(),
                session_id: session_id.to_owned(),
                params: params.clone(),
                blackboard: self.blackboard.clone(),
                trace_id: Some(tenant.trace_id.clone()),
            })
            .await
            .unwrap_or_else(|e| {
                self.metrics.inc(&format!("node_error:{node_id}"));
                NodeResult::error(e.to_string())
            });
        self.metrics.observe(
            &format!("node_latency:{node_id}"),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        result
    }

    /// Persist artifacts, append the result event, publish it, and finalize
    /// the idempotency row.
    async fn record_result(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        step: &str,
        attempt: u32,
        result: &NodeResult,
    ) -> Result<()> {
        let tenant_id = tenant.tenant_id.as_str();

        for (artifact_id, value) in &result.artifacts {
            self.blackboard
                .write_artifact(tenant_id, session_id, artifact_id, value)?;
        }

        let (kind, success) = match result.status {
            NodeStatus::Success | NodeStatus::NeedUserInput => (EVENT_RESULT, true),
            NodeStatus::Aborted => (EVENT_ABORTED, false),
            NodeStatus::Error => (EVENT_ERROR, false),
        };
        self.record_and_publish(
            EventEnvelope::new(kind, SOURCE, tenant_id, session_id)?
                .with_trace(Some(tenant.trace_id.clone()))
                .with_states(Some(step.to_owned()), None)
                .with_payload(json!({
                    "status": result.status.as_str(),
                    "attempt": attempt,
                    "result": result.result,
                    "ui_schema": result.ui_schema,
                    "artifacts": result.artifacts.keys().collect::<Vec<_>>(),
                    "error_message": result.error_message,
                })),
        )
        .await?;

        if result.is_success() {
            // The STEP_DONE row is what fan-in checks look for.
            self.record_and_publish(
                EventEnvelope::new(STEP_DONE, SOURCE, tenant_id, session_id)?
                    .with_trace(Some(tenant.trace_id.clone()))
                    .with_states(Some(step.to_owned()), None),
            )
            .await?;
        }

        self.idempotency
            .after_execute(session_id, step, attempt, success, Some(&result.result))
            .await
    }

    // ── Finishers ───────────────────────────────────────────────

    async fn finish_terminal(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        state: &str,
    ) -> Result<DispatchOutcome> {
        let tenant_id = tenant.tenant_id.as_str();
        let status = match state {
            "error" => "error",
            "aborted" => "aborted",
            _ => "completed",
        };
        self.blackboard
            .set_state(tenant_id, session_id, "_status", &json!(status));
        self.sessions.mark_completed(session_id, status).await?;
        if status == "completed" {
            self.record_and_publish(
                EventEnvelope::new(SESSION_COMPLETE, SOURCE, tenant_id, session_id)?
                    .with_trace(Some(tenant.trace_id.clone()))
                    .with_states(Some(state.to_owned()), None),
            )
            .await?;
            self.metrics.inc("sessions_completed");
        }
        Ok(DispatchOutcome {
            state: state.to_owned(),
            disposition: Disposition::Completed,
            result: None,
        })
    }

    async fn finish_aborted(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        at: &str,
    ) -> Result<DispatchOutcome> {
        let tenant_id = tenant.tenant_id.as_str();
        self.record_and_publish(
            EventEnvelope::new(EVENT_ABORTED, SOURCE, tenant_id, session_id)?
                .with_trace(Some(tenant.trace_id.clone()))
                .with_payload(json!({
                    "at": at,
                    "reason": self.stopper.abort_reason(tenant_id, session_id),
                })),
        )
        .await?;
        self.sessions.mark_completed(session_id, "aborted").await?;
        self.metrics.inc("sessions_aborted");
        Ok(DispatchOutcome {
            state: at.to_owned(),
            disposition: Disposition::Aborted,
            result: None,
        })
    }

    async fn finish_failed(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        state: &str,
        message: &str,
    ) -> Result<DispatchOutcome> {
        let tenant_id = tenant.tenant_id.as_str();
        // Route the flow to its error state when it defines one; otherwise
        // the status flag alone marks the failure.
        match self.dispatch_inner(tenant, session_id, ERROR, MAX_CHAIN_DEPTH).await {
            Ok(_) => {}
            Err(Error::InvalidTransition { .. }) => {
                self.blackboard
                    .set_state(tenant_id, session_id, "_status", &json!("error"));
                self.sessions.update_state(session_id, state, "error").await?;
            }
            Err(e) => return Err(e),
        }
        self.metrics.inc("sessions_failed");
        Ok(DispatchOutcome {
            state: state.to_owned(),
            disposition: Disposition::Failed {
                message: message.to_owned(),
            },
            result: None,
        })
    }

    // ── Helpers ─────────────────────────────────────────────────

    async fn advance_with_retries(
        &self,
        machine: &FlowMachine,
        tenant_id: &str,
        session_id: &str,
        trigger: &str,
    ) -> Result<String> {
        let mut last_conflict = None;
        for round in 0..self.fsm_advance_retries.max(1) {
            match machine.advance_atomic(&self.store, tenant_id, session_id, trigger, self.session_ttl)
            {
                Ok(state) => return Ok(state),
                Err(e @ Error::Conflict { .. }) => {
                    tracing::debug!(
                        session_id = %session_id,
                        round,
                        "fsm advance conflict, re-reading"
                    );
                    self.metrics.inc("fsm_conflicts");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or(Error::Conflict {
            expected: String::new(),
            current: String::new(),
        }))
    }

    fn machine(&self, tenant_id: &str, session_id: &str) -> FlowMachine {
        match self.flow(tenant_id, session_id) {
            Some(flow) => FlowMachine::from_flow(&flow),
            None => FlowMachine::implicit(),
        }
    }

    fn flow(&self, tenant_id: &str, session_id: &str) -> Option<FlowDefinition> {
        let flow_id = self
            .blackboard
            .get_state(tenant_id, session_id, "_flow_id")?
            .as_str()?
            .to_owned();
        self.flows.get(&flow_id)
    }

    fn node_ref_for(
        &self,
        flow: Option<&FlowDefinition>,
        tenant_id: &str,
        session_id: &str,
        state: &str,
    ) -> Option<String> {
        match flow {
            Some(flow) => flow.node_ref(state).map(str::to_owned),
            None if state == crate::fsm::IMPLICIT_INITIAL_STATE => self
                .blackboard
                .get_state(tenant_id, session_id, "_node_id")
                .and_then(|v| v.as_str().map(|id| format!("builtin://{id}"))),
            None => None,
        }
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        session_id: &str,
        state: &str,
        status: &str,
    ) -> Result<()> {
        self.blackboard
            .set_state(tenant_id, session_id, "_status", &json!(status));
        self.sessions.update_state(session_id, state, status).await
    }

    /// Append to the audit log then publish on the bus, both under the
    /// session's publish lock so insertion order equals publish order.
    async fn record_and_publish(&self, mut event: EventEnvelope) -> Result<()> {
        let lock = {
            let mut locks = self.publish_locks.lock();
            locks
                .entry(event.session_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        event.tick = next_tick(&self.store, &event.tenant_id, &event.session_id);
        self.events.append(&event).await?;
        self.bus.publish(&event);
        Ok(())
    }
}
