//! Session lifecycle management.
//!
//! Creates explicit (flow-backed) and implicit (single-node) sessions,
//! inherits blackboard artifacts between sessions, pushes user events into
//! the audit/bus pipeline, and runs the TTL sweep that pages aged-out
//! sessions into cold snapshots — rehydrated on the next event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use tempo_domain::event::{SESSION_PAUSE, SESSION_RESUME, SESSION_START};
use tempo_domain::{Error, EventEnvelope, Result, TenantContext};
use tempo_storage::{EventRepo, SessionRepo, SnapshotRepo};

use crate::blackboard::Blackboard;
use crate::bus::EventBus;
use crate::dispatcher::next_tick;
use crate::flow::FlowCatalog;
use crate::fsm::{FlowMachine, FSM_STATE_FIELD, IMPLICIT_INITIAL_STATE};
use crate::store::FastStore;

/// Accumulated-result lists captured into snapshots.
const SNAPSHOT_TOOLS: &[&str] = &["search", "data_query", "writer"];

pub struct SessionManager {
    store: Arc<FastStore>,
    bus: Arc<EventBus>,
    blackboard: Arc<Blackboard>,
    flows: Arc<FlowCatalog>,
    sessions: SessionRepo,
    snapshots: SnapshotRepo,
    events: EventRepo,
    session_ttl: Duration,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<FastStore>,
        bus: Arc<EventBus>,
        blackboard: Arc<Blackboard>,
        flows: Arc<FlowCatalog>,
        sessions: SessionRepo,
        snapshots: SnapshotRepo,
        events: EventRepo,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            blackboard,
            flows,
            sessions,
            snapshots,
            events,
            session_ttl,
        }
    }

    // ── Start (explicit flow) ───────────────────────────────────

    /// Start an explicit multi-step flow. Writes the session record in
    /// `running`, seeds the blackboard, and audits SESSION_START. The first
    /// step runs when the caller hands the initial trigger to the dispatcher.
    pub async fn start_flow(
        &self,
        tenant: &TenantContext,
        flow_id: &str,
        params: &Value,
    ) -> Result<String> {
        let flow = self
            .flows
            .get(flow_id)
            .ok_or_else(|| Error::FlowNotFound(flow_id.to_owned()))?;
        let session_id = Uuid::new_v4().to_string();

        self.seed_session(&tenant.tenant_id, &session_id, params);
        self.blackboard
            .set_state(&tenant.tenant_id, &session_id, "_flow_id", &json!(flow_id));

        self.sessions
            .create(
                &session_id,
                &tenant.tenant_id,
                Some(flow_id),
                params,
                self.session_ttl.as_secs(),
                &flow.initial_state,
            )
            .await?;

        self.audit_start(
            tenant,
            &session_id,
            json!({
                "flow_id": flow_id,
                "initial_state": flow.initial_state,
                "params": params,
            }),
        )
        .await?;

        tracing::info!(
            flow_id = %flow_id,
            session_id = %session_id,
            initial_state = %flow.initial_state,
            "flow session started"
        );
        Ok(session_id)
    }

    // ── Start (implicit single node) ────────────────────────────

    /// Start an implicit session around one node: a synthetic
    /// `[execute] --STEP_DONE--> [end]` machine. The session stays alive
    /// (TTL-based) so later operations can inherit its blackboard.
    pub async fn start_single_node(
        &self,
        tenant: &TenantContext,
        node_id: &str,
        params: &Value,
    ) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();

        self.seed_session(&tenant.tenant_id, &session_id, params);
        self.blackboard
            .set_state(&tenant.tenant_id, &session_id, "_node_id", &json!(node_id));
        self.blackboard
            .set_state(&tenant.tenant_id, &session_id, "_implicit", &json!(true));

        self.sessions
            .create(
                &session_id,
                &tenant.tenant_id,
                None,
                params,
                self.session_ttl.as_secs(),
                IMPLICIT_INITIAL_STATE,
            )
            .await?;

        self.audit_start(
            tenant,
            &session_id,
            json!({ "node_id": node_id, "implicit": true, "params": params }),
        )
        .await?;

        tracing::info!(node_id = %node_id, session_id = %session_id, "implicit session started");
        Ok(session_id)
    }

    // ── Inherit ─────────────────────────────────────────────────

    /// Start a new flow session that inherits the artifacts of a prior
    /// session. The source session is not modified.
    pub async fn inherit(
        &self,
        tenant: &TenantContext,
        flow_id: &str,
        from_session_id: &str,
        params: &Value,
    ) -> Result<String> {
        let session_id = self.start_flow(tenant, flow_id, params).await?;

        let artifact_ids = self
            .blackboard
            .list_artifacts(&tenant.tenant_id, from_session_id);
        for artifact_id in &artifact_ids {
            if let Some(value) =
                self.blackboard
                    .read_artifact(&tenant.tenant_id, from_session_id, artifact_id)
            {
                self.blackboard
                    .write_artifact(&tenant.tenant_id, &session_id, artifact_id, &value)?;
            }
        }

        tracing::info!(
            session_id = %session_id,
            from = %from_session_id,
            artifacts = artifact_ids.len(),
            "session inherited blackboard artifacts"
        );
        Ok(session_id)
    }

    // ── Events ──────────────────────────────────────────────────

    /// Record and publish a user/control event. Rehydrates a paused session
    /// first; the caller drives the actual FSM advance via the dispatcher.
    pub async fn push_event(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<()> {
        self.ensure_live(&tenant.tenant_id, session_id).await?;

        if !payload.is_null() && payload != json!({}) {
            self.blackboard.set_state(
                &tenant.tenant_id,
                session_id,
                "_user_payload",
                &payload,
            );
        }

        let event = EventEnvelope::new(event_type, "user", &tenant.tenant_id, session_id)?
            .with_tick(next_tick(&self.store, &tenant.tenant_id, session_id))
            .with_trace(Some(tenant.trace_id.clone()))
            .with_payload(payload);
        self.events.append(&event).await?;
        self.bus.publish(&event);
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Current session status from the blackboard, falling back to the
    /// durable record for paged-out sessions.
    pub async fn status(&self, tenant_id: &str, session_id: &str) -> Result<String> {
        if let Some(status) = self.blackboard.get_state(tenant_id, session_id, "_status") {
            if let Some(s) = status.as_str() {
                return Ok(s.to_owned());
            }
        }
        let record = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_owned()))?;
        Ok(record.status)
    }

    pub fn flow_id(&self, tenant_id: &str, session_id: &str) -> Option<String> {
        self.blackboard
            .get_state(tenant_id, session_id, "_flow_id")
            .and_then(|v| v.as_str().map(str::to_owned))
    }

    /// The machine for a session: its flow's, or the implicit one.
    pub fn machine(&self, tenant_id: &str, session_id: &str) -> FlowMachine {
        match self
            .flow_id(tenant_id, session_id)
            .and_then(|flow_id| self.flows.get(&flow_id))
        {
            Some(flow) => FlowMachine::from_flow(&flow),
            None => FlowMachine::implicit(),
        }
    }

    // ── Rehydration ─────────────────────────────────────────────

    /// Make sure a session is present in the fast store, rehydrating from
    /// its cold snapshot if it was paged out.
    pub async fn ensure_live(&self, tenant_id: &str, session_id: &str) -> Result<()> {
        if self.blackboard.session_exists(tenant_id, session_id) {
            return Ok(());
        }
        let Some(snapshot) = self.snapshots.get(session_id).await? else {
            return Err(Error::SessionNotFound(session_id.to_owned()));
        };
        if snapshot.tenant_id != tenant_id {
            return Err(Error::SessionNotFound(session_id.to_owned()));
        }

        let fields: HashMap<String, Value> =
            serde_json::from_str(&snapshot.blackboard).unwrap_or_default();
        for (field, value) in &fields {
            self.blackboard.set_state(tenant_id, session_id, field, value);
        }
        let chat_history: Value =
            serde_json::from_str(&snapshot.chat_history).unwrap_or_else(|_| json!([]));
        self.blackboard
            .set_state(tenant_id, session_id, "_chat_history", &chat_history);
        let tool_results: HashMap<String, Value> =
            serde_json::from_str(&snapshot.tool_results).unwrap_or_default();
        for (tool, results) in &tool_results {
            if let Some(items) = results.as_array() {
                for item in items {
                    self.blackboard.append_result(tenant_id, session_id, tool, item);
                }
            }
        }
        let artifact_ids: Vec<String> =
            serde_json::from_str(&snapshot.artifacts).unwrap_or_default();
        for artifact_id in &artifact_ids {
            self.blackboard.track_artifact(tenant_id, session_id, artifact_id);
        }
        self.blackboard
            .set_state(tenant_id, session_id, "_status", &json!("running"));
        self.sessions
            .update_state(session_id, &snapshot.current_state, "running")
            .await?;

        let event = EventEnvelope::new(SESSION_RESUME, "session_manager", tenant_id, session_id)?
            .with_tick(next_tick(&self.store, tenant_id, session_id))
            .with_payload(json!({ "from_snapshot": true }));
        self.events.append(&event).await?;
        self.bus.publish(&event);

        tracing::info!(session_id = %session_id, "session rehydrated from snapshot");
        Ok(())
    }

    // ── TTL sweep ───────────────────────────────────────────────

    /// Page out sessions whose `last-update + ttl` has lapsed: persist a
    /// snapshot, mark them `paused`, and drop their fast-store state.
    /// Returns how many sessions were paused.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut paused = 0usize;

        for record in self.sessions.list_active().await? {
            let deadline = record.updated_at + ChronoDuration::seconds(record.ttl_seconds);
            if deadline > now {
                continue;
            }
            let tenant_id = record.tenant_id.clone();
            let session_id = record.session_id.clone();

            let mut fields = self.blackboard.get_all_state(&tenant_id, &session_id);
            let chat_history = fields
                .remove("_chat_history")
                .unwrap_or_else(|| json!([]));
            let chat_summary = fields
                .get("_chat_summary")
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            let routed_scene = fields
                .get("_routed_scene")
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            let current_state = fields
                .get(FSM_STATE_FIELD)
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or(record.current_state.clone());

            let mut tool_results = serde_json::Map::new();
            for tool in SNAPSHOT_TOOLS {
                let results = self.blackboard.get_results(&tenant_id, &session_id, tool, 50);
                if !results.is_empty() {
                    tool_results.insert(tool.to_string(), Value::Array(results));
                }
            }
            // The artifact set is dropped with the fast-store state and
            // rebuilt from here on rehydration; the blobs keep their own TTL.
            let artifact_ids = self.blackboard.list_artifacts(&tenant_id, &session_id);

            self.snapshots
                .upsert(
                    &session_id,
                    &tenant_id,
                    &current_state,
                    "paused",
                    &chat_history,
                    &Value::Object(fields.into_iter().collect()),
                    &Value::Object(tool_results),
                    &json!(artifact_ids),
                    &chat_summary,
                    &routed_scene,
                )
                .await?;
            self.sessions
                .update_state(&session_id, &current_state, "paused")
                .await?;
            self.blackboard.clear_session(&tenant_id, &session_id);

            let event =
                EventEnvelope::new(SESSION_PAUSE, "tempo_clock", &tenant_id, &session_id)?
                    .with_payload(json!({ "reason": "ttl_expired" }));
            self.events.append(&event).await?;
            self.bus.publish(&event);

            paused += 1;
            tracing::info!(session_id = %session_id, "session paged out to snapshot");
        }
        Ok(paused)
    }

    // ── Internals ───────────────────────────────────────────────

    fn seed_session(&self, tenant_id: &str, session_id: &str, params: &Value) {
        self.blackboard
            .set_state(tenant_id, session_id, "_status", &json!("running"));
        if !params.is_null() {
            self.blackboard
                .set_state(tenant_id, session_id, "_params", params);
        }
    }

    async fn audit_start(
        &self,
        tenant: &TenantContext,
        session_id: &str,
        payload: Value,
    ) -> Result<()> {
        let event =
            EventEnvelope::new(SESSION_START, "session_manager", &tenant.tenant_id, session_id)?
                .with_tick(next_tick(&self.store, &tenant.tenant_id, session_id))
                .with_trace(Some(tenant.trace_id.clone()))
                .with_payload(payload);
        self.events.append(&event).await?;
        self.bus.publish(&event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowDefinition;
    use tempo_storage::Database;

    const FLOW_YAML: &str = r#"
name: demo
states: [search, end]
initial_state: search
transitions:
  - { from: search, event: STEP_DONE, to: end }
state_node_map:
  search: builtin://search
"#;

    async fn manager() -> (SessionManager, Arc<Blackboard>, Arc<EventBus>, EventRepo, SessionRepo) {
        let store = Arc::new(FastStore::new());
        let bus = Arc::new(EventBus::new());
        let blackboard = Arc::new(Blackboard::with_defaults(store.clone()));
        let flows = Arc::new(FlowCatalog::new());
        flows.register(
            "demo",
            FlowDefinition::from_yaml(FLOW_YAML).unwrap(),
            None,
        );
        let db = Database::in_memory().await.unwrap();
        let sessions = SessionRepo::new(db.pool().clone());
        let snapshots = SnapshotRepo::new(db.pool().clone());
        let events = EventRepo::new(db.pool().clone());
        let manager = SessionManager::new(
            store,
            bus.clone(),
            blackboard.clone(),
            flows,
            sessions.clone(),
            snapshots,
            events.clone(),
            Duration::from_secs(1800),
        );
        (manager, blackboard, bus, events, sessions)
    }

    fn tenant() -> TenantContext {
        TenantContext::new("t1", Some("u1".into()), "tr-1").unwrap()
    }

    #[tokio::test]
    async fn start_flow_seeds_and_audits() {
        let (manager, blackboard, bus, events, sessions) = manager().await;
        let mut sub = bus.subscribe("t1");

        let session_id = manager
            .start_flow(&tenant(), "demo", &json!({"query": "钢管"}))
            .await
            .unwrap();

        assert_eq!(
            blackboard.get_state("t1", &session_id, "_flow_id").unwrap(),
            json!("demo")
        );
        assert_eq!(manager.status("t1", &session_id).await.unwrap(), "running");

        let record = sessions.get(&session_id).await.unwrap().unwrap();
        assert_eq!(record.flow_id.as_deref(), Some("demo"));
        assert_eq!(record.current_state, "search");

        // Implicit sessions and flow sessions alike appear in the audit log.
        let replayed = events.replay(&session_id).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].event_type, SESSION_START);
        assert_eq!(sub.recv().await.unwrap().kind, SESSION_START);
    }

    #[tokio::test]
    async fn unknown_flow_is_rejected() {
        let (manager, _, _, _, _) = manager().await;
        let err = manager
            .start_flow(&tenant(), "ghost", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FLOW_NOT_FOUND");
    }

    #[tokio::test]
    async fn implicit_session_is_audited() {
        let (manager, blackboard, _, events, _) = manager().await;
        let session_id = manager
            .start_single_node(&tenant(), "echo", &json!({"input": 1}))
            .await
            .unwrap();

        assert_eq!(
            blackboard.get_state("t1", &session_id, "_implicit").unwrap(),
            json!(true)
        );
        let replayed = events.replay(&session_id).await.unwrap();
        assert_eq!(replayed[0].event_type, SESSION_START);
        // Implicit sessions resolve to the synthetic machine.
        assert_eq!(manager.machine("t1", &session_id).initial_state(), "execute");
    }

    #[tokio::test]
    async fn inherit_copies_artifacts_without_touching_source() {
        let (manager, blackboard, _, _, _) = manager().await;
        let source = manager
            .start_single_node(&tenant(), "search", &json!({}))
            .await
            .unwrap();
        blackboard
            .write_artifact("t1", &source, "search_result", &json!({"rows": 3}))
            .unwrap();
        // A sibling session using the same artifact id must not bleed into
        // the inheritance.
        let sibling = manager
            .start_single_node(&tenant(), "search", &json!({}))
            .await
            .unwrap();
        blackboard
            .write_artifact("t1", &sibling, "search_result", &json!({"rows": 99}))
            .unwrap();

        let inherited = manager
            .inherit(&tenant(), "demo", &source, &json!({}))
            .await
            .unwrap();

        assert_eq!(blackboard.list_artifacts("t1", &inherited), vec!["search_result"]);
        assert_eq!(
            blackboard.read_artifact("t1", &inherited, "search_result").unwrap()["rows"],
            3
        );
        // Source untouched.
        assert_eq!(blackboard.list_artifacts("t1", &source), vec!["search_result"]);
        assert_eq!(
            blackboard.read_artifact("t1", &source, "search_result").unwrap()["rows"],
            3
        );
    }

    #[tokio::test]
    async fn push_event_requires_live_session() {
        let (manager, _, _, _, _) = manager().await;
        let err = manager
            .push_event(&tenant(), "ghost", "USER_CONFIRM", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn sweep_pages_out_and_push_event_rehydrates() {
        let (manager, blackboard, _, events, sessions) = manager().await;
        let session_id = manager.start_flow(&tenant(), "demo", &json!({})).await.unwrap();
        blackboard.set_state("t1", &session_id, "_chat_history", &json!([{"role": "user"}]));
        blackboard.set_state("t1", &session_id, "_routed_scene", &json!("procurement"));

        // Expire by forcing the record's TTL to zero.
        sqlx::query("UPDATE workflow_sessions SET ttl_seconds = 0 WHERE session_id = ?")
            .bind(&session_id)
            .execute(sessions_pool(&sessions))
            .await
            .unwrap();

        assert_eq!(manager.sweep_expired().await.unwrap(), 1);
        assert!(!blackboard.session_exists("t1", &session_id));
        assert_eq!(manager.status("t1", &session_id).await.unwrap(), "paused");

        // A subsequent event rehydrates from the snapshot.
        manager
            .push_event(&tenant(), &session_id, "USER_CONFIRM", json!({}))
            .await
            .unwrap();
        assert!(blackboard.session_exists("t1", &session_id));
        assert_eq!(
            blackboard.get_state("t1", &session_id, "_routed_scene").unwrap(),
            json!("procurement")
        );
        assert_eq!(manager.status("t1", &session_id).await.unwrap(), "running");

        let kinds: Vec<String> = events
            .replay(&session_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(kinds.contains(&SESSION_PAUSE.to_string()));
        assert!(kinds.contains(&SESSION_RESUME.to_string()));
    }

    #[tokio::test]
    async fn artifacts_survive_pause_and_rehydrate() {
        let (manager, blackboard, _, _, sessions) = manager().await;
        let session_id = manager.start_flow(&tenant(), "demo", &json!({})).await.unwrap();
        blackboard
            .write_artifact("t1", &session_id, "search_result", &json!({"rows": 3}))
            .unwrap();
        blackboard
            .write_artifact("t1", &session_id, "quotation_result", &json!({"total": 12000}))
            .unwrap();
        let before = blackboard.list_artifacts("t1", &session_id);

        sqlx::query("UPDATE workflow_sessions SET ttl_seconds = 0 WHERE session_id = ?")
            .bind(&session_id)
            .execute(sessions_pool(&sessions))
            .await
            .unwrap();
        assert_eq!(manager.sweep_expired().await.unwrap(), 1);
        assert!(blackboard.list_artifacts("t1", &session_id).is_empty());

        manager
            .push_event(&tenant(), &session_id, "USER_CONFIRM", json!({}))
            .await
            .unwrap();

        // The artifact set matches the written artifacts again, and every
        // listed id is still readable.
        assert_eq!(blackboard.list_artifacts("t1", &session_id), before);
        assert_eq!(
            blackboard
                .read_artifact("t1", &session_id, "search_result")
                .unwrap()["rows"],
            3
        );
        assert_eq!(
            blackboard
                .read_artifact("t1", &session_id, "quotation_result")
                .unwrap()["total"],
            12000
        );
    }

    // Test-only peek at the repo's pool for TTL manipulation.
    fn sessions_pool(repo: &SessionRepo) -> &sqlx::SqlitePool {
        repo.pool()
    }
}
