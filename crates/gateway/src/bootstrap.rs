//! AppState construction and background-service wiring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use tempo_clients::{LlmClient, PolicySigner, TongluClient, WebhookCaller};
use tempo_domain::config::Config;
use tempo_domain::node::NodeKind;
use tempo_kernel::clock::{ClockHandle, TempoClock};
use tempo_kernel::metrics::Metrics;
use tempo_kernel::registry::WebhookNode;
use tempo_kernel::reliability::{HardStopper, IdempotencyGuard, RetryPolicy};
use tempo_kernel::{
    Blackboard, Dispatcher, EventBus, FastStore, FlowCatalog, FlowDefinition, NodeRegistry,
    SessionManager,
};
use tempo_storage::{
    Database, EventRepo, FlowRepo, IdempotencyRepo, NodeRepo, SessionRepo, SnapshotRepo,
};

use crate::runtime::lock::SessionLockMap;
use crate::state::AppState;

/// Initialize every subsystem and return a fully wired [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Fast store, bus, blackboard ──────────────────────────────
    let store = Arc::new(FastStore::new());
    let bus = Arc::new(EventBus::new());
    let session_ttl = Duration::from_secs(config.sessions.ttl_seconds);
    let blackboard = Arc::new(Blackboard::new(
        store.clone(),
        session_ttl,
        Duration::from_secs(config.sessions.artifact_ttl_seconds),
    ));

    // ── Durable storage ──────────────────────────────────────────
    let db = Database::from_path(&config.storage.database_path, config.storage.max_connections)
        .await
        .context("opening database")?;
    let sessions = SessionRepo::new(db.pool().clone());
    let events = EventRepo::new(db.pool().clone());
    let flow_repo = FlowRepo::new(db.pool().clone());
    let node_repo = NodeRepo::new(db.pool().clone());
    let snapshots = SnapshotRepo::new(db.pool().clone());
    let idempotency = Arc::new(IdempotencyGuard::new(IdempotencyRepo::new(db.pool().clone())));
    tracing::info!(path = %config.storage.database_path, "durable storage ready");

    // ── External clients ─────────────────────────────────────────
    let llm = Arc::new(LlmClient::from_config(&config.llm).context("llm client")?);
    let tonglu = Arc::new(TongluClient::from_config(&config.tonglu).context("tonglu client")?);
    let signer = Arc::new(PolicySigner::new(config.oss.clone()));
    let webhooks = Arc::new(
        WebhookCaller::new(Duration::from_secs(config.workflow.webhook_timeout_secs))
            .context("webhook caller")?,
    );
    tracing::info!(
        llm_configured = llm.is_configured(),
        oss_configured = signer.is_configured(),
        "external clients ready"
    );

    // ── Node registry ────────────────────────────────────────────
    let registry = Arc::new(NodeRegistry::new());
    tempo_nodes::register_builtin_nodes(&registry, llm.clone(), tonglu.clone());
    persist_builtins(&registry, &node_repo).await?;
    reload_webhooks(&registry, &node_repo).await?;

    let metrics = Arc::new(Metrics::new());
    metrics.set_gauge("nodes_registered", registry.len() as f64);

    // ── Flows ────────────────────────────────────────────────────
    let flows = Arc::new(FlowCatalog::new());
    load_flows_from_dir(&flows, &registry, &config.workflow.flows_dir);
    reload_flows(&flows, &registry, &flow_repo).await?;
    metrics.set_gauge("flows_registered", flows.len() as f64);

    // ── Reliability + dispatcher ─────────────────────────────────
    let stopper = Arc::new(HardStopper::new(
        store.clone(),
        bus.clone(),
        blackboard.clone(),
        events.clone(),
        sessions.clone(),
    ));
    let callback_base = format!("http://{}:{}", config.server.host, config.server.port);
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
        RetryPolicy::from_config(&config.workflow.retry),
        webhooks,
        metrics.clone(),
        config.workflow.fsm_advance_retries,
        session_ttl,
        callback_base,
    ));

    let session_manager = Arc::new(SessionManager::new(
        store.clone(),
        bus.clone(),
        blackboard.clone(),
        flows.clone(),
        sessions.clone(),
        snapshots,
        events.clone(),
        session_ttl,
    ));

    Ok(AppState {
        config,
        store,
        bus,
        blackboard,
        flows,
        registry,
        metrics,
        sessions,
        events,
        flow_repo,
        node_repo,
        stopper,
        dispatcher,
        session_manager,
        llm,
        tonglu,
        signer,
        session_locks: Arc::new(SessionLockMap::new()),
    })
}

/// Spawn the tempo clock (TTL sweeps) and the capture listener.
pub fn start_background(state: &AppState) -> ClockHandle {
    crate::capture::spawn(state.clone());

    let mut clock = TempoClock::new(Duration::from_secs(
        state.config.sessions.sweep_interval_secs,
    ));
    let sweep_state = state.clone();
    clock.on_tick(move |tick| {
        let state = sweep_state.clone();
        async move {
            let evicted = state.store.sweep_expired();
            state.session_locks.prune_idle();
            match state.session_manager.sweep_expired().await {
                Ok(paused) if paused > 0 => {
                    tracing::info!(tick, paused, evicted, "ttl sweep paused sessions")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(tick, error = %e, "ttl sweep failed"),
            }
            state
                .metrics
                .set_gauge("fast_store_keys", state.store.len() as f64);
        }
    });
    clock.start()
}

// ── Startup wiring helpers ──────────────────────────────────────────

/// Upsert every builtin into the durable registry so peers converge.
async fn persist_builtins(registry: &NodeRegistry, node_repo: &NodeRepo) -> anyhow::Result<()> {
    for info in registry.list() {
        if info.node_type == NodeKind::Builtin {
            node_repo.upsert(&info).await.context("persisting builtin node")?;
        }
    }
    Ok(())
}

/// Re-register webhook nodes recorded by this or a peer instance.
async fn reload_webhooks(registry: &NodeRegistry, node_repo: &NodeRepo) -> anyhow::Result<()> {
    let rows = node_repo.list(Some("webhook")).await.context("loading webhook nodes")?;
    let count = rows.len();
    for row in rows {
        let Some(endpoint) = row.endpoint else { continue };
        registry.register_webhook(WebhookNode {
            node_id: row.node_id,
            name: row.name,
            endpoint,
            description: row.description,
            param_schema: row
                .param_schema
                .and_then(|raw| serde_json::from_str(&raw).ok()),
        });
    }
    if count > 0 {
        tracing::info!(count, "webhook nodes reloaded from registry table");
    }
    Ok(())
}

fn load_flows_from_dir(flows: &FlowCatalog, registry: &NodeRegistry, dir: &str) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::info!(dir, "no flow directory, skipping");
        return;
    };
    let builtins = registry.builtin_ids();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "flow file unreadable");
                continue;
            }
        };
        match FlowDefinition::from_yaml(&raw) {
            Ok(flow) => {
                let flow_id = flow.name.clone();
                let errors = flows.register(&flow_id, flow, Some(&builtins));
                if errors.is_empty() {
                    tracing::info!(flow_id = %flow_id, "flow loaded");
                } else {
                    tracing::warn!(flow_id = %flow_id, ?errors, "flow rejected");
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "flow parse failed"),
        }
    }
}

/// Flows registered through the API live in the flow table; load them after
/// the directory so dynamic registrations win.
async fn reload_flows(
    flows: &FlowCatalog,
    registry: &NodeRegistry,
    flow_repo: &FlowRepo,
) -> anyhow::Result<()> {
    let builtins = registry.builtin_ids();
    for record in flow_repo.list().await.context("loading flows")? {
        match FlowDefinition::from_yaml(&record.yaml_content) {
            Ok(mut flow) => {
                flow.name = record.name;
                flow.description = record.description;
                let errors = flows.register(&record.flow_id, flow, Some(&builtins));
                if !errors.is_empty() {
                    tracing::warn!(flow_id = %record.flow_id, ?errors, "stored flow rejected");
                }
            }
            Err(e) => {
                tracing::warn!(flow_id = %record.flow_id, error = %e, "stored flow parse failed")
            }
        }
    }
    Ok(())
}
