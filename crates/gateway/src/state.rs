use std::sync::Arc;

use tempo_clients::{LlmClient, PolicySigner, TongluClient};
use tempo_domain::config::Config;
use tempo_kernel::metrics::Metrics;
use tempo_kernel::reliability::HardStopper;
use tempo_kernel::{
    Blackboard, Dispatcher, EventBus, FastStore, FlowCatalog, NodeRegistry, SessionManager,
};
use tempo_storage::{EventRepo, FlowRepo, NodeRepo, SessionRepo};

use crate::runtime::lock::SessionLockMap;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<FastStore>,
    pub bus: Arc<EventBus>,
    pub blackboard: Arc<Blackboard>,
    pub flows: Arc<FlowCatalog>,
    pub registry: Arc<NodeRegistry>,
    pub metrics: Arc<Metrics>,
    pub sessions: SessionRepo,
    pub events: EventRepo,
    pub flow_repo: FlowRepo,
    pub node_repo: NodeRepo,
    pub stopper: Arc<HardStopper>,
    pub dispatcher: Arc<Dispatcher>,
    pub session_manager: Arc<SessionManager>,
    pub llm: Arc<LlmClient>,
    pub tonglu: Arc<TongluClient>,
    pub signer: Arc<PolicySigner>,
    /// Per-session chat input lock: one streaming turn at a time.
    pub session_locks: Arc<SessionLockMap>,
}
