//! The TempoOS execution kernel.
//!
//! Everything between the HTTP surface and the external services lives here:
//! the tenant-scoped fast store and event bus, the per-session blackboard,
//! the config-driven FSM with atomic advance, the flow catalog, the node
//! registry, the session manager, the dispatcher (sole writer of state
//! transitions and audit records), and the reliability layer (idempotency,
//! fan-in, hard-stop, retry).

pub mod blackboard;
pub mod bus;
pub mod clock;
pub mod dispatcher;
pub mod flow;
pub mod fsm;
pub mod keys;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod reliability;
pub mod session;
pub mod store;

pub use blackboard::Blackboard;
pub use bus::{BusSubscription, EventBus};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use flow::{FlowCatalog, FlowDefinition};
pub use fsm::FlowMachine;
pub use node::Node;
pub use registry::{NodeRegistry, ResolvedNode};
pub use session::SessionManager;
pub use store::FastStore;
