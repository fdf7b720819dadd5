//! The builtin-node execution contract.
//!
//! Builtin nodes run in-process and talk to the world through the
//! [`Blackboard`] handed to them; webhook nodes live behind HTTP and are
//! described in the registry instead of implementing this trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tempo_domain::{NodeResult, Result};

use crate::blackboard::Blackboard;

/// Everything a builtin node gets for one execution.
pub struct NodeContext {
    pub tenant_id: String,
    pub session_id: String,
    pub params: Value,
    pub blackboard: Arc<Blackboard>,
    pub trace_id: Option<String>,
}

impl NodeContext {
    /// Cooperative cancellation check. Builtin nodes must poll this at every
    /// suspension point and return `NodeResult::aborted()` when set.
    pub fn aborted(&self) -> bool {
        self.blackboard
            .get_signal(&self.tenant_id, &self.session_id, "abort")
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }
}

#[async_trait]
pub trait Node: Send + Sync {
    fn node_id(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str {
        ""
    }
    /// JSON Schema of the accepted params object.
    fn param_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeResult>;
}
