//! The node registry — resolves `builtin://` and `http(s)://` node
//! references to executors.
//!
//! Builtins are registered at process startup and immutable afterwards;
//! webhooks may be registered dynamically. Durable registration (so peer
//! instances converge) is the caller's job via the node-registry repository;
//! this type is the in-memory view.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use tempo_domain::node::{NodeInfo, NodeKind};
use tempo_domain::{Error, Result};

use crate::node::Node;

pub const BUILTIN_PREFIX: &str = "builtin://";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Webhook descriptor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct WebhookNode {
    pub node_id: String,
    pub name: String,
    pub endpoint: String,
    pub description: String,
    pub param_schema: Option<Value>,
}

/// What a `node_ref` resolves to.
pub enum ResolvedNode {
    Builtin(Arc<dyn Node>),
    Webhook(WebhookNode),
}

impl std::fmt::Debug for ResolvedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedNode::Builtin(node) => {
                f.debug_tuple("Builtin").field(&node.node_id()).finish()
            }
            ResolvedNode::Webhook(webhook) => f.debug_tuple("Webhook").field(webhook).finish(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct NodeRegistry {
    builtins: RwLock<HashMap<String, Arc<dyn Node>>>,
    webhooks: RwLock<HashMap<String, WebhookNode>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            builtins: RwLock::new(HashMap::new()),
            webhooks: RwLock::new(HashMap::new()),
        }
    }

    // ── Registration ────────────────────────────────────────────

    pub fn register_builtin(&self, node: Arc<dyn Node>) {
        let node_id = node.node_id().to_owned();
        tracing::info!(node_id = %node_id, name = %node.name(), "registered builtin node");
        self.builtins.write().insert(node_id, node);
    }

    pub fn register_webhook(&self, webhook: WebhookNode) {
        tracing::info!(
            node_id = %webhook.node_id,
            endpoint = %webhook.endpoint,
            "registered webhook node"
        );
        self.webhooks.write().insert(webhook.node_id.clone(), webhook);
    }

    // ── Resolution ──────────────────────────────────────────────

    /// Resolve a node reference string.
    ///
    /// `builtin://search` → the in-process node; `https://…` → the webhook
    /// registered under that endpoint, or an ad-hoc descriptor for endpoints
    /// a flow names directly.
    pub fn resolve(&self, node_ref: &str) -> Result<ResolvedNode> {
        if let Some(node_id) = node_ref.strip_prefix(BUILTIN_PREFIX) {
            return self
                .builtins
                .read()
                .get(node_id)
                .cloned()
                .map(ResolvedNode::Builtin)
                .ok_or_else(|| Error::NodeNotFound(node_ref.to_owned()));
        }
        if node_ref.starts_with("http://") || node_ref.starts_with("https://") {
            let webhooks = self.webhooks.read();
            if let Some(webhook) = webhooks.values().find(|w| w.endpoint == node_ref) {
                return Ok(ResolvedNode::Webhook(webhook.clone()));
            }
            return Ok(ResolvedNode::Webhook(WebhookNode {
                node_id: "adhoc".into(),
                name: "adhoc".into(),
                endpoint: node_ref.to_owned(),
                description: String::new(),
                param_schema: None,
            }));
        }
        Err(Error::NodeNotFound(node_ref.to_owned()))
    }

    pub fn get_webhook(&self, node_id: &str) -> Option<WebhookNode> {
        self.webhooks.read().get(node_id).cloned()
    }

    pub fn has_builtin(&self, node_id: &str) -> bool {
        self.builtins.read().contains_key(node_id)
    }

    // ── Listing ─────────────────────────────────────────────────

    pub fn builtin_ids(&self) -> HashSet<String> {
        self.builtins.read().keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<NodeInfo> {
        let mut out: Vec<NodeInfo> = self
            .builtins
            .read()
            .values()
            .map(|n| NodeInfo {
                node_id: n.node_id().to_owned(),
                node_type: NodeKind::Builtin,
                name: n.name().to_owned(),
                description: n.description().to_owned(),
                endpoint: None,
                param_schema: Some(n.param_schema()),
            })
            .collect();
        out.extend(self.webhooks.read().values().map(|w| NodeInfo {
            node_id: w.node_id.clone(),
            node_type: NodeKind::Webhook,
            name: w.name.clone(),
            description: w.description.clone(),
            endpoint: Some(w.endpoint.clone()),
            param_schema: w.param_schema.clone(),
        }));
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    pub fn len(&self) -> usize {
        self.builtins.read().len() + self.webhooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
