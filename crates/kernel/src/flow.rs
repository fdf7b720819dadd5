//! Flow definitions — YAML-described FSM templates over states, transitions,
//! and a state-to-node map.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use tempo_domain::{Error, Result};

use parking_lot::RwLock;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub from: String,
    pub event: String,
    pub to: String,
    #[serde(default)]
    pub fan_in: bool,
}

/// Parsed and validated workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub initial_state: String,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub state_node_map: HashMap<String, String>,
    #[serde(default)]
    pub user_input_states: Vec<String>,
}

impl FlowDefinition {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut flow: FlowDefinition = serde_yaml::from_str(raw)
            .map_err(|e| Error::BadRequest(format!("flow yaml: {e}")))?;
        if flow.initial_state.is_empty() {
            flow.initial_state = flow.states.first().cloned().unwrap_or_default();
        }
        Ok(flow)
    }

    pub fn node_ref(&self, state: &str) -> Option<&str> {
        self.state_node_map.get(state).map(String::as_str)
    }

    pub fn is_user_input_state(&self, state: &str) -> bool {
        self.user_input_states.iter().any(|s| s == state)
    }

    /// The transition matching `(from, event)`, if any.
    pub fn transition(&self, from: &str, event: &str) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.event == event)
    }

    /// Prerequisite steps of a fan-in state: every state with a transition
    /// into it. Fan-in readiness itself is decided by event-log lookups, not
    /// by this structural set.
    pub fn fan_in_prerequisites(&self, to_state: &str) -> Vec<String> {
        let mut steps: Vec<String> = self
            .transitions
            .iter()
            .filter(|t| t.to == to_state)
            .map(|t| t.from.clone())
            .collect();
        steps.sort();
        steps.dedup();
        steps
    }

    /// Validate the definition. Returns violation messages (empty = valid).
    pub fn validate(&self, registered_builtins: Option<&HashSet<String>>) -> Vec<String> {
        let mut errors = Vec::new();

        if self.states.len() < 2 {
            errors.push("flow must have at least 2 states".into());
        }
        let state_set: HashSet<&str> = self.states.iter().map(String::as_str).collect();
        if !state_set.contains(self.initial_state.as_str()) {
            errors.push(format!(
                "initial_state '{}' not in states",
                self.initial_state
            ));
        }

        for t in &self.transitions {
            if !state_set.contains(t.from.as_str()) {
                errors.push(format!("transition from unknown state '{}'", t.from));
            }
            if !state_set.contains(t.to.as_str()) {
                errors.push(format!("transition to unknown state '{}'", t.to));
            }
        }

        for (state, node_ref) in &self.state_node_map {
            if !state_set.contains(state.as_str()) {
                errors.push(format!("state_node_map references unknown state '{state}'"));
            }
            if !(node_ref.starts_with("builtin://")
                || node_ref.starts_with("http://")
                || node_ref.starts_with("https://"))
            {
                errors.push(format!(
                    "invalid node_ref '{node_ref}' for state '{state}': must start with builtin:// or http(s)://"
                ));
            }
            if let Some(registered) = registered_builtins {
                if let Some(node_id) = node_ref.strip_prefix("builtin://") {
                    if !registered.contains(node_id) {
                        errors.push(format!(
                            "node '{node_id}' not registered (referenced by state '{state}')"
                        ));
                    }
                }
            }
        }

        for state in &self.user_input_states {
            if !state_set.contains(state.as_str()) {
                errors.push(format!("user_input_states references unknown state '{state}'"));
            }
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory catalog of registered flows, keyed by flow id.
pub struct FlowCatalog {
    flows: RwLock<HashMap<String, FlowDefinition>>,
}

impl Default for FlowCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a flow. Returns validation errors (empty = ok,
    /// flow stored).
    pub fn register(
        &self,
        flow_id: &str,
        flow: FlowDefinition,
        registered_builtins: Option<&HashSet<String>>,
    ) -> Vec<String> {
        let errors = flow.validate(registered_builtins);
        if errors.is_empty() {
            self.flows.write().insert(flow_id.to_owned(), flow);
        }
        errors
    }

    pub fn get(&self, flow_id: &str) -> Option<FlowDefinition> {
        self.flows.read().get(flow_id).cloned()
    }

    pub fn list(&self) -> Vec<(String, String, String)> {
        let flows = self.flows.read();
        let mut out: Vec<(String, String, String)> = flows
            .iter()
            .map(|(id, f)| (id.clone(), f.name.clone(), f.description.clone()))
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.flows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.read().is_empty()
    }
}
