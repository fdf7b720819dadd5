//! Echo node — returns whatever it receives (testing and wiring checks).

use async_trait::async_trait;
use serde_json::json;

use tempo_domain::{NodeResult, Result};
use tempo_kernel::node::{Node, NodeContext};

pub struct EchoNode;

#[async_trait]
impl Node for EchoNode {
    fn node_id(&self) -> &str {
        "echo"
    }

    fn name(&self) -> &str {
        "Echo"
    }

    fn description(&self) -> &str {
        "Returns whatever it receives (for testing)"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeResult> {
        let data = ctx.params.get("input").cloned().unwrap_or(ctx.params.clone());
        Ok(NodeResult::success(json!({ "echo": data }))
            .with_artifact("echo_result", data.clone())
            .with_ui_schema(json!({
                "component": "document_preview",
                "title": "Echo",
                "data": { "sections": [{ "title": "Echo", "content": data.to_string() }] },
            })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempo_kernel::{Blackboard, FastStore};

    #[tokio::test]
    async fn echoes_input() {
        let blackboard = Arc::new(Blackboard::with_defaults(Arc::new(FastStore::new())));
        let result = EchoNode
            .execute(NodeContext {
                tenant_id: "t1".into(),
                session_id: "s1".into(),
                params: json!({ "input": { "q": 1 } }),
                blackboard,
                trace_id: None,
            })
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.result["echo"]["q"], 1);
        assert!(result.artifacts.contains_key("echo_result"));
    }
}
