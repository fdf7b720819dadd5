//! Data query node — retrieves internal records through the Tonglu data
//! service (semantic, structured, or hybrid).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tempo_clients::TongluClient;
use tempo_domain::{NodeResult, Result};
use tempo_kernel::node::{Node, NodeContext};

pub struct DataQueryNode {
    tonglu: Arc<TongluClient>,
}

impl DataQueryNode {
    pub fn new(tonglu: Arc<TongluClient>) -> Self {
        Self { tonglu }
    }
}

#[async_trait]
impl Node for DataQueryNode {
    fn node_id(&self) -> &str {
        "data_query"
    }

    fn name(&self) -> &str {
        "数据查询"
    }

    fn description(&self) -> &str {
        "从企业知识库中检索合同、发票、商品等内部数据（支持语义搜索和精确查询）"
    }

    fn param_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "intent": { "type": "string", "description": "查询意图（自然语言）" },
                "mode": { "type": "string", "enum": ["sql", "vector", "hybrid"], "default": "hybrid" },
                "filters": { "type": "object", "description": "结构化过滤条件" },
                "limit": { "type": "integer", "default": 20, "minimum": 1, "maximum": 100 },
            },
            "required": ["intent"],
        })
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeResult> {
        let Some(intent) = ctx.param_str("intent").map(str::to_owned) else {
            return Ok(NodeResult::error("missing required param: intent"));
        };
        if ctx.aborted() {
            return Ok(NodeResult::aborted());
        }

        let mode = ctx.param_str("mode").unwrap_or("hybrid").to_owned();
        let limit = ctx.params["limit"].as_u64().unwrap_or(20).clamp(1, 100) as u32;
        let filters = ctx.params.get("filters").cloned();

        let records = match self
            .tonglu
            .query(&intent, filters.as_ref(), &ctx.tenant_id, &mode, limit)
            .await
        {
            Ok(records) => records,
            Err(e) => return Ok(NodeResult::error(format!("数据查询失败: {e}"))),
        };
        if ctx.aborted() {
            return Ok(NodeResult::aborted());
        }

        let result = json!({ "records": records, "count": records.len() });
        ctx.blackboard.set_state(
            &ctx.tenant_id,
            &ctx.session_id,
            "last_data_query_result",
            &result,
        );
        ctx.blackboard
            .append_result(&ctx.tenant_id, &ctx.session_id, "data_query", &result);

        let ui_schema = build_table(&records);
        Ok(NodeResult::success(result)
            .with_artifact("query_result", json!(records))
            .with_ui_schema(ui_schema))
    }
}

fn build_table(records: &[Value]) -> Value {
    let Some(first) = records.first().and_then(Value::as_object) else {
        return json!({
            "component": "document_preview",
            "title": "数据查询",
            "data": { "sections": [{ "title": "数据查询", "content": "未找到匹配数据" }] },
        });
    };
    let columns: Vec<Value> = first
        .keys()
        .filter(|k| !k.starts_with('_'))
        .map(|k| json!({ "key": k, "label": k }))
        .collect();
    json!({
        "component": "smart_table",
        "title": "查询结果",
        "data": { "columns": columns, "rows": records },
        "actions": [
            { "label": "导出 Excel", "action_type": "download_json_as_xlsx" },
        ],
    })
}
