//! Data ingest node — pushes text/JSON data into the Tonglu data service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tempo_clients::TongluClient;
use tempo_domain::{NodeResult, Result};
use tempo_kernel::node::{Node, NodeContext};

pub struct DataIngestNode {
    tonglu: Arc<TongluClient>,
}

impl DataIngestNode {
    pub fn new(tonglu: Arc<TongluClient>) -> Self {
        Self { tonglu }
    }
}

#[async_trait]
impl Node for DataIngestNode {
    fn node_id(&self) -> &str {
        "data_ingest"
    }

    fn name(&self) -> &str {
        "数据入库"
    }

    fn description(&self) -> &str {
        "将文本或结构化数据写入企业知识库"
    }

    fn param_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "data": { "description": "要入库的文本或结构化数据" },
                "schema_type": { "type": "string", "description": "数据类型提示" },
                "metadata": { "type": "object" },
            },
            "required": ["data"],
        })
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeResult> {
        let Some(data) = ctx.params.get("data").cloned() else {
            return Ok(NodeResult::error("missing required param: data"));
        };
        if ctx.aborted() {
            return Ok(NodeResult::aborted());
        }

        let schema_type = ctx.param_str("schema_type").map(str::to_owned);
        let metadata = ctx.params.get("metadata").cloned();

        let record_id = match self
            .tonglu
            .ingest(&data, &ctx.tenant_id, schema_type.as_deref(), metadata.as_ref())
            .await
        {
            Ok(record_id) => record_id,
            Err(e) => return Ok(NodeResult::error(format!("数据入库失败: {e}"))),
        };

        let result = json!({ "record_id": record_id });
        Ok(NodeResult::success(result.clone()).with_artifact("ingest_result", result))
    }
}
