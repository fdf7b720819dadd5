//! File parser node — registers an uploaded object-store file with Tonglu
//! and waits for the parsed record.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tempo_clients::TongluClient;
use tempo_domain::{NodeResult, Result};
use tempo_kernel::node::{Node, NodeContext};

pub struct FileParserNode {
    tonglu: Arc<TongluClient>,
}

impl FileParserNode {
    pub fn new(tonglu: Arc<TongluClient>) -> Self {
        Self { tonglu }
    }
}

#[async_trait]
impl Node for FileParserNode {
    fn node_id(&self) -> &str {
        "file_parser"
    }

    fn name(&self) -> &str {
        "文件解析"
    }

    fn description(&self) -> &str {
        "解析已上传到对象存储的文件（PDF/Excel/图片），返回结构化内容"
    }

    fn param_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_url": { "type": "string", "description": "对象存储文件 URL" },
                "file_name": { "type": "string", "description": "文件名" },
                "schema_type": { "type": "string", "description": "数据类型提示" },
            },
            "required": ["file_url"],
        })
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeResult> {
        let Some(file_url) = ctx.param_str("file_url").map(str::to_owned) else {
            return Ok(NodeResult::error("missing required param: file_url"));
        };
        let file_name = ctx.param_str("file_name").unwrap_or("").to_owned();
        let schema_type = ctx.param_str("schema_type").map(str::to_owned);

        if ctx.aborted() {
            return Ok(NodeResult::aborted());
        }

        let task_id = match self
            .tonglu
            .ingest_url(&file_url, &file_name, &ctx.tenant_id, schema_type.as_deref())
            .await
        {
            Ok(task_id) => task_id,
            Err(e) => return Ok(NodeResult::error(format!("文件上传失败: {e}"))),
        };
        tracing::info!(task_id = %task_id, file = %file_name, "file registered for parsing");

        if ctx.aborted() {
            return Ok(NodeResult::aborted());
        }
        let record = match self.tonglu.wait_for_task(&task_id).await {
            Ok(record) => record,
            Err(e) => return Ok(NodeResult::error(format!("文件解析失败: {e}"))),
        };

        ctx.blackboard.set_state(
            &ctx.tenant_id,
            &ctx.session_id,
            "last_parsed_file",
            &json!({ "url": file_url, "name": file_name }),
        );
        Ok(NodeResult::success(record.clone()).with_artifact("parsed_data", record))
    }
}
