//! Web search node — delegates to the LLM endpoint's search-enabled
//! completion mode and shapes the answer into table or text results with
//! source citations.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tempo_clients::LlmClient;
use tempo_domain::llm::{ChatMessage, SearchSource};
use tempo_domain::{NodeResult, Result};
use tempo_kernel::node::{Node, NodeContext};

const SEARCH_SYSTEM_PROMPT: &str = "\
你是一个专业的采购分析助手。当用户要求搜索产品时：
1. 在网上搜索相关产品信息。
2. 对比价格、好评率、规格型号、供应商资质。
3. 以结构化格式返回结果。

输出要求：
- 如果用户要求对比/比价，返回 JSON 格式的表格数据：
  {\"type\": \"table\", \"title\": \"...\", \"columns\": [...], \"rows\": [...]}
- 如果用户是一般性查询，直接返回文字总结。
- columns 格式: [{\"key\": \"field_name\", \"label\": \"显示名\"}]
- rows 格式: [{\"field_name\": \"value\", ...}]

注意：只返回 JSON 或纯文字，不要用 markdown 代码块包裹。";

pub struct SearchNode {
    llm: Arc<LlmClient>,
}

impl SearchNode {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Node for SearchNode {
    fn node_id(&self) -> &str {
        "search"
    }

    fn name(&self) -> &str {
        "联网搜索"
    }

    fn description(&self) -> &str {
        "联网搜索产品信息、价格、供应商等外部数据，支持生成比价表"
    }

    fn param_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "搜索关键词或自然语言查询" },
                "output_format": { "type": "string", "enum": ["table", "text"] },
                "search_strategy": { "type": "string", "enum": ["turbo", "max", "agent", "agent_max"] },
            },
            "required": ["query"],
        })
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeResult> {
        let Some(query) = ctx.param_str("query").map(str::to_owned) else {
            return Ok(NodeResult::error("missing required param: query"));
        };
        let output_format = ctx.param_str("output_format").map(str::to_owned);
        let strategy = ctx
            .param_str("search_strategy")
            .unwrap_or("max")
            .to_owned();

        if ctx.aborted() {
            return Ok(NodeResult::aborted());
        }

        let mut user_message = query.clone();
        if output_format.as_deref() == Some("table") {
            user_message.push_str("\n\n请以表格JSON格式返回对比结果。");
        }
        let messages = [
            ChatMessage::system(SEARCH_SYSTEM_PROMPT),
            ChatMessage::user(user_message),
        ];

        let completion = match self.llm.search_completion(&messages, &strategy).await {
            Ok(completion) => completion,
            Err(e) => return Ok(NodeResult::error(format!("搜索调用失败: {e}"))),
        };
        if ctx.aborted() {
            return Ok(NodeResult::aborted());
        }

        let result_data = parse_search_result(&completion.content, &completion.search_sources);
        ctx.blackboard.set_state(
            &ctx.tenant_id,
            &ctx.session_id,
            "last_search_query",
            &json!(query),
        );
        ctx.blackboard.set_state(
            &ctx.tenant_id,
            &ctx.session_id,
            "last_search_result",
            &result_data,
        );
        ctx.blackboard
            .append_result(&ctx.tenant_id, &ctx.session_id, "search", &result_data);

        let ui_schema = build_search_ui(&result_data, &completion.search_sources);
        Ok(NodeResult::success(result_data.clone())
            .with_artifact("search_result", result_data)
            .with_ui_schema(ui_schema))
    }
}

/// Parse the model's answer into a structured result; falls back to a text
/// result carrying the citations.
fn parse_search_result(content: &str, sources: &[SearchSource]) -> Value {
    let cleaned = strip_code_fence(content.trim());

    if let Ok(mut parsed) = serde_json::from_str::<Value>(cleaned.trim()) {
        if parsed.get("type").is_some() {
            if !sources.is_empty() {
                parsed["sources"] = sources_value(sources);
            }
            return parsed;
        }
    }

    let mut result = json!({
        "type": "text",
        "title": "搜索结果",
        "content": content,
    });
    if !sources.is_empty() {
        result["sources"] = sources_value(sources);
    }
    result
}

/// Some models wrap JSON in a code fence despite instructions.
fn strip_code_fence(content: &str) -> String {
    if !content.starts_with("```") {
        return content.to_owned();
    }
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() > 2 {
        lines[1..lines.len() - 1].join("\n")
    } else {
        content.to_owned()
    }
}

fn sources_value(sources: &[SearchSource]) -> Value {
    json!(sources
        .iter()
        .map(|s| json!({ "title": s.title, "url": s.url, "index": s.index }))
        .collect::<Vec<Value>>())
}

fn build_search_ui(result: &Value, sources: &[SearchSource]) -> Value {
    if result["type"] == "table" {
        let mut data = json!({
            "columns": result.get("columns").cloned().unwrap_or_else(|| json!([])),
            "rows": result.get("rows").cloned().unwrap_or_else(|| json!([])),
        });
        if !sources.is_empty() {
            data["sources"] = sources_value(sources);
        }
        return json!({
            "component": "smart_table",
            "title": result.get("title").cloned().unwrap_or_else(|| json!("搜索结果")),
            "data": data,
            "actions": [
                { "label": "导出 Excel", "action_type": "download_json_as_xlsx" },
                { "label": "重新搜索", "action_type": "post_back", "payload": "换一批供应商" },
            ],
        });
    }

    json!({
        "component": "document_preview",
        "title": result.get("title").cloned().unwrap_or_else(|| json!("搜索结果")),
        "data": {
            "sections": [
                { "title": "搜索结果", "content": result.get("content").cloned().unwrap_or_default() },
            ],
            "sources": sources_value(sources),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_table_json() {
        let content = r#"{"type": "table", "title": "比价表", "columns": [], "rows": []}"#;
        let parsed = parse_search_result(content, &[]);
        assert_eq!(parsed["type"], "table");
        assert_eq!(parsed["title"], "比价表");
    }

    #[test]
    fn strips_code_fence() {
        let content = "```json\n{\"type\": \"table\", \"title\": \"x\", \"rows\": []}\n```";
        let parsed = parse_search_result(content, &[]);
        assert_eq!(parsed["type"], "table");
    }

    #[test]
    fn plain_text_falls_back_with_sources() {
        let sources = vec![SearchSource {
            title: "供应商A".into(),
            url: "https://a.example.com".into(),
            index: json!(1),
        }];
        let parsed = parse_search_result("没有找到结构化数据", &sources);
        assert_eq!(parsed["type"], "text");
        assert_eq!(parsed["sources"][0]["title"], "供应商A");
    }

    #[test]
    fn table_result_renders_smart_table() {
        let result = json!({ "type": "table", "title": "比价表", "columns": [], "rows": [] });
        let ui = build_search_ui(&result, &[]);
        assert_eq!(ui["component"], "smart_table");
        assert!(!ui["actions"].as_array().unwrap().is_empty());
    }

    #[test]
    fn text_result_renders_document_preview() {
        let result = json!({ "type": "text", "title": "搜索结果", "content": "摘要" });
        let ui = build_search_ui(&result, &[]);
        assert_eq!(ui["component"], "document_preview");
    }
}
