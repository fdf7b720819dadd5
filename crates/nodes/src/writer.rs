//! Writer node — skill-driven business document generation.
//!
//! Each skill key selects a writing prompt; the result is parsed into a
//! structured document result and surfaced as a preview/table/report panel.
//! Adding a document type means adding a skill entry, nothing else.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use tempo_clients::LlmClient;
use tempo_domain::llm::ChatMessage;
use tempo_domain::{NodeResult, Result};
use tempo_kernel::node::{Node, NodeContext};

const SKILLS: &[(&str, &str, &str)] = &[
    (
        "quotation",
        "报价单",
        "你是报价单撰写专家。根据业务数据生成正式报价单，包含品名、规格、数量、单价、金额、合计。\
         返回 JSON：{\"type\": \"document\", \"title\": \"...\", \"sections\": [{\"title\": \"...\", \"content\": \"...\"}]}",
    ),
    (
        "contract",
        "采购合同",
        "你是采购合同撰写专家。根据业务数据生成采购合同草案，包含甲乙双方、标的、价款、交付、违约责任条款。\
         返回 JSON：{\"type\": \"document\", \"title\": \"...\", \"sections\": [...]}",
    ),
    (
        "delivery_note",
        "送货单",
        "你是送货单撰写专家。根据订单数据生成送货单，包含送货日期、收货方、品项明细、数量、签收栏。\
         返回 JSON：{\"type\": \"document\", \"title\": \"...\", \"sections\": [...]}",
    ),
    (
        "financial_report",
        "财务报表",
        "你是财务分析专家。根据数据生成财务报告，给出关键指标和趋势结论。\
         返回 JSON：{\"type\": \"report\", \"title\": \"...\", \"metrics\": [{\"name\": \"...\", \"value\": \"...\"}], \"summary\": \"...\"}",
    ),
    (
        "comparison",
        "对比表",
        "你是比价分析专家。根据候选数据生成对比表。\
         返回 JSON：{\"type\": \"table\", \"title\": \"...\", \"columns\": [...], \"rows\": [...]}",
    ),
    (
        "general",
        "通用文档",
        "你是文档撰写助手。根据要求生成文档。\
         返回 JSON：{\"type\": \"document\", \"title\": \"...\", \"sections\": [...]}",
    ),
];

pub struct WriterNode {
    llm: Arc<LlmClient>,
}

impl WriterNode {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    fn skill(key: &str) -> Option<&'static (&'static str, &'static str, &'static str)> {
        SKILLS.iter().find(|(k, _, _)| *k == key)
    }
}

#[async_trait]
impl Node for WriterNode {
    fn node_id(&self) -> &str {
        "writer"
    }

    fn name(&self) -> &str {
        "智能撰写"
    }

    fn description(&self) -> &str {
        "根据业务数据生成报价单、合同、送货单、财务报表、对比表等业务文档"
    }

    fn param_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skill": {
                    "type": "string",
                    "enum": SKILLS.iter().map(|(k, _, _)| *k).collect::<Vec<_>>(),
                    "description": "撰写技能类型",
                },
                "data": { "type": "object", "description": "业务数据（如报价清单、合同信息等）" },
                "template_id": { "type": "string", "description": "模板记录 ID（用户上传的模板）" },
            },
            "required": ["skill"],
        })
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeResult> {
        let skill_key = ctx.param_str("skill").unwrap_or("general").to_owned();
        let Some(&(_, skill_name, prompt)) = Self::skill(&skill_key) else {
            return Ok(NodeResult::error(format!("unknown writer skill: {skill_key}")));
        };

        if ctx.aborted() {
            return Ok(NodeResult::aborted());
        }

        // Business data plus any prior results the agent gathered this session.
        let data = ctx.params.get("data").cloned().unwrap_or_else(|| json!({}));
        let prior = ctx
            .blackboard
            .get_state(&ctx.tenant_id, &ctx.session_id, "last_search_result");
        let mut user_content = format!("技能：{skill_name}\n业务数据：\n{data}");
        if let Some(prior) = prior {
            user_content.push_str(&format!("\n\n本会话已有检索结果（可引用）：\n{prior}"));
        }
        if let Some(template_id) = ctx.param_str("template_id") {
            user_content.push_str(&format!("\n\n模板记录 ID：{template_id}"));
        }

        let messages = [ChatMessage::system(prompt), ChatMessage::user(user_content)];
        let completion = match self.llm.chat(&messages, None, None).await {
            Ok(completion) => completion,
            Err(e) => return Ok(NodeResult::error(format!("撰写调用失败: {e}"))),
        };
        if ctx.aborted() {
            return Ok(NodeResult::aborted());
        }

        let document = parse_document(&completion.content, skill_name);
        let artifact_id = format!("{skill_key}_result");
        ctx.blackboard
            .append_result(&ctx.tenant_id, &ctx.session_id, "writer", &document);

        let ui_schema = build_writer_ui(&document);
        Ok(NodeResult::success(document.clone())
            .with_artifact(artifact_id, document)
            .with_ui_schema(ui_schema))
    }
}

fn parse_document(content: &str, default_title: &str) -> Value {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(parsed) = serde_json::from_str::<Value>(cleaned) {
        if parsed.is_object() && parsed.get("type").is_some() {
            return parsed;
        }
    }
    json!({
        "type": "document",
        "title": default_title,
        "sections": [{ "title": default_title, "content": content }],
    })
}

fn build_writer_ui(document: &Value) -> Value {
    let title = document
        .get("title")
        .cloned()
        .unwrap_or_else(|| json!("文档预览"));
    match document["type"].as_str() {
        Some("table") => json!({
            "component": "smart_table",
            "title": title,
            "data": {
                "columns": document.get("columns").cloned().unwrap_or_else(|| json!([])),
                "rows": document.get("rows").cloned().unwrap_or_else(|| json!([])),
            },
            "actions": [
                { "label": "导出 Excel", "action_type": "download_json_as_xlsx" },
            ],
        }),
        Some("report") => json!({
            "component": "chart_report",
            "title": title,
            "data": document,
            "actions": [
                { "label": "下载报告", "action_type": "download_generated_file" },
            ],
        }),
        _ => json!({
            "component": "document_preview",
            "title": title,
            "data": document,
            "actions": [
                { "label": "下载 Word", "action_type": "download_generated_file" },
                { "label": "修改", "action_type": "post_back", "payload": "修改这份文档" },
            ],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_skills_resolve() {
        for key in ["quotation", "contract", "delivery_note", "financial_report", "comparison", "general"] {
            assert!(WriterNode::skill(key).is_some(), "missing skill {key}");
        }
        assert!(WriterNode::skill("poetry").is_none());
    }

    #[test]
    fn structured_document_passes_through() {
        let raw = r#"{"type": "report", "title": "月度财务", "metrics": [{"name": "营收", "value": "120万"}]}"#;
        let document = parse_document(raw, "财务报表");
        assert_eq!(document["type"], "report");
        assert_eq!(build_writer_ui(&document)["component"], "chart_report");
    }

    #[test]
    fn free_text_becomes_document_sections() {
        let document = parse_document("甲方：某公司……", "采购合同");
        assert_eq!(document["type"], "document");
        assert_eq!(document["title"], "采购合同");
        assert_eq!(build_writer_ui(&document)["component"], "document_preview");
    }

    #[test]
    fn table_document_renders_smart_table_with_actions() {
        let document = json!({ "type": "table", "title": "比价", "columns": [], "rows": [] });
        let ui = build_writer_ui(&document);
        assert_eq!(ui["component"], "smart_table");
        assert!(!ui["actions"].as_array().unwrap().is_empty());
    }
}
