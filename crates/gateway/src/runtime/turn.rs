//! Chat turn execution — the frame producer behind `POST /api/agent/chat`.
//!
//! One turn = one spawned task that walks the think-call-tool-respond loop
//! and emits [`ChatFrame`]s over a channel; the SSE endpoint turns frames
//! into wire events. The task guarantees exactly one `session_init` first
//! and exactly one `done` last, with any `error` frame in between.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use tempo_domain::event::{FILE_READY, FILE_UPLOADED};
use tempo_domain::llm::{ChatMessage, ToolCall, ToolDefinition};
use tempo_domain::node::NodeStatus;
use tempo_domain::ui::normalize_ui_render;
use tempo_domain::{Error, EventEnvelope, Result, TenantContext};

use crate::state::AppState;

const SYSTEM_PROMPT: &str = "\
你是\"数字员工助手\"，一个专业的企业办公AI助手。你的核心能力包括：

1. **联网搜索 (search)**：在全网搜索产品信息、价格、供应商数据，生成比价表。
2. **智能撰写 (writer)**：根据数据和模板生成报价表、采购合同、送货单、财务报表等业务文档。
3. **内部数据查询 (data_query)**：从企业知识库中检索历史合同、发票、商品 SKU 等内部数据。

工作原则：
- 用户的需求可能需要你调用一个或多个工具来完成。
- 先理解用户意图，必要时追问细节，然后选择合适的工具执行。
- 执行完毕后，用简洁的语言总结结果。
- 如果用户上传了文件，注意利用文件内容来辅助完成任务。";

/// Builtin nodes exposed to the LLM as tools.
const AGENT_TOOL_IDS: &[&str] = &["search", "writer", "data_query"];

/// Identifier recorded for sessions created by the chat controller.
pub const CHAT_NODE_ID: &str = "agent_chat";

const DEFAULT_PANEL: &str = "panel_main";
const MESSAGE_CHUNK_CHARS: usize = 8;
const TOOL_RESULT_CONTEXT_LIMIT: usize = 2000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reference to a file already uploaded to the object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub url: String,
    #[serde(rename = "type", default)]
    pub content_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    #[serde(default = "d_user_role")]
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub files: Vec<FileRef>,
}

fn d_user_role() -> String {
    "user".into()
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub messages: Vec<UserMessage>,
    /// Free-form page context from the client (current page, selection, …).
    #[serde(default)]
    pub context: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frames emitted during one chat turn. Serialized untagged — the SSE event
/// name comes from [`ChatFrame::event`], the payload is the variant body.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ChatFrame {
    SessionInit {
        session_id: String,
    },
    Thinking {
        content: String,
        phase: String,
        status: String,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<String>,
    },
    ToolStart {
        run_id: String,
        tool: String,
        title: String,
        status: String,
        progress: u8,
    },
    ToolDone {
        run_id: String,
        tool: String,
        title: String,
        status: String,
        progress: u8,
    },
    UiRender(Value),
    Message {
        message_id: String,
        seq: u32,
        mode: String,
        role: String,
        content: String,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
        trace_id: String,
    },
    Done {
        session_id: String,
    },
}

impl ChatFrame {
    pub fn event(&self) -> &'static str {
        match self {
            ChatFrame::SessionInit { .. } => "session_init",
            ChatFrame::Thinking { .. } => "thinking",
            ChatFrame::ToolStart { .. } => "tool_start",
            ChatFrame::ToolDone { .. } => "tool_done",
            ChatFrame::UiRender(_) => "ui_render",
            ChatFrame::Message { .. } => "message",
            ChatFrame::Error { .. } => "error",
            ChatFrame::Done { .. } => "done",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn one chat turn. The receiver yields frames until `done`; dropping it
/// (client disconnect) stops the turn at its next emission point.
pub fn run_chat_turn(
    state: AppState,
    tenant: TenantContext,
    session_id: String,
    request: ChatRequest,
) -> mpsc::Receiver<ChatFrame> {
    let (tx, rx) = mpsc::channel::<ChatFrame>(64);

    let span = tracing::info_span!(
        "chat_turn",
        tenant_id = %tenant.tenant_id,
        session_id = %session_id,
        trace_id = %tenant.trace_id,
    );
    tokio::spawn(tracing::Instrument::instrument(
        async move {
            let emitter = Emitter { tx };
            if !emitter
                .send(ChatFrame::SessionInit {
                    session_id: session_id.clone(),
                })
                .await
            {
                return;
            }

            if let Err(e) = turn_inner(&state, &tenant, &session_id, request, &emitter).await {
                tracing::warn!(error = %e, "chat turn failed");
                state.metrics.inc("chat_turn_errors");
                emitter
                    .send(ChatFrame::Error {
                        code: e.code().to_owned(),
                        message: e.to_string(),
                        retryable: e.retryable(),
                        trace_id: tenant.trace_id.clone(),
                    })
                    .await;
            }

            // Exactly one `done`, even after an error frame.
            emitter.send(ChatFrame::Done { session_id }).await;
        },
        span,
    ));

    rx
}

struct Emitter {
    tx: mpsc::Sender<ChatFrame>,
}

impl Emitter {
    /// False when the client is gone; callers stop producing.
    async fn send(&self, frame: ChatFrame) -> bool {
        self.tx.send(frame).await.is_ok()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The turn loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn turn_inner(
    state: &AppState,
    tenant: &TenantContext,
    session_id: &str,
    request: ChatRequest,
    emitter: &Emitter,
) -> Result<()> {
    let tenant_id = tenant.tenant_id.as_str();
    state.metrics.inc("chat_turns");

    if !state.llm.is_configured() {
        return Err(Error::Upstream {
            service: "llm".into(),
            message: "LLM endpoint is not configured".into(),
        });
    }

    // ── Files: publish FILE_UPLOADED, await FILE_READY ──────────
    let files = collect_files(&request.messages);
    let mut file_texts: HashMap<String, String> = HashMap::new();
    if !files.is_empty() {
        if !emitter
            .send(ChatFrame::Thinking {
                content: "正在处理上传文件...".into(),
                phase: "tool".into(),
                status: "running".into(),
                progress: 2,
                run_id: None,
                step: Some("file_parser".into()),
            })
            .await
        {
            return Ok(());
        }
        file_texts = process_files(state, tenant, session_id, &files).await?;
    }

    // ── Conversation assembly ───────────────────────────────────
    // Prior turns live in the blackboard; the request carries this turn only.
    let mut history = load_chat_history(state, tenant_id, session_id);

    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
    if let Some(context) = &request.context {
        messages.push(ChatMessage::system(format!("页面上下文：{context}")));
    }
    for entry in &history {
        let role = entry["role"].as_str().unwrap_or("user");
        let content = entry["content"].as_str().unwrap_or_default();
        messages.push(ChatMessage {
            role: role.to_owned(),
            content: content.to_owned(),
            tool_calls: Vec::new(),
            name: None,
        });
    }
    for message in &request.messages {
        messages.push(build_llm_message(message, &file_texts));
        history.push(json!({ "role": message.role, "content": message.content }));
    }

    if !emitter
        .send(ChatFrame::Thinking {
            content: "正在思考...".into(),
            phase: "plan".into(),
            status: "running".into(),
            progress: 5,
            run_id: None,
            step: None,
        })
        .await
    {
        return Ok(());
    }

    // ── Think-call-tool-respond loop ────────────────────────────
    let tools = agent_tool_definitions(state);
    let max_loops = state.config.workflow.max_tool_loops;

    for _ in 0..max_loops {
        let completion = state.llm.chat(&messages, Some(&tools), None).await?;

        if completion.tool_calls.is_empty() {
            // Direct reply: finalize and stream it.
            if !emitter
                .send(ChatFrame::Thinking {
                    content: "正在生成回复...".into(),
                    phase: "finalize".into(),
                    status: "success".into(),
                    progress: 95,
                    run_id: None,
                    step: None,
                })
                .await
            {
                return Ok(());
            }
            stream_message(emitter, &completion.content).await;
            history.push(json!({ "role": "assistant", "content": completion.content }));
            persist_chat_history(state, tenant_id, session_id, &history);
            return Ok(());
        }

        messages.push(ChatMessage::assistant_tool_calls(
            completion.content.clone(),
            completion.tool_calls.clone(),
        ));

        for tool_call in &completion.tool_calls {
            let Some(result_text) =
                run_tool(state, tenant, session_id, tool_call, emitter).await?
            else {
                return Ok(()); // client gone
            };
            messages.push(ChatMessage::tool_result(&tool_call.tool_name, result_text));
        }

        if !emitter
            .send(ChatFrame::Thinking {
                content: "正在整理结果...".into(),
                phase: "summarize".into(),
                status: "running".into(),
                progress: 85,
                run_id: None,
                step: None,
            })
            .await
        {
            return Ok(());
        }
    }

    Err(Error::Internal(format!(
        "tool loop limit reached ({max_loops} iterations)"
    )))
}

/// Run one tool call end to end: tool_start, dispatch, ui_render, tool_done.
/// Returns the text fed back to the LLM, or None when the client is gone.
async fn run_tool(
    state: &AppState,
    tenant: &TenantContext,
    session_id: &str,
    tool_call: &ToolCall,
    emitter: &Emitter,
) -> Result<Option<String>> {
    let run_id = Uuid::new_v4().to_string();
    let tool = tool_call.tool_name.clone();
    let title = tool_display_name(&tool);

    if !emitter
        .send(ChatFrame::Thinking {
            content: format!("正在执行：{title}..."),
            phase: "tool".into(),
            status: "running".into(),
            progress: 10,
            run_id: Some(run_id.clone()),
            step: Some(tool.clone()),
        })
        .await
    {
        return Ok(None);
    }
    if !emitter
        .send(ChatFrame::ToolStart {
            run_id: run_id.clone(),
            tool: tool.clone(),
            title: title.clone(),
            status: "running".into(),
            progress: 0,
        })
        .await
    {
        return Ok(None);
    }

    let node_ref = format!("builtin://{tool}");
    // The step key is stable across a replayed LLM response, so a reconnect
    // cannot re-execute a tool whose result is already recorded.
    let step = format!("{tool}:{}", tool_call.call_id);
    let result = state
        .dispatcher
        .execute_single(tenant, session_id, &node_ref, &step, &tool_call.arguments)
        .await
        .unwrap_or_else(|e| tempo_domain::NodeResult::error(e.to_string()));

    let frame_status = match result.status {
        NodeStatus::Success | NodeStatus::NeedUserInput => "success",
        NodeStatus::Error | NodeStatus::Aborted => "failed",
    };

    if let Some(ui_schema) = result.ui_schema.clone() {
        let rendered = normalize_ui_render(ui_schema, DEFAULT_PANEL, "replace", Some(&run_id));
        if !emitter.send(ChatFrame::UiRender(rendered)).await {
            return Ok(None);
        }
    }

    // `progress` reaches 100 on failure as well, for client animation
    // symmetry.
    if !emitter
        .send(ChatFrame::ToolDone {
            run_id,
            tool: tool.clone(),
            title,
            status: frame_status.into(),
            progress: 100,
        })
        .await
    {
        return Ok(None);
    }

    let feedback = match result.status {
        NodeStatus::Error => format!(
            "工具执行失败: {}",
            result.error_message.as_deref().unwrap_or("unknown error")
        ),
        _ => truncate(&result.result.to_string(), TOOL_RESULT_CONTEXT_LIMIT),
    };
    Ok(Some(feedback))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File pre-processing over the bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Publish FILE_UPLOADED for each attachment and wait for the capture
/// listener's FILE_READY answers. On deadline, missing files degrade to a
/// notice so the turn never hangs.
async fn process_files(
    state: &AppState,
    tenant: &TenantContext,
    session_id: &str,
    files: &[FileRef],
) -> Result<HashMap<String, String>> {
    let tenant_id = tenant.tenant_id.as_str();
    let mut subscription = state.bus.subscribe(tenant_id);

    for file in files {
        let event = EventEnvelope::new(FILE_UPLOADED, "agent_controller", tenant_id, session_id)?
            .with_trace(Some(tenant.trace_id.clone()))
            .with_payload(json!({
                "file_id": Uuid::new_v4().to_string(),
                "file_url": file.url,
                "file_name": file.name,
                "file_type": file.content_type,
                "user_id": tenant.user_or_anonymous(),
            }));
        state.bus.publish(&event);
        tracing::info!(file = %file.name, "published FILE_UPLOADED");
    }

    let mut texts: HashMap<String, String> = HashMap::new();
    let mut pending: Vec<&FileRef> = files.iter().collect();
    let deadline = std::time::Duration::from_secs(state.config.tonglu.file_parse_timeout_secs);

    let wait = async {
        while !pending.is_empty() {
            let Some(event) = subscription.recv().await else {
                break;
            };
            if event.kind != FILE_READY || event.session_id != session_id {
                continue;
            }
            let url = event.payload["file_url"].as_str().unwrap_or_default().to_owned();
            let text = event.payload["text_content"]
                .as_str()
                .unwrap_or_default()
                .to_owned();
            pending.retain(|f| f.url != url);
            texts.insert(url, text);
        }
    };
    if tokio::time::timeout(deadline, wait).await.is_err() {
        tracing::warn!(
            parsed = texts.len(),
            total = files.len(),
            "file parse deadline reached"
        );
    }

    for file in files {
        texts
            .entry(file.url.clone())
            .or_insert_with(|| format!("（文件 {} 处理超时，请稍后重试）", file.name));
    }
    Ok(texts)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn collect_files(messages: &[UserMessage]) -> Vec<FileRef> {
    messages
        .iter()
        .filter(|m| m.role == "user")
        .flat_map(|m| m.files.iter().cloned())
        .collect()
}

fn build_llm_message(message: &UserMessage, file_texts: &HashMap<String, String>) -> ChatMessage {
    if message.files.is_empty() {
        return ChatMessage {
            role: message.role.clone(),
            content: message.content.clone(),
            tool_calls: Vec::new(),
            name: None,
        };
    }
    let mut parts = Vec::new();
    for file in &message.files {
        match file_texts.get(&file.url) {
            Some(text) if !text.is_empty() => {
                parts.push(format!("[附件: {}]\n{text}", file.name))
            }
            _ => parts.push(format!("[附件: {}]（文件处理中或处理失败）", file.name)),
        }
    }
    ChatMessage {
        role: message.role.clone(),
        content: format!("{}\n\n附件内容:\n{}", message.content, parts.join("\n---\n")),
        tool_calls: Vec::new(),
        name: None,
    }
}

/// Stream assistant text as delta frames with strictly increasing `seq`.
async fn stream_message(emitter: &Emitter, content: &str) {
    let message_id = Uuid::new_v4().to_string();
    let chars: Vec<char> = content.chars().collect();
    let mut seq = 0u32;
    for chunk in chars.chunks(MESSAGE_CHUNK_CHARS) {
        seq += 1;
        let frame = ChatFrame::Message {
            message_id: message_id.clone(),
            seq,
            mode: "delta".into(),
            role: "assistant".into(),
            content: chunk.iter().collect(),
        };
        if !emitter.send(frame).await {
            return;
        }
    }
}

fn agent_tool_definitions(state: &AppState) -> Vec<ToolDefinition> {
    state
        .registry
        .list()
        .into_iter()
        .filter(|info| AGENT_TOOL_IDS.contains(&info.node_id.as_str()))
        .map(|info| ToolDefinition {
            name: info.node_id,
            description: format!("{}：{}", info.name, info.description),
            parameters: info
                .param_schema
                .unwrap_or_else(|| json!({ "type": "object" })),
        })
        .collect()
}

fn tool_display_name(tool: &str) -> String {
    match tool {
        "search" => "联网搜索".into(),
        "writer" => "智能撰写".into(),
        "data_query" => "数据检索".into(),
        other => other.to_owned(),
    }
}

fn load_chat_history(state: &AppState, tenant_id: &str, session_id: &str) -> Vec<Value> {
    state
        .blackboard
        .get_state(tenant_id, session_id, "_chat_history")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
}

fn persist_chat_history(state: &AppState, tenant_id: &str, session_id: &str, history: &[Value]) {
    state
        .blackboard
        .set_state(tenant_id, session_id, "_chat_history", &json!(history));
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_owned()
    } else {
        text.chars().take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_event_names() {
        assert_eq!(
            ChatFrame::SessionInit { session_id: "s".into() }.event(),
            "session_init"
        );
        assert_eq!(ChatFrame::UiRender(json!({})).event(), "ui_render");
        assert_eq!(ChatFrame::Done { session_id: "s".into() }.event(), "done");
    }

    #[test]
    fn frames_serialize_without_tag() {
        let frame = ChatFrame::Message {
            message_id: "m1".into(),
            seq: 2,
            mode: "delta".into(),
            role: "assistant".into(),
            content: "你好".into(),
        };
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["message_id"], "m1");
        assert_eq!(wire["seq"], 2);
        assert!(wire.get("type").is_none());
    }

    #[test]
    fn thinking_frame_skips_absent_fields() {
        let frame = ChatFrame::Thinking {
            content: "x".into(),
            phase: "plan".into(),
            status: "running".into(),
            progress: 5,
            run_id: None,
            step: None,
        };
        let wire = serde_json::to_string(&frame).unwrap();
        assert!(!wire.contains("run_id"));
        assert!(!wire.contains("step"));
    }

    #[test]
    fn file_message_injects_parsed_text() {
        let message = UserMessage {
            role: "user".into(),
            content: "分析这份报价".into(),
            files: vec![FileRef {
                name: "报价.xlsx".into(),
                url: "https://oss.example.com/a.xlsx".into(),
                content_type: "application/vnd.ms-excel".into(),
            }],
        };
        let mut texts = HashMap::new();
        texts.insert(
            "https://oss.example.com/a.xlsx".to_owned(),
            "品名,单价\n钢管,120".to_owned(),
        );
        let llm_message = build_llm_message(&message, &texts);
        assert!(llm_message.content.contains("钢管,120"));
        assert!(llm_message.content.contains("[附件: 报价.xlsx]"));

        // Unparsed file degrades to a notice.
        let llm_message = build_llm_message(&message, &HashMap::new());
        assert!(llm_message.content.contains("文件处理中或处理失败"));
    }

    #[tokio::test]
    async fn streamed_message_seq_is_strictly_increasing() {
        let (tx, mut rx) = mpsc::channel(64);
        let emitter = Emitter { tx };
        stream_message(&emitter, "这是一个足够长的回复，会被切成多个增量帧。").await;
        drop(emitter);

        let mut last_seq = 0;
        let mut combined = String::new();
        while let Some(frame) = rx.recv().await {
            if let ChatFrame::Message { seq, content, mode, .. } = frame {
                assert_eq!(mode, "delta");
                assert_eq!(seq, last_seq + 1);
                last_seq = seq;
                combined.push_str(&content);
            }
        }
        assert!(last_seq > 1);
        assert_eq!(combined, "这是一个足够长的回复，会被切成多个增量帧。");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("数据很长", 2), "数据");
        assert_eq!(truncate("short", 10), "short");
    }
}
