//! The UI component contract.
//!
//! Nodes emit `ui_schema` objects; the chat controller relays them as
//! `ui_render` frames. The component set is closed — anything outside it is
//! degraded to a generic card (title + raw data + download action) so clients
//! never receive an uncategorised payload.

use serde_json::{json, Value};

pub const SCHEMA_VERSION: u32 = 1;

/// The closed set of component types clients know how to render.
pub const KNOWN_COMPONENTS: &[&str] = &[
    "smart_table",
    "document_preview",
    "chart_report",
    "image_preview",
];

pub const RENDER_MODES: &[&str] = &["replace", "append", "patch"];

const GENERIC_CARD: &str = "generic_card";

/// Normalize a node-produced `ui_schema` into a complete `ui_render` payload.
///
/// Existing keys are preserved; missing meta fields (`schema_version`,
/// `ui_id`, `render_mode`, `run_id`) are filled in. Unknown components and
/// non-object schemas are degraded to a generic card.
pub fn normalize_ui_render(
    ui_schema: Value,
    ui_id: &str,
    render_mode: &str,
    run_id: Option<&str>,
) -> Value {
    let mut obj = match ui_schema {
        Value::Object(map) => map,
        other => {
            // Not even an object — wrap it whole.
            return generic_card("UI Schema", other, ui_id, render_mode, run_id);
        }
    };

    let component_ok = obj
        .get("component")
        .and_then(Value::as_str)
        .map(|c| KNOWN_COMPONENTS.contains(&c))
        .unwrap_or(false);
    if !component_ok {
        let title = obj
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("执行结果")
            .to_string();
        let data = obj.remove("data").unwrap_or(Value::Object(obj));
        return generic_card(&title, data, ui_id, render_mode, run_id);
    }

    obj.entry("schema_version")
        .or_insert_with(|| json!(SCHEMA_VERSION));
    obj.entry("ui_id").or_insert_with(|| json!(ui_id));
    let mode_ok = obj
        .get("render_mode")
        .and_then(Value::as_str)
        .map(|m| RENDER_MODES.contains(&m))
        .unwrap_or(false);
    if !mode_ok {
        obj.insert("render_mode".into(), json!(render_mode));
    }
    if let Some(run_id) = run_id {
        obj.entry("run_id").or_insert_with(|| json!(run_id));
    }
    obj.entry("actions").or_insert_with(|| json!([]));
    Value::Object(obj)
}

fn generic_card(
    title: &str,
    data: impl Into<Value>,
    ui_id: &str,
    render_mode: &str,
    run_id: Option<&str>,
) -> Value {
    let mut card = json!({
        "schema_version": SCHEMA_VERSION,
        "ui_id": ui_id,
        "render_mode": render_mode,
        "component": GENERIC_CARD,
        "title": title,
        "data": { "raw": data.into() },
        "actions": [
            { "label": "下载 JSON", "action_type": "download_raw_json" },
        ],
    });
    if let Some(run_id) = run_id {
        card["run_id"] = json!(run_id);
    }
    card
}

/// Validate a normalized `ui_render` payload against the contract.
///
/// Returns violation messages; an empty list means valid. The generic card is
/// always accepted.
pub fn validate_ui_render(payload: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(obj) = payload.as_object() else {
        return vec!["ui_render payload must be an object".into()];
    };

    match obj.get("component").and_then(Value::as_str) {
        Some(c) if KNOWN_COMPONENTS.contains(&c) || c == GENERIC_CARD => {}
        Some(c) => errors.push(format!("unknown component '{c}'")),
        None => errors.push("missing 'component'".into()),
    }
    match obj.get("render_mode").and_then(Value::as_str) {
        Some(m) if RENDER_MODES.contains(&m) => {}
        Some(m) => errors.push(format!("unknown render_mode '{m}'")),
        None => errors.push("missing 'render_mode'".into()),
    }
    if obj.get("ui_id").and_then(Value::as_str).is_none() {
        errors.push("missing 'ui_id'".into());
    }
    if !obj.contains_key("data") {
        errors.push("missing 'data'".into());
    }
    if let Some(actions) = obj.get("actions") {
        if !actions.is_array() {
            errors.push("'actions' must be an array".into());
        }
    }
    errors
}
