//! Client payload -> upstream Responses payload.
//!
//! Clients may send either Chat Completions (`messages[]`) or Responses
//! (`input[]`) shaped bodies; either way the upstream only ever accepts
//! the Responses shape with a fixed set of "codex parity" defaults.

use rand::Rng;
use serde_json::{json, Map, Value};

/// Any of the header/body spellings a client may use to pin a session.
pub const SESSION_ID_KEYS: &[&str] = &["session_id", "session-id", "x-session-id", "x-session_id"];

pub fn is_chat_completions_payload(body: &Value) -> bool {
    body.get("messages").map(Value::is_array).unwrap_or(false)
}

fn new_call_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: u64 = rng.gen();
    format!("call_{suffix:016x}")
}

/// Joins any `text` fields found in a content array with `\n`, or falls
/// back to JSON-stringifying non-textual content.
fn tool_content_to_output(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Array(items) => {
            let texts: Vec<String> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str).map(str::to_string))
                .collect();
            if texts.is_empty() {
                serde_json::to_string(content).unwrap_or_default()
            } else {
                texts.join("\n")
            }
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Extracts plain text from either a raw string or an array of text-ish
/// content parts, joining multiple text parts with `\n`.
fn extract_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str).map(str::to_string))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn stringify_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Builds the Responses `input[]` array from Chat Completions `messages[]`,
/// excluding any `role:system` entries (those feed `instructions` instead).
fn chat_messages_to_input_items(messages: &[Value]) -> Vec<Value> {
    let mut items = Vec::new();
    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = message.get("content").cloned().unwrap_or(Value::Null);
        match role {
            "system" => continue,
            "tool" => {
                let call_id = message
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(new_call_id);
                items.push(json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": tool_content_to_output(&content),
                }));
            }
            "assistant" => {
                let text = extract_text(&content);
                if !text.is_empty() {
                    items.push(json!({
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": text}],
                    }));
                }
                if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
                    for call in tool_calls {
                        let call_id = call
                            .get("id")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(new_call_id);
                        let function = call.get("function").cloned().unwrap_or(Value::Null);
                        let name = function.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                        let arguments = function
                            .get("arguments")
                            .map(stringify_arguments)
                            .unwrap_or_default();
                        items.push(json!({
                            "type": "function_call",
                            "call_id": call_id,
                            "name": name,
                            "arguments": arguments,
                        }));
                    }
                }
            }
            _ => {
                let text = extract_text(&content);
                items.push(json!({
                    "role": "user",
                    "content": [{"type": "input_text", "text": text}],
                }));
            }
        }
    }

    if let Some(first) = items.first() {
        if first.get("role").and_then(Value::as_str) != Some("user") {
            items.insert(0, json!({"role": "user", "content": [{"type": "input_text", "text": " "}]}));
        }
    }
    items
}

fn translate_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| {
            let function = tool.get("function")?;
            Some(json!({
                "type": "function",
                "name": function.get("name").cloned().unwrap_or(Value::Null),
                "description": function.get("description").cloned().unwrap_or(Value::Null),
                "parameters": function.get("parameters").cloned().unwrap_or(Value::Null),
                "strict": function.get("strict").cloned().unwrap_or(Value::Null),
            }))
        })
        .collect()
}

/// Lifts a session id from any of the header/body spellings a client may
/// use (the engine needs this again to set the upstream `session_id` header).
pub fn session_id_from_body(body: &Value) -> Option<String> {
    SESSION_ID_KEYS
        .iter()
        .find_map(|key| body.get(key).and_then(Value::as_str).map(str::to_string))
}

/// Converts a Chat Completions body into a Responses-shaped `Map`.
fn chat_to_responses(body: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    let messages = body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();

    let system_instructions: Vec<String> = messages
        .iter()
        .filter(|m| m.get("role").and_then(Value::as_str) == Some("system"))
        .map(|m| extract_text(m.get("content").unwrap_or(&Value::Null)))
        .filter(|text| !text.is_empty())
        .collect();
    if !system_instructions.is_empty() && body.get("instructions").is_none() {
        out.insert("instructions".to_string(), Value::String(system_instructions.join("\n\n")));
    }

    out.insert("input".to_string(), Value::Array(chat_messages_to_input_items(&messages)));

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        out.insert("tools".to_string(), Value::Array(translate_tools(tools)));
    }
    for passthrough in ["tool_choice", "reasoning", "reasoning_effort", "temperature", "model"] {
        if let Some(value) = body.get(passthrough) {
            out.insert(passthrough.to_string(), value.clone());
        }
    }
    out
}

/// Shallow-copies a Responses-shaped body, normalizing a bare string
/// `input`/`prompt` into a single user `input_text` item.
fn normalize_responses_body(body: &Value) -> Map<String, Value> {
    let mut out = body.as_object().cloned().unwrap_or_default();
    let needs_wrap = !matches!(out.get("input"), Some(Value::Array(_)));
    if needs_wrap {
        let text = out
            .get("input")
            .and_then(Value::as_str)
            .or_else(|| out.get("prompt").and_then(Value::as_str))
            .unwrap_or("")
            .to_string();
        out.insert(
            "input".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "content": [{"type": "input_text", "text": text}],
            })]),
        );
    }
    out
}

fn bare_model_id(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

/// The reasoning-effort clamp table from the model-scrubbing rules.
fn clamp_reasoning_effort(model: &str, effort: &str) -> String {
    let bare = bare_model_id(model);
    if (bare.starts_with("gpt-5.2") || bare.starts_with("gpt-5.3")) && effort == "minimal" {
        return "low".to_string();
    }
    if bare == "gpt-5.1" && effort == "xhigh" {
        return "high".to_string();
    }
    if bare == "gpt-5.1-codex-mini" {
        return if matches!(effort, "high" | "xhigh") { "high".to_string() } else { "medium".to_string() };
    }
    effort.to_string()
}

fn apply_codex_parity_defaults(obj: &mut Map<String, Value>, session_id: Option<&str>) {
    obj.insert("store".to_string(), Value::Bool(false));
    obj.insert("stream".to_string(), Value::Bool(true));
    obj.entry("tool_choice").or_insert_with(|| Value::String("auto".to_string()));
    obj.entry("parallel_tool_calls").or_insert(Value::Bool(true));

    let text = obj.entry("text").or_insert_with(|| Value::Object(Map::new()));
    if !text.is_object() {
        *text = Value::Object(Map::new());
    }
    text.as_object_mut().unwrap().entry("verbosity").or_insert_with(|| Value::String("medium".to_string()));

    let include = obj.entry("include").or_insert_with(|| Value::Array(Vec::new()));
    if !include.is_array() {
        *include = Value::Array(Vec::new());
    }
    let include_arr = include.as_array_mut().unwrap();
    if !include_arr.iter().any(|v| v.as_str() == Some("reasoning.encrypted_content")) {
        include_arr.push(Value::String("reasoning.encrypted_content".to_string()));
    }

    if let Some(session_id) = session_id {
        obj.entry("prompt_cache_key").or_insert_with(|| Value::String(session_id.to_string()));
    }

    let instructions_is_empty = obj.get("instructions").and_then(Value::as_str).map(str::is_empty).unwrap_or(true);
    if instructions_is_empty {
        obj.insert("instructions".to_string(), Value::String("You are a helpful assistant.".to_string()));
    }

    if let Some(flat_effort) = obj.remove("reasoning_effort") {
        let reasoning = obj.entry("reasoning").or_insert_with(|| Value::Object(Map::new()));
        if !reasoning.is_object() {
            *reasoning = Value::Object(Map::new());
        }
        reasoning.as_object_mut().unwrap().entry("effort").or_insert(flat_effort);
    }

    let model = obj.get("model").and_then(Value::as_str).map(str::to_string);
    if let Some(reasoning) = obj.get_mut("reasoning").and_then(Value::as_object_mut) {
        if reasoning.get("effort").is_some() {
            reasoning.entry("summary").or_insert_with(|| Value::String("auto".to_string()));
        }
        if let (Some(model), Some(effort)) = (model.as_deref(), reasoning.get("effort").and_then(Value::as_str).map(str::to_string)) {
            let clamped = clamp_reasoning_effort(model, &effort);
            reasoning.insert("effort".to_string(), Value::String(clamped));
        }
    }

    if let Some(model) = model {
        if bare_model_id(&model).starts_with("gpt-5") {
            obj.remove("max_output_tokens");
        }
    }
}

/// Builds the full upstream payload from a client body, applying the
/// shape conversion (if Chat Completions) and the codex parity defaults.
pub fn build_upstream_payload(client_body: &Value) -> Value {
    let session_id = session_id_from_body(client_body);
    let mut obj = if is_chat_completions_payload(client_body) {
        chat_to_responses(client_body)
    } else {
        normalize_responses_body(client_body)
    };
    apply_codex_parity_defaults(&mut obj, session_id.as_deref());
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_join_into_instructions() {
        let body = json!({
            "messages": [
                {"role": "system", "content": "Be nice."},
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hi"}
            ]
        });
        let out = build_upstream_payload(&body);
        assert_eq!(out.get("instructions").and_then(Value::as_str), Some("Be nice.\n\nBe brief."));
    }

    #[test]
    fn existing_instructions_are_not_overridden_by_system_messages() {
        let body = json!({
            "instructions": "keep me",
            "messages": [{"role": "system", "content": "ignored"}, {"role": "user", "content": "hi"}]
        });
        let out = build_upstream_payload(&body);
        assert_eq!(out.get("instructions").and_then(Value::as_str), Some("keep me"));
    }

    #[test]
    fn tool_message_becomes_function_call_output() {
        let body = json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "tool", "tool_call_id": "c1", "content": "42"}
            ]
        });
        let out = build_upstream_payload(&body);
        let input = out.get("input").unwrap().as_array().unwrap();
        let tool_item = input.iter().find(|i| i.get("type").and_then(Value::as_str) == Some("function_call_output")).unwrap();
        assert_eq!(tool_item.get("call_id").and_then(Value::as_str), Some("c1"));
        assert_eq!(tool_item.get("output").and_then(Value::as_str), Some("42"));
    }

    #[test]
    fn assistant_text_and_tool_calls_both_emitted_in_order() {
        let body = json!({
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": "checking", "tool_calls": [
                    {"id": "c1", "function": {"name": "get_weather", "arguments": {"city": "Paris"}}}
                ]}
            ]
        });
        let out = build_upstream_payload(&body);
        let input = out.get("input").unwrap().as_array().unwrap();
        let text_item = input.iter().find(|i| i.get("role").and_then(Value::as_str) == Some("assistant")).unwrap();
        assert_eq!(
            text_item.get("content").unwrap()[0].get("text").and_then(Value::as_str),
            Some("checking")
        );
        let call_item = input.iter().find(|i| i.get("type").and_then(Value::as_str) == Some("function_call")).unwrap();
        assert_eq!(call_item.get("call_id").and_then(Value::as_str), Some("c1"));
        assert_eq!(call_item.get("arguments").and_then(Value::as_str), Some("{\"city\":\"Paris\"}"));
    }

    #[test]
    fn leading_non_user_item_gets_synthetic_user_prefix() {
        let body = json!({"messages": [{"role": "assistant", "content": "hello"}]});
        let out = build_upstream_payload(&body);
        let input = out.get("input").unwrap().as_array().unwrap();
        assert_eq!(input[0].get("role").and_then(Value::as_str), Some("user"));
        assert_eq!(input[0]["content"][0]["text"].as_str(), Some(" "));
    }

    #[test]
    fn empty_messages_list_skips_synthetic_prefix() {
        let body = json!({"messages": []});
        let out = build_upstream_payload(&body);
        assert_eq!(out.get("input").unwrap().as_array().unwrap().len(), 0);
    }

    #[test]
    fn tools_translated_to_responses_shape() {
        let body = json!({
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {"type": "object"}, "strict": true}}]
        });
        let out = build_upstream_payload(&body);
        let tools = out.get("tools").unwrap().as_array().unwrap();
        assert_eq!(tools[0].get("name").and_then(Value::as_str), Some("get_weather"));
        assert_eq!(tools[0].get("strict").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn codex_parity_defaults_applied() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let out = build_upstream_payload(&body);
        assert_eq!(out.get("store").and_then(Value::as_bool), Some(false));
        assert_eq!(out.get("stream").and_then(Value::as_bool), Some(true));
        assert_eq!(out.get("tool_choice").and_then(Value::as_str), Some("auto"));
        assert_eq!(out.get("parallel_tool_calls").and_then(Value::as_bool), Some(true));
        assert_eq!(out.pointer("/text/verbosity").and_then(Value::as_str), Some("medium"));
        assert!(out
            .get("include")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v.as_str() == Some("reasoning.encrypted_content")));
        assert_eq!(out.get("instructions").and_then(Value::as_str), Some("You are a helpful assistant."));
    }

    #[test]
    fn prompt_cache_key_defaults_to_session_id() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}], "session_id": "sess-1"});
        let out = build_upstream_payload(&body);
        assert_eq!(out.get("prompt_cache_key").and_then(Value::as_str), Some("sess-1"));
    }

    #[test]
    fn flat_reasoning_effort_moves_under_reasoning_and_gets_summary() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}], "reasoning_effort": "high", "model": "gpt-5-codex"});
        let out = build_upstream_payload(&body);
        assert!(out.get("reasoning_effort").is_none());
        assert_eq!(out.pointer("/reasoning/effort").and_then(Value::as_str), Some("high"));
        assert_eq!(out.pointer("/reasoning/summary").and_then(Value::as_str), Some("auto"));
    }

    #[test]
    fn gpt_5_2_codex_clamps_minimal_effort_to_low() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}], "reasoning_effort": "minimal", "model": "gpt-5.2-codex"});
        let out = build_upstream_payload(&body);
        assert_eq!(out.pointer("/reasoning/effort").and_then(Value::as_str), Some("low"));
    }

    #[test]
    fn gpt_5_1_codex_mini_clamps_high_and_xhigh_to_high_else_medium() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}], "reasoning_effort": "xhigh", "model": "gpt-5.1-codex-mini"});
        let out = build_upstream_payload(&body);
        assert_eq!(out.pointer("/reasoning/effort").and_then(Value::as_str), Some("high"));

        let body = json!({"messages": [{"role": "user", "content": "hi"}], "reasoning_effort": "low", "model": "gpt-5.1-codex-mini"});
        let out = build_upstream_payload(&body);
        assert_eq!(out.pointer("/reasoning/effort").and_then(Value::as_str), Some("medium"));
    }

    #[test]
    fn gpt_5_models_have_max_output_tokens_stripped() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}], "model": "gpt-5-codex", "max_output_tokens": 100});
        let out = build_upstream_payload(&body);
        assert!(out.get("max_output_tokens").is_none());
    }

    #[test]
    fn responses_shaped_string_input_is_wrapped() {
        let body = json!({"input": "hello", "model": "gpt-5-codex"});
        let out = build_upstream_payload(&body);
        let input = out.get("input").unwrap().as_array().unwrap();
        assert_eq!(input[0]["content"][0]["text"].as_str(), Some("hello"));
    }

    #[test]
    fn responses_shaped_array_input_passes_through_unwrapped() {
        let body = json!({"input": [{"role": "user", "content": [{"type": "input_text", "text": "hi"}]}]});
        let out = build_upstream_payload(&body);
        assert_eq!(out.get("input").unwrap().as_array().unwrap().len(), 1);
    }
}
