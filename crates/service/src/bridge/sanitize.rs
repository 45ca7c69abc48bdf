//! Strips upstream reasoning/hidden-thinking artifacts and internal
//! tool-protocol leakage from anything bound for a client.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

const STARTS_WITH_MARKERS: &[&str] = &[
    "The user earlier asked:",
    "Now we need to reply final message",
    "Need summary:",
    "List commands run:",
    "Need final instructions:",
    "[Use functions tool",
];

const CHATTER_MARKERS: &[&str] = &[
    "Need to",
    "Now run",
    "Let's run",
    "Use tool",
    "Use functions",
    "Input to tool",
    "Command:",
    "We'll run",
];

fn tool_protocol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:assistant\s+)?to=functions\.[A-Za-z0-9_]+|functions\.[A-Za-z0-9_]+").unwrap()
    })
}

fn is_tool_protocol_text(text: &str) -> bool {
    tool_protocol_regex().is_match(text)
}

fn is_planner_chatter(text: &str) -> bool {
    if STARTS_WITH_MARKERS.iter().any(|marker| text.starts_with(marker)) {
        return true;
    }
    if CHATTER_MARKERS.iter().any(|marker| text.starts_with(marker)) {
        return true;
    }
    CHATTER_MARKERS.iter().filter(|marker| text.contains(**marker)).count() >= 2
}

/// True when a visible text part must never reach the client.
pub fn is_dropped_text(text: &str) -> bool {
    is_tool_protocol_text(text) || is_planner_chatter(text)
}

/// True when a function-call name is a sentinel the client must never see.
pub fn is_sentinel_tool_name(name: &str) -> bool {
    name.to_ascii_lowercase().starts_with("functions.")
}

/// Sanitizes one decoded Responses-API SSE event in place. Returns `false`
/// when the whole frame must be suppressed (not forwarded to the client).
pub fn sanitize_frame(event_type: &str, data: &mut Value) -> bool {
    if event_type.starts_with("response.reasoning.") {
        return false;
    }
    match event_type {
        "response.output_text.delta" => {
            let delta = data.get("delta").and_then(Value::as_str).unwrap_or("");
            !is_dropped_text(delta)
        }
        "response.output_text.done" => {
            let text = data.get("text").and_then(Value::as_str).unwrap_or("");
            !is_dropped_text(text)
        }
        "response.content_part.added" | "response.content_part.done" => {
            let part_type = data.pointer("/part/type").and_then(Value::as_str).unwrap_or("");
            part_type == "output_text" || part_type == "refusal"
        }
        "response.output_item.added" | "response.output_item.done" => {
            let item_type = data.pointer("/item/type").and_then(Value::as_str).unwrap_or("");
            if item_type == "reasoning" {
                return false;
            }
            if item_type == "function_call" {
                let name = data.pointer("/item/name").and_then(Value::as_str).unwrap_or("");
                if is_sentinel_tool_name(name) {
                    return false;
                }
            }
            true
        }
        "response.completed" => {
            if let Some(response) = data.get_mut("response") {
                sanitize_response_object(response);
            }
            true
        }
        _ => true,
    }
}

/// Strips a full Responses-API response object of every sanitizer
/// target: the top-level `reasoning` field, `type:"reasoning"` output
/// items, sentinel-named function calls, non-text content parts, and
/// planner/tool-protocol text inside surviving `output_text` parts.
pub fn sanitize_response_object(response: &mut Value) {
    if let Some(obj) = response.as_object_mut() {
        obj.remove("reasoning");
    }
    let Some(output) = response.get_mut("output").and_then(Value::as_array_mut) else {
        return;
    };
    output.retain_mut(|item| {
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or("").to_string();
        if item_type == "reasoning" {
            return false;
        }
        if item_type == "function_call" {
            let name = item.get("name").and_then(Value::as_str).unwrap_or("");
            if is_sentinel_tool_name(name) {
                return false;
            }
        }
        if let Some(content) = item.get_mut("content").and_then(Value::as_array_mut) {
            content.retain(|part| {
                let part_type = part.get("type").and_then(Value::as_str).unwrap_or("");
                if part_type != "output_text" && part_type != "refusal" {
                    return false;
                }
                if part_type == "output_text" {
                    let text = part.get("text").and_then(Value::as_str).unwrap_or("");
                    if is_dropped_text(text) {
                        return false;
                    }
                }
                true
            });
        }
        true
    });
}
