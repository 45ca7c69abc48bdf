//! Upstream Responses-API reply -> client Chat Completions / Responses
//! reply, in both buffered-JSON and live SSE forms.

use gatebridge_core::extract_token_counts;
use serde_json::{json, Value};

use super::sanitize::sanitize_response_object;
use super::sse::SseDecoder;

const FALLBACK_ASSISTANT_TEXT: &str = "[upstream returned no assistant output; please retry]";

fn extract_message_text(response: &Value) -> String {
    let Some(items) = response.get("output").and_then(Value::as_array) else {
        return String::new();
    };
    items
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
        .flat_map(|item| item.get("content").and_then(Value::as_array).cloned().unwrap_or_default())
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str).map(str::to_string))
        .collect::<Vec<_>>()
        .join("")
}

fn extract_tool_calls(response: &Value) -> Vec<Value> {
    let Some(items) = response.get("output").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call"))
        .enumerate()
        .map(|(index, item)| {
            json!({
                "index": index,
                "id": item.get("call_id").cloned().unwrap_or(Value::Null),
                "type": "function",
                "function": {
                    "name": item.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": item.get("arguments").cloned().unwrap_or(Value::Null),
                },
            })
        })
        .collect()
}

fn chat_usage(response: &Value) -> Option<Value> {
    let usage = response.get("usage")?;
    let (input, output, total) = extract_token_counts(usage);
    Some(json!({
        "prompt_tokens": input.unwrap_or(0),
        "completion_tokens": output.unwrap_or(0),
        "total_tokens": total.unwrap_or(0),
    }))
}

/// Decodes a full (non-live) SSE byte payload and returns the sanitized
/// final Responses-API response object carried by `response.completed`.
pub fn parse_sse_to_completed_response(bytes: &[u8]) -> Option<Value> {
    let mut decoder = SseDecoder::new();
    let mut frames = decoder.push(bytes);
    if let Some(trailing) = decoder.flush() {
        frames.push(trailing);
    }
    let completed = frames.into_iter().rev().find(|frame| super::sse::event_type(frame) == "response.completed")?;
    let mut response = completed.data.get("response").cloned().unwrap_or(completed.data);
    sanitize_response_object(&mut response);
    Some(response)
}

/// Converts a sanitized Responses-API response object into a Chat
/// Completions JSON reply, patching in the empty-output fallback so the
/// client never sees an empty `choices[0].message`.
pub fn response_to_chat_completion(response: &Value, id: &str, created: i64) -> Value {
    let model = response.get("model").cloned().unwrap_or(Value::Null);
    let text = extract_message_text(response);
    let tool_calls = extract_tool_calls(response);

    let mut message = json!({"role": "assistant"});
    let mut finish_reason = "stop";
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
        finish_reason = "tool_calls";
        if !text.is_empty() {
            message["content"] = Value::String(text);
        }
    } else if !text.is_empty() {
        message["content"] = Value::String(text);
    } else {
        message["content"] = Value::String(FALLBACK_ASSISTANT_TEXT.to_string());
    }

    let mut out = json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = chat_usage(response) {
        out["usage"] = usage;
    }
    out
}

/// True when the response carries neither visible text nor a tool call.
pub fn response_is_assistant_empty(response: &Value) -> bool {
    extract_message_text(response).is_empty() && extract_tool_calls(response).is_empty()
}

/// Synthesizes a 2-3 frame chat.completion.chunk SSE sequence from an
/// already-buffered chat.completion JSON object (used when the upstream
/// delivered JSON but the client asked for a stream).
pub fn chat_completion_to_sse_frames(chat: &Value, id: &str, created: i64) -> Vec<Value> {
    let model = chat.get("model").cloned().unwrap_or(Value::Null);
    let choice = chat.pointer("/choices/0").cloned().unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);
    let finish_reason = choice.get("finish_reason").cloned().unwrap_or(Value::String("stop".to_string()));

    let mut frames = Vec::new();
    if let Some(content) = message.get("content").and_then(Value::as_str) {
        frames.push(chunk_frame(id, created, &model, json!({"role": "assistant", "content": content}), None, None));
    }
    let mut final_delta = json!({});
    if let Some(tool_calls) = message.get("tool_calls") {
        final_delta["tool_calls"] = tool_calls.clone();
    }
    frames.push(chunk_frame(id, created, &model, final_delta, Some(finish_reason), chat.get("usage").cloned()));
    frames
}

fn chunk_frame(id: &str, created: i64, model: &Value, delta: Value, finish_reason: Option<Value>, usage: Option<Value>) -> Value {
    let mut frame = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason.unwrap_or(Value::Null),
        }],
    });
    if let Some(usage) = usage {
        frame["usage"] = usage;
    }
    frame
}

/// Incremental translator from sanitized Responses-API SSE events to
/// Chat Completions SSE chunks. The caller must have already dropped any
/// frame `sanitize::sanitize_frame` rejected before calling `translate`.
pub struct ChatSseTranslator {
    id: String,
    created: i64,
    model: Value,
    emitted_any_content: bool,
    sent_first_chunk: bool,
}

impl ChatSseTranslator {
    pub fn new(id: impl Into<String>, created: i64, model: Value) -> Self {
        Self { id: id.into(), created, model, emitted_any_content: false, sent_first_chunk: false }
    }

    /// Returns the `chat.completion.chunk` frames this event produces, if
    /// any (an event may yield zero, one, or — for `response.completed`
    /// with no prior content — two frames).
    pub fn translate(&mut self, event_type: &str, data: &Value) -> Vec<Value> {
        match event_type {
            "response.output_text.delta" => {
                let delta = data.get("delta").and_then(Value::as_str).unwrap_or("");
                if delta.is_empty() {
                    return Vec::new();
                }
                self.emitted_any_content = true;
                let delta_obj = if self.sent_first_chunk {
                    json!({"content": delta})
                } else {
                    json!({"role": "assistant", "content": delta})
                };
                self.sent_first_chunk = true;
                vec![self.chunk(delta_obj, None, None)]
            }
            "response.completed" => self.finish(data.get("response").unwrap_or(data)),
            _ => Vec::new(),
        }
    }

    fn finish(&mut self, response: &Value) -> Vec<Value> {
        let tool_calls = extract_tool_calls(response);
        let usage = chat_usage(response);
        let mut frames = Vec::new();

        if !self.emitted_any_content && tool_calls.is_empty() {
            let delta_obj = if self.sent_first_chunk {
                json!({"content": FALLBACK_ASSISTANT_TEXT})
            } else {
                json!({"role": "assistant", "content": FALLBACK_ASSISTANT_TEXT})
            };
            self.sent_first_chunk = true;
            frames.push(self.chunk(delta_obj, None, None));
            frames.push(self.chunk(json!({}), Some("stop"), usage));
            return frames;
        }

        if !tool_calls.is_empty() {
            frames.push(self.chunk(json!({"tool_calls": tool_calls}), Some("tool_calls"), usage));
        } else {
            frames.push(self.chunk(json!({}), Some("stop"), usage));
        }
        frames
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> Value {
        let mut frame = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            frame["usage"] = usage;
        }
        frame
    }
}

/// Synthesizes `response.output_text.delta` + `response.completed` SSE
/// events from a buffered Responses JSON object (upstream delivered JSON,
/// client asked for a stream).
pub fn response_json_to_sse_events(response: &Value) -> Vec<Value> {
    let text = extract_message_text(response);
    let mut events = Vec::new();
    if !text.is_empty() {
        events.push(json!({"type": "response.output_text.delta", "delta": text}));
    }
    events.push(json!({"type": "response.completed", "response": response}));
    events
}

/// Renders an SSE event as the `data: <json>\n\n` wire bytes the client
/// expects; `[DONE]` is rendered literally rather than JSON-encoded.
pub fn render_sse_data_frame(value: &Value) -> String {
    format!("data: {}\n\n", value)
}

pub fn render_done_frame() -> &'static str {
    "data: [DONE]\n\n"
}
