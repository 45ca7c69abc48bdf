//! Wires the payload/reply/sanitize/SSE submodules into the reply-transform
//! dispatch matrix: upstream buffered-JSON or live SSE, in either order,
//! translated into whatever shape (JSON or SSE, chat or Responses) the
//! client asked for.

pub mod payload;
pub mod reply;
pub mod sanitize;
pub mod sse;

use rand::Rng;
use serde_json::{json, Value};

use sse::{Frame, SseDecoder};

/// A random id in the shape upstream/OpenAI-style ids use (`chatcmpl-…`,
/// `resp_…`), not required to be globally unique, only unique per process.
pub fn new_id(prefix: &str) -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("{prefix}{suffix:016x}")
}

/// A fully rendered reply: either one buffered JSON body, or a sequence of
/// already-framed `data: …\n\n` SSE lines ready to write to the client.
pub enum BridgeReply {
    Json(Value),
    SseFrames(Vec<String>),
}

fn sanitize_chat_message(message: &mut Value) {
    if let Some(content) = message.get("content").and_then(Value::as_str) {
        if sanitize::is_dropped_text(content) {
            message["content"] = Value::Null;
        }
    }
    if let Some(calls) = message.get_mut("tool_calls").and_then(Value::as_array_mut) {
        calls.retain(|call| {
            let name = call.pointer("/function/name").and_then(Value::as_str).unwrap_or("");
            !sanitize::is_sentinel_tool_name(name)
        });
        if calls.is_empty() {
            if let Some(obj) = message.as_object_mut() {
                obj.remove("tool_calls");
            }
        }
    }
}

/// Sanitizes an already-Chat-Completion-shaped JSON object in place, for
/// the (rarer) case where upstream itself delivered a chat.completion
/// body rather than a Responses object.
fn sanitize_chat_completion(chat: &mut Value) {
    if let Some(choices) = chat.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices.iter_mut() {
            if let Some(message) = choice.get_mut("message") {
                sanitize_chat_message(message);
            }
        }
    }
}

/// Patches `choices[0].message` with the fallback sentinel when neither
/// content nor tool_calls survived sanitization.
fn ensure_chat_completion_non_empty(chat: &mut Value) {
    let Some(message) = chat.pointer_mut("/choices/0/message") else { return };
    let has_content = message.get("content").and_then(Value::as_str).map(|c| !c.is_empty()).unwrap_or(false);
    let has_tool_calls = message.get("tool_calls").and_then(Value::as_array).map(|c| !c.is_empty()).unwrap_or(false);
    if !has_content && !has_tool_calls {
        message["content"] = json!("[upstream returned no assistant output; please retry]");
        if let Some(choice) = chat.pointer_mut("/choices/0") {
            choice["finish_reason"] = json!("stop");
        }
    }
}

fn respond_from_chat_json(mut chat: Value, client_wants_stream: bool, id: &str, created: i64) -> BridgeReply {
    sanitize_chat_completion(&mut chat);
    ensure_chat_completion_non_empty(&mut chat);
    if client_wants_stream {
        let frames = reply::chat_completion_to_sse_frames(&chat, id, created);
        let mut rendered: Vec<String> = frames.iter().map(reply::render_sse_data_frame).collect();
        rendered.push(reply::render_done_frame().to_string());
        BridgeReply::SseFrames(rendered)
    } else {
        BridgeReply::Json(chat)
    }
}

/// Dispatch for a fully-buffered upstream body (the four non-live rows of
/// the reply-transform matrix: Chat JSON, Responses JSON, and either shape
/// when upstream itself answered with plain JSON).
pub fn respond_buffered(
    client_wants_chat: bool,
    client_wants_stream: bool,
    upstream_content_type: &str,
    upstream_body: &[u8],
    id: &str,
    created: i64,
) -> BridgeReply {
    let is_sse_upstream = upstream_content_type.contains("text/event-stream");

    if is_sse_upstream {
        let response = reply::parse_sse_to_completed_response(upstream_body).unwrap_or_else(|| json!({"output": []}));
        return respond_from_responses_object(response, client_wants_chat, client_wants_stream, id, created);
    }

    let parsed: Value = serde_json::from_slice(upstream_body).unwrap_or_else(|_| json!({"output": []}));
    if parsed.get("object").and_then(Value::as_str) == Some("chat.completion") {
        return respond_from_chat_json(parsed, client_wants_stream, id, created);
    }
    let mut response = parsed;
    sanitize::sanitize_response_object(&mut response);
    respond_from_responses_object(response, client_wants_chat, client_wants_stream, id, created)
}

fn respond_from_responses_object(response: Value, client_wants_chat: bool, client_wants_stream: bool, id: &str, created: i64) -> BridgeReply {
    if client_wants_chat {
        let chat = reply::response_to_chat_completion(&response, id, created);
        if client_wants_stream {
            let frames = reply::chat_completion_to_sse_frames(&chat, id, created);
            let mut rendered: Vec<String> = frames.iter().map(reply::render_sse_data_frame).collect();
            rendered.push(reply::render_done_frame().to_string());
            BridgeReply::SseFrames(rendered)
        } else {
            BridgeReply::Json(chat)
        }
    } else if client_wants_stream {
        let events = reply::response_json_to_sse_events(&response);
        let rendered: Vec<String> = events.iter().map(reply::render_sse_data_frame).collect();
        BridgeReply::SseFrames(rendered)
    } else {
        BridgeReply::Json(response)
    }
}

enum LiveSink {
    ChatSse(reply::ChatSseTranslator),
    ResponsesSse,
}

/// Drives the live SSE reply path (the two "upstream delivers SSE, client
/// wants SSE" matrix rows): a stateful frame decoder feeding the sanitizer,
/// then either the chat-chunk translator or a raw Responses-SSE reframer.
/// The caller feeds upstream bytes as they arrive and writes the returned
/// wire frames straight to the client without buffering the whole body.
pub struct LiveReplyTranslator {
    decoder: SseDecoder,
    sink: LiveSink,
    completed_response: Option<Value>,
    chat_finished: bool,
}

impl LiveReplyTranslator {
    pub fn new_chat_sse(id: impl Into<String>, created: i64, model: Value) -> Self {
        Self {
            decoder: SseDecoder::new(),
            sink: LiveSink::ChatSse(reply::ChatSseTranslator::new(id, created, model)),
            completed_response: None,
            chat_finished: false,
        }
    }

    pub fn new_responses_sse() -> Self {
        Self { decoder: SseDecoder::new(), sink: LiveSink::ResponsesSse, completed_response: None, chat_finished: false }
    }

    /// Feeds newly-received upstream bytes; returns every client-bound
    /// wire frame (`data: …\n\n`) now ready to send.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let frames = self.decoder.push(bytes);
        frames.into_iter().flat_map(|frame| self.handle_frame(frame)).collect()
    }

    /// Flushes any trailing partial frame and, for the chat-SSE sink,
    /// guarantees the terminal `finish_reason` chunk plus `data: [DONE]`
    /// even if upstream closed before `response.completed` arrived.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(frame) = self.decoder.flush() {
            out.extend(self.handle_frame(frame));
        }
        if let LiveSink::ChatSse(translator) = &mut self.sink {
            if !self.chat_finished {
                out.extend(translator.finish(&json!({"output": []})).iter().map(reply::render_sse_data_frame));
            }
            out.push(reply::render_done_frame().to_string());
        }
        out
    }

    fn handle_frame(&mut self, frame: Frame) -> Vec<String> {
        let event_type = sse::event_type(&frame);
        let mut data = frame.data;
        let keep = sanitize::sanitize_frame(&event_type, &mut data);
        if event_type == "response.completed" {
            self.chat_finished = true;
            self.completed_response = data.get("response").cloned();
        }
        if !keep {
            return Vec::new();
        }
        match &mut self.sink {
            LiveSink::ResponsesSse => vec![reply::render_sse_data_frame(&data)],
            LiveSink::ChatSse(translator) => {
                translator.translate(&event_type, &data).iter().map(reply::render_sse_data_frame).collect()
            }
        }
    }

    /// The `usage` object carried by the last `response.completed` frame
    /// seen, if any — used to populate the trace entry.
    pub fn usage(&self) -> Option<Value> {
        self.completed_response.as_ref().and_then(|r| r.get("usage").cloned())
    }

    /// True once a `response.completed` frame with neither visible text
    /// nor a surviving tool call has been observed.
    pub fn assistant_empty(&self) -> bool {
        self.completed_response.as_ref().map(reply::response_is_assistant_empty).unwrap_or(true)
    }

    pub fn finish_reason(&self) -> Option<&'static str> {
        self.completed_response.as_ref().map(|response| {
            if response.get("output").and_then(Value::as_array).map(|items| {
                items.iter().any(|item| item.get("type").and_then(Value::as_str) == Some("function_call"))
            }).unwrap_or(false) {
                "tool_calls"
            } else {
                "stop"
            }
        })
    }
}
