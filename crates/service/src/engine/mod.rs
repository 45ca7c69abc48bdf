//! Forwarding engine: the per-client-request state machine (INIT -> PREP ->
//! ATTEMPT(k) -> EXHAUSTED/FAIL_503) that ties the router, token/usage
//! refresh, upstream retry, and the protocol bridge together.

mod stream;
mod token;
mod upstream;

use std::io::Read;
use std::sync::OnceLock;

use gatebridge_core::{now_ms, Account, Router};
use regex::Regex;
use serde_json::Value;

use crate::bridge::{self, BridgeReply, LiveReplyTranslator};
use crate::trace::{self, NewTrace};
use upstream::AttemptResult;

fn quota_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b429\b|quota|usage limit|rate.?limit|too many requests|limit reached|capacity")
            .expect("static regex")
    })
}

fn engine_router() -> &'static Router {
    static ROUTER: OnceLock<Router> = OnceLock::new();
    ROUTER.get_or_init(|| Router::new(crate::config::current().routing_window_ms))
}

/// The body of an [`EngineResponse`]: either fully buffered, or a live
/// stream the HTTP layer reads from as bytes arrive from upstream.
pub enum EngineBody {
    Bytes(Vec<u8>),
    Stream(Box<dyn Read + Send>),
}

pub struct EngineResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: EngineBody,
}

impl EngineResponse {
    fn json(status: u16, value: &Value) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        Self { status, content_type: "application/json", body: EngineBody::Bytes(body) }
    }

    fn sse_bytes(status: u16, frames: Vec<String>) -> Self {
        let body = frames.concat().into_bytes();
        Self { status, content_type: "text/event-stream", body: EngineBody::Bytes(body) }
    }
}

/// Wraps a live SSE stream so the trace entry (usage, finish reason,
/// latency) is appended the moment the client has drained the last byte,
/// rather than requiring the caller to poll the translator separately.
struct TracedLiveStream {
    inner: stream::LiveStream,
    traced: bool,
    route: String,
    account_id: String,
    email: Option<String>,
    model: Option<String>,
    started: i64,
}

impl Read for TracedLiveStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !self.traced {
            self.traced = true;
            let translator = self.inner.translator();
            trace::append_trace(NewTrace {
                route: self.route.clone(),
                account_id: Some(self.account_id.clone()),
                email: self.email.clone(),
                model: self.model.clone(),
                status: 200,
                stream: true,
                latency_ms: now_ms() - self.started,
                usage: translator.usage(),
                assistant_empty_output: translator.assistant_empty(),
                assistant_finish_reason: translator.finish_reason().map(str::to_string),
                ..Default::default()
            });
        }
        Ok(n)
    }
}

/// Entry point: one client HTTP request in, one reply out. `path` is used
/// only to detect the `chat/completions` route (response shape wins over
/// payload shape, per the gateway's documented ambiguous-but-preserved
/// behavior); `client_body` is the already-parsed JSON request body.
pub fn forward(path: &str, client_body: Value) -> EngineResponse {
    let is_chat_path = path.contains("chat/completions");
    let client_wants_stream = client_body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let session_id = bridge::payload::session_id_from_body(&client_body);
    let client_model = client_body.get("model").and_then(Value::as_str).map(str::to_string);
    let upstream_payload = bridge::payload::build_upstream_payload(&client_body);

    let store = crate::store::accounts();
    let accounts = store.list();
    if accounts.is_empty() {
        return EngineResponse::json(503, &serde_json::json!({"error": "no accounts configured"}));
    }

    // PREP: refresh token/usage for every known account up front, persist
    // whichever ones actually changed.
    let accounts: Vec<Account> = accounts
        .into_iter()
        .map(|account| {
            let refreshed = token::ensure_valid_token(&account);
            let with_usage = crate::usage::refresh_usage(&refreshed, false);
            if with_usage != account {
                let _ = store.upsert(with_usage.clone());
            }
            with_usage
        })
        .collect();

    let cfg = crate::config::current();
    let router = engine_router();
    let max_attempts = (accounts.len() as u32).min(cfg.max_account_retry_attempts);

    let mut tried_ids: Vec<String> = Vec::new();
    for _ in 0..max_attempts {
        let candidates: Vec<Account> =
            accounts.iter().filter(|a| !tried_ids.contains(&a.id)).cloned().collect();
        let now = now_ms();
        let Some(mut account) = router.choose(&candidates, now) else {
            return EngineResponse::json(429, &serde_json::json!({"error": "all accounts exhausted or unavailable"}));
        };
        tried_ids.push(account.id.clone());

        account.state.get_or_insert_with(Default::default).last_selected_at = Some(now);
        let _ = store.upsert(account.clone());

        let started = now_ms();
        match upstream::attempt_upstream(&account, session_id.as_deref(), &upstream_payload) {
            Ok(AttemptResult::Success(resp)) => {
                let content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                return dispatch_success(
                    is_chat_path,
                    client_wants_stream,
                    content_type,
                    resp,
                    started,
                    &account,
                    &client_model,
                    path,
                );
            }
            Ok(AttemptResult::Failed { status, body, content_type }) => {
                let body_text = String::from_utf8_lossy(&body).to_string();
                let now = now_ms();
                let latency_ms = now - started;
                let is_quota = status == 429 || quota_regex().is_match(&body_text);
                if is_quota {
                    account.mark_quota_hit(now, body_text.clone(), cfg.block_fallback_ms);
                } else {
                    account.remember_error(now, body_text.clone());
                }
                let _ = store.upsert(account.clone());
                trace::append_trace(NewTrace {
                    route: path.to_string(),
                    account_id: Some(account.id.clone()),
                    email: account.email.clone(),
                    model: client_model.clone(),
                    status,
                    stream: client_wants_stream,
                    latency_ms,
                    error: Some(body_text),
                    upstream_content_type: content_type.clone(),
                    ..Default::default()
                });
                if is_quota {
                    continue;
                }
                return EngineResponse {
                    status,
                    content_type: "application/json",
                    body: EngineBody::Bytes(body),
                };
            }
            Err(message) => {
                let now = now_ms();
                account.remember_error(now, message.clone());
                let _ = store.upsert(account.clone());
                trace::append_trace(NewTrace {
                    route: path.to_string(),
                    account_id: Some(account.id.clone()),
                    email: account.email.clone(),
                    model: client_model.clone(),
                    status: 599,
                    stream: client_wants_stream,
                    latency_ms: now - started,
                    upstream_error: Some(message),
                    ..Default::default()
                });
                continue;
            }
        }
    }

    EngineResponse::json(429, &serde_json::json!({"error": "all accounts exhausted or unavailable"}))
}

/// Dispatches a 200 upstream response per the reply-transform matrix: a
/// live translator when the client asked for a stream and upstream is
/// actually SSE, a fully-buffered translation otherwise.
fn dispatch_success(
    is_chat_path: bool,
    client_wants_stream: bool,
    content_type: String,
    mut resp: reqwest::blocking::Response,
    started: i64,
    account: &Account,
    client_model: &Option<String>,
    route: &str,
) -> EngineResponse {
    let is_sse_upstream = content_type.contains("text/event-stream");
    let created = now_ms() / 1000;

    if client_wants_stream && is_sse_upstream {
        let id = bridge::new_id(if is_chat_path { "chatcmpl-" } else { "resp_" });
        let translator = if is_chat_path {
            let model = client_model.clone().map(Value::String).unwrap_or(Value::Null);
            LiveReplyTranslator::new_chat_sse(id, created, model)
        } else {
            LiveReplyTranslator::new_responses_sse()
        };
        let live = stream::LiveStream::new(resp, translator);
        let traced = TracedLiveStream {
            inner: live,
            traced: false,
            route: route.to_string(),
            account_id: account.id.clone(),
            email: account.email.clone(),
            model: client_model.clone(),
            started,
        };
        return EngineResponse {
            status: 200,
            content_type: "text/event-stream",
            body: EngineBody::Stream(Box::new(traced)),
        };
    }

    let mut buf = Vec::new();
    let _ = resp.read_to_end(&mut buf);
    let id = bridge::new_id(if is_chat_path { "chatcmpl-" } else { "resp_" });
    let reply = bridge::respond_buffered(is_chat_path, client_wants_stream, &content_type, &buf, &id, created);

    trace::append_trace(NewTrace {
        route: route.to_string(),
        account_id: Some(account.id.clone()),
        email: account.email.clone(),
        model: client_model.clone(),
        status: 200,
        stream: client_wants_stream,
        latency_ms: now_ms() - started,
        upstream_content_type: Some(content_type),
        ..Default::default()
    });

    match reply {
        BridgeReply::Json(value) => EngineResponse::json(200, &value),
        BridgeReply::SseFrames(frames) => EngineResponse::sse_bytes(200, frames),
    }
}
