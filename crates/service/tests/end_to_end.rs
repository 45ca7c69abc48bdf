//! End-to-end scenarios driven through `engine::forward` against a
//! hand-rolled `tiny_http` stub upstream, a function-level/narrow-socket
//! test style rather than a full client-harness crate. Tests that mutate
//! process-wide env vars or the singleton account store are serialized
//! behind `TEST_GUARD`.

use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::sync::{Mutex, Once, OnceLock};

use gatebridge_core::usage::{UsageSnapshot, UsageWindow};
use gatebridge_core::{now_ms, Account};
use gatebridge_service::engine::{self, EngineBody};
use gatebridge_service::{config, store, trace};
use serde_json::{json, Value};
use tempfile::TempDir;
use tiny_http::{Header, Response, Server, StatusCode};

fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|p| p.into_inner())
}

/// One-time process setup for the store paths: `AccountStore`/
/// `OAuthStateStore` are process-wide `OnceLock`s with no path-reset, so
/// they must be pointed at a throwaway directory before the first access
/// anywhere in this binary.
fn setup_once() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let dir = tempfile::tempdir().expect("tempdir").into_path();
        std::env::set_var("STORE_PATH", dir.join("accounts.json"));
        std::env::set_var("OAUTH_STATE_PATH", dir.join("oauth-state.json"));
        // Small enough that two sequential test calls essentially never
        // land in the same sticky bucket, keeping `engine_router`'s
        // process-wide stickiness from leaking between tests.
        std::env::set_var("ROUTING_WINDOW_MS", "1");
        config::reload_from_env();
    });
}

/// Re-points the trace writers at a fresh temp directory so each test's
/// trace assertions see only its own entries.
fn fresh_trace_paths() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::env::set_var("TRACE_FILE_PATH", dir.path().join("trace.jsonl"));
    std::env::set_var("TRACE_STATS_HISTORY_PATH", dir.path().join("history.jsonl"));
    config::reload_from_env();
    trace::reload_from_env();
    dir
}

fn clear_accounts() {
    for account in store::accounts().list() {
        let _ = store::accounts().delete(&account.id);
    }
}

fn untouched_account(id: &str) -> Account {
    Account {
        id: id.to_string(),
        email: None,
        access_token: "tok".to_string(),
        refresh_token: None,
        expires_at: None,
        chatgpt_account_id: None,
        issuer: None,
        enabled: true,
        priority: None,
        usage: Some(UsageSnapshot {
            primary: UsageWindow { used_percent: Some(0.0), reset_at: None },
            secondary: UsageWindow { used_percent: Some(0.0), reset_at: None },
            fetched_at: now_ms(),
        }),
        state: None,
    }
}

fn account_with_usage(id: &str, primary: f64, secondary: f64) -> Account {
    let mut account = untouched_account(id);
    account.usage = Some(UsageSnapshot {
        primary: UsageWindow { used_percent: Some(primary), reset_at: None },
        secondary: UsageWindow { used_percent: Some(secondary), reset_at: None },
        fetched_at: now_ms(),
    });
    account
}

struct StubUpstream {
    addr: String,
}

/// Serves `responses` in order, one per incoming connection, then stops
/// accepting. Each response is `(status, content_type, body)`.
fn spawn_stub(responses: Vec<(u16, &'static str, Vec<u8>)>) -> StubUpstream {
    let server = Server::http("127.0.0.1:0").expect("bind stub server");
    let addr = server.server_addr().to_ip().expect("ip addr").to_string();
    std::thread::spawn(move || {
        let mut queue: VecDeque<(u16, &'static str, Vec<u8>)> = responses.into();
        while let Some((status, content_type, body)) = queue.pop_front() {
            let Ok(request) = server.recv() else { break };
            let header = Header::from_bytes(b"Content-Type".as_slice(), content_type.as_bytes()).expect("header");
            let len = Some(body.len());
            let response = Response::new(StatusCode(status), vec![header], Cursor::new(body), len, None);
            let _ = request.respond(response);
        }
    });
    StubUpstream { addr }
}

fn point_at_stub(stub: &StubUpstream) {
    std::env::set_var("CHATGPT_BASE_URL", format!("http://{}", stub.addr));
    config::reload_from_env();
}

fn read_body(body: EngineBody) -> Vec<u8> {
    match body {
        EngineBody::Bytes(bytes) => bytes,
        EngineBody::Stream(mut reader) => {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).expect("drain stream");
            out
        }
    }
}

fn chat_request(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "stream": stream,
        "messages": [{"role": "user", "content": "hi"}],
    })
}

#[test]
fn happy_chat_sse_streams_deltas_then_done() {
    let _guard = test_guard();
    setup_once();
    let _trace_dir = fresh_trace_paths();
    clear_accounts();

    for id in ["acc-a", "acc-b", "acc-c"] {
        store::accounts().upsert(untouched_account(id)).expect("seed account");
    }

    let sse_body = concat!(
        "data: {\"type\":\"response.output_text.delta\",\"delta\":\"he\"}\n\n",
        "data: {\"type\":\"response.output_text.delta\",\"delta\":\"llo\"}\n\n",
        "data: {\"type\":\"response.completed\",\"response\":{\"model\":\"gpt-5.3-codex\",\"output\":[{\"type\":\"message\",\"role\":\"assistant\",\"content\":[{\"type\":\"output_text\",\"text\":\"hello\"}]}],\"usage\":{\"input_tokens\":3,\"output_tokens\":1,\"total_tokens\":4}}}\n\n",
    );
    let stub = spawn_stub(vec![(200, "text/event-stream", sse_body.as_bytes().to_vec())]);
    point_at_stub(&stub);

    let result = engine::forward("/v1/chat/completions", chat_request("gpt-5.3-codex", true));
    assert_eq!(result.status, 200);
    let body = String::from_utf8(read_body(result.body)).expect("utf8 body");

    assert!(body.contains("\"delta\":\"he\""));
    assert!(body.contains("\"delta\":\"llo\""));
    assert!(body.contains("\"finish_reason\":\"stop\""));
    assert!(body.contains("\"prompt_tokens\":3"));
    assert!(body.contains("\"completion_tokens\":1"));
    assert!(body.trim_end().ends_with("data: [DONE]"));

    // Router picked the lexicographically-smallest untouched id.
    let traces = trace::read_trace_window();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].account_id.as_deref(), Some("acc-a"));
    assert_eq!(traces[0].status, 200);
}

#[test]
fn quota_failover_rotates_to_next_account() {
    let _guard = test_guard();
    setup_once();
    let _trace_dir = fresh_trace_paths();
    clear_accounts();

    store::accounts().upsert(untouched_account("acc-low")).expect("seed A");
    store::accounts().upsert(account_with_usage("acc-high", 95.0, 40.0)).expect("seed B");

    let ok_body = json!({
        "model": "gpt-5.3-codex",
        "output": [{"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "ok"}]}],
    });
    let stub = spawn_stub(vec![
        (429, "application/json", br#"{"error":"rate limit reached"}"#.to_vec()),
        (200, "application/json", serde_json::to_vec(&ok_body).unwrap()),
    ]);
    point_at_stub(&stub);

    let result = engine::forward("/v1/chat/completions", chat_request("gpt-5.3-codex", false));
    assert_eq!(result.status, 200);

    let traces = trace::read_trace_window();
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[0].status, 429);
    assert_eq!(traces[1].status, 200);
    let statuses: Vec<u16> = traces.iter().map(|t| t.status).collect();
    assert!(statuses.contains(&429) && statuses.contains(&200));

    // The quota-hit account is now blocked.
    let low = store::accounts().get("acc-low").expect("account still present");
    assert!(low.blocked_until() > now_ms());
}

#[test]
fn non_quota_error_returns_verbatim_without_failover() {
    let _guard = test_guard();
    setup_once();
    let _trace_dir = fresh_trace_paths();
    clear_accounts();

    store::accounts().upsert(untouched_account("acc-solo")).expect("seed account");

    let stub = spawn_stub(vec![(400, "application/json", br#"{"error":"invalid request"}"#.to_vec())]);
    point_at_stub(&stub);

    let result = engine::forward("/v1/chat/completions", chat_request("gpt-5.3-codex", false));
    assert_eq!(result.status, 400);

    // Not blocked: this was a terminal non-quota error, not a quota hit.
    let account = store::accounts().get("acc-solo").expect("account still present");
    assert_eq!(account.blocked_until(), 0);
}

#[test]
fn tool_calls_pass_through_with_finish_reason() {
    let _guard = test_guard();
    setup_once();
    let _trace_dir = fresh_trace_paths();
    clear_accounts();
    store::accounts().upsert(untouched_account("acc-tools")).expect("seed account");

    let upstream_body = json!({
        "model": "gpt-5.3-codex",
        "output": [{
            "type": "function_call",
            "call_id": "c1",
            "name": "get_weather",
            "arguments": "{\"city\":\"Paris\"}",
        }],
    });
    let stub = spawn_stub(vec![(200, "application/json", serde_json::to_vec(&upstream_body).unwrap())]);
    point_at_stub(&stub);

    let mut body = chat_request("gpt-5.3-codex", false);
    body["tools"] = json!([{"type": "function", "function": {"name": "get_weather", "parameters": {"type": "object"}, "strict": true}}]);

    let result = engine::forward("/v1/chat/completions", body);
    assert_eq!(result.status, 200);
    let chat: Value = serde_json::from_slice(&read_body(result.body)).expect("json body");

    let tool_calls = &chat["choices"][0]["message"]["tool_calls"];
    assert_eq!(tool_calls[0]["id"], "c1");
    assert_eq!(tool_calls[0]["function"]["name"], "get_weather");
    assert_eq!(tool_calls[0]["function"]["arguments"], "{\"city\":\"Paris\"}");
    assert_eq!(chat["choices"][0]["finish_reason"], "tool_calls");
}

#[test]
fn retention_compaction_keeps_only_the_last_window() {
    let _guard = test_guard();
    setup_once();
    let _trace_dir = fresh_trace_paths();
    std::env::set_var("RETENTION_MAX", "1000");
    config::reload_from_env();

    for i in 0..1500 {
        trace::append_trace(trace::NewTrace {
            route: "/v1/chat/completions".to_string(),
            account_id: Some(format!("acc-{i}")),
            status: 200,
            ..Default::default()
        });
    }

    let window = trace::read_trace_window();
    assert_eq!(window.len(), 1000);
    assert_eq!(window.last().unwrap().account_id.as_deref(), Some("acc-1499"));

    std::env::remove_var("RETENTION_MAX");
    config::reload_from_env();
}
