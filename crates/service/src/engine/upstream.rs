//! Single-account upstream fetch with the bounded intra-attempt retry
//! budget: a small result enum per outcome, exponential backoff between
//! attempts, transport errors classified the same way as non-ok statuses.

use std::sync::OnceLock;
use std::time::Duration;

use gatebridge_core::Account;
use regex::Regex;
use reqwest::blocking::{Client, Response};
use serde_json::Value;

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

fn retryable_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)rate.?limit|overloaded|service.?unavailable|upstream.?connect|connection.?refused").expect("static regex"))
}

fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

static UPSTREAM_CLIENT: OnceLock<Client> = OnceLock::new();

fn client() -> &'static Client {
    UPSTREAM_CLIENT.get_or_init(|| {
        Client::builder().connect_timeout(Duration::from_secs(15)).build().unwrap_or_else(|err| {
            log::error!("upstream http client build failed, falling back to defaults: {err}");
            Client::new()
        })
    })
}

fn user_agent() -> String {
    let info = os_info::get();
    format!("pi ({} {}; {})", info.os_type(), info.version(), std::env::consts::ARCH)
}

/// Every upstream request carries this fixed header set; `chatgpt-account-id`
/// and `session_id` are only attached when the account/client provide them.
fn build_request(account: &Account, session_id: Option<&str>, payload: &Value) -> reqwest::blocking::RequestBuilder {
    let cfg = crate::config::current();
    let url = format!("{}{}", cfg.chatgpt_base_url, cfg.upstream_path);
    let mut req = client()
        .post(&url)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", account.access_token))
        .header("accept", "text/event-stream")
        .header("OpenAI-Beta", "responses=experimental")
        .header("originator", "pi")
        .header("User-Agent", user_agent())
        .json(payload);
    if let Some(account_id) = &account.chatgpt_account_id {
        req = req.header("chatgpt-account-id", account_id);
    }
    if let Some(session_id) = session_id {
        req = req.header("session_id", session_id);
    }
    req
}

fn backoff_sleep(attempt: u32) {
    let cfg = crate::config::current();
    let delay_ms = cfg.upstream_base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    std::thread::sleep(Duration::from_millis(delay_ms));
}

pub(super) enum AttemptResult {
    /// Status 200; body not yet consumed, ready to stream or buffer.
    Success(Response),
    /// A terminal non-ok status, after the intra-attempt retry budget (if
    /// any applied) was exhausted.
    Failed { status: u16, body: Vec<u8>, content_type: Option<String> },
}

/// Runs one account's fetch with up to `MAX_UPSTREAM_RETRIES + 1` total
/// attempts. Returns `Err` only for a transport failure that survived every
/// retry (or mentioned "usage limit", which is never worth retrying).
pub(super) fn attempt_upstream(account: &Account, session_id: Option<&str>, payload: &Value) -> Result<AttemptResult, String> {
    let cfg = crate::config::current();
    let max_retries = cfg.max_upstream_retries;

    for attempt in 0..=max_retries {
        match build_request(account, session_id, payload).send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if status == 200 {
                    return Ok(AttemptResult::Success(resp));
                }
                let content_type = resp.headers().get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
                let body = resp.bytes().map(|b| b.to_vec()).unwrap_or_default();
                let body_text = String::from_utf8_lossy(&body);
                let retry_eligible = attempt < max_retries && (is_retryable_status(status) || retryable_text_re().is_match(&body_text));
                if retry_eligible {
                    backoff_sleep(attempt);
                    continue;
                }
                return Ok(AttemptResult::Failed { status, body, content_type });
            }
            Err(err) => {
                let message = err.to_string();
                let retry_eligible = attempt < max_retries && !message.to_lowercase().contains("usage limit");
                if retry_eligible {
                    backoff_sleep(attempt);
                    continue;
                }
                return Err(message);
            }
        }
    }
    unreachable!("loop always returns within max_retries + 1 iterations")
}
