//! Quota probe: per-account usage refresh and the OAuth token refresh it
//! shares an HTTP client with.

mod http_client;

use serde::Deserialize;
use serde_json::Value;

use gatebridge_core::{now_ms, Account};

#[derive(Debug, Deserialize)]
pub struct RefreshTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

fn send_with_retry(
    build: impl Fn(&reqwest::blocking::Client) -> reqwest::blocking::RequestBuilder,
) -> Result<reqwest::blocking::Response, String> {
    let client = http_client::usage_http_client();
    match build(&client).send() {
        Ok(resp) => Ok(resp),
        Err(first_err) => {
            log::warn!("usage http request failed, rebuilding client and retrying once: {first_err}");
            let client = http_client::rebuild_usage_http_client();
            build(&client).send().map_err(|err| format!("usage http request failed: {err}"))
        }
    }
}

/// Fetches `GET {base}/backend-api/wham/usage` for one account's bearer
/// token, under the configured timeout, and returns the raw JSON body.
fn fetch_usage_body(base_url: &str, bearer: &str, chatgpt_account_id: Option<&str>) -> Result<Value, String> {
    let cfg = crate::config::current();
    let url = format!("{base_url}/backend-api/wham/usage");
    let resp = send_with_retry(|client| {
        let mut req = client.get(&url).bearer_auth(bearer);
        if let Some(account_id) = chatgpt_account_id {
            req = req.header("ChatGPT-Account-Id", account_id);
        }
        req
    })?;
    let status = resp.status();
    if !status.is_success() {
        return Err(format!("usage endpoint status {status}"));
    }
    http_client::read_json_with_timeout(resp, cfg.usage_timeout())
}

/// `refresh_usage(account, force)`: returns the possibly-updated account.
/// No-ops (returns `account` unchanged) unless `force` or the cached
/// snapshot is older than `USAGE_CACHE_TTL_MS`.
pub fn refresh_usage(account: &Account, force: bool) -> Account {
    let cfg = crate::config::current();
    let now = now_ms();
    if !force {
        if let Some(usage) = &account.usage {
            if now - usage.fetched_at < cfg.usage_cache_ttl_ms {
                return account.clone();
            }
        }
    }

    let mut next = account.clone();
    match fetch_usage_body(&cfg.chatgpt_base_url, &account.access_token, account.chatgpt_account_id.as_deref()) {
        Ok(body) => {
            next.usage = Some(gatebridge_core::usage::parse_usage_snapshot(&body, now));
            if let Some(state) = next.state.as_mut() {
                state.last_error = None;
            }
        }
        Err(err) => {
            log::warn!("usage refresh failed for account={}: {}", account.id, err);
            next.remember_error(now, err);
        }
    }
    next
}

/// Refreshes an OAuth access token via `grant_type=refresh_token`, posted
/// as a standard form-urlencoded body.
pub fn refresh_access_token(issuer: &str, client_id: &str, refresh_token: &str) -> Result<RefreshTokenResponse, String> {
    let cfg = crate::config::current();
    let url = format!("{}/oauth/token", issuer.trim_end_matches('/'));
    let body = format!(
        "grant_type=refresh_token&refresh_token={}&client_id={}&scope=openid%20profile%20email",
        urlencoding::encode(refresh_token),
        urlencoding::encode(client_id),
    );
    let resp = send_with_retry(|client| {
        client
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body.clone())
    })?;
    let status = resp.status();
    if !status.is_success() {
        return Err(format!("token refresh status {status}"));
    }
    http_client::read_json_with_timeout(resp, cfg.usage_timeout())
}
