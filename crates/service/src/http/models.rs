//! `/v1/models` listing: merges the configured `PROXY_MODELS` allowlist with
//! whatever upstream itself reports, cached behind a TTL.

use std::sync::{Mutex, OnceLock};

use gatebridge_core::now_ms;
use serde_json::{json, Value};

use crate::lock_utils::lock_recover;

struct ModelsCache {
    at: i64,
    models: Vec<String>,
}

static CACHE: OnceLock<Mutex<Option<ModelsCache>>> = OnceLock::new();

fn cache() -> &'static Mutex<Option<ModelsCache>> {
    CACHE.get_or_init(|| Mutex::new(None))
}

fn fetch_upstream_model_ids() -> Vec<String> {
    let cfg = crate::config::current();
    let url = format!(
        "{}/backend-api/codex/models?client_version={}",
        cfg.chatgpt_base_url, cfg.models_client_version
    );
    let account = crate::store::accounts().list().into_iter().find(|a| a.enabled);
    let Some(account) = account else { return Vec::new() };

    let client = reqwest::blocking::Client::new();
    let mut req = client.get(&url).header("authorization", format!("Bearer {}", account.access_token));
    if let Some(account_id) = &account.chatgpt_account_id {
        req = req.header("chatgpt-account-id", account_id);
    }
    let response = match req.send() {
        Ok(resp) if resp.status().is_success() => resp,
        Ok(resp) => {
            log::warn!("model discovery upstream status={}", resp.status());
            return Vec::new();
        }
        Err(err) => {
            log::warn!("model discovery request failed: {err}");
            return Vec::new();
        }
    };
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if content_type.to_ascii_lowercase().contains("text/html") {
        return Vec::new();
    }
    let body: Value = match response.json() {
        Ok(v) => v,
        Err(err) => {
            log::warn!("model discovery response parse failed: {err}");
            return Vec::new();
        }
    };
    body.get("models")
        .or_else(|| body.get("data"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string).or_else(|| item.get("id").and_then(Value::as_str).map(str::to_string)))
                .collect()
        })
        .unwrap_or_default()
}

fn refreshed_model_ids() -> Vec<String> {
    let cfg = crate::config::current();
    let now = now_ms();
    {
        let guard = lock_recover(cache(), "models_cache");
        if let Some(existing) = guard.as_ref() {
            if now - existing.at < cfg.models_cache_ms as i64 {
                return existing.models.clone();
            }
        }
    }

    let mut ids = cfg.proxy_models.clone();
    for discovered in fetch_upstream_model_ids() {
        if !ids.contains(&discovered) {
            ids.push(discovered);
        }
    }

    let mut guard = lock_recover(cache(), "models_cache");
    *guard = Some(ModelsCache { at: now, models: ids.clone() });
    ids
}

fn supports_reasoning(id: &str) -> bool {
    id.contains("gpt-5") || id.contains("codex")
}

fn model_object(id: &str) -> Value {
    json!({
        "id": id,
        "object": "model",
        "owned_by": "gatebridge",
        "context_window": Value::Null,
        "max_output_tokens": Value::Null,
        "supports_reasoning": supports_reasoning(id),
        "supports_tools": true,
        "supported_tool_types": ["function"],
    })
}

/// `GET /v1/models` body: `{"object":"list","data":[...]}`.
pub(super) fn list_models() -> Value {
    let ids = refreshed_model_ids();
    json!({
        "object": "list",
        "data": ids.iter().map(|id| model_object(id)).collect::<Vec<_>>(),
    })
}

/// `GET /v1/models/:id`; `None` if the id is not in the merged set.
pub(super) fn find_model(id: &str) -> Option<Value> {
    let ids = refreshed_model_ids();
    ids.iter().find(|candidate| candidate.as_str() == id).map(|id| model_object(id))
}
