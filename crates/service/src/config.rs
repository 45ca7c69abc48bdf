//! Environment-driven runtime configuration.
//!
//! Every tunable is read once into a cached value behind a `OnceLock`, with
//! a `reload_from_env()` entry point per group so tests (and, eventually, a
//! SIGHUP-style reload) can force a re-read without restarting the process.

use std::sync::{OnceLock, RwLock};
use std::time::Duration;

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port: u16,
    pub store_path: String,
    pub oauth_state_path: String,
    pub trace_file_path: String,
    pub trace_stats_history_path: String,
    pub trace_include_body: bool,
    pub chatgpt_base_url: String,
    pub upstream_path: String,
    pub oauth_issuer: String,
    pub oauth_client_id: String,
    pub admin_token: Option<String>,
    pub max_account_retry_attempts: u32,
    pub max_upstream_retries: u32,
    pub upstream_base_delay_ms: u64,
    pub proxy_models: Vec<String>,
    pub models_client_version: String,
    pub models_cache_ms: u64,
    pub token_refresh_margin_ms: i64,
    pub account_flush_interval_ms: u64,
    pub usage_cache_ttl_ms: i64,
    pub usage_timeout_ms: u64,
    pub block_fallback_ms: i64,
    pub routing_window_ms: i64,
    pub retention_max: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    fn from_env() -> Self {
        let proxy_models = env_string("PROXY_MODELS", "gpt-5.3-codex,gpt-5.2-codex,gpt-5-codex")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            port: env_u32("PORT", 8787) as u16,
            store_path: env_string("STORE_PATH", "accounts.json"),
            oauth_state_path: env_string("OAUTH_STATE_PATH", "oauth-state.json"),
            trace_file_path: env_string("TRACE_FILE_PATH", "requests-trace.jsonl"),
            trace_stats_history_path: env_string(
                "TRACE_STATS_HISTORY_PATH",
                "requests-stats-history.jsonl",
            ),
            trace_include_body: env_bool("TRACE_INCLUDE_BODY", false),
            chatgpt_base_url: env_string("CHATGPT_BASE_URL", "https://chatgpt.com"),
            upstream_path: env_string("UPSTREAM_PATH", "/backend-api/codex/responses"),
            oauth_issuer: env_string("OAUTH_ISSUER", "https://auth.openai.com"),
            oauth_client_id: env_string("OAUTH_CLIENT_ID", "app_EMoamEEZ73f0CkXaXp7hrann"),
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|v| !v.trim().is_empty()),
            max_account_retry_attempts: env_u32("MAX_ACCOUNT_RETRY_ATTEMPTS", 5),
            max_upstream_retries: env_u32("MAX_UPSTREAM_RETRIES", 3),
            upstream_base_delay_ms: env_u64("UPSTREAM_BASE_DELAY_MS", 1000),
            proxy_models,
            models_client_version: env_string("MODELS_CLIENT_VERSION", "0.1.0"),
            models_cache_ms: env_u64("MODELS_CACHE_MS", 10 * 60 * 1000),
            token_refresh_margin_ms: env_u64("TOKEN_REFRESH_MARGIN_MS", 5 * 60 * 1000) as i64,
            account_flush_interval_ms: env_u64("ACCOUNT_FLUSH_INTERVAL_MS", 5000),
            usage_cache_ttl_ms: env_u64("USAGE_CACHE_TTL_MS", 5 * 60 * 1000) as i64,
            usage_timeout_ms: env_u64("USAGE_TIMEOUT_MS", 10_000),
            block_fallback_ms: env_u64("BLOCK_FALLBACK_MS", 30 * 60 * 1000) as i64,
            routing_window_ms: env_u64("ROUTING_WINDOW_MS", 5 * 60 * 1000) as i64,
            retention_max: env_u64("RETENTION_MAX", 1000) as usize,
        }
    }

    pub fn usage_timeout(&self) -> Duration {
        Duration::from_millis(self.usage_timeout_ms)
    }

    pub fn account_flush_interval(&self) -> Duration {
        Duration::from_millis(self.account_flush_interval_ms)
    }
}

static RUNTIME_CONFIG: OnceLock<RwLock<RuntimeConfig>> = OnceLock::new();

fn cell() -> &'static RwLock<RuntimeConfig> {
    RUNTIME_CONFIG.get_or_init(|| RwLock::new(RuntimeConfig::from_env()))
}

/// Current cached configuration snapshot.
pub fn current() -> RuntimeConfig {
    match cell().read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Re-reads every recognized environment variable into the cache.
pub fn reload_from_env() {
    let next = RuntimeConfig::from_env();
    let mut guard = match cell().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = next;
}
