//! Per-account token-refresh locking: a TTL-cleaned lock table keyed by
//! account id, so concurrent requests for the same account serialize on a
//! single in-flight refresh instead of racing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use gatebridge_core::{now_ms, Account};

use crate::lock_utils::lock_recover;

const LOCK_TTL_MS: i64 = 30 * 60 * 1000;
const LOCK_CLEANUP_INTERVAL_MS: i64 = 60_000;

struct LockEntry {
    lock: Arc<Mutex<()>>,
    last_seen_at: i64,
}

#[derive(Default)]
struct LockTable {
    entries: HashMap<String, LockEntry>,
    last_cleanup_at: i64,
}

static LOCKS: OnceLock<Mutex<LockTable>> = OnceLock::new();

fn account_lock(account_id: &str) -> Arc<Mutex<()>> {
    let mut table = lock_recover(LOCKS.get_or_init(|| Mutex::new(LockTable::default())), "token_refresh_locks");
    let now = now_ms();
    maybe_cleanup(&mut table, now);
    let entry = table.entries.entry(account_id.to_string()).or_insert_with(|| LockEntry {
        lock: Arc::new(Mutex::new(())),
        last_seen_at: now,
    });
    entry.last_seen_at = now;
    entry.lock.clone()
}

fn maybe_cleanup(table: &mut LockTable, now: i64) {
    if table.last_cleanup_at != 0 && now - table.last_cleanup_at < LOCK_CLEANUP_INTERVAL_MS {
        return;
    }
    table.last_cleanup_at = now;
    table.entries.retain(|_, entry| now - entry.last_seen_at <= LOCK_TTL_MS || Arc::strong_count(&entry.lock) > 1);
}

/// Refreshes `account`'s access token if it is within `TOKEN_REFRESH_MARGIN_MS`
/// of expiry and a refresh token is present; otherwise returns it unchanged.
/// A refresh failure is recorded on the account (`needs_token_refresh = true`,
/// `remember_error`) but never removes the stale token — the caller still
/// tries it, and upstream's own 401/403 carries the failure forward.
pub(super) fn ensure_valid_token(account: &Account) -> Account {
    let cfg = crate::config::current();
    let now = now_ms();
    let needs_refresh = match (account.expires_at, &account.refresh_token) {
        (Some(expires_at), Some(_)) => expires_at - now < cfg.token_refresh_margin_ms,
        _ => false,
    };
    if !needs_refresh {
        return account.clone();
    }

    let guard_lock = account_lock(&account.id);
    let _held = lock_recover(&guard_lock, "account_token_refresh");

    let mut next = account.clone();
    let issuer = account.issuer.clone().unwrap_or(cfg.oauth_issuer.clone());
    let refresh_token = account.refresh_token.clone().expect("checked Some above");
    match crate::usage::refresh_access_token(&issuer, &cfg.oauth_client_id, &refresh_token) {
        Ok(refreshed) => {
            next.access_token = refreshed.access_token;
            if let Some(refresh_token) = refreshed.refresh_token {
                next.refresh_token = Some(refresh_token);
            }
            next.expires_at = Some(now + 3600 * 1000);
            if let Some(state) = next.state.as_mut() {
                state.needs_token_refresh = false;
            }
        }
        Err(err) => {
            log::warn!("token refresh failed for account={}: {}", account.id, err);
            next.state.get_or_insert_with(Default::default).needs_token_refresh = true;
            next.remember_error(now, format!("token refresh failed: {err}"));
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(expires_at: Option<i64>, refresh_token: Option<&str>) -> Account {
        Account {
            id: "acc-1".to_string(),
            email: None,
            access_token: "tok".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at,
            chatgpt_account_id: None,
            issuer: None,
            enabled: true,
            priority: None,
            usage: None,
            state: None,
        }
    }

    #[test]
    fn skips_refresh_when_not_near_expiry() {
        let far_future = now_ms() + 24 * 3600 * 1000;
        let acc = account(Some(far_future), Some("rt"));
        let next = ensure_valid_token(&acc);
        assert_eq!(next.access_token, "tok");
    }

    #[test]
    fn skips_refresh_without_refresh_token() {
        let soon = now_ms() + 60_000;
        let acc = account(Some(soon), None);
        let next = ensure_valid_token(&acc);
        assert_eq!(next.access_token, "tok");
    }
}
