use serde::{Deserialize, Serialize};

use crate::usage::UsageSnapshot;

/// One upstream identity: credential plus optional quota/block state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chatgpt_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AccountState>,
}

impl Account {
    /// `used_percent == 0` on both windows (missing windows count as 0).
    pub fn is_untouched(&self) -> bool {
        match &self.usage {
            None => true,
            Some(usage) => {
                usage.primary.used_percent.unwrap_or(0.0) == 0.0
                    && usage.secondary.used_percent.unwrap_or(0.0) == 0.0
            }
        }
    }

    pub fn blocked_until(&self) -> i64 {
        self.state.as_ref().and_then(|s| s.blocked_until).unwrap_or(0)
    }

    pub fn is_eligible(&self, now: i64) -> bool {
        self.enabled && self.blocked_until() <= now
    }
}

const RECENT_ERRORS_MAX: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_selected_at: Option<i64>,
    #[serde(default)]
    pub recent_errors: Vec<RecentError>,
    #[serde(default)]
    pub needs_token_refresh: bool,
}

impl AccountState {
    pub fn remember_error(&mut self, at: i64, message: impl Into<String>) {
        let message = message.into();
        self.recent_errors.insert(0, RecentError { at, message: message.clone() });
        self.recent_errors.truncate(RECENT_ERRORS_MAX);
        self.last_error = Some(message);
    }
}

impl Account {
    pub fn remember_error(&mut self, at: i64, message: impl Into<String>) {
        self.state.get_or_insert_with(AccountState::default).remember_error(at, message);
    }

    /// Blocks the account until the sooner of its two window resets, or
    /// `now + fallback_ms` when neither window carries a reset time (or both
    /// are already in the past, e.g. a stale usage snapshot) — never less
    /// than `now`, so the just-hit account is never immediately eligible
    /// again.
    pub fn mark_quota_hit(&mut self, now: i64, message: impl Into<String>, fallback_ms: i64) {
        let resets = self
            .usage
            .as_ref()
            .map(|u| [u.primary.reset_at, u.secondary.reset_at])
            .unwrap_or([None, None]);
        let blocked_until = resets
            .into_iter()
            .flatten()
            .min()
            .filter(|reset_at| *reset_at > now)
            .unwrap_or(now + fallback_ms)
            .max(now);
        let message = message.into();
        let state = self.state.get_or_insert_with(AccountState::default);
        state.blocked_until = Some(blocked_until);
        state.blocked_reason = Some(message.clone());
        state.remember_error(now, message);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentError {
    pub at: i64,
    pub message: String,
}

/// Onboarding progress record. Populated externally by the OAuth flow (out
/// of scope here); this crate only owns the bounded store it lives in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthFlowState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub pkce_verifier: String,
    pub created_at: i64,
    pub status: OAuthFlowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthFlowStatus {
    Pending,
    Success,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(enabled: bool, blocked_until: Option<i64>) -> Account {
        Account {
            id: "acc-1".to_string(),
            email: None,
            access_token: "tok".to_string(),
            refresh_token: None,
            expires_at: None,
            chatgpt_account_id: None,
            issuer: None,
            enabled,
            priority: None,
            usage: None,
            state: blocked_until.map(|blocked_until| AccountState {
                blocked_until: Some(blocked_until),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn untouched_with_no_usage_snapshot() {
        assert!(account(true, None).is_untouched());
    }

    #[test]
    fn eligibility_requires_enabled_and_unblocked() {
        assert!(account(true, None).is_eligible(1_000));
        assert!(!account(false, None).is_eligible(1_000));
        assert!(!account(true, Some(2_000)).is_eligible(1_000));
        assert!(account(true, Some(500)).is_eligible(1_000));
    }

    #[test]
    fn remember_error_truncates_to_ten_and_sets_last_error() {
        let mut state = AccountState::default();
        for i in 0..15 {
            state.remember_error(i, format!("err-{i}"));
        }
        assert_eq!(state.recent_errors.len(), 10);
        assert_eq!(state.recent_errors[0].message, "err-14");
        assert_eq!(state.last_error.as_deref(), Some("err-14"));
    }

    #[test]
    fn mark_quota_hit_uses_earliest_window_reset() {
        let mut acc = account(true, None);
        acc.usage = Some(crate::usage::UsageSnapshot {
            primary: crate::usage::UsageWindow { used_percent: Some(100.0), reset_at: Some(5_000) },
            secondary: crate::usage::UsageWindow { used_percent: Some(40.0), reset_at: Some(2_000) },
            fetched_at: 0,
        });
        acc.mark_quota_hit(1_000, "quota", 30 * 60 * 1000);
        assert_eq!(acc.state.as_ref().unwrap().blocked_until, Some(2_000));
        assert_eq!(acc.state.as_ref().unwrap().blocked_reason.as_deref(), Some("quota"));
    }

    #[test]
    fn mark_quota_hit_falls_back_when_no_reset_times() {
        let mut acc = account(true, None);
        acc.mark_quota_hit(1_000, "quota", 30 * 60 * 1000);
        assert_eq!(acc.state.as_ref().unwrap().blocked_until, Some(1_000 + 30 * 60 * 1000));
    }

    #[test]
    fn mark_quota_hit_falls_back_when_cached_reset_times_are_stale() {
        let mut acc = account(true, None);
        acc.usage = Some(crate::usage::UsageSnapshot {
            primary: crate::usage::UsageWindow { used_percent: Some(100.0), reset_at: Some(500) },
            secondary: crate::usage::UsageWindow { used_percent: Some(40.0), reset_at: Some(200) },
            fetched_at: 0,
        });
        acc.mark_quota_hit(1_000, "quota", 30 * 60 * 1000);
        let blocked_until = acc.state.as_ref().unwrap().blocked_until.unwrap();
        assert_eq!(blocked_until, 1_000 + 30 * 60 * 1000);
        assert!(blocked_until > 1_000);
    }
}
