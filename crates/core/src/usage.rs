use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One rolling rate-limit window (primary ~5h, secondary ~weekly).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub primary: UsageWindow,
    pub secondary: UsageWindow,
    pub fetched_at: i64,
}

fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

/// Parses `rate_limit.{primary,secondary}_window` from a wham/usage body.
/// `reset_at` on the wire is epoch seconds; stored as epoch ms.
pub fn parse_usage_snapshot(value: &Value, fetched_at: i64) -> UsageSnapshot {
    UsageSnapshot {
        primary: parse_window(value, "primary_window"),
        secondary: parse_window(value, "secondary_window"),
        fetched_at,
    }
}

fn parse_window(value: &Value, window: &str) -> UsageWindow {
    let used_percent = value
        .pointer(&format!("/rate_limit/{window}/used_percent"))
        .and_then(Value::as_f64)
        .map(clamp_percent);
    let reset_at = value
        .pointer(&format!("/rate_limit/{window}/reset_at"))
        .and_then(Value::as_i64)
        .map(|seconds| seconds * 1000);
    UsageWindow { used_percent, reset_at }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_both_windows_and_converts_reset_at_to_epoch_ms() {
        let body = json!({
            "rate_limit": {
                "primary_window": {"used_percent": 42.5, "reset_at": 1_700_000_000},
                "secondary_window": {"used_percent": 10.0, "reset_at": 1_800_000_000}
            }
        });
        let snap = parse_usage_snapshot(&body, 123);
        assert_eq!(snap.primary.used_percent, Some(42.5));
        assert_eq!(snap.primary.reset_at, Some(1_700_000_000_000));
        assert_eq!(snap.secondary.used_percent, Some(10.0));
        assert_eq!(snap.fetched_at, 123);
    }

    #[test]
    fn clamps_out_of_range_used_percent() {
        let body = json!({"rate_limit": {"primary_window": {"used_percent": 142.0}}});
        let snap = parse_usage_snapshot(&body, 0);
        assert_eq!(snap.primary.used_percent, Some(100.0));

        let body = json!({"rate_limit": {"primary_window": {"used_percent": -5.0}}});
        let snap = parse_usage_snapshot(&body, 0);
        assert_eq!(snap.primary.used_percent, Some(0.0));
    }

    #[test]
    fn missing_windows_parse_to_none() {
        let snap = parse_usage_snapshot(&json!({}), 0);
        assert_eq!(snap.primary.used_percent, None);
        assert_eq!(snap.secondary.reset_at, None);
    }
}
