use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One forwarded request, immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub id: String,
    pub at: i64,
    pub route: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub status: u16,
    pub is_error: bool,
    pub stream: bool,
    pub latency_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_input: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_output: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_content_type: Option<String>,
    #[serde(default)]
    pub upstream_empty_body: bool,
    #[serde(default)]
    pub assistant_empty_output: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant_finish_reason: Option<String>,
}

/// Derives `(input, output, total)` token counts from a raw usage object,
/// accepting either the Responses shape (`input_tokens`/`output_tokens`)
/// or the Chat Completions shape (`prompt_tokens`/`completion_tokens`).
pub fn extract_token_counts(usage: &Value) -> (Option<i64>, Option<i64>, Option<i64>) {
    let input = usage
        .get("input_tokens")
        .or_else(|| usage.get("prompt_tokens"))
        .and_then(Value::as_i64);
    let output = usage
        .get("output_tokens")
        .or_else(|| usage.get("completion_tokens"))
        .and_then(Value::as_i64);
    let total = usage.get("total_tokens").and_then(Value::as_i64);
    (input, output, total)
}

impl TraceEntry {
    /// The slim shape written to the unbounded stats-history log: drops
    /// `request_body`, `usage`, and the long diagnostic strings.
    pub fn to_history_record(&self) -> TraceEntry {
        let mut slim = self.clone();
        slim.request_body = None;
        slim.usage = None;
        slim.error = None;
        slim.upstream_error = None;
        slim
    }
}
