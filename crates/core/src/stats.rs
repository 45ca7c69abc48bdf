use serde::{Deserialize, Serialize};

use crate::trace::TraceEntry;

/// Inclusive `[since, until]` epoch-ms filter; either bound may be absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceRange {
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
}

impl TraceRange {
    pub fn contains(&self, at: i64) -> bool {
        self.since_ms.map(|since| at >= since).unwrap_or(true)
            && self.until_ms.map(|until| at <= until).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelBreakdown {
    pub model: String,
    pub requests: u64,
    pub errors: u64,
    pub tokens_total: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HourlyBucket {
    pub bucket_start_ms: i64,
    pub requests: u64,
    pub errors: u64,
    pub tokens_total: i64,
    pub cost_usd: f64,
    pub p50_latency_ms: i64,
    pub p95_latency_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceStats {
    pub requests: u64,
    pub errors: u64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub tokens_total: i64,
    pub cost_usd: f64,
    pub by_model: Vec<ModelBreakdown>,
    pub hourly: Vec<HourlyBucket>,
}

const HOUR_MS: i64 = 3_600_000;

fn bucket_start(at: i64) -> i64 {
    at.div_euclid(HOUR_MS) * HOUR_MS
}

/// Integer-index percentile over a pre-sorted slice; `p` is 0..=100.
/// `p == 100` returns the maximum.
fn percentile(sorted: &[i64], p: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Aggregates totals, per-model breakdown (desc by request count), and an
/// hourly time-series with p50/p95 latency, over traces within `range`.
pub fn build_stats(traces: &[TraceEntry], range: TraceRange) -> TraceStats {
    let mut stats = TraceStats::default();
    let mut by_model: std::collections::BTreeMap<String, ModelBreakdown> = std::collections::BTreeMap::new();
    let mut by_hour: std::collections::BTreeMap<i64, (Vec<i64>, HourlyBucket)> = std::collections::BTreeMap::new();

    for trace in traces.iter().filter(|t| range.contains(t.at)) {
        stats.requests += 1;
        if trace.is_error {
            stats.errors += 1;
        }
        stats.tokens_input += trace.tokens_input.unwrap_or(0);
        stats.tokens_output += trace.tokens_output.unwrap_or(0);
        stats.tokens_total += trace.tokens_total.unwrap_or(0);
        stats.cost_usd += trace.cost_usd.unwrap_or(0.0);

        let model = trace.model.clone().unwrap_or_else(|| "unknown".to_string());
        let entry = by_model.entry(model.clone()).or_insert_with(|| ModelBreakdown { model, ..Default::default() });
        entry.requests += 1;
        if trace.is_error {
            entry.errors += 1;
        }
        entry.tokens_total += trace.tokens_total.unwrap_or(0);
        entry.cost_usd += trace.cost_usd.unwrap_or(0.0);

        let bucket = bucket_start(trace.at);
        let (latencies, hourly) = by_hour.entry(bucket).or_insert_with(|| {
            (Vec::new(), HourlyBucket { bucket_start_ms: bucket, ..Default::default() })
        });
        latencies.push(trace.latency_ms);
        hourly.requests += 1;
        if trace.is_error {
            hourly.errors += 1;
        }
        hourly.tokens_total += trace.tokens_total.unwrap_or(0);
        hourly.cost_usd += trace.cost_usd.unwrap_or(0.0);
    }

    let mut models: Vec<ModelBreakdown> = by_model.into_values().collect();
    models.sort_by(|a, b| b.requests.cmp(&a.requests).then_with(|| a.model.cmp(&b.model)));
    stats.by_model = models;

    let mut hourly: Vec<HourlyBucket> = Vec::new();
    for (_, (mut latencies, mut bucket)) in by_hour {
        latencies.sort_unstable();
        bucket.p50_latency_ms = percentile(&latencies, 50.0);
        bucket.p95_latency_ms = percentile(&latencies, 95.0);
        hourly.push(bucket);
    }
    stats.hourly = hourly;

    stats
}

/// Incremental per-key usage rollup (e.g. per account or per route),
/// mirroring the fields `buildStats` tracks but meant to be folded one
/// trace at a time as traces are appended.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageAggregate {
    pub requests: u64,
    pub ok: u64,
    pub errors: u64,
    #[serde(default)]
    pub status_counts: std::collections::BTreeMap<u16, u64>,
    pub latency_ms_sum: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub tokens_total: i64,
    pub usage_bearing_requests: u64,
    pub first_at: Option<i64>,
    pub last_at: Option<i64>,
}

impl UsageAggregate {
    pub fn add(&mut self, trace: &TraceEntry) {
        self.requests += 1;
        if trace.is_error {
            self.errors += 1;
        } else {
            self.ok += 1;
        }
        *self.status_counts.entry(trace.status).or_insert(0) += 1;
        self.latency_ms_sum += trace.latency_ms;
        if trace.usage.is_some() {
            self.usage_bearing_requests += 1;
            self.tokens_input += trace.tokens_input.unwrap_or(0);
            self.tokens_output += trace.tokens_output.unwrap_or(0);
            self.tokens_total += trace.tokens_total.unwrap_or(0);
        }
        self.first_at = Some(self.first_at.map_or(trace.at, |f| f.min(trace.at)));
        self.last_at = Some(self.last_at.map_or(trace.at, |l| l.max(trace.at)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(at: i64, model: &str, status: u16, latency_ms: i64, tokens_total: i64) -> TraceEntry {
        TraceEntry {
            id: format!("trc_{at}"),
            at,
            route: "/v1/chat/completions".to_string(),
            account_id: None,
            email: None,
            model: Some(model.to_string()),
            status,
            is_error: status >= 400,
            stream: false,
            latency_ms,
            tokens_input: Some(tokens_total / 2),
            tokens_output: Some(tokens_total - tokens_total / 2),
            tokens_total: Some(tokens_total),
            cost_usd: Some(tokens_total as f64 * 0.00001),
            usage: Some(serde_json::json!({"total_tokens": tokens_total})),
            request_body: None,
            error: None,
            upstream_error: None,
            upstream_content_type: None,
            upstream_empty_body: false,
            assistant_empty_output: false,
            assistant_finish_reason: Some("stop".to_string()),
        }
    }

    #[test]
    fn percentile_100_returns_the_maximum() {
        let sorted = vec![1, 5, 9, 20];
        assert_eq!(percentile(&sorted, 100.0), 20);
    }

    #[test]
    fn percentile_on_empty_slice_is_zero() {
        assert_eq!(percentile(&[], 50.0), 0);
    }

    #[test]
    fn build_stats_groups_by_model_desc_and_buckets_by_hour() {
        let traces = vec![
            trace(0, "gpt-5-codex", 200, 100, 10),
            trace(1_000, "gpt-5-codex", 200, 200, 10),
            trace(HOUR_MS, "gpt-4o", 500, 50, 5),
        ];
        let stats = build_stats(&traces, TraceRange::default());
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.by_model[0].model, "gpt-5-codex");
        assert_eq!(stats.by_model[0].requests, 2);
        assert_eq!(stats.hourly.len(), 2);
        assert_eq!(stats.hourly[0].requests, 2);
        assert_eq!(stats.hourly[0].p95_latency_ms, 200);
    }

    #[test]
    fn range_filter_is_inclusive_on_both_ends() {
        let traces = vec![trace(100, "gpt-5-codex", 200, 1, 1), trace(200, "gpt-5-codex", 200, 1, 1)];
        let range = TraceRange { since_ms: Some(100), until_ms: Some(100) };
        let stats = build_stats(&traces, range);
        assert_eq!(stats.requests, 1);
    }

    #[test]
    fn usage_aggregate_tracks_first_and_last_and_status_counts() {
        let mut agg = UsageAggregate::default();
        agg.add(&trace(100, "gpt-5-codex", 200, 10, 10));
        agg.add(&trace(50, "gpt-5-codex", 429, 10, 10));
        assert_eq!(agg.requests, 2);
        assert_eq!(agg.ok, 1);
        assert_eq!(agg.errors, 1);
        assert_eq!(agg.first_at, Some(50));
        assert_eq!(agg.last_at, Some(100));
        assert_eq!(*agg.status_counts.get(&429).unwrap(), 1);
        assert_eq!(agg.usage_bearing_requests, 2);
    }
}
