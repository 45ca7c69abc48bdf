//! Retention-capped window log + append-only stats history, and the
//! aggregation built on top of them.

mod writer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde_json::Value;

use gatebridge_core::{build_stats, extract_token_counts, now_ms, pricing, TraceEntry, TraceRange, TraceStats};

use writer::AsyncJsonlWriter;

static TRACE_SEQ: AtomicU64 = AtomicU64::new(1);

/// `trc_{millis}_{seq:x}`: unique under concurrent use without needing a
/// lock.
fn next_trace_id() -> String {
    let millis = now_ms();
    let seq = TRACE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("trc_{millis}_{seq:x}")
}

/// The not-yet-computed fields of a trace entry; `append_trace` fills in
/// `id`, `at`, `is_error`, the token counts, and `cost_usd`.
#[derive(Debug, Clone, Default)]
pub struct NewTrace {
    pub route: String,
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub model: Option<String>,
    pub status: u16,
    pub stream: bool,
    pub latency_ms: i64,
    pub usage: Option<Value>,
    pub request_body: Option<Value>,
    pub error: Option<String>,
    pub upstream_error: Option<String>,
    pub upstream_content_type: Option<String>,
    pub upstream_empty_body: bool,
    pub assistant_empty_output: bool,
    pub assistant_finish_reason: Option<String>,
}

static WINDOW_WRITER: OnceLock<AsyncJsonlWriter> = OnceLock::new();
static HISTORY_WRITER: OnceLock<AsyncJsonlWriter> = OnceLock::new();

fn window_path() -> PathBuf {
    PathBuf::from(crate::config::current().trace_file_path)
}

fn history_path() -> PathBuf {
    PathBuf::from(crate::config::current().trace_stats_history_path)
}

/// If the history file does not exist yet but the window log does, seed
/// history with a slim record per window entry so a fresh history file
/// never silently loses whatever traces the window log already carried.
fn seed_history_if_missing(history_path: &Path, window_path: &Path) {
    if history_path.exists() || !window_path.exists() {
        return;
    }
    let lines = writer::read_tolerant(window_path);
    let seeded: Vec<String> = lines
        .iter()
        .filter_map(|line| serde_json::from_str::<TraceEntry>(line).ok())
        .map(|entry| entry.to_history_record())
        .filter_map(|slim| serde_json::to_string(&slim).ok())
        .collect();
    if seeded.is_empty() {
        return;
    }
    if let Some(parent) = history_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut body = seeded.join("\n");
    body.push('\n');
    if let Err(err) = std::fs::write(history_path, body) {
        log::warn!("trace history seed failed: path={}, err={}", history_path.display(), err);
    }
}

fn window_writer() -> &'static AsyncJsonlWriter {
    WINDOW_WRITER.get_or_init(|| {
        let retention = crate::config::current().retention_max;
        AsyncJsonlWriter::spawn("trace-window-writer", window_path(), Some(retention))
    })
}

fn history_writer() -> &'static AsyncJsonlWriter {
    HISTORY_WRITER.get_or_init(|| {
        seed_history_if_missing(&history_path(), &window_path());
        AsyncJsonlWriter::spawn("trace-history-writer", history_path(), None)
    })
}

/// Computes the derived fields, writes to both the window and history
/// queues, and returns the full entry this call produced.
pub fn append_trace(input: NewTrace) -> TraceEntry {
    let at = now_ms();
    let is_error = input.status >= 400;
    let (tokens_input, tokens_output, tokens_total) =
        input.usage.as_ref().map(extract_token_counts).unwrap_or((None, None, None));
    let cost_usd = pricing::cost_usd(input.model.as_deref(), tokens_input, tokens_output);

    let entry = TraceEntry {
        id: next_trace_id(),
        at,
        route: input.route,
        account_id: input.account_id,
        email: input.email,
        model: input.model,
        status: input.status,
        is_error,
        stream: input.stream,
        latency_ms: input.latency_ms,
        tokens_input,
        tokens_output,
        tokens_total,
        cost_usd,
        usage: input.usage,
        request_body: input.request_body,
        error: input.error,
        upstream_error: input.upstream_error,
        upstream_content_type: input.upstream_content_type,
        upstream_empty_body: input.upstream_empty_body,
        assistant_empty_output: input.assistant_empty_output,
        assistant_finish_reason: input.assistant_finish_reason,
    };

    if let Ok(line) = serde_json::to_string(&entry) {
        window_writer().append_and_wait(line);
    }
    if let Ok(line) = serde_json::to_string(&entry.to_history_record()) {
        history_writer().append_and_wait(line);
    }
    entry
}

/// The current window log contents, tolerant of malformed lines.
pub fn read_trace_window() -> Vec<TraceEntry> {
    writer::read_tolerant(&window_path())
        .iter()
        .filter_map(|line| serde_json::from_str::<TraceEntry>(line).ok())
        .collect()
}

/// Aggregates over the current window, within an inclusive `[since, until]`.
pub fn window_stats(range: TraceRange) -> TraceStats {
    build_stats(&read_trace_window(), range)
}

/// Re-points already-spawned writers at the (possibly changed) configured
/// paths. A no-op for a writer that has not been lazily spawned yet, since
/// `window_path()`/`history_path()` are read fresh on first spawn anyway.
pub fn reload_from_env() {
    if let Some(writer) = WINDOW_WRITER.get() {
        writer.reset_path(window_path());
    }
    if let Some(writer) = HISTORY_WRITER.get() {
        writer.reset_path(history_path());
    }
}
