//! Process-wide HTTP client for the quota probe and OAuth token refresh,
//! rebuilt on transport failure.

use std::sync::{mpsc, OnceLock, RwLock};
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use serde::Deserialize;

use crate::lock_utils::{read_recover, write_recover};

static USAGE_HTTP_CLIENT: OnceLock<RwLock<Client>> = OnceLock::new();

fn build_usage_http_client() -> Client {
    let cfg = crate::config::current();
    Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .timeout(cfg.usage_timeout())
        .pool_max_idle_per_host(8)
        .pool_idle_timeout(Some(Duration::from_secs(60)))
        .build()
        .unwrap_or_else(|err| {
            log::error!("usage http client build failed, falling back to defaults: {err}");
            Client::new()
        })
}

fn cell() -> &'static RwLock<Client> {
    USAGE_HTTP_CLIENT.get_or_init(|| RwLock::new(build_usage_http_client()))
}

pub(super) fn usage_http_client() -> Client {
    read_recover(cell(), "usage_http_client").clone()
}

pub(super) fn rebuild_usage_http_client() -> Client {
    let next = build_usage_http_client();
    let mut guard = write_recover(cell(), "usage_http_client");
    *guard = next.clone();
    next
}

/// Bounded-wait JSON decode so a slow-to-deserialize body cannot block the
/// calling thread past the configured timeout budget.
struct JsonReadTask {
    run: Box<dyn FnOnce() + Send>,
}

struct JsonReadExecutor {
    sender: mpsc::Sender<JsonReadTask>,
}

fn json_read_worker_count() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4).clamp(4, 32)
}

impl JsonReadExecutor {
    fn new(worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel::<JsonReadTask>();
        let rx = std::sync::Arc::new(std::sync::Mutex::new(rx));
        for idx in 0..worker_count {
            let rx = rx.clone();
            let _ = thread::Builder::new().name(format!("usage-json-read-{idx}")).spawn(move || loop {
                let task = {
                    let guard = rx.lock().unwrap_or_else(|p| p.into_inner());
                    guard.recv()
                };
                match task {
                    Ok(task) => (task.run)(),
                    Err(_) => break,
                }
            });
        }
        Self { sender: tx }
    }
}

static JSON_READ_EXECUTOR: OnceLock<JsonReadExecutor> = OnceLock::new();

fn executor() -> &'static JsonReadExecutor {
    JSON_READ_EXECUTOR.get_or_init(|| JsonReadExecutor::new(json_read_worker_count()))
}

/// Submits the response's JSON decode to a worker pool and waits up to
/// `read_timeout` for the result, rather than blocking the caller's own
/// thread on a potentially slow `Response::json` call.
pub(super) fn read_json_with_timeout<T>(resp: Response, read_timeout: Duration) -> Result<T, String>
where
    T: for<'de> Deserialize<'de> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<Result<T, String>>(1);
    let task = JsonReadTask {
        run: Box::new(move || {
            let result = resp.json::<T>().map_err(|err| format!("json decode failed: {err}"));
            let _ = tx.send(result);
        }),
    };
    if executor().sender.send(task).is_err() {
        return Err("json read executor unavailable".to_string());
    }
    rx.recv_timeout(read_timeout).map_err(|_| "json decode timed out".to_string())?
}
