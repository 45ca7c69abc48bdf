//! `tiny_http::Server` accept loop plus two bounded worker pools (normal vs.
//! streaming), sized from env vars with CPU-scaled defaults. No
//! admin/dashboard surface, no loopback-HTTP shutdown wakeup: lifecycle is a
//! single shutdown flag set from `main.rs`'s `ctrlc` handler.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use tiny_http::{Request, Response, Server};

use super::routes;

const HTTP_WORKER_FACTOR: usize = 4;
const HTTP_WORKER_MIN: usize = 8;
const HTTP_STREAM_WORKER_FACTOR: usize = 1;
const HTTP_STREAM_WORKER_MIN: usize = 2;
const HTTP_QUEUE_FACTOR: usize = 4;
const HTTP_QUEUE_MIN: usize = 32;
const HTTP_STREAM_QUEUE_FACTOR: usize = 2;
const HTTP_STREAM_QUEUE_MIN: usize = 16;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Set by the process's `ctrlc` handler; the accept loop checks this after
/// every incoming connection and stops taking new work once it is set.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn env_usize_or(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn worker_count() -> usize {
    let cpus = thread::available_parallelism().map(|v| v.get()).unwrap_or(4);
    let factor = env_usize_or("GATEWAY_HTTP_WORKER_FACTOR", HTTP_WORKER_FACTOR).max(1);
    let min = env_usize_or("GATEWAY_HTTP_WORKER_MIN", HTTP_WORKER_MIN).max(1);
    cpus.saturating_mul(factor).max(min)
}

fn stream_worker_count() -> usize {
    let cpus = thread::available_parallelism().map(|v| v.get()).unwrap_or(4);
    let factor = env_usize_or("GATEWAY_HTTP_STREAM_WORKER_FACTOR", HTTP_STREAM_WORKER_FACTOR).max(1);
    let min = env_usize_or("GATEWAY_HTTP_STREAM_WORKER_MIN", HTTP_STREAM_WORKER_MIN).max(1);
    cpus.saturating_mul(factor).max(min)
}

fn queue_size(workers: usize) -> usize {
    let factor = env_usize_or("GATEWAY_HTTP_QUEUE_FACTOR", HTTP_QUEUE_FACTOR).max(1);
    let min = env_usize_or("GATEWAY_HTTP_QUEUE_MIN", HTTP_QUEUE_MIN).max(1);
    workers.saturating_mul(factor).max(min)
}

fn stream_queue_size(workers: usize) -> usize {
    let factor = env_usize_or("GATEWAY_HTTP_STREAM_QUEUE_FACTOR", HTTP_STREAM_QUEUE_FACTOR).max(1);
    let min = env_usize_or("GATEWAY_HTTP_STREAM_QUEUE_MIN", HTTP_STREAM_QUEUE_MIN).max(1);
    workers.saturating_mul(factor).max(min)
}

fn spawn_workers(count: usize, rx: Receiver<Request>) {
    for _ in 0..count {
        let rx = rx.clone();
        thread::spawn(move || {
            while let Ok(request) = rx.recv() {
                routes::handle(request);
            }
        });
    }
}

fn request_is_stream_like(request: &Request) -> bool {
    request
        .headers()
        .iter()
        .find(|header| header.field.equiv("Accept"))
        .map(|header| header.value.as_str().to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

fn enqueue_request(request: Request, normal_tx: &Sender<Request>, stream_tx: &Sender<Request>) -> Result<(), ()> {
    if request_is_stream_like(&request) {
        stream_tx.send(request).or_else(|err| normal_tx.send(err.into_inner())).map_err(|_| ())
    } else {
        normal_tx.send(request).or_else(|err| stream_tx.send(err.into_inner())).map_err(|_| ())
    }
}

fn run(server: Server) {
    let workers = worker_count();
    let stream_workers = stream_worker_count();
    let (normal_tx, normal_rx) = bounded::<Request>(queue_size(workers));
    let (stream_tx, stream_rx) = bounded::<Request>(stream_queue_size(stream_workers));
    spawn_workers(workers, normal_rx);
    spawn_workers(stream_workers, stream_rx);

    for request in server.incoming_requests() {
        if SHUTDOWN.load(Ordering::SeqCst) {
            let _ = request.respond(Response::from_string("shutting down").with_status_code(503));
            break;
        }
        if enqueue_request(request, &normal_tx, &stream_tx).is_err() {
            log::warn!("http request queues closed, stopping accept loop");
            break;
        }
    }
}

/// Binds `addr` and blocks the calling thread serving requests until
/// [`request_shutdown`] is observed.
pub fn serve(addr: &str) -> io::Result<()> {
    let server = Server::http(addr).map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    log::info!("gatebridge listening on {addr}");
    run(server);
    Ok(())
}
