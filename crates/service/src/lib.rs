//! A non-custodial OpenAI-compatible gateway: fans Chat Completions and
//! Responses requests out across a pool of ChatGPT accounts, rotating to
//! the next account on quota exhaustion. See `crates/service/src/main.rs`
//! for the process entry point.

mod lock_utils;

pub mod bridge;
pub mod config;
pub mod engine;
pub mod http;
pub mod store;
pub mod trace;
pub mod usage;

/// Binds the configured port and serves until [`http::request_shutdown`] is
/// observed. Opens the account/oauth-state stores first so a bad
/// `STORE_PATH`/`OAUTH_STATE_PATH` fails fast, before any socket is bound.
pub fn run() -> std::io::Result<()> {
    let cfg = config::current();
    let _ = store::accounts();
    let _ = store::oauth_states();
    let addr = format!("0.0.0.0:{}", cfg.port);
    http::serve(&addr)
}
