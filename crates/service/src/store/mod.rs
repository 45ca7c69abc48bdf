//! Process-wide account/OAuth-state stores, opened once from config paths.

use std::sync::OnceLock;

use gatebridge_core::{AccountStore, OAuthStateStore};

static ACCOUNT_STORE: OnceLock<AccountStore> = OnceLock::new();
static OAUTH_STATE_STORE: OnceLock<OAuthStateStore> = OnceLock::new();

fn open_account_store() -> AccountStore {
    let cfg = crate::config::current();
    match AccountStore::open(cfg.store_path.clone(), cfg.account_flush_interval()) {
        Ok(store) => store,
        Err(err) => {
            log::error!("account store open failed: path={}, err={}", cfg.store_path, err);
            panic!("cannot continue without an account store: {err}");
        }
    }
}

fn open_oauth_state_store() -> OAuthStateStore {
    let cfg = crate::config::current();
    match OAuthStateStore::open(cfg.oauth_state_path.clone()) {
        Ok(store) => store,
        Err(err) => {
            log::error!("oauth state store open failed: path={}, err={}", cfg.oauth_state_path, err);
            panic!("cannot continue without an oauth state store: {err}");
        }
    }
}

/// The singleton account store, opened lazily from `STORE_PATH`.
pub fn accounts() -> &'static AccountStore {
    ACCOUNT_STORE.get_or_init(open_account_store)
}

/// The singleton OAuth-flow-state store, opened lazily from `OAUTH_STATE_PATH`.
pub fn oauth_states() -> &'static OAuthStateStore {
    OAUTH_STATE_STORE.get_or_init(open_oauth_state_store)
}
