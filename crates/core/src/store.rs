use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::account::{Account, OAuthFlowState};

const OAUTH_STATE_MAX: usize = 200;

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsFile {
    accounts: Vec<Account>,
}

/// Durable id -> Account mapping backed by a flat JSON file with atomic
/// tmp+rename writes and a short debounce. Readers observe the in-memory
/// snapshot; writers go through `upsert`/`patch`/`delete`, which mutate the
/// snapshot under a lock and schedule (or force) a flush.
pub struct AccountStore {
    path: PathBuf,
    flush_interval: std::time::Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    accounts: Vec<Account>,
    dirty: bool,
    last_flush_at: Option<Instant>,
}

impl AccountStore {
    /// Loads `path` if it exists, otherwise starts empty. Does not create
    /// the file until the first flush.
    pub fn open(path: impl Into<PathBuf>, flush_interval: std::time::Duration) -> io::Result<Self> {
        let path = path.into();
        let accounts = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<AccountsFile>(&bytes)
                .map(|f| f.accounts)
                .unwrap_or_else(|err| {
                    log::warn!("accounts store at {} is malformed, starting empty: {}", path.display(), err);
                    Vec::new()
                }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            flush_interval,
            inner: Mutex::new(Inner { accounts, dirty: false, last_flush_at: None }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("account store lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// In-memory snapshot of all accounts.
    pub fn list(&self) -> Vec<Account> {
        self.lock().accounts.clone()
    }

    pub fn get(&self, id: &str) -> Option<Account> {
        self.lock().accounts.iter().find(|a| a.id == id).cloned()
    }

    /// Inserts, or replaces in place (by id), then schedules a flush.
    pub fn upsert(&self, account: Account) -> io::Result<()> {
        {
            let mut inner = self.lock();
            match inner.accounts.iter_mut().find(|a| a.id == account.id) {
                Some(existing) => *existing = account,
                None => inner.accounts.push(account),
            }
            inner.dirty = true;
        }
        self.maybe_flush(false)
    }

    /// Mutates the account identified by `id` in place via `patch`, if present.
    pub fn patch(&self, id: &str, patch: impl FnOnce(&mut Account)) -> io::Result<()> {
        {
            let mut inner = self.lock();
            if let Some(account) = inner.accounts.iter_mut().find(|a| a.id == id) {
                patch(account);
                inner.dirty = true;
            }
        }
        self.maybe_flush(false)
    }

    pub fn delete(&self, id: &str) -> io::Result<()> {
        {
            let mut inner = self.lock();
            let before = inner.accounts.len();
            inner.accounts.retain(|a| a.id != id);
            inner.dirty = inner.dirty || inner.accounts.len() != before;
        }
        self.maybe_flush(false)
    }

    /// Forces an immediate flush regardless of the debounce window.
    pub fn flush_now(&self) -> io::Result<()> {
        self.maybe_flush(true)
    }

    fn maybe_flush(&self, force: bool) -> io::Result<()> {
        let snapshot = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(());
            }
            let due = force
                || inner
                    .last_flush_at
                    .map(|at| at.elapsed() >= self.flush_interval)
                    .unwrap_or(true);
            if !due {
                return Ok(());
            }
            inner.dirty = false;
            inner.last_flush_at = Some(Instant::now());
            inner.accounts.clone()
        };
        write_atomic(&self.path, &AccountsFile { accounts: snapshot })
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json")
    ));
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OAuthStateFile {
    states: Vec<OAuthFlowState>,
}

/// Bounded append/read store for onboarding flow state; this crate never
/// populates it itself (the OAuth flow is external), it only owns the file
/// shape and the 200-entry retention.
pub struct OAuthStateStore {
    path: PathBuf,
    inner: Mutex<Vec<OAuthFlowState>>,
}

impl OAuthStateStore {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let states = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<OAuthStateFile>(&bytes)
                .map(|f| f.states)
                .unwrap_or_default(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err),
        };
        Ok(Self { path, inner: Mutex::new(states) })
    }

    pub fn list(&self) -> Vec<OAuthFlowState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn append(&self, state: OAuthFlowState) -> io::Result<()> {
        let snapshot = {
            let mut states = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            states.push(state);
            if states.len() > OAUTH_STATE_MAX {
                let drop_count = states.len() - OAUTH_STATE_MAX;
                states.drain(0..drop_count);
            }
            states.clone()
        };
        write_atomic(&self.path, &OAuthStateFile { states: snapshot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            email: None,
            access_token: "tok".to_string(),
            refresh_token: None,
            expires_at: None,
            chatgpt_account_id: None,
            issuer: None,
            enabled: true,
            priority: None,
            usage: None,
            state: None,
        }
    }

    #[test]
    fn upsert_then_flush_now_persists_and_reopen_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        let store = AccountStore::open(&path, Duration::from_secs(60)).unwrap();
        store.upsert(account("acc-1")).unwrap();
        store.flush_now().unwrap();
        assert!(path.exists());

        let reopened = AccountStore::open(&path, Duration::from_secs(60)).unwrap();
        assert_eq!(reopened.list().len(), 1);
        assert_eq!(reopened.get("acc-1").unwrap().id, "acc-1");
    }

    #[test]
    fn debounce_window_defers_flush_until_forced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        let store = AccountStore::open(&path, Duration::from_secs(60)).unwrap();
        store.upsert(account("acc-1")).unwrap();
        assert!(!path.exists(), "first upsert should debounce, not flush immediately");

        store.flush_now().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn delete_removes_account() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = AccountStore::open(&path, Duration::from_millis(0)).unwrap();
        store.upsert(account("acc-1")).unwrap();
        store.upsert(account("acc-2")).unwrap();
        store.delete("acc-1").unwrap();
        let ids: Vec<_> = store.list().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["acc-2".to_string()]);
    }

    #[test]
    fn oauth_state_store_bounds_to_200_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth-state.json");
        let store = OAuthStateStore::open(&path).unwrap();
        for i in 0..250 {
            store
                .append(OAuthFlowState {
                    id: format!("flow-{i}"),
                    email: None,
                    pkce_verifier: "v".to_string(),
                    created_at: i as i64,
                    status: crate::account::OAuthFlowStatus::Pending,
                    error: None,
                    completed_at: None,
                    account_id: None,
                })
                .unwrap();
        }
        let states = store.list();
        assert_eq!(states.len(), 200);
        assert_eq!(states[0].id, "flow-50");
        assert_eq!(states.last().unwrap().id, "flow-249");
    }
}
