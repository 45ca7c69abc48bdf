use std::sync::Mutex;

use crate::account::Account;

/// Score an account by quota pressure: weighted mean of the two window
/// percents, nudged by how far apart they are. Lower is more eligible.
fn score(account: &Account) -> f64 {
    let (p, w) = window_percents(account);
    0.75 * ((p + w) / 2.0) + 0.25 * (p - w).abs()
}

fn window_percents(account: &Account) -> (f64, f64) {
    match &account.usage {
        None => (0.0, 0.0),
        Some(usage) => (
            usage.primary.used_percent.unwrap_or(0.0),
            usage.secondary.used_percent.unwrap_or(0.0),
        ),
    }
}

fn secondary_reset_at(account: &Account) -> Option<i64> {
    account.usage.as_ref().and_then(|u| u.secondary.reset_at)
}

/// Total order over candidates for a single selection round: ascending
/// score, then ascending secondary reset (nulls last), then ascending
/// priority (nulls last), then lexicographic id.
fn cmp_candidates(a: &Account, b: &Account) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    score(a)
        .partial_cmp(&score(b))
        .unwrap_or(Ordering::Equal)
        .then_with(|| match (secondary_reset_at(a), secondary_reset_at(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| match (a.priority, b.priority) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Owns the process-local sticky bucket. Selection is otherwise pure over
/// its `candidates` argument; the sticky pick is best-effort and need not
/// be globally serialized across threads (last-writer-wins is fine).
pub struct Router {
    window_ms: i64,
    sticky: Mutex<Option<(i64, String)>>,
}

impl Router {
    pub fn new(window_ms: i64) -> Self {
        Self { window_ms, sticky: Mutex::new(None) }
    }

    /// Picks one eligible account from `candidates`, or `None` if the
    /// eligible pool is empty. `candidates` should already be filtered to
    /// the accounts not yet tried in this client request.
    pub fn choose(&self, candidates: &[Account], now: i64) -> Option<Account> {
        let bucket = now.div_euclid(self.window_ms);
        let eligible: Vec<&Account> = candidates.iter().filter(|a| a.is_eligible(now)).collect();
        if eligible.is_empty() {
            return None;
        }

        if let Some((sticky_bucket, sticky_id)) = self.sticky_snapshot() {
            if sticky_bucket == bucket {
                if let Some(account) = eligible.iter().find(|a| a.id == sticky_id) {
                    return Some((*account).clone());
                }
            }
        }

        let untouched: Vec<&Account> = eligible.iter().copied().filter(|a| a.is_untouched()).collect();
        let pool = if untouched.is_empty() { eligible } else { untouched };

        let winner = pool.into_iter().min_by(|a, b| cmp_candidates(a, b))?;
        self.remember(bucket, winner.id.clone());
        Some(winner.clone())
    }

    fn sticky_snapshot(&self) -> Option<(i64, String)> {
        self.sticky.lock().ok().and_then(|guard| guard.clone())
    }

    fn remember(&self, bucket: i64, account_id: String) {
        if let Ok(mut guard) = self.sticky.lock() {
            *guard = Some((bucket, account_id));
        }
    }
}
