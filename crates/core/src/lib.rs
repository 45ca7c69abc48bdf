pub mod account;
pub mod pricing;
pub mod router;
pub mod stats;
pub mod store;
pub mod time;
pub mod trace;
pub mod usage;

pub use account::{Account, AccountState, OAuthFlowState, RecentError};
pub use router::Router;
pub use stats::{build_stats, HourlyBucket, ModelBreakdown, TraceRange, TraceStats, UsageAggregate};
pub use store::{AccountStore, OAuthStateStore};
pub use time::now_ms;
pub use trace::{extract_token_counts, TraceEntry};
pub use usage::{UsageSnapshot, UsageWindow};

pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
