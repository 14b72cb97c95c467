//! Timestamp stores backing the sliding-window limiter.
//!
//! A store holds, per resource key, the ordered multiset of
//! `(timestamp, weight)` entries inside the current window. Two
//! interchangeable implementations exist: [`MemoryStore`] for
//! process-local state and [`RedisStore`] for state shared across
//! processes.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Result of the atomic prune+count+conditional-append primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// Whether the entry was appended.
    pub admitted: bool,
    /// Load after the append when admitted, the current load otherwise.
    pub load: f64,
    /// Oldest live timestamp after the operation, if any.
    pub oldest: Option<f64>,
    /// Member handle of the appended entry, for exact-member removal.
    pub member: Option<String>,
}

/// Backing store for window series.
///
/// Every operation is observably atomic per key; operations on distinct
/// keys are free to run concurrently. Implementations surface their own
/// errors unchanged; policy (retry, fail the call) lives above the store.
#[async_trait]
pub trait TimestampStore: Send + Sync {
    /// Short backend identifier for logs and outcome records.
    fn backend_name(&self) -> &'static str;

    /// Atomically prune entries older than `cutoff`, sum the live load,
    /// and append `(now, weight)` iff `load + weight <= limit`.
    ///
    /// `weighted` marks series whose entries carry non-unit weights;
    /// pure request series may count cardinality instead of summing.
    async fn check_and_admit(
        &self,
        key: &str,
        cutoff: f64,
        now: f64,
        weight: f64,
        limit: f64,
        weighted: bool,
    ) -> Result<Admission>;

    /// Append one `(t, weight)` entry unconditionally. Returns the member
    /// handle of the new entry.
    async fn add(&self, key: &str, t: f64, weight: f64) -> Result<String>;

    /// Remove all entries with timestamp strictly below `cutoff`.
    async fn prune(&self, key: &str, cutoff: f64) -> Result<()>;

    /// Sum of weights of entries at or after `cutoff`.
    async fn load(&self, key: &str, cutoff: f64, weighted: bool) -> Result<f64>;

    /// Smallest live timestamp at or after `cutoff`, if any.
    async fn oldest(&self, key: &str, cutoff: f64) -> Result<Option<f64>>;

    /// Remove one entry by its exact member handle. Returns whether an
    /// entry was removed.
    async fn remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Drop the whole series for `key`.
    async fn clear(&self, key: &str) -> Result<()>;

    /// All keys currently holding a series.
    async fn all_keys(&self) -> Result<Vec<String>>;

    /// Approximate memory held by series state, in bytes.
    async fn report_memory(&self) -> Result<u64>;

    /// Health probe against the backing service.
    async fn ping(&self) -> Result<()>;
}

/// Wall-clock seconds since the Unix epoch.
///
/// Wall-clock time (rather than a monotonic instant) keeps processes
/// sharing a Redis store on the same frame of reference.
pub fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Encode an entry member as `<nanos>:<weight>:<nonce>`.
///
/// The timestamp rides in the score (Redis) or entry struct (memory);
/// the member payload carries the weight so weighted series can be
/// summed, and a nonce so two same-instant same-weight admissions do
/// not collapse into one member.
pub(crate) fn encode_member(t: f64, weight: f64) -> String {
    let nanos = (t * 1e9) as u128;
    let nonce = uuid::Uuid::new_v4().simple();
    format!("{}:{}:{}", nanos, weight, nonce)
}

/// Parse the weight component out of a member payload. Unparsable
/// members count as weight 1 rather than poisoning the series.
pub(crate) fn member_weight(member: &str) -> f64 {
    member
        .split(':')
        .nth(1)
        .and_then(|w| w.parse().ok())
        .unwrap_or(1.0)
}
