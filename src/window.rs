//! Sliding-window admission for a single `(key, limit)` pair.
//!
//! The limiter is stateless apart from the store it reads and mutates:
//! every decision prunes the series to the window, compares the live
//! load against the limit, and either appends the new entry or computes
//! the minimum wait until one slot frees.

use std::sync::Arc;
use tracing::trace;

use crate::error::Result;
use crate::limits::LimitSpec;
use crate::store::TimestampStore;

/// One admission decision for a single limit.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowDecision {
    /// Whether the entry was admitted (for [`SlidingWindowLimiter::peek`],
    /// whether it would have been).
    pub admitted: bool,
    /// Minimum seconds until retrying can observe more headroom. Zero when
    /// admitted; zero on rejection means another admitter freed a slot
    /// mid-check and the caller should retry immediately.
    pub wait: f64,
    /// Load after admission when admitted, the observed load otherwise.
    pub load: f64,
    /// Member handle of the admitted entry, used for rollback.
    pub(crate) member: Option<String>,
}

/// Sliding-window counting engine over a [`TimestampStore`].
pub struct SlidingWindowLimiter {
    store: Arc<dyn TimestampStore>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn TimestampStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TimestampStore> {
        &self.store
    }

    /// Admit `(now, weight)` into the series for `key` iff the live load
    /// plus `weight` fits within `spec.max`.
    ///
    /// On rejection the wait is `max(0, t₀ + W − now)` where `t₀` is the
    /// oldest live entry: the instant it falls out of the window is the
    /// earliest the load can drop. Sleeping that long guarantees progress
    /// but not admission; callers must re-check.
    ///
    /// A weight larger than `spec.max` can never be admitted; it is
    /// rejected with `wait = W` and nothing is recorded.
    pub async fn check_and_admit(
        &self,
        key: &str,
        spec: &LimitSpec,
        weight: f64,
        now: f64,
    ) -> Result<WindowDecision> {
        let cutoff = now - spec.window;
        let weighted = spec.kind.is_token();

        if weight > spec.max {
            let load = self.store.load(key, cutoff, weighted).await?;
            trace!(
                key = %key,
                weight = weight,
                max = spec.max,
                "Weight exceeds limit capacity; permanently unadmissible"
            );
            return Ok(WindowDecision {
                admitted: false,
                wait: spec.window,
                load,
                member: None,
            });
        }

        let admission = self
            .store
            .check_and_admit(key, cutoff, now, weight, spec.max, weighted)
            .await?;

        let wait = if admission.admitted {
            0.0
        } else {
            admission
                .oldest
                .map(|t0| (t0 + spec.window - now).max(0.0))
                .unwrap_or(0.0)
        };

        trace!(
            key = %key,
            admitted = admission.admitted,
            load = admission.load,
            wait = wait,
            "Sliding window check"
        );

        Ok(WindowDecision {
            admitted: admission.admitted,
            wait,
            load: admission.load,
            member: admission.member,
        })
    }

    /// Read-only probe: what would a call of `weight` see right now?
    ///
    /// Prunes the series but records nothing, whatever the answer.
    pub async fn peek(
        &self,
        key: &str,
        spec: &LimitSpec,
        weight: f64,
        now: f64,
    ) -> Result<WindowDecision> {
        let cutoff = now - spec.window;
        let weighted = spec.kind.is_token();

        self.store.prune(key, cutoff).await?;
        let load = self.store.load(key, cutoff, weighted).await?;

        if weight <= spec.max && load + weight <= spec.max {
            return Ok(WindowDecision {
                admitted: true,
                wait: 0.0,
                load,
                member: None,
            });
        }

        let wait = if weight > spec.max {
            spec.window
        } else {
            self.store
                .oldest(key, cutoff)
                .await?
                .map(|t0| (t0 + spec.window - now).max(0.0))
                .unwrap_or(0.0)
        };

        Ok(WindowDecision {
            admitted: false,
            wait,
            load,
            member: None,
        })
    }
}
