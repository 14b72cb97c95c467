//! Multi-limit resource management.
//!
//! A resource binds up to five limits (see [`LimitKind`]) and evaluates
//! them jointly: a call is admitted iff every active limit admits it.
//! Limits are checked in the fixed order rps, rpm, rph, tps, tpm: the
//! tightest short-term limit first, so the common rejection happens
//! before anything needs rolling back.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, WindwardError};
use crate::limits::{LimitSpec, ResourceLimits};
use crate::store::TimestampStore;
use crate::window::SlidingWindowLimiter;

/// Joint decision across all active limits of one resource.
#[derive(Debug, Clone)]
pub struct ResourceDecision {
    /// Whether every active limit admitted the call.
    pub admitted: bool,
    /// Maximum wait among rejecting limits (zero when admitted).
    pub wait: f64,
    /// The binding limit: the rejector demanding the longest wait.
    pub binding: Option<LimitSpec>,
    /// Load observed on the binding limit, or on the last limit when
    /// admitted.
    pub load: f64,
}

impl ResourceDecision {
    fn admitted(load: f64) -> Self {
        Self {
            admitted: true,
            wait: 0.0,
            binding: None,
            load,
        }
    }
}

/// Binds resource names to their configured limits and runs the joint
/// admission check.
pub struct ResourceManager {
    limiter: SlidingWindowLimiter,
    configs: RwLock<HashMap<String, ResourceLimits>>,
}

impl ResourceManager {
    pub fn new(store: Arc<dyn TimestampStore>) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(store),
            configs: RwLock::new(HashMap::new()),
        }
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Configure the limits for a resource. Idempotent; replaces any
    /// previous configuration. Non-positive limits normalize to
    /// inactive, and a configuration with no active limit is rejected.
    ///
    /// Reconfiguration is not atomic with in-flight checks; new values
    /// apply from the next check. Series state for deactivated limits
    /// is left in place in case the limit is re-enabled.
    pub fn configure(&self, resource: &str, limits: ResourceLimits) -> Result<()> {
        let normalized = limits.normalized();
        if normalized.is_empty() {
            return Err(WindwardError::InvalidArgument(
                "at least one rate limit must be specified".to_string(),
            ));
        }

        info!(
            resource = %resource,
            limits = ?normalized,
            "Resource limits configured"
        );
        self.configs.write().insert(resource.to_string(), normalized);
        Ok(())
    }

    /// The normalized configuration for a resource, if any.
    pub fn configuration(&self, resource: &str) -> Option<ResourceLimits> {
        self.configs.read().get(resource).cloned()
    }

    pub fn is_configured(&self, resource: &str) -> bool {
        self.configs.read().contains_key(resource)
    }

    /// Active limits for a resource in evaluation order.
    pub fn active_specs(&self, resource: &str) -> Vec<LimitSpec> {
        self.configs
            .read()
            .get(resource)
            .map(|c| c.active_specs())
            .unwrap_or_default()
    }

    /// Widest active window for a resource, in seconds.
    pub fn widest_window(&self, resource: &str) -> Option<f64> {
        self.configs.read().get(resource).and_then(|c| c.widest_window())
    }

    /// Evaluate one call against every active limit of `resource`.
    ///
    /// `series_base` is the namespaced key the series hang off
    /// (`resource` or `resource_<user_id>`); each limit uses
    /// `<series_base>:<suffix>`. Token limits consume `weight`; request
    /// limits count 1.
    ///
    /// Admission stops being attempted after the first rejection; the
    /// remaining limits are probed read-only so the binding limit (the
    /// one demanding the longest wait) is reported. Admissions already
    /// made by earlier limits are rolled back by exact-member removal.
    /// A failed rollback leaves the entry to age out of its window:
    /// conservative, never over-admitting.
    pub async fn check_at(
        &self,
        resource: &str,
        series_base: &str,
        weight: f64,
        now: f64,
    ) -> Result<ResourceDecision> {
        let specs = self.active_specs(resource);
        if specs.is_empty() {
            // Unconfigured resources are not limited.
            return Ok(ResourceDecision::admitted(0.0));
        }

        let mut admitted: Vec<(String, String)> = Vec::new();
        let mut rejections: Vec<(LimitSpec, f64, f64)> = Vec::new();
        let mut last_load = 0.0;

        for spec in &specs {
            let key = format!("{}:{}", series_base, spec.kind.suffix());
            let effective = if spec.kind.is_token() { weight } else { 1.0 };

            if rejections.is_empty() {
                let decision = match self
                    .limiter
                    .check_and_admit(&key, spec, effective, now)
                    .await
                {
                    Ok(decision) => decision,
                    Err(e) => {
                        self.rollback(&admitted).await;
                        return Err(e);
                    }
                };

                if decision.admitted {
                    last_load = decision.load;
                    if let Some(member) = decision.member {
                        admitted.push((key, member));
                    }
                } else {
                    rejections.push((*spec, decision.wait, decision.load));
                }
            } else {
                // Something already rejected; probe the rest read-only so
                // the longest wait wins without touching their series.
                let probe = match self.limiter.peek(&key, spec, effective, now).await {
                    Ok(probe) => probe,
                    Err(e) => {
                        self.rollback(&admitted).await;
                        return Err(e);
                    }
                };
                if !probe.admitted {
                    rejections.push((*spec, probe.wait, probe.load));
                }
            }
        }

        if rejections.is_empty() {
            return Ok(ResourceDecision::admitted(last_load));
        }

        self.rollback(&admitted).await;

        let mut binding = rejections[0];
        for rejection in &rejections[1..] {
            if rejection.1 > binding.1 {
                binding = *rejection;
            }
        }
        let (spec, wait, load) = binding;

        debug!(
            resource = %resource,
            key = %series_base,
            limit_type = %spec.kind,
            wait = wait,
            load = load,
            "Call rejected by binding limit"
        );

        Ok(ResourceDecision {
            admitted: false,
            wait,
            binding: Some(spec),
            load,
        })
    }

    /// Remove entries admitted earlier in a call that ultimately
    /// rejected. Best-effort: a member that cannot be removed stays and
    /// contributes to future load.
    async fn rollback(&self, admitted: &[(String, String)]) {
        for (key, member) in admitted {
            match self.limiter.store().remove(key, member).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(key = %key, "Rollback found no entry to remove");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Rollback failed; entry left to age out");
                }
            }
        }
    }
}
