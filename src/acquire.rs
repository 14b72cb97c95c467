//! Admit/sleep coordination and the public library surface.
//!
//! [`Windward`] is the entry point callers hold: it owns the resource
//! manager and the store, builds the namespaced key for a call, and
//! either sleeps through rejections (`acquire`) or reports them
//! immediately (`try_acquire`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RedisConfig;
use crate::error::{Result, WindwardError};
use crate::limits::{LimitSpec, LimitsFile, ResourceLimits};
use crate::resource::{ResourceDecision, ResourceManager};
use crate::store::{wall_clock_seconds, MemoryStore, RedisStore, TimestampStore};

/// Terminal status of one `acquire` or `try_acquire` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    /// Every active limit admitted the call.
    Admitted,
    /// Rejected without sleeping (`try_acquire` only); `wait` carries
    /// the retry hint.
    RateLimited,
    /// Retries exceeded the widest configured window.
    Exhausted,
    /// The store failed; terminal for this call, nothing was slept.
    BackendError,
    /// The caller's deadline arrived first.
    Cancelled,
}

impl std::fmt::Display for AcquireStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AcquireStatus::Admitted => "admitted",
            AcquireStatus::RateLimited => "rate_limited",
            AcquireStatus::Exhausted => "exhausted",
            AcquireStatus::BackendError => "backend_error",
            AcquireStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One record per call: stable shape for logging and for any HTTP
/// adapter sitting above the library.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: AcquireStatus,
    /// The namespaced key the call was evaluated under.
    pub resource_key: String,
    /// Binding limit when the call was rejected.
    pub limit_type: Option<&'static str>,
    pub max_requests: Option<f64>,
    pub time_window: Option<f64>,
    /// Seconds: retry hint for `rate_limited`, elapsed for `exhausted`
    /// and `cancelled`, zero for `admitted`.
    pub wait: f64,
    /// Load observed on the binding limit (or the last admitted one).
    pub load: f64,
    /// Backend identity the decision came from.
    pub backend: &'static str,
    /// Store error text for `backend_error`.
    pub error: Option<String>,
}

impl Outcome {
    fn new(status: AcquireStatus, resource_key: &str, backend: &'static str) -> Self {
        Self {
            status,
            resource_key: resource_key.to_string(),
            limit_type: None,
            max_requests: None,
            time_window: None,
            wait: 0.0,
            load: 0.0,
            backend,
            error: None,
        }
    }

    fn with_binding(mut self, binding: Option<LimitSpec>) -> Self {
        if let Some(spec) = binding {
            self.limit_type = Some(spec.kind.limit_type());
            self.max_requests = Some(spec.max);
            self.time_window = Some(spec.window);
        }
        self
    }
}

/// Current usage of one limit type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageEntry {
    pub current: f64,
    pub limit: f64,
}

/// Snapshot of a resource's configuration and live usage.
#[derive(Debug, Clone)]
pub struct ResourceStatus {
    pub resource_key: String,
    pub configuration: ResourceLimits,
    /// Keyed by limit type name (`requests_per_second`, ...).
    pub current_usage: HashMap<&'static str, UsageEntry>,
    /// Oldest live timestamp across all series of this key.
    pub oldest_timestamp: Option<f64>,
    /// How long a weight-1 call arriving now would have to wait.
    pub sleep_time_hint: f64,
}

/// Diagnostic view of the backing store.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub variant: &'static str,
    pub connected: bool,
    pub connection_error: Option<String>,
    pub key_count: usize,
    pub approximate_memory_bytes: u64,
}

/// Sliding-window rate limiter with multi-limit resources and a
/// pluggable store.
pub struct Windward {
    manager: ResourceManager,
    store: Arc<dyn TimestampStore>,
}

impl Windward {
    pub fn new(store: Arc<dyn TimestampStore>) -> Self {
        Self {
            manager: ResourceManager::new(Arc::clone(&store)),
            store,
        }
    }

    /// Limiter over process-local state.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Limiter over a Redis store shared across processes.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let store = RedisStore::connect(config).await?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    /// Configure (or reconfigure) the limits of a resource.
    pub fn configure(&self, resource: &str, limits: ResourceLimits) -> Result<()> {
        self.manager.configure(resource, limits)
    }

    /// Configure every resource listed in a YAML limits file.
    pub fn configure_from_file(&self, path: &str) -> Result<()> {
        let file = LimitsFile::from_file(path)?;
        for (resource, limits) in file.resources {
            self.manager.configure(&resource, limits)?;
        }
        Ok(())
    }

    /// Acquire one slot for `resource`, sleeping through rejections.
    ///
    /// Retries until admission, until total wait reaches the widest
    /// configured window (`Exhausted`), or until `deadline`
    /// (`Cancelled`, checked before each retry and at every sleep
    /// boundary). Store errors are terminal for the call and surface as
    /// a `BackendError` outcome without sleeping.
    pub async fn acquire(
        &self,
        resource: &str,
        user_id: Option<&str>,
        weight: f64,
        deadline: Option<Instant>,
    ) -> Result<Outcome> {
        validate_weight(weight)?;
        let key = namespaced_key(resource, user_id);
        let backend = self.store.backend_name();
        let budget = self.manager.widest_window(resource);
        let started = Instant::now();

        loop {
            let elapsed = started.elapsed().as_secs_f64();

            if deadline.is_some_and(|d| Instant::now() >= d) {
                let mut outcome = Outcome::new(AcquireStatus::Cancelled, &key, backend);
                outcome.wait = elapsed;
                return Ok(self.observe(outcome));
            }

            let decision = match self
                .manager
                .check_at(resource, &key, weight, wall_clock_seconds())
                .await
            {
                Ok(decision) => decision,
                Err(e) if e.is_backend() => {
                    let mut outcome = Outcome::new(AcquireStatus::BackendError, &key, backend);
                    outcome.error = Some(e.to_string());
                    return Ok(self.observe(outcome));
                }
                Err(e) => return Err(e),
            };

            if decision.admitted {
                let mut outcome = Outcome::new(AcquireStatus::Admitted, &key, backend);
                outcome.load = decision.load;
                return Ok(self.observe(outcome));
            }

            let budget = budget.unwrap_or(0.0);
            if elapsed >= budget {
                let mut outcome = Outcome::new(AcquireStatus::Exhausted, &key, backend)
                    .with_binding(decision.binding);
                outcome.wait = elapsed;
                outcome.load = decision.load;
                return Ok(self.observe(outcome));
            }

            self.sleep_through(&key, &decision, elapsed, budget, deadline).await;
        }
    }

    /// Non-blocking variant: one check, no sleeping. A rejection comes
    /// back as `RateLimited` with the wait hint.
    pub async fn try_acquire(
        &self,
        resource: &str,
        user_id: Option<&str>,
        weight: f64,
    ) -> Result<Outcome> {
        validate_weight(weight)?;
        let key = namespaced_key(resource, user_id);
        let backend = self.store.backend_name();

        let decision = match self
            .manager
            .check_at(resource, &key, weight, wall_clock_seconds())
            .await
        {
            Ok(decision) => decision,
            Err(e) if e.is_backend() => {
                let mut outcome = Outcome::new(AcquireStatus::BackendError, &key, backend);
                outcome.error = Some(e.to_string());
                return Ok(self.observe(outcome));
            }
            Err(e) => return Err(e),
        };

        let mut outcome = if decision.admitted {
            Outcome::new(AcquireStatus::Admitted, &key, backend)
        } else {
            let mut outcome = Outcome::new(AcquireStatus::RateLimited, &key, backend)
                .with_binding(decision.binding);
            outcome.wait = decision.wait;
            outcome
        };
        outcome.load = decision.load;
        Ok(self.observe(outcome))
    }

    /// Sleep the reported wait, never past the retry budget or the
    /// caller's deadline.
    async fn sleep_through(
        &self,
        key: &str,
        decision: &ResourceDecision,
        elapsed: f64,
        budget: f64,
        deadline: Option<Instant>,
    ) {
        let mut sleep_for = decision.wait.min(budget - elapsed).max(0.0);
        if let Some(deadline) = deadline {
            let until_deadline = deadline
                .saturating_duration_since(Instant::now())
                .as_secs_f64();
            sleep_for = sleep_for.min(until_deadline);
        }

        debug!(
            key = %key,
            limit_type = decision.binding.map(|s| s.kind.limit_type()).unwrap_or(""),
            wait = decision.wait,
            sleeping = sleep_for,
            load = decision.load,
            backend = self.store.backend_name(),
            "Rate limited; sleeping before retry"
        );

        if sleep_for > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(sleep_for)).await;
        } else {
            // wait == 0 means a slot freed mid-check; retry immediately
            // but let other tasks run first.
            tokio::task::yield_now().await;
        }
    }

    /// Emit the one structured observation per terminal outcome.
    fn observe(&self, outcome: Outcome) -> Outcome {
        debug!(
            key = %outcome.resource_key,
            status = %outcome.status,
            limit_type = outcome.limit_type.unwrap_or(""),
            max_requests = outcome.max_requests.unwrap_or(0.0),
            time_window = outcome.time_window.unwrap_or(0.0),
            wait = outcome.wait,
            load = outcome.load,
            backend = outcome.backend,
            "Acquire outcome"
        );
        outcome
    }

    /// Configuration and live usage for a resource key, or `None` when
    /// the resource was never configured.
    pub async fn status(
        &self,
        resource: &str,
        user_id: Option<&str>,
    ) -> Result<Option<ResourceStatus>> {
        let Some(configuration) = self.manager.configuration(resource) else {
            return Ok(None);
        };

        let key = namespaced_key(resource, user_id);
        let now = wall_clock_seconds();
        let limiter = self.manager.limiter();

        let mut current_usage = HashMap::new();
        let mut oldest_timestamp: Option<f64> = None;
        let mut sleep_time_hint = 0.0f64;

        for spec in configuration.active_specs() {
            let series_key = format!("{}:{}", key, spec.kind.suffix());
            let cutoff = now - spec.window;
            let weighted = spec.kind.is_token();

            let current = self.store.load(&series_key, cutoff, weighted).await?;
            current_usage.insert(
                spec.kind.limit_type(),
                UsageEntry {
                    current,
                    limit: spec.max,
                },
            );

            if let Some(oldest) = self.store.oldest(&series_key, cutoff).await? {
                oldest_timestamp = Some(oldest_timestamp.map_or(oldest, |t| t.min(oldest)));
            }

            let probe = limiter.peek(&series_key, &spec, 1.0, now).await?;
            if !probe.admitted {
                sleep_time_hint = sleep_time_hint.max(probe.wait);
            }
        }

        Ok(Some(ResourceStatus {
            resource_key: key,
            configuration,
            current_usage,
            oldest_timestamp,
            sleep_time_hint,
        }))
    }

    /// Diagnostic view of the backing store: variant, reachability, key
    /// count, and approximate memory.
    pub async fn backend_info(&self) -> BackendInfo {
        let (connected, connection_error) = match self.store.ping().await {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        let key_count = self.store.all_keys().await.map(|k| k.len()).unwrap_or(0);
        let approximate_memory_bytes = self.store.report_memory().await.unwrap_or(0);

        info!(
            variant = self.store.backend_name(),
            connected = connected,
            key_count = key_count,
            "Backend info probed"
        );

        BackendInfo {
            variant: self.store.backend_name(),
            connected,
            connection_error,
            key_count,
            approximate_memory_bytes,
        }
    }
}

/// `resource` alone, or `resource_<user_id>` when a user is supplied.
fn namespaced_key(resource: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user_id) => format!("{}_{}", resource, user_id),
        None => resource.to_string(),
    }
}

fn validate_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(WindwardError::InvalidArgument(format!(
            "weight must be a positive finite number, got {}",
            weight
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::LimitKind;

    fn limits(rps: Option<f64>, rpm: Option<f64>, tps: Option<f64>) -> ResourceLimits {
        ResourceLimits {
            requests_per_second: rps,
            requests_per_minute: rpm,
            tokens_per_second: tps,
            ..ResourceLimits::default()
        }
    }

    #[test]
    fn test_namespaced_key() {
        assert_eq!(namespaced_key("api", None), "api");
        assert_eq!(namespaced_key("api", Some("bob")), "api_bob");
    }

    #[tokio::test]
    async fn test_invalid_weight_is_rejected_up_front() {
        let limiter = Windward::in_memory();

        assert!(limiter.acquire("r", None, 0.0, None).await.is_err());
        assert!(limiter.acquire("r", None, -1.0, None).await.is_err());
        assert!(limiter.try_acquire("r", None, f64::NAN).await.is_err());
    }

    #[tokio::test]
    async fn test_unconfigured_resource_admits() {
        let limiter = Windward::in_memory();

        let outcome = limiter.acquire("anything", None, 1.0, None).await.unwrap();
        assert_eq!(outcome.status, AcquireStatus::Admitted);
        assert_eq!(outcome.wait, 0.0);
        assert_eq!(outcome.backend, "memory");
    }

    #[tokio::test]
    async fn test_admitted_outcome_shape() {
        let limiter = Windward::in_memory();
        limiter.configure("api", limits(Some(5.0), None, None)).unwrap();

        let outcome = limiter
            .acquire("api", Some("bob"), 1.0, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, AcquireStatus::Admitted);
        assert_eq!(outcome.resource_key, "api_bob");
        assert_eq!(outcome.limit_type, None);
        assert_eq!(outcome.load, 1.0);
    }

    #[tokio::test]
    async fn test_try_acquire_reports_rate_limited() {
        let limiter = Windward::in_memory();
        limiter.configure("api", limits(Some(2.0), None, None)).unwrap();

        for _ in 0..2 {
            let outcome = limiter.try_acquire("api", None, 1.0).await.unwrap();
            assert_eq!(outcome.status, AcquireStatus::Admitted);
        }

        let outcome = limiter.try_acquire("api", None, 1.0).await.unwrap();
        assert_eq!(outcome.status, AcquireStatus::RateLimited);
        assert_eq!(outcome.limit_type, Some("requests_per_second"));
        assert_eq!(outcome.max_requests, Some(2.0));
        assert_eq!(outcome.time_window, Some(1.0));
        assert!(outcome.wait > 0.0 && outcome.wait <= 1.0);
    }

    #[tokio::test]
    async fn test_acquire_sleeps_through_a_burst() {
        let limiter = Windward::in_memory();
        limiter.configure("api", limits(Some(1.0), None, None)).unwrap();

        let first = limiter.acquire("api", None, 1.0, None).await.unwrap();
        assert_eq!(first.status, AcquireStatus::Admitted);

        // The second call has to wait out the 1-second window.
        let started = Instant::now();
        let second = limiter.acquire("api", None, 1.0, None).await.unwrap();
        assert_eq!(second.status, AcquireStatus::Admitted);
        assert!(started.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_oversized_weight_exhausts_without_recording() {
        let limiter = Windward::in_memory();
        limiter.configure("llm", limits(None, None, Some(5.0))).unwrap();

        let outcome = limiter.acquire("llm", None, 6.0, None).await.unwrap();
        assert_eq!(outcome.status, AcquireStatus::Exhausted);
        assert_eq!(outcome.limit_type, Some("tokens_per_second"));
        // Total wait is bounded by the widest window (1 s here).
        assert!(outcome.wait <= 1.5);

        let status = limiter.status("llm", None).await.unwrap().unwrap();
        assert_eq!(status.current_usage["tokens_per_second"].current, 0.0);
    }

    #[tokio::test]
    async fn test_deadline_cancels_mid_sleep() {
        let limiter = Windward::in_memory();
        limiter.configure("api", limits(Some(1.0), None, None)).unwrap();

        assert_eq!(
            limiter.acquire("api", None, 1.0, None).await.unwrap().status,
            AcquireStatus::Admitted
        );

        let deadline = Instant::now() + Duration::from_millis(100);
        let started = Instant::now();
        let outcome = limiter
            .acquire("api", None, 1.0, Some(deadline))
            .await
            .unwrap();
        assert_eq!(outcome.status, AcquireStatus::Cancelled);
        // Cancelled at the sleep boundary, well before the 1 s window.
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let limiter = Windward::in_memory();
        limiter
            .configure("user", limits(Some(5.0), Some(10.0), None))
            .unwrap();

        for _ in 0..3 {
            limiter.acquire("user", Some("bob"), 1.0, None).await.unwrap();
        }

        let status = limiter.status("user", Some("bob")).await.unwrap().unwrap();
        assert_eq!(status.resource_key, "user_bob");
        assert_eq!(status.configuration.requests_per_second, Some(5.0));
        assert_eq!(status.current_usage["requests_per_second"].current, 3.0);
        assert_eq!(status.current_usage["requests_per_second"].limit, 5.0);
        assert_eq!(status.current_usage["requests_per_minute"].current, 3.0);
        assert!(status.oldest_timestamp.is_some());
        assert_eq!(status.sleep_time_hint, 0.0);

        assert!(limiter.status("missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_hints_when_saturated() {
        let limiter = Windward::in_memory();
        limiter.configure("api", limits(Some(2.0), None, None)).unwrap();

        for _ in 0..2 {
            limiter.try_acquire("api", None, 1.0).await.unwrap();
        }

        let status = limiter.status("api", None).await.unwrap().unwrap();
        assert!(status.sleep_time_hint > 0.0);
        assert!(status.sleep_time_hint <= 1.0);
    }

    #[tokio::test]
    async fn test_backend_info_memory() {
        let limiter = Windward::in_memory();
        limiter.configure("api", limits(Some(5.0), None, None)).unwrap();
        limiter.acquire("api", None, 1.0, None).await.unwrap();

        let info = limiter.backend_info().await;
        assert_eq!(info.variant, "memory");
        assert!(info.connected);
        assert_eq!(info.connection_error, None);
        assert_eq!(info.key_count, 1);
        assert!(info.approximate_memory_bytes > 0);
    }

    #[tokio::test]
    async fn test_parallel_users_admit_independently() {
        let limiter = Arc::new(Windward::in_memory());
        limiter.configure("api", limits(Some(5.0), None, None)).unwrap();

        let mut handles = Vec::new();
        for user in ["alice", "bob"] {
            for _ in 0..5 {
                let limiter = Arc::clone(&limiter);
                handles.push(tokio::spawn(async move {
                    limiter
                        .try_acquire("api", Some(user), 1.0)
                        .await
                        .unwrap()
                        .status
                }));
            }
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() == AcquireStatus::Admitted {
                admitted += 1;
            }
        }

        // Each user has their own series; both bursts fit exactly.
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_rejection_binding_kind_is_exposed() {
        let limiter = Windward::in_memory();
        limiter
            .configure("x", limits(Some(10.0), Some(1.0), None))
            .unwrap();

        assert_eq!(
            limiter.try_acquire("x", None, 1.0).await.unwrap().status,
            AcquireStatus::Admitted
        );

        let rejected = limiter.try_acquire("x", None, 1.0).await.unwrap();
        assert_eq!(rejected.status, AcquireStatus::RateLimited);
        assert_eq!(rejected.limit_type, Some(LimitKind::RequestsPerMinute.limit_type()));

        // The rolled-back rps admission is not visible in status.
        let status = limiter.status("x", None).await.unwrap().unwrap();
        assert_eq!(status.current_usage["requests_per_second"].current, 1.0);
        assert_eq!(status.current_usage["requests_per_minute"].current, 1.0);
    }
}
