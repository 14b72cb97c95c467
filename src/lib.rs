//! windward - Sliding-Window Rate Limiting
//!
//! This crate enforces per-resource request and token quotas with a
//! precise sliding-window algorithm. A resource combines up to five
//! limits (requests per second/minute/hour, tokens per second/minute),
//! evaluated jointly; window state lives either in process memory or in
//! a shared Redis store, where admissions run as a single server-side
//! script so concurrent clients never over-admit.
//!
//! ```no_run
//! use windward::{ResourceLimits, Windward};
//!
//! # async fn example() -> windward::Result<()> {
//! let limiter = Windward::in_memory();
//! limiter.configure(
//!     "user",
//!     ResourceLimits {
//!         requests_per_second: Some(5.0),
//!         requests_per_minute: Some(10.0),
//!         ..ResourceLimits::default()
//!     },
//! )?;
//!
//! let outcome = limiter.acquire("user", Some("bob"), 1.0, None).await?;
//! println!("{}: waited {:.3}s", outcome.status, outcome.wait);
//! # Ok(())
//! # }
//! ```

pub mod acquire;
pub mod config;
pub mod error;
pub mod limits;
pub mod resource;
pub mod store;
pub mod window;

pub use acquire::{AcquireStatus, BackendInfo, Outcome, ResourceStatus, UsageEntry, Windward};
pub use config::{RedisConfig, WindwardConfig};
pub use error::{Result, WindwardError};
pub use limits::{LimitKind, LimitSpec, LimitsFile, ResourceLimits};
pub use resource::{ResourceDecision, ResourceManager};
pub use store::{MemoryStore, RedisStore, TimestampStore};
pub use window::{SlidingWindowLimiter, WindowDecision};
