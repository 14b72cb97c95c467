//! Limit types and per-resource limit configuration.
//!
//! A resource may carry up to five independent limits, one per
//! [`LimitKind`]. Request-counting kinds always count each call as 1;
//! token kinds consume the caller-supplied weight.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{Result, WindwardError};

/// The five limit types a resource can be configured with, in evaluation
/// order. Short windows come first so the tightest limit rejects early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    RequestsPerSecond,
    RequestsPerMinute,
    RequestsPerHour,
    TokensPerSecond,
    TokensPerMinute,
}

impl LimitKind {
    /// All kinds in evaluation order.
    pub const ALL: [LimitKind; 5] = [
        LimitKind::RequestsPerSecond,
        LimitKind::RequestsPerMinute,
        LimitKind::RequestsPerHour,
        LimitKind::TokensPerSecond,
        LimitKind::TokensPerMinute,
    ];

    /// Series key suffix for this kind.
    pub fn suffix(&self) -> &'static str {
        match self {
            LimitKind::RequestsPerSecond => "rps",
            LimitKind::RequestsPerMinute => "rpm",
            LimitKind::RequestsPerHour => "rph",
            LimitKind::TokensPerSecond => "tps",
            LimitKind::TokensPerMinute => "tpm",
        }
    }

    /// Long-form name used in configuration, status reports, and logs.
    pub fn limit_type(&self) -> &'static str {
        match self {
            LimitKind::RequestsPerSecond => "requests_per_second",
            LimitKind::RequestsPerMinute => "requests_per_minute",
            LimitKind::RequestsPerHour => "requests_per_hour",
            LimitKind::TokensPerSecond => "tokens_per_second",
            LimitKind::TokensPerMinute => "tokens_per_minute",
        }
    }

    /// Window length in seconds.
    pub fn window(&self) -> f64 {
        match self {
            LimitKind::RequestsPerSecond | LimitKind::TokensPerSecond => 1.0,
            LimitKind::RequestsPerMinute | LimitKind::TokensPerMinute => 60.0,
            LimitKind::RequestsPerHour => 3600.0,
        }
    }

    /// Token kinds consume the caller-supplied weight; request kinds
    /// always count 1 per call.
    pub fn is_token(&self) -> bool {
        matches!(self, LimitKind::TokensPerSecond | LimitKind::TokensPerMinute)
    }

    /// Parse a series key suffix back into a kind.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "rps" => Some(LimitKind::RequestsPerSecond),
            "rpm" => Some(LimitKind::RequestsPerMinute),
            "rph" => Some(LimitKind::RequestsPerHour),
            "tps" => Some(LimitKind::TokensPerSecond),
            "tpm" => Some(LimitKind::TokensPerMinute),
            _ => None,
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.limit_type())
    }
}

/// A single active limit: at most `max` cumulative weight inside any
/// window of `window` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitSpec {
    pub kind: LimitKind,
    pub max: f64,
    pub window: f64,
}

impl LimitSpec {
    pub fn new(kind: LimitKind, max: f64) -> Self {
        Self {
            kind,
            max,
            window: kind.window(),
        }
    }
}

/// Limits configured for one resource. Absent or non-positive values mean
/// the corresponding limit is inactive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(default)]
    pub requests_per_minute: Option<f64>,
    #[serde(default)]
    pub requests_per_hour: Option<f64>,
    #[serde(default)]
    pub tokens_per_second: Option<f64>,
    #[serde(default)]
    pub tokens_per_minute: Option<f64>,
}

impl ResourceLimits {
    /// The configured maximum for a kind, if any.
    pub fn limit_for(&self, kind: LimitKind) -> Option<f64> {
        match kind {
            LimitKind::RequestsPerSecond => self.requests_per_second,
            LimitKind::RequestsPerMinute => self.requests_per_minute,
            LimitKind::RequestsPerHour => self.requests_per_hour,
            LimitKind::TokensPerSecond => self.tokens_per_second,
            LimitKind::TokensPerMinute => self.tokens_per_minute,
        }
    }

    /// Copy of this configuration with non-positive and non-finite limits
    /// normalized to inactive.
    pub fn normalized(&self) -> Self {
        let keep = |v: Option<f64>| v.filter(|m| m.is_finite() && *m > 0.0);
        Self {
            requests_per_second: keep(self.requests_per_second),
            requests_per_minute: keep(self.requests_per_minute),
            requests_per_hour: keep(self.requests_per_hour),
            tokens_per_second: keep(self.tokens_per_second),
            tokens_per_minute: keep(self.tokens_per_minute),
        }
    }

    /// Active limits in evaluation order.
    pub fn active_specs(&self) -> Vec<LimitSpec> {
        LimitKind::ALL
            .iter()
            .filter_map(|&kind| self.limit_for(kind).map(|max| LimitSpec::new(kind, max)))
            .collect()
    }

    /// Length of the widest active window, in seconds.
    pub fn widest_window(&self) -> Option<f64> {
        self.active_specs()
            .iter()
            .map(|s| s.window)
            .fold(None, |acc, w| Some(acc.map_or(w, |a: f64| a.max(w))))
    }

    pub fn is_empty(&self) -> bool {
        self.active_specs().is_empty()
    }
}

/// A set of resource limit configurations, typically loaded from YAML.
///
/// Format:
/// ```yaml
/// resources:
///   user_alice:
///     requests_per_second: 5
///     requests_per_minute: 10
///   llm:
///     tokens_per_second: 100
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsFile {
    #[serde(default)]
    pub resources: HashMap<String, ResourceLimits>,
}

impl LimitsFile {
    /// Load resource limits from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading resource limits");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load resource limits from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WindwardError::Config(format!("failed to parse limits: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_order() {
        let suffixes: Vec<&str> = LimitKind::ALL.iter().map(|k| k.suffix()).collect();
        assert_eq!(suffixes, vec!["rps", "rpm", "rph", "tps", "tpm"]);
    }

    #[test]
    fn test_windows() {
        assert_eq!(LimitKind::RequestsPerSecond.window(), 1.0);
        assert_eq!(LimitKind::RequestsPerMinute.window(), 60.0);
        assert_eq!(LimitKind::RequestsPerHour.window(), 3600.0);
        assert_eq!(LimitKind::TokensPerSecond.window(), 1.0);
        assert_eq!(LimitKind::TokensPerMinute.window(), 60.0);
    }

    #[test]
    fn test_suffix_round_trip() {
        for kind in LimitKind::ALL {
            assert_eq!(LimitKind::from_suffix(kind.suffix()), Some(kind));
        }
        assert_eq!(LimitKind::from_suffix("custom"), None);
    }

    #[test]
    fn test_token_kinds_take_weight() {
        assert!(!LimitKind::RequestsPerSecond.is_token());
        assert!(!LimitKind::RequestsPerMinute.is_token());
        assert!(!LimitKind::RequestsPerHour.is_token());
        assert!(LimitKind::TokensPerSecond.is_token());
        assert!(LimitKind::TokensPerMinute.is_token());
    }

    #[test]
    fn test_normalization_deactivates_non_positive() {
        let limits = ResourceLimits {
            requests_per_second: Some(5.0),
            requests_per_minute: Some(0.0),
            requests_per_hour: Some(-1.0),
            tokens_per_second: Some(f64::NAN),
            tokens_per_minute: None,
        };
        let normalized = limits.normalized();
        assert_eq!(normalized.requests_per_second, Some(5.0));
        assert_eq!(normalized.requests_per_minute, None);
        assert_eq!(normalized.requests_per_hour, None);
        assert_eq!(normalized.tokens_per_second, None);

        let specs = normalized.active_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].kind, LimitKind::RequestsPerSecond);
        assert_eq!(specs[0].max, 5.0);
        assert_eq!(specs[0].window, 1.0);
    }

    #[test]
    fn test_widest_window() {
        let limits = ResourceLimits {
            requests_per_second: Some(5.0),
            requests_per_minute: Some(10.0),
            ..ResourceLimits::default()
        };
        assert_eq!(limits.widest_window(), Some(60.0));

        assert_eq!(ResourceLimits::default().widest_window(), None);
    }

    #[test]
    fn test_parse_limits_file() {
        let yaml = r#"
resources:
  user_alice:
    requests_per_second: 5
    requests_per_minute: 10
  llm:
    tokens_per_second: 100
"#;
        let file = LimitsFile::from_yaml(yaml).unwrap();
        assert_eq!(file.resources.len(), 2);
        assert_eq!(
            file.resources["user_alice"].requests_per_second,
            Some(5.0)
        );
        assert_eq!(file.resources["llm"].tokens_per_second, Some(100.0));
        assert_eq!(file.resources["llm"].requests_per_second, None);
    }
}
