//! Engine configuration

use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session-wide settings, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Entries kept by the debug log before the oldest are evicted
    pub debug_log_capacity: usize,
    /// Retry policy for queries that don't declare their own
    pub retry: RetryPolicy,
    /// Released versions reject structural edits
    pub released: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debug_log_capacity: 50,
            retry: RetryPolicy::default(),
            released: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(text).map_err(|e| RuntimeError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// How transport failures are retried. Logic failures never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(alias = "maxRetries")]
    pub max_retries: u32,
    #[serde(alias = "delayMs")]
    pub delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 500,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = match self.backoff {
            Backoff::Fixed => 1,
            Backoff::Exponential => 1u64.checked_shl(retry.min(16)).unwrap_or(1),
        };
        Duration::from_millis(self.delay_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.debug_log_capacity, 50);
        assert!(!config.released);
        assert_eq!(config.retry.max_retries, 0);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = EngineConfig::from_json(r#"{"released": true, "retry": {"max_retries": 2}}"#).unwrap();
        assert!(config.released);
        assert_eq!(config.debug_log_capacity, 50);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.backoff, Backoff::Fixed);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = EngineConfig::from_json(r#"{"capacity": 3}"#).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[test]
    fn test_backoff_delays() {
        let fixed = RetryPolicy {
            max_retries: 3,
            delay_ms: 100,
            backoff: Backoff::Fixed,
        };
        assert_eq!(fixed.delay(2), Duration::from_millis(100));

        let exponential = RetryPolicy {
            backoff: Backoff::Exponential,
            ..fixed
        };
        assert_eq!(exponential.delay(0), Duration::from_millis(100));
        assert_eq!(exponential.delay(3), Duration::from_millis(800));
    }
}
