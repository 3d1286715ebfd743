//! Core Configuration
//!
//! Tuning knobs for the retry loops, store batch bounds and the wave guard.
//! Every field has a compile-time default, so an empty JSON object is a
//! valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// Runtime configuration shared by every handler through the context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoreConfig {
    /// Attempts after the first before an optimistic write gives up.
    pub max_retries: u32,

    /// Delay before the first retry; doubled on each further attempt.
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay.
    pub backoff_max_ms: u64,

    /// Maximum operations in one batch write.
    pub batch_write_limit: usize,

    /// Maximum operations in one multi-item transaction.
    pub transact_limit: usize,

    /// Waves the bus may run for a single `run` call before bailing out.
    pub max_waves: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 20,
            backoff_max_ms: 1_000,
            batch_write_limit: 25,
            transact_limit: 100,
            max_waves: 256,
        }
    }
}

impl CoreConfig {
    /// Parse a configuration from JSON; missing fields take defaults.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `RIPPLE_*` environment overrides on top of this configuration.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        self.max_retries = env_or("RIPPLE_MAX_RETRIES", self.max_retries);
        self.backoff_base_ms = env_or("RIPPLE_BACKOFF_BASE_MS", self.backoff_base_ms);
        self.backoff_max_ms = env_or("RIPPLE_BACKOFF_MAX_MS", self.backoff_max_ms);
        self.batch_write_limit = env_or("RIPPLE_BATCH_WRITE_LIMIT", self.batch_write_limit);
        self.transact_limit = env_or("RIPPLE_TRANSACT_LIMIT", self.transact_limit);
        self.max_waves = env_or("RIPPLE_MAX_WAVES", self.max_waves);
        self
    }

    /// Backoff delay before retry number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let millis = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.backoff_max_ms))
    }
}

fn env_or<T: std::str::FromStr + Copy>(name: &str, fallback: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, "ignoring unparseable override");
                fallback
            }
        },
        Err(_) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        let config = CoreConfig::from_json("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config = CoreConfig::from_json(r#"{"max_retries": 9}"#).unwrap();
        assert_eq!(config.max_retries, 9);
        assert_eq!(config.batch_write_limit, 25);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = CoreConfig {
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            ..CoreConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(10));
        assert_eq!(config.backoff(1), Duration::from_millis(20));
        assert_eq!(config.backoff(2), Duration::from_millis(40));
        assert_eq!(config.backoff(3), Duration::from_millis(50));
        assert_eq!(config.backoff(40), Duration::from_millis(50));
    }
}
