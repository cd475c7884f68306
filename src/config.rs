// ⚙️ Configuration - thresholds, windows and resilience knobs
//
// Layering: built-in defaults ← trust-unify.toml ← UNIFY_* environment.
// Example: UNIFY_MATCHING__MERGE_THRESHOLD=0.8

use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "trust-unify.toml";
pub const ENV_PREFIX: &str = "UNIFY_";

// ============================================================================
// MATCHING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Ledger merge threshold (default: 0.75)
    pub merge_threshold: f64,

    /// Pending queue: auto-merge at or above this score (default: 0.85)
    pub pending_auto_merge_threshold: f64,

    /// Pending queue: flag as possible duplicate at or above this score (default: 0.60)
    pub pending_flag_threshold: f64,

    /// Relative amount tolerance (default: 0.01 = 1%)
    pub amount_tolerance: Decimal,

    /// Date window in days on either side (default: 2)
    pub date_window_days: i64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig {
            merge_threshold: 0.75,
            pending_auto_merge_threshold: 0.85,
            pending_flag_threshold: 0.60,
            amount_tolerance: Decimal::new(1, 2),
            date_window_days: 2,
        }
    }
}

// ============================================================================
// RESILIENCE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive transient failures before the breaker opens (default: 5)
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before allowing a trial call (default: 300)
    pub recovery_timeout_secs: u64,

    /// Attempts per call, first try included (default: 3)
    pub retry_max_attempts: u32,

    /// First backoff delay, doubled on each retry (default: 500ms)
    pub retry_base_delay_ms: u64,

    /// Backoff ceiling (default: 30s)
    pub retry_max_delay_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 300,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl ResilienceConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

// ============================================================================
// DATABASE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: "trust-unify.db".to_string(),
        }
    }
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifyConfig {
    pub matching: MatchingConfig,
    pub resilience: ResilienceConfig,
    pub database: DatabaseConfig,
}

impl UnifyConfig {
    /// Load from `trust-unify.toml` (if present) and `UNIFY_*` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config: UnifyConfig = Figment::from(Serialized::defaults(UnifyConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.matching;
        for (name, value) in [
            ("merge_threshold", m.merge_threshold),
            ("pending_auto_merge_threshold", m.pending_auto_merge_threshold),
            ("pending_flag_threshold", m.pending_flag_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("matching.{} must be within [0, 1], got {}", name, value);
            }
        }
        if m.pending_flag_threshold > m.pending_auto_merge_threshold {
            bail!("matching.pending_flag_threshold must not exceed pending_auto_merge_threshold");
        }
        if m.amount_tolerance.is_sign_negative() {
            bail!("matching.amount_tolerance must not be negative");
        }
        if m.date_window_days < 0 {
            bail!("matching.date_window_days must not be negative");
        }

        let r = &self.resilience;
        if r.retry_max_attempts == 0 {
            bail!("resilience.retry_max_attempts must be at least 1");
        }
        if r.failure_threshold == 0 {
            bail!("resilience.failure_threshold must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let config = UnifyConfig::default();

        assert_eq!(config.matching.merge_threshold, 0.75);
        assert_eq!(config.matching.pending_auto_merge_threshold, 0.85);
        assert_eq!(config.matching.pending_flag_threshold, 0.60);
        assert_eq!(config.matching.amount_tolerance, dec!(0.01));
        assert_eq!(config.matching.date_window_days, 2);
        assert_eq!(config.resilience.failure_threshold, 5);
        assert_eq!(config.resilience.recovery_timeout(), Duration::from_secs(300));
        assert_eq!(config.resilience.retry_max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = UnifyConfig::load_from(Path::new("does-not-exist.toml")).unwrap();
        assert_eq!(config.matching, MatchingConfig::default());
    }

    #[test]
    fn test_validate_rejects_inverted_pending_band() {
        let mut config = UnifyConfig::default();
        config.matching.pending_flag_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let mut config = UnifyConfig::default();
        config.matching.merge_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = UnifyConfig::default();
        config.resilience.retry_max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
