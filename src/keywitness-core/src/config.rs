//! Configuration for the witness pipeline.
//!
//! All durations serialize as integer milliseconds. Missing fields take
//! their defaults, so a partial JSON file only needs the values it changes.

use std::path::Path;
use std::time::Duration;

use keywitness_anchor::SealPolicy;
use serde::{Deserialize, Serialize};

use crate::error::WitnessError;

/// Thresholds for the timing anomaly detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Intervals shorter than this are not humanly achievable.
    #[serde(with = "duration_ms")]
    pub min_human_interval: Duration,
    /// Two intervals closer than this count as identical.
    #[serde(with = "duration_ms")]
    pub identical_tolerance: Duration,
    /// Identical-interval run length that flags scripting.
    pub identical_run_threshold: u32,
    /// Intervals per pattern fingerprint.
    pub pattern_window: usize,
    /// Bucket width when fingerprinting patterns.
    #[serde(with = "duration_ms")]
    pub pattern_bucket: Duration,
    /// Fingerprint occurrences that flag a repeating pattern.
    pub pattern_repeat_threshold: u32,
    /// Intervals kept for the variance check.
    pub buffer_size: usize,
    /// Coefficient of variation below which timing is too regular.
    pub cv_threshold: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            min_human_interval: Duration::from_millis(20),
            identical_tolerance: Duration::from_millis(1),
            identical_run_threshold: 5,
            pattern_window: 8,
            pattern_bucket: Duration::from_millis(10),
            pattern_repeat_threshold: 3,
            buffer_size: 100,
            cv_threshold: 0.05,
        }
    }
}

/// Cross-source reconciliation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Reconciliation period.
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,
    /// Credit only reference-confirmed events.
    pub strict: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            strict: true,
        }
    }
}

/// Hardware trust binding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Advance the anchor's monotonic counter on every recorded event.
    pub use_hw_counter: bool,
    /// Take periodic signed quotes.
    pub use_attestation: bool,
    /// Seal the integrity key to the anchor at startup.
    pub seal_integrity_key: bool,
    /// Platform state seals and quotes are bound to.
    pub seal_policy: SealPolicy,
    /// Minimum time between periodic quotes.
    #[serde(with = "duration_ms")]
    pub quote_interval: Duration,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            use_hw_counter: true,
            use_attestation: true,
            seal_integrity_key: true,
            seal_policy: SealPolicy::default(),
            quote_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WitnessConfig {
    /// Timing analysis thresholds.
    pub timing: TimingConfig,
    /// Reconciliation settings.
    pub validator: ValidatorConfig,
    /// Hardware binding settings.
    pub binding: BindingConfig,
    /// Upper bound on waiting for a background task to exit.
    #[serde(with = "duration_ms")]
    pub stop_timeout: Duration,
    /// Bind the software anchor when no hardware anchor is available.
    /// Off by default: its quotes are not hardware-backed.
    pub allow_software_anchor: bool,
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            validator: ValidatorConfig::default(),
            binding: BindingConfig::default(),
            stop_timeout: Duration::from_secs(1),
            allow_software_anchor: false,
        }
    }
}

impl WitnessConfig {
    /// Parse configuration from JSON and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, WitnessError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WitnessError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Reject values that would disable a check or spin a task.
    pub fn validate(&self) -> Result<(), WitnessError> {
        let t = &self.timing;
        if t.identical_run_threshold == 0
            || t.pattern_window == 0
            || t.pattern_repeat_threshold == 0
            || t.buffer_size < 2
        {
            return Err(WitnessError::config("timing thresholds must be non-zero"));
        }
        if t.pattern_bucket.is_zero() {
            return Err(WitnessError::config("pattern_bucket must be non-zero"));
        }
        if !(t.cv_threshold.is_finite() && t.cv_threshold >= 0.0) {
            return Err(WitnessError::config("cv_threshold must be a finite non-negative number"));
        }
        if self.validator.tick_interval.is_zero() {
            return Err(WitnessError::config("validator.tick_interval must be non-zero"));
        }
        if self.binding.quote_interval.is_zero() {
            return Err(WitnessError::config("binding.quote_interval must be non-zero"));
        }
        Ok(())
    }
}

/// Serialize `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WitnessConfig::default();
        assert_eq!(config.timing.min_human_interval, Duration::from_millis(20));
        assert_eq!(config.validator.tick_interval, Duration::from_millis(50));
        assert!(config.validator.strict);
        assert_eq!(config.binding.seal_policy.pcrs, vec![0, 1, 7]);
        assert_eq!(config.binding.quote_interval, Duration::from_secs(300));
        assert!(!config.allow_software_anchor, "software anchor must be opt-in");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = WitnessConfig::from_json_str(
            r#"{ "validator": { "strict": false }, "timing": { "min_human_interval": 15 } }"#,
        )
        .unwrap();
        assert!(!config.validator.strict);
        assert_eq!(config.validator.tick_interval, Duration::from_millis(50));
        assert_eq!(config.timing.min_human_interval, Duration::from_millis(15));
    }

    #[test]
    fn test_roundtrip_json() {
        let config = WitnessConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(WitnessConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_zero_tick() {
        let err = WitnessConfig::from_json_str(r#"{ "validator": { "tick_interval": 0 } }"#);
        assert!(matches!(err, Err(WitnessError::ConfigError { .. })));
    }
}
