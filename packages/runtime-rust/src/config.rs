//! Runtime configuration with lock-free reload.
//!
//! [`ResilienceConfig`] bundles the configuration of every primitive.
//! [`ConfigHandle`] publishes it through an `ArcSwap`: a reload builds and
//! validates a complete new value, then swaps the pointer, so a reader holds
//! either the old or the new configuration and never a mix of both.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bulwark_core::{
    AdmissionPolicy, CheckpointConfig, CircuitBreakerConfig, ConfigError, PolicyConfig,
    RateLimiterConfig,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ResilienceError;

/// Admission queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Load bands applied to the queue depth.
    pub policy: AdmissionPolicy,
    /// Queue depth treated as full capacity.
    pub queue_capacity: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            policy: AdmissionPolicy::default(),
            queue_capacity: 1024,
        }
    }
}

/// Background policy ticker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TickerConfig {
    /// Interval between two policy evaluations.
    pub tick_interval_ms: u64,
    /// Look-back window for rapid-escalation detection.
    pub rapid_window_ms: u64,
    /// Escalations within the window above which an alert is raised.
    pub rapid_escalation_count: usize,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            rapid_window_ms: 60_000,
            rapid_escalation_count: 2,
        }
    }
}

/// Configuration of every runtime component.
///
/// Top-level sections may be omitted and fall back to their defaults; a
/// section that is present must be complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimiterConfig,
    pub admission: AdmissionConfig,
    pub checkpoint: CheckpointConfig,
    pub policy: PolicyConfig,
    pub ticker: TickerConfig,
    /// Default window size for replay runs.
    pub replay_window: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimiterConfig::default(),
            admission: AdmissionConfig::default(),
            checkpoint: CheckpointConfig::default(),
            policy: PolicyConfig::default(),
            ticker: TickerConfig::default(),
            replay_window: 1_000,
        }
    }
}

impl ResilienceConfig {
    /// Validates every section, reporting the first offending field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate()?;
        self.rate_limit.validate()?;
        self.admission.policy.validate()?;
        self.checkpoint.validate()?;
        self.policy.validate()?;
        if self.admission.queue_capacity == 0 {
            return Err(ConfigError::invalid("admission.queue_capacity", "must be at least 1"));
        }
        if self.ticker.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("ticker.tick_interval_ms", "must be at least 1"));
        }
        if self.replay_window == 0 {
            return Err(ConfigError::invalid("replay_window", "must be at least 1"));
        }
        Ok(())
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// [`ResilienceError::ConfigFormat`] for malformed JSON or unknown keys,
    /// [`ResilienceError::Config`] for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ResilienceError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON file.
    ///
    /// # Errors
    ///
    /// [`ResilienceError::Internal`] if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_path(path: &Path) -> Result<Self, ResilienceError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        Self::from_json_str(&json)
    }
}

// ---------------------------------------------------------------------------
// ConfigHandle
// ---------------------------------------------------------------------------

/// Shared, atomically swappable configuration.
#[derive(Debug)]
pub struct ConfigHandle {
    current: ArcSwap<ResilienceConfig>,
}

impl ConfigHandle {
    /// # Errors
    ///
    /// Returns the validation error of an unusable configuration.
    pub fn new(config: ResilienceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            current: ArcSwap::from_pointee(config),
        })
    }

    /// Current configuration. The returned value stays valid after a reload.
    #[must_use]
    pub fn load(&self) -> Arc<ResilienceConfig> {
        self.current.load_full()
    }

    /// Replaces the configuration if `config` validates.
    ///
    /// # Errors
    ///
    /// Returns the validation error; the previous configuration stays live.
    pub fn reload(&self, config: ResilienceConfig) -> Result<(), ConfigError> {
        if let Err(err) = config.validate() {
            warn!(error = %err, "rejected configuration reload");
            return Err(err);
        }
        self.current.store(Arc::new(config));
        info!("configuration reloaded");
        Ok(())
    }

    /// Parses `json` and reloads from it.
    ///
    /// # Errors
    ///
    /// As [`ResilienceConfig::from_json_str`]; the previous configuration
    /// stays live on any error.
    pub fn reload_from_str(&self, json: &str) -> Result<(), ResilienceError> {
        let config: ResilienceConfig = serde_json::from_str(json)?;
        self.reload(config)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn valid() -> ResilienceConfig {
        ResilienceConfig {
            replay_window: 64,
            ..ResilienceConfig::default()
        }
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = ResilienceConfig::from_json_str("{}").unwrap();
        assert_eq!(config.breaker, CircuitBreakerConfig::default());
        assert_eq!(config.admission.queue_capacity, 1024);
    }

    #[test]
    fn unknown_section_is_rejected() {
        let err = ResilienceConfig::from_json_str(r#"{"breakers": {}}"#).unwrap_err();
        assert!(matches!(err, ResilienceError::ConfigFormat(_)));
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let json = r#"{"ticker": {"tick_interval_ms": 0, "rapid_window_ms": 1, "rapid_escalation_count": 1}}"#;
        let err = ResilienceConfig::from_json_str(json).unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::Config(ConfigError::Invalid { field: "ticker.tick_interval_ms", .. })
        ));
    }

    #[test]
    fn reload_swaps_whole_config() {
        let handle = ConfigHandle::new(valid()).unwrap();
        let before = handle.load();

        let mut next = valid();
        next.admission.queue_capacity = 8;
        next.breaker.failure_threshold = 1;
        handle.reload(next).unwrap();

        let after = handle.load();
        assert_eq!(after.admission.queue_capacity, 8);
        assert_eq!(after.breaker.failure_threshold, 1);
        // A reader that loaded earlier keeps a consistent old value.
        assert_eq!(before.admission.queue_capacity, 1024);
        assert_eq!(before.breaker.failure_threshold, 5);
    }

    #[test]
    fn invalid_reload_keeps_previous_config() {
        let handle = ConfigHandle::new(valid()).unwrap();
        let mut bad = valid();
        bad.rate_limit.burst_capacity = 0;
        assert!(handle.reload(bad).is_err());
        assert!(handle.reload_from_str("{not json").is_err());
        assert_eq!(*handle.load(), valid());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"replay_window": 16}}"#).unwrap();
        let config = ResilienceConfig::from_path(file.path()).unwrap();
        assert_eq!(config.replay_window, 16);
        assert!(ResilienceConfig::from_path(Path::new("/nonexistent/bulwark.json")).is_err());
    }
}
