//! Ratio-based admission control.
//!
//! Decisions compare `current_load / max_capacity` against load bands rather
//! than absolute numbers, so one policy serves pools of any size. Each band
//! caps the priority it still admits: priority `1` is the most important
//! work, larger numbers are progressively more sheddable.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// A load band: at or above `min_ratio`, only work with
/// `priority <= max_priority` is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadBand {
    pub min_ratio: f64,
    pub max_priority: u32,
}

/// Why a request was shed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ShedReason {
    /// The pool has no capacity at all.
    NoCapacity,
    /// Load reached the hard limit; nothing is admitted.
    HardLimit { load_ratio: f64 },
    /// The request's priority is above the band's ceiling.
    PriorityTooLow {
        load_ratio: f64,
        priority: u32,
        max_priority: u32,
    },
}

impl fmt::Display for ShedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCapacity => f.write_str("no capacity"),
            Self::HardLimit { load_ratio } => write!(f, "hard limit reached at load {load_ratio:.2}"),
            Self::PriorityTooLow {
                load_ratio,
                priority,
                max_priority,
            } => write!(
                f,
                "priority {priority} above ceiling {max_priority} at load {load_ratio:.2}"
            ),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admit,
    Shed(ShedReason),
}

impl AdmissionDecision {
    /// Returns `true` for [`AdmissionDecision::Admit`].
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Load bands plus the ratio at which everything is shed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionPolicy {
    /// At or above this ratio every request is shed.
    pub hard_limit_ratio: f64,
    /// Bands in any order; the highest band not above the load applies.
    pub bands: Vec<LoadBand>,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            hard_limit_ratio: 1.0,
            bands: vec![
                LoadBand {
                    min_ratio: 0.75,
                    max_priority: 4,
                },
                LoadBand {
                    min_ratio: 0.9,
                    max_priority: 2,
                },
            ],
        }
    }
}

impl AdmissionPolicy {
    /// Checks ratios are finite, positive and below the hard limit.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.hard_limit_ratio.is_finite() || self.hard_limit_ratio <= 0.0 {
            return Err(ConfigError::invalid(
                "hard_limit_ratio",
                "must be a finite ratio greater than 0",
            ));
        }
        for band in &self.bands {
            if !band.min_ratio.is_finite()
                || band.min_ratio < 0.0
                || band.min_ratio > self.hard_limit_ratio
            {
                return Err(ConfigError::invalid(
                    "bands.min_ratio",
                    "must lie between 0 and hard_limit_ratio",
                ));
            }
        }
        Ok(())
    }

    /// Decides whether work of `priority` is admitted at the given load.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn decide(&self, current_load: u64, max_capacity: u64, priority: u32) -> AdmissionDecision {
        if max_capacity == 0 {
            return AdmissionDecision::Shed(ShedReason::NoCapacity);
        }
        let load_ratio = current_load as f64 / max_capacity as f64;
        if load_ratio >= self.hard_limit_ratio {
            return AdmissionDecision::Shed(ShedReason::HardLimit { load_ratio });
        }

        let band = self
            .bands
            .iter()
            .filter(|band| load_ratio >= band.min_ratio)
            .max_by(|a, b| a.min_ratio.total_cmp(&b.min_ratio));

        match band {
            Some(band) if priority > band.max_priority => {
                AdmissionDecision::Shed(ShedReason::PriorityTooLow {
                    load_ratio,
                    priority,
                    max_priority: band.max_priority,
                })
            }
            _ => AdmissionDecision::Admit,
        }
    }
}

/// Admission check under the default policy.
#[must_use]
pub fn admission_control(current_load: u64, max_capacity: u64, priority: u32) -> AdmissionDecision {
    AdmissionPolicy::default().decide(current_load, max_capacity, priority)
}

/// Queue-depth shedding: the limit itself already sheds.
#[must_use]
pub fn should_shed(depth: usize, hard_limit: usize) -> bool {
    depth >= hard_limit
}
