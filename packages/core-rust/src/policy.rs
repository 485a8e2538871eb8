//! Graduated policy escalation.
//!
//! The system posture moves one step at a time along
//! `normal < watch < restricted < halted`. A failure burst above the current
//! level's escalation threshold tightens the posture; a run of recorded
//! successes reaching the current level's de-escalation threshold relaxes it.
//!
//! Thresholds are typed per-level fields. A configuration with a missing or
//! misspelled level key fails to deserialize, so no level can end up without
//! a way back down.
//!
//! Every evaluated burst is also kept in a bounded sample window so
//! collectors can see how bursty the system is below the thresholds.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::stats;

/// Evaluated failure bursts kept for [`PolicyEngine::burst_stats`].
pub const BURST_SAMPLE_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// PolicyLevel
// ---------------------------------------------------------------------------

/// System-wide response posture, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLevel {
    Normal,
    Watch,
    Restricted,
    Halted,
}

impl PolicyLevel {
    /// Every level in ascending order.
    pub const ALL: [PolicyLevel; 4] = [
        PolicyLevel::Normal,
        PolicyLevel::Watch,
        PolicyLevel::Restricted,
        PolicyLevel::Halted,
    ];

    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyLevel::Normal => "normal",
            PolicyLevel::Watch => "watch",
            PolicyLevel::Restricted => "restricted",
            PolicyLevel::Halted => "halted",
        }
    }

    /// The next stricter level, if any.
    #[must_use]
    pub fn escalated(self) -> Option<PolicyLevel> {
        match self {
            PolicyLevel::Normal => Some(PolicyLevel::Watch),
            PolicyLevel::Watch => Some(PolicyLevel::Restricted),
            PolicyLevel::Restricted => Some(PolicyLevel::Halted),
            PolicyLevel::Halted => None,
        }
    }

    /// The next more relaxed level, if any.
    #[must_use]
    pub fn deescalated(self) -> Option<PolicyLevel> {
        match self {
            PolicyLevel::Normal => None,
            PolicyLevel::Watch => Some(PolicyLevel::Normal),
            PolicyLevel::Restricted => Some(PolicyLevel::Watch),
            PolicyLevel::Halted => Some(PolicyLevel::Restricted),
        }
    }
}

impl fmt::Display for PolicyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyLevel {
    type Err = ConfigError;

    /// Accepts canonical names only; cosmetic aliases are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PolicyLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownLevel(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Failure burst above which each level escalates. `halted` has nowhere to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationThresholds {
    pub normal: u32,
    pub watch: u32,
    pub restricted: u32,
}

/// Consecutive successes that relax each level by one step. `normal` is the
/// floor and has no threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeescalationThresholds {
    pub watch: u32,
    pub restricted: u32,
    pub halted: u32,
}

/// Thresholds for a [`PolicyEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub escalation: EscalationThresholds,
    pub deescalation: DeescalationThresholds,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            escalation: EscalationThresholds {
                normal: 5,
                watch: 10,
                restricted: 20,
            },
            deescalation: DeescalationThresholds {
                watch: 3,
                restricted: 5,
                halted: 10,
            },
        }
    }
}

impl PolicyConfig {
    /// Escalation threshold of `level`; `None` for `halted`.
    #[must_use]
    pub fn escalation_threshold(&self, level: PolicyLevel) -> Option<u32> {
        match level {
            PolicyLevel::Normal => Some(self.escalation.normal),
            PolicyLevel::Watch => Some(self.escalation.watch),
            PolicyLevel::Restricted => Some(self.escalation.restricted),
            PolicyLevel::Halted => None,
        }
    }

    /// De-escalation threshold of `level`; `None` for `normal`.
    #[must_use]
    pub fn deescalation_threshold(&self, level: PolicyLevel) -> Option<u32> {
        match level {
            PolicyLevel::Normal => None,
            PolicyLevel::Watch => Some(self.deescalation.watch),
            PolicyLevel::Restricted => Some(self.deescalation.restricted),
            PolicyLevel::Halted => Some(self.deescalation.halted),
        }
    }

    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for a zero de-escalation threshold, which
    /// would relax a level without any evidence of recovery.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.deescalation;
        if d.watch == 0 || d.restricted == 0 || d.halted == 0 {
            return Err(ConfigError::invalid("deescalation", "thresholds must be at least 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What moved the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum ChangeCause {
    Escalation { failure_burst: u32 },
    Deescalation { successes: u32 },
}

/// One level change, appended to the engine history and handed to alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyChange {
    pub from: PolicyLevel,
    pub to: PolicyLevel,
    pub at_ms: u64,
    #[serde(flatten)]
    pub cause: ChangeCause,
}

impl PolicyChange {
    #[must_use]
    pub fn is_escalation(&self) -> bool {
        matches!(self.cause, ChangeCause::Escalation { .. })
    }
}

/// Result of [`PolicyEngine::evaluate_with_history`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EscalationReport {
    pub level: PolicyLevel,
    pub escalations_in_window: usize,
    pub rapid_escalation: bool,
}

/// Read-only view for observability collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicySnapshot {
    pub level: PolicyLevel,
    pub consecutive_successes: u32,
    pub last_escalation_at: Option<u64>,
    pub changes_total: usize,
}

/// Distribution of the most recent evaluated failure bursts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BurstStats {
    pub samples: usize,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
    pub p95: Option<f64>,
    pub max: Option<u32>,
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Escalation state machine.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: PolicyConfig,
    current_level: PolicyLevel,
    consecutive_successes: u32,
    last_escalation_at: Option<u64>,
    history: Vec<PolicyChange>,
    recent_bursts: VecDeque<u32>,
}

impl PolicyEngine {
    /// Engine starting at `normal`.
    ///
    /// # Errors
    ///
    /// Returns the validation error of an unusable configuration.
    pub fn new(config: PolicyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            current_level: PolicyLevel::Normal,
            consecutive_successes: 0,
            last_escalation_at: None,
            history: Vec::new(),
            recent_bursts: VecDeque::with_capacity(BURST_SAMPLE_CAPACITY),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    #[must_use]
    pub fn current_level(&self) -> PolicyLevel {
        self.current_level
    }

    #[must_use]
    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    #[must_use]
    pub fn last_escalation_at(&self) -> Option<u64> {
        self.last_escalation_at
    }

    /// Append-only record of level changes.
    #[must_use]
    pub fn history(&self) -> &[PolicyChange] {
        &self.history
    }

    /// Escalates one level when `failure_burst` exceeds the current level's
    /// threshold.
    ///
    /// A stable evaluation leaves `consecutive_successes` untouched; only an
    /// escalation clears it.
    pub fn evaluate(&mut self, failure_burst: u32, now_ms: u64) -> Option<PolicyChange> {
        if self.recent_bursts.len() == BURST_SAMPLE_CAPACITY {
            self.recent_bursts.pop_front();
        }
        self.recent_bursts.push_back(failure_burst);

        let threshold = self.config.escalation_threshold(self.current_level)?;
        if failure_burst <= threshold {
            return None;
        }
        let to = self.current_level.escalated()?;
        let change = PolicyChange {
            from: self.current_level,
            to,
            at_ms: now_ms,
            cause: ChangeCause::Escalation { failure_burst },
        };
        warn!(from = %change.from, to = %change.to, failure_burst, "policy escalated");
        self.current_level = to;
        self.consecutive_successes = 0;
        self.last_escalation_at = Some(now_ms);
        self.history.push(change);
        Some(change)
    }

    /// Counts a success and relaxes one level once the current level's
    /// threshold is reached (inclusive).
    pub fn record_success(&mut self, now_ms: u64) -> Option<PolicyChange> {
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        let threshold = self.config.deescalation_threshold(self.current_level)?;
        if self.consecutive_successes < threshold {
            return None;
        }
        let to = self.current_level.deescalated()?;
        let change = PolicyChange {
            from: self.current_level,
            to,
            at_ms: now_ms,
            cause: ChangeCause::Deescalation {
                successes: self.consecutive_successes,
            },
        };
        info!(from = %change.from, to = %change.to, "policy de-escalated");
        self.current_level = to;
        self.consecutive_successes = 0;
        self.history.push(change);
        Some(change)
    }

    /// Flags `rapid_escalation` when more than `rapid_escalation_count`
    /// escalations happened in the last `window_ms` milliseconds.
    #[must_use]
    pub fn evaluate_with_history(
        &self,
        window_ms: u64,
        rapid_escalation_count: usize,
        now_ms: u64,
    ) -> EscalationReport {
        let escalations_in_window = self
            .history
            .iter()
            .filter(|c| c.is_escalation() && now_ms.saturating_sub(c.at_ms) <= window_ms)
            .count();
        EscalationReport {
            level: self.current_level,
            escalations_in_window,
            rapid_escalation: escalations_in_window > rapid_escalation_count,
        }
    }

    /// Mean, spread and p95 over the last [`BURST_SAMPLE_CAPACITY`] bursts
    /// passed to [`evaluate`](Self::evaluate), escalating or not.
    #[must_use]
    pub fn burst_stats(&self) -> BurstStats {
        let samples: Vec<f64> = self.recent_bursts.iter().map(|&b| f64::from(b)).collect();
        BurstStats {
            samples: samples.len(),
            mean: stats::mean(&samples),
            std_dev: stats::std_dev(&samples),
            p95: stats::percentile(&samples, 95.0),
            max: self.recent_bursts.iter().copied().max(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            level: self.current_level,
            consecutive_successes: self.consecutive_successes,
            last_escalation_at: self.last_escalation_at,
            changes_total: self.history.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
