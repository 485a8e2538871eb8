//! Per-stream checkpoints with max-merge convergence.
//!
//! A checkpoint maps a stream id to the highest sequence known to be
//! processed. Recording and merging only ever move a stream forward, so
//! merges are commutative, associative and idempotent: replicas that replay
//! independently converge no matter in which order they exchange state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Default number of observed events between checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 100;

/// Per-instance checkpoint cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Events observed between two due checkpoints.
    pub interval: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

impl CheckpointConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::invalid("interval", "must be at least 1"));
        }
        Ok(())
    }
}

/// Highest processed sequence per stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointManager {
    config: CheckpointConfig,
    streams: BTreeMap<String, u64>,
    #[serde(default)]
    since_last_checkpoint: u64,
}

impl CheckpointManager {
    /// Manager with the default interval.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager with its own interval; sibling instances are unaffected.
    ///
    /// # Errors
    ///
    /// Returns the validation error of an unusable configuration.
    pub fn with_config(config: CheckpointConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    /// Returns this instance's configuration.
    #[must_use]
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Records `sequence` for `stream_id`, keeping the larger of the stored
    /// and the new value. Returns `true` if the checkpoint advanced.
    pub fn record(&mut self, stream_id: &str, sequence: u64) -> bool {
        match self.streams.get_mut(stream_id) {
            Some(current) if *current >= sequence => false,
            Some(current) => {
                *current = sequence;
                true
            }
            None => {
                self.streams.insert(stream_id.to_string(), sequence);
                true
            }
        }
    }

    /// Records an event and reports whether a checkpoint is now due.
    ///
    /// Every `interval`-th observed event makes a checkpoint due; the
    /// counter restarts afterwards.
    pub fn observe(&mut self, stream_id: &str, sequence: u64) -> bool {
        self.record(stream_id, sequence);
        self.since_last_checkpoint += 1;
        if self.since_last_checkpoint >= self.config.interval {
            self.since_last_checkpoint = 0;
            return true;
        }
        false
    }

    /// Last recorded sequence for a stream.
    #[must_use]
    pub fn last_sequence(&self, stream_id: &str) -> Option<u64> {
        self.streams.get(stream_id).copied()
    }

    /// Takes the pointwise maximum with `other`.
    ///
    /// Never lowers a stream and never adopts `other`'s interval.
    pub fn merge(&mut self, other: &CheckpointManager) {
        for (stream_id, &sequence) in &other.streams {
            self.record(stream_id, sequence);
        }
    }

    /// Pointwise maximum of two managers, keeping `a`'s configuration.
    #[must_use]
    pub fn merged(a: &CheckpointManager, b: &CheckpointManager) -> CheckpointManager {
        let mut out = a.clone();
        out.merge(b);
        out
    }

    /// Stream positions in stream-id order.
    #[must_use]
    pub fn streams(&self) -> &BTreeMap<String, u64> {
        &self.streams
    }

    /// Number of tracked streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns `true` when no stream has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
