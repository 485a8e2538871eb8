//! Deterministic event replay for disaster recovery.
//!
//! Replay reduces an event log to exactly one authoritative event per entity:
//!
//! - the higher `sequence` wins;
//! - at equal `sequence` the later-arriving event wins (last-write-wins);
//! - output is sorted ascending by `sequence`, ties by entity id.
//!
//! The reduction is idempotent, and replaying window by window then
//! reducing the concatenated window winners yields the same result as
//! replaying the whole log at once.
//!
//! A malformed event aborts the whole run: replay never returns partial
//! state.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CheckpointManager;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A validated event. Sequences are assigned per entity by the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event<P> {
    pub entity_id: String,
    pub sequence: u64,
    pub payload: P,
}

impl<P> Event<P> {
    pub fn new(entity_id: impl Into<String>, sequence: u64, payload: P) -> Self {
        Self {
            entity_id: entity_id.into(),
            sequence,
            payload,
        }
    }
}

/// Event as delivered by a collaborator, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent<P> {
    #[serde(default, alias = "id")]
    pub entity_id: Option<String>,
    #[serde(default, alias = "seq")]
    pub sequence: Option<u64>,
    pub payload: P,
}

/// Error that aborts a replay run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("replay inconsistency: event at position {position} has no entity id")]
    MissingEntityId { position: usize },
    #[error("replay inconsistency: event at position {position} for `{entity_id}` has no sequence")]
    MissingSequence { position: usize, entity_id: String },
    #[error("replay window size must be at least 1")]
    InvalidWindow,
}

impl ReplayError {
    /// Moves the reported position by `offset`, for errors raised on a
    /// window of a larger log.
    #[must_use]
    pub fn shifted(self, offset: usize) -> Self {
        match self {
            Self::MissingEntityId { position } => Self::MissingEntityId {
                position: position + offset,
            },
            Self::MissingSequence {
                position,
                entity_id,
            } => Self::MissingSequence {
                position: position + offset,
                entity_id,
            },
            Self::InvalidWindow => Self::InvalidWindow,
        }
    }
}

impl<P> RawEvent<P> {
    /// Validates the event found at `position` in its log.
    ///
    /// # Errors
    ///
    /// [`ReplayError::MissingEntityId`] for an absent or empty id,
    /// [`ReplayError::MissingSequence`] for an absent sequence.
    pub fn validate(self, position: usize) -> Result<Event<P>, ReplayError> {
        let entity_id = match self.entity_id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(ReplayError::MissingEntityId { position }),
        };
        let Some(sequence) = self.sequence else {
            return Err(ReplayError::MissingSequence {
                position,
                entity_id,
            });
        };
        Ok(Event {
            entity_id,
            sequence,
            payload: self.payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Reduces `events` (in arrival order) to one winner per entity.
///
/// # Errors
///
/// [`ReplayError::MissingEntityId`] if any event has an empty id.
pub fn replay<P>(events: impl IntoIterator<Item = Event<P>>) -> Result<Vec<Event<P>>, ReplayError> {
    let mut winners: HashMap<String, Event<P>> = HashMap::new();
    for (position, event) in events.into_iter().enumerate() {
        if event.entity_id.is_empty() {
            return Err(ReplayError::MissingEntityId { position });
        }
        match winners.entry(event.entity_id.clone()) {
            Entry::Occupied(mut slot) => {
                // `>=`: equal sequences go to the later arrival.
                if event.sequence >= slot.get().sequence {
                    slot.insert(event);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(event);
            }
        }
    }

    let mut out: Vec<Event<P>> = winners.into_values().collect();
    out.sort_by(|a, b| {
        a.sequence
            .cmp(&b.sequence)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    Ok(out)
}

/// Validates every raw event, then replays them.
///
/// # Errors
///
/// The first validation error; no events are replayed in that case.
pub fn replay_raw<P>(events: Vec<RawEvent<P>>) -> Result<Vec<Event<P>>, ReplayError> {
    let validated = events
        .into_iter()
        .enumerate()
        .map(|(position, raw)| raw.validate(position))
        .collect::<Result<Vec<_>, _>>()?;
    replay(validated)
}

/// Replays fixed-size windows independently, then reduces across windows.
///
/// # Errors
///
/// [`ReplayError::InvalidWindow`] for a zero window; otherwise the first
/// validation error, with its position relative to the whole log.
pub fn replay_windowed<P>(
    events: Vec<Event<P>>,
    window_size: usize,
) -> Result<Vec<Event<P>>, ReplayError> {
    if window_size == 0 {
        return Err(ReplayError::InvalidWindow);
    }
    let mut carried = Vec::new();
    let mut offset = 0;
    let mut iter = events.into_iter().peekable();
    while iter.peek().is_some() {
        let window: Vec<Event<P>> = iter.by_ref().take(window_size).collect();
        // Window winners are appended in window order, so a later window
        // still counts as a later arrival in the final reduction.
        carried.extend(replay(window).map_err(|e| e.shifted(offset))?);
        offset += window_size;
    }
    replay(carried)
}

// ---------------------------------------------------------------------------
// ReplayEngine
// ---------------------------------------------------------------------------

/// Result of one checkpoint-aware replay run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayOutcome<P> {
    /// One winning event per entity, ascending by sequence.
    pub winners: Vec<Event<P>>,
    /// Events at or below their stream's checkpoint, already recovered.
    pub skipped_stale: usize,
    /// Checkpoints that became due while recording the winners.
    pub checkpoints_due: usize,
}

/// Replays event logs on top of a [`CheckpointManager`].
///
/// Each entity id is its own stream. Events at or below the stream's
/// checkpoint were recovered by an earlier run and are skipped; winners
/// advance the checkpoints only once the whole run has succeeded.
#[derive(Debug, Clone, Default)]
pub struct ReplayEngine {
    checkpoints: CheckpointManager,
}

impl ReplayEngine {
    #[must_use]
    pub fn new(checkpoints: CheckpointManager) -> Self {
        Self { checkpoints }
    }

    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    #[must_use]
    pub fn into_checkpoints(self) -> CheckpointManager {
        self.checkpoints
    }

    /// Replays `events`, skipping already-recovered ones.
    ///
    /// # Errors
    ///
    /// [`ReplayError::MissingEntityId`] if any event is malformed; the
    /// checkpoints are left untouched in that case.
    pub fn apply<P>(&mut self, events: Vec<Event<P>>) -> Result<ReplayOutcome<P>, ReplayError> {
        if let Some(position) = events.iter().position(|e| e.entity_id.is_empty()) {
            return Err(ReplayError::MissingEntityId { position });
        }

        let total = events.len();
        let fresh: Vec<Event<P>> = events
            .into_iter()
            .filter(|e| {
                self.checkpoints
                    .last_sequence(&e.entity_id)
                    .map_or(true, |checkpoint| e.sequence > checkpoint)
            })
            .collect();
        let skipped_stale = total - fresh.len();

        let winners = replay(fresh)?;
        let checkpoints_due = winners
            .iter()
            .filter(|e| self.checkpoints.observe(&e.entity_id, e.sequence))
            .count();

        Ok(ReplayOutcome {
            winners,
            skipped_stale,
            checkpoints_due,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
