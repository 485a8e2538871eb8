//! Shared checkpoint state.

use std::collections::BTreeMap;

use bulwark_core::CheckpointManager;
use parking_lot::Mutex;

/// A [`CheckpointManager`] shared between replay runs and replicas.
///
/// Merges take the pointwise maximum, so concurrent sources may merge in any
/// order and still converge.
#[derive(Debug, Default)]
pub struct SharedCheckpoints {
    manager: Mutex<CheckpointManager>,
}

impl SharedCheckpoints {
    #[must_use]
    pub fn new(manager: CheckpointManager) -> Self {
        Self {
            manager: Mutex::new(manager),
        }
    }

    /// Returns `true` if the stream advanced.
    pub fn record(&self, stream_id: &str, sequence: u64) -> bool {
        self.manager.lock().record(stream_id, sequence)
    }

    pub fn merge(&self, other: &CheckpointManager) {
        self.manager.lock().merge(other);
    }

    #[must_use]
    pub fn last_sequence(&self, stream_id: &str) -> Option<u64> {
        self.manager.lock().last_sequence(stream_id)
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> CheckpointManager {
        self.manager.lock().clone()
    }

    #[must_use]
    pub fn streams(&self) -> BTreeMap<String, u64> {
        self.manager.lock().streams().clone()
    }
}
