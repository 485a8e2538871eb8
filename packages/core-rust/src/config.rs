//! Configuration validation errors shared by every primitive.
//!
//! Configuration values are owned by a collaborator and arrive here as typed
//! structs. Each struct validates itself and reports the first offending
//! field by name.

use thiserror::Error;

/// Error raised when a configuration value cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("invalid configuration for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    /// A level name is not one of the canonical names.
    #[error("unknown policy level `{0}`")]
    UnknownLevel(String),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    #[must_use]
    pub fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}
