//! Outbound audit sinks.
//!
//! Defines [`AuditSink`] for forwarding workflow audit entries to external
//! collaborators, and [`CompositeAuditSink`] which fans one entry out to many
//! sinks. Sinks are called after the engine lock is released, one entry at a
//! time in audit-log order.

use std::sync::Arc;

use bulwark_core::workflow::{AuditEntry, AuditKind};
use tracing::info;

/// Receiver of workflow audit entries.
///
/// Used as `Arc<dyn AuditSink<S>>`.
pub trait AuditSink<S>: Send + Sync {
    /// Called once per transition or rollback, in audit-log order.
    ///
    /// Must not call back into the workflow that issued the entry.
    fn on_audit(&self, entry: &AuditEntry<S>);
}

/// Sink that forwards to multiple sinks in registration order.
pub struct CompositeAuditSink<S> {
    sinks: Vec<Arc<dyn AuditSink<S>>>,
}

impl<S> Default for CompositeAuditSink<S> {
    fn default() -> Self {
        Self { sinks: Vec::new() }
    }
}

impl<S> CompositeAuditSink<S> {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn AuditSink<S>>>) -> Self {
        Self { sinks }
    }

    pub fn add(&mut self, sink: Arc<dyn AuditSink<S>>) {
        self.sinks.push(sink);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl<S> AuditSink<S> for CompositeAuditSink<S> {
    fn on_audit(&self, entry: &AuditEntry<S>) {
        for sink in &self.sinks {
            sink.on_audit(entry);
        }
    }
}

/// Writes every entry as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl<S: std::fmt::Display> AuditSink<S> for TracingAuditSink {
    fn on_audit(&self, entry: &AuditEntry<S>) {
        let kind = match entry.kind {
            AuditKind::Transition => "transition",
            AuditKind::Rollback => "rollback",
        };
        let record = &entry.record;
        info!(
            kind,
            entity_id = %record.entity_id,
            from = %record.from_state,
            to = %record.to_state,
            timestamp_ms = record.timestamp_ms,
            "workflow audit"
        );
    }
}
