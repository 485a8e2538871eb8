//! Shared workflow engine with audit fan-out.

use std::sync::Arc;

use bulwark_core::workflow::{
    AuditEntry, AuditKind, LifecycleState, TransitionOutcome, TransitionRecord, WorkflowEngine,
    WorkflowError, WorkflowStats,
};
use bulwark_core::ClockSource;
use parking_lot::Mutex;

use crate::observability;
use crate::sink::AuditSink;

/// A [`WorkflowEngine`] shared between tasks.
///
/// Audit entries reach the sink in audit-log order. A committer takes the
/// publish guard before it releases the engine lock and keeps it while the
/// sink runs, so a later commit cannot overtake an earlier one. Sinks must
/// not call back into the workflow that notifies them.
pub struct SharedWorkflow<S: LifecycleState> {
    engine: Mutex<WorkflowEngine<S>>,
    publish_order: Mutex<()>,
    clock: Arc<dyn ClockSource>,
    sink: Arc<dyn AuditSink<S>>,
}

impl<S: LifecycleState> SharedWorkflow<S> {
    #[must_use]
    pub fn new(
        engine: WorkflowEngine<S>,
        clock: Arc<dyn ClockSource>,
        sink: Arc<dyn AuditSink<S>>,
    ) -> Self {
        Self {
            engine: Mutex::new(engine),
            publish_order: Mutex::new(()),
            clock,
            sink,
        }
    }

    /// # Errors
    ///
    /// [`WorkflowError::DuplicateEntity`] or [`WorkflowError::UnknownState`].
    pub fn register(&self, entity_id: &str, initial_state: S) -> Result<(), WorkflowError<S>> {
        self.engine.lock().register(entity_id, initial_state)
    }

    /// Transitions one entity, then notifies the audit sink.
    ///
    /// # Errors
    ///
    /// As [`WorkflowEngine::transition`].
    pub fn transition(
        &self,
        entity_id: &str,
        target: S,
    ) -> Result<TransitionRecord<S>, WorkflowError<S>> {
        let now_ms = self.clock.now();
        let mut engine = self.engine.lock();
        let record = engine.transition(entity_id, target, now_ms)?;
        let order = self.publish_order.lock();
        drop(engine);
        self.publish(AuditKind::Transition, &record);
        drop(order);
        Ok(record)
    }

    /// Transitions every id under one lock acquisition; one outcome per id.
    pub fn bulk_transition<I>(&self, entity_ids: I, target: S) -> Vec<TransitionOutcome<S>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let now_ms = self.clock.now();
        let mut engine = self.engine.lock();
        let outcomes = engine.bulk_transition(entity_ids, target, now_ms);
        let order = self.publish_order.lock();
        drop(engine);
        for record in outcomes.iter().filter_map(|o| o.result.as_ref().ok()) {
            self.publish(AuditKind::Transition, record);
        }
        drop(order);
        outcomes
    }

    /// # Errors
    ///
    /// As [`WorkflowEngine::rollback_last_transition`].
    pub fn rollback_last_transition(
        &self,
        entity_id: &str,
    ) -> Result<TransitionRecord<S>, WorkflowError<S>> {
        let now_ms = self.clock.now();
        let mut engine = self.engine.lock();
        let record = engine.rollback_last_transition(entity_id, now_ms)?;
        let order = self.publish_order.lock();
        drop(engine);
        self.publish(AuditKind::Rollback, &record);
        drop(order);
        Ok(record)
    }

    #[must_use]
    pub fn get_state(&self, entity_id: &str) -> Option<S> {
        self.engine.lock().get_state(entity_id)
    }

    /// Checks, without mutating, that `entity_id` exists and may move to
    /// `target`.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::UnknownEntity`] or [`WorkflowError::InvalidTransition`].
    pub fn ensure_can_transition(&self, entity_id: &str, target: S) -> Result<(), WorkflowError<S>> {
        let engine = self.engine.lock();
        let Some(from) = engine.get_state(entity_id) else {
            return Err(WorkflowError::UnknownEntity(entity_id.to_string()));
        };
        if engine.graph().can_transition(from, target) {
            Ok(())
        } else {
            Err(WorkflowError::InvalidTransition {
                entity_id: entity_id.to_string(),
                from,
                to: target,
            })
        }
    }

    /// Copy of an entity's history.
    #[must_use]
    pub fn history(&self, entity_id: &str) -> Option<Vec<TransitionRecord<S>>> {
        self.engine.lock().history(entity_id).map(<[_]>::to_vec)
    }

    #[must_use]
    pub fn stats(&self) -> WorkflowStats {
        self.engine.lock().stats()
    }

    /// Runs a read-only closure against the engine under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&WorkflowEngine<S>) -> R) -> R {
        f(&self.engine.lock())
    }

    fn publish(&self, kind: AuditKind, record: &TransitionRecord<S>) {
        observability::record_workflow_transition(match kind {
            AuditKind::Transition => "transition",
            AuditKind::Rollback => "rollback",
        });
        self.sink.on_audit(&AuditEntry {
            kind,
            record: record.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use bulwark_core::{DispatchState, ManualClock};

    use super::*;
    use crate::sink::tests::RecordingSink;

    fn shared() -> (Arc<SharedWorkflow<DispatchState>>, Arc<RecordingSink<DispatchState>>) {
        let sink = Arc::new(RecordingSink::default());
        let workflow = SharedWorkflow::new(
            WorkflowEngine::dispatch(),
            Arc::new(ManualClock::new(1_000)),
            sink.clone(),
        );
        (Arc::new(workflow), sink)
    }

    #[test]
    fn transitions_reach_the_sink() {
        let (wf, sink) = shared();
        wf.register("truck-1", DispatchState::Queued).unwrap();
        let record = wf.transition("truck-1", DispatchState::Allocated).unwrap();
        assert_eq!(record.timestamp_ms, 1_000);
        wf.rollback_last_transition("truck-1").unwrap();

        let kinds: Vec<_> = sink.entries.lock().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditKind::Transition, AuditKind::Rollback]);
        assert_eq!(wf.get_state("truck-1"), Some(DispatchState::Queued));
    }

    #[test]
    fn rejected_transition_is_not_audited() {
        let (wf, sink) = shared();
        wf.register("truck-1", DispatchState::Queued).unwrap();
        assert!(wf.transition("truck-1", DispatchState::Arrived).is_err());
        assert!(sink.entries.lock().is_empty());
    }

    #[test]
    fn bulk_reports_per_item_and_audits_successes() {
        let (wf, sink) = shared();
        wf.register("a", DispatchState::Queued).unwrap();
        wf.register("b", DispatchState::Departed).unwrap();
        let outcomes = wf.bulk_transition(["a", "b", "ghost"], DispatchState::Allocated);
        let ok: Vec<_> = outcomes.iter().map(TransitionOutcome::is_success).collect();
        assert_eq!(ok, vec![true, false, false]);
        assert_eq!(sink.entries.lock().len(), 1);
    }

    #[test]
    fn ensure_can_transition_does_not_mutate() {
        let (wf, _) = shared();
        wf.register("a", DispatchState::Queued).unwrap();
        assert!(wf.ensure_can_transition("a", DispatchState::Allocated).is_ok());
        assert!(wf.ensure_can_transition("a", DispatchState::Arrived).is_err());
        assert!(matches!(
            wf.ensure_can_transition("nope", DispatchState::Allocated),
            Err(WorkflowError::UnknownEntity(_))
        ));
        assert_eq!(wf.get_state("a"), Some(DispatchState::Queued));
    }

    /// Stalls on entries that move into `stall_on`.
    struct StallingSink {
        stall_on: DispatchState,
        seen: Mutex<Vec<DispatchState>>,
    }

    impl AuditSink<DispatchState> for StallingSink {
        fn on_audit(&self, entry: &AuditEntry<DispatchState>) {
            if entry.record.to_state == self.stall_on {
                thread::sleep(Duration::from_millis(200));
            }
            self.seen.lock().push(entry.record.to_state);
        }
    }

    #[test]
    fn slow_sink_sees_commits_in_audit_log_order() {
        let sink = Arc::new(StallingSink {
            stall_on: DispatchState::Allocated,
            seen: Mutex::new(Vec::new()),
        });
        let wf = Arc::new(SharedWorkflow::new(
            WorkflowEngine::dispatch(),
            Arc::new(ManualClock::new(0)),
            sink.clone(),
        ));
        wf.register("t", DispatchState::Queued).unwrap();

        let first = {
            let wf = Arc::clone(&wf);
            thread::spawn(move || wf.transition("t", DispatchState::Allocated).unwrap())
        };
        while wf.get_state("t") != Some(DispatchState::Allocated) {
            thread::yield_now();
        }
        wf.transition("t", DispatchState::Departed).unwrap();
        first.join().unwrap();

        let logged: Vec<_> = wf.read(|engine| {
            engine
                .audit_log()
                .iter()
                .map(|entry| entry.record.to_state)
                .collect()
        });
        assert_eq!(logged, vec![DispatchState::Allocated, DispatchState::Departed]);
        assert_eq!(*sink.seen.lock(), logged);
    }

    #[test]
    fn concurrent_transitions_admit_exactly_one_winner() {
        let (wf, sink) = shared();
        wf.register("truck-1", DispatchState::Queued).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let wf = Arc::clone(&wf);
                thread::spawn(move || wf.transition("truck-1", DispatchState::Allocated).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(wf.history("truck-1").unwrap().len(), 1);
        assert_eq!(sink.entries.lock().len(), 1);
    }
}
