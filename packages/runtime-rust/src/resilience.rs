//! `ResilienceCore`: one handle over every runtime component.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use bulwark_core::{
    BurstStats, CheckpointManager, CircuitBreakerSnapshot, ClockSource, LifecycleState, PolicySnapshot,
    TransitionRecord, WorkflowEngine, WorkflowGraph, WorkflowStats,
};
use serde::Serialize;
use tracing::{info_span, warn, Instrument};

use crate::admission::AdmissionController;
use crate::config::{ConfigHandle, ResilienceConfig};
use crate::engine::{BreakerRegistry, SharedCheckpoints, SharedPolicy, SharedWorkflow};
use crate::error::ResilienceError;
use crate::replay::ReplayWorker;
use crate::sink::AuditSink;
use crate::ticker::{PolicySignal, PolicyTicker};
use crate::worker::BackgroundWorker;

/// Observability snapshot of every component.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceSnapshot {
    pub workflow: WorkflowStats,
    pub breakers: BTreeMap<String, CircuitBreakerSnapshot>,
    pub policy: PolicySnapshot,
    /// Recent failure bursts seen by the policy ticker.
    pub failure_bursts: BurstStats,
    pub checkpoints: BTreeMap<String, u64>,
}

/// Composes the workflow engine, breakers, policy ticker and checkpoints.
pub struct ResilienceCore<S: LifecycleState> {
    config: Arc<ConfigHandle>,
    clock: Arc<dyn ClockSource>,
    workflow: Arc<SharedWorkflow<S>>,
    breakers: BreakerRegistry,
    policy: Arc<SharedPolicy>,
    checkpoints: Arc<SharedCheckpoints>,
    ticker: BackgroundWorker<PolicyTicker>,
}

impl<S: LifecycleState> ResilienceCore<S> {
    /// Builds every component and starts the policy ticker. Must be called
    /// inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ResilienceError::Config`] if `config` does not validate.
    pub fn new(
        graph: WorkflowGraph<S>,
        config: ResilienceConfig,
        clock: Arc<dyn ClockSource>,
        sink: Arc<dyn AuditSink<S>>,
    ) -> Result<Self, ResilienceError> {
        let checkpoint_config = config.checkpoint;
        let policy_config = config.policy;
        let config = Arc::new(ConfigHandle::new(config)?);

        let workflow = Arc::new(SharedWorkflow::new(
            WorkflowEngine::new(graph),
            Arc::clone(&clock),
            sink,
        ));
        let breakers = BreakerRegistry::new(Arc::clone(&config), Arc::clone(&clock));
        let policy = Arc::new(SharedPolicy::new(policy_config, Arc::clone(&clock))?);
        let checkpoints = Arc::new(SharedCheckpoints::new(CheckpointManager::with_config(
            checkpoint_config,
        )?));
        let ticker = PolicyTicker::new(Arc::clone(&policy), Arc::clone(&config)).spawn();

        Ok(Self {
            config,
            clock,
            workflow,
            breakers,
            policy,
            checkpoints,
            ticker,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    #[must_use]
    pub fn workflow(&self) -> &Arc<SharedWorkflow<S>> {
        &self.workflow
    }

    #[must_use]
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<SharedPolicy> {
        &self.policy
    }

    #[must_use]
    pub fn checkpoints(&self) -> &Arc<SharedCheckpoints> {
        &self.checkpoints
    }

    /// Replay worker writing into this core's checkpoints.
    #[must_use]
    pub fn replay_worker(&self) -> ReplayWorker {
        ReplayWorker::new(Arc::clone(&self.checkpoints))
    }

    /// Admission controller sharing this core's configuration and clock.
    ///
    /// # Errors
    ///
    /// [`ResilienceError::Config`] for an unusable rate limiter section.
    pub fn admission<T: Send + 'static>(
        &self,
    ) -> Result<AdmissionController<T>, ResilienceError> {
        Ok(AdmissionController::new(
            Arc::clone(&self.config),
            Arc::clone(&self.clock),
        )?)
    }

    /// Runs one workflow step that depends on `dependency`.
    ///
    /// The transition is checked first, so a step that could never commit
    /// does not spend a call. The call goes through the dependency's breaker;
    /// on success the entity moves to `target`, on failure the policy ticker
    /// receives a failure signal. Dropping the returned future before `call`
    /// completes records nothing and hands back a half-open probe slot.
    ///
    /// # Errors
    ///
    /// [`ResilienceError::UnknownEntity`] or
    /// [`ResilienceError::InvalidTransition`] before the call,
    /// [`ResilienceError::Breaker`] when the breaker rejects it,
    /// [`ResilienceError::Dependency`] when `call` fails.
    pub async fn execute_step<T, E, F>(
        &self,
        entity_id: &str,
        dependency: &str,
        target: S,
        call: F,
    ) -> Result<(T, TransitionRecord<S>), ResilienceError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let span = info_span!("execute_step", entity_id, dependency, target = %target);
        async move {
            self.workflow.ensure_can_transition(entity_id, target)?;
            let breaker = self.breakers.get_or_create(dependency)?;
            let permit = breaker.try_acquire()?;

            match call.await {
                Ok(value) => {
                    permit.success();
                    self.signal(PolicySignal::Success).await;
                    let record = self.workflow.transition(entity_id, target)?;
                    Ok((value, record))
                }
                Err(err) => {
                    permit.failure();
                    self.signal(PolicySignal::Failure).await;
                    Err(ResilienceError::Dependency(err.into()))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Feeds an outcome observed outside [`execute_step`](Self::execute_step)
    /// to the policy ticker.
    pub async fn signal(&self, signal: PolicySignal) {
        if let Err(err) = self.ticker.submit(signal).await {
            warn!(error = %err, ?signal, "policy signal dropped");
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ResilienceSnapshot {
        ResilienceSnapshot {
            workflow: self.workflow.stats(),
            breakers: self.breakers.snapshots(),
            policy: self.policy.snapshot(),
            failure_bursts: self.policy.burst_stats(),
            checkpoints: self.checkpoints.streams(),
        }
    }

    /// Stops the policy ticker after it handled every queued signal.
    pub async fn shutdown(&mut self) {
        self.ticker.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bulwark_core::{
        AuditKind, CircuitBreakerConfig, CircuitState, DispatchState, Event, ManualClock,
        PolicyLevel,
    };
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::sink::tests::RecordingSink;

    struct Fixture {
        core: ResilienceCore<DispatchState>,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingSink<DispatchState>>,
    }

    fn fixture() -> Fixture {
        let mut config = ResilienceConfig::default();
        config.breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout_ms: 1_000,
            max_half_open_requests: 1,
        };
        config.ticker.tick_interval_ms = 100;
        let clock = Arc::new(ManualClock::new(0));
        let sink = Arc::new(RecordingSink::default());
        let core = ResilienceCore::new(
            WorkflowGraph::dispatch(),
            config,
            clock.clone(),
            sink.clone(),
        )
        .unwrap();
        Fixture { core, clock, sink }
    }

    async fn ok() -> Result<u32, anyhow::Error> {
        Ok(42)
    }

    async fn fail() -> Result<u32, anyhow::Error> {
        Err(anyhow::anyhow!("dependency down"))
    }

    #[tokio::test]
    async fn successful_step_transitions_and_audits() {
        let f = fixture();
        f.core.workflow().register("truck-1", DispatchState::Queued).unwrap();

        let (value, record) = f
            .core
            .execute_step("truck-1", "fleet-api", DispatchState::Allocated, ok())
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(record.to_state, DispatchState::Allocated);
        assert_eq!(f.sink.entries.lock()[0].kind, AuditKind::Transition);
        assert_eq!(
            f.core.breakers().get("fleet-api").unwrap().state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn invalid_step_never_calls_the_dependency() {
        let f = fixture();
        f.core.workflow().register("truck-1", DispatchState::Queued).unwrap();
        let err = f
            .core
            .execute_step("truck-1", "fleet-api", DispatchState::Arrived, ok())
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::InvalidTransition { .. }));
        assert!(f.core.breakers().is_empty());

        let err = f
            .core
            .execute_step("ghost", "fleet-api", DispatchState::Allocated, ok())
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::UnknownEntity(_)));
    }

    #[tokio::test]
    async fn failures_open_the_breaker_and_leave_state_alone() {
        let f = fixture();
        f.core.workflow().register("truck-1", DispatchState::Queued).unwrap();

        for _ in 0..2 {
            let err = f
                .core
                .execute_step("truck-1", "fleet-api", DispatchState::Allocated, fail())
                .await
                .unwrap_err();
            assert!(matches!(err, ResilienceError::Dependency(_)));
        }
        let err = f
            .core
            .execute_step("truck-1", "fleet-api", DispatchState::Allocated, ok())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            f.core.workflow().get_state("truck-1"),
            Some(DispatchState::Queued)
        );

        f.clock.advance(1_000);
        f.core
            .execute_step("truck-1", "fleet-api", DispatchState::Allocated, ok())
            .await
            .unwrap();
        assert_eq!(
            f.core.workflow().get_state("truck-1"),
            Some(DispatchState::Allocated)
        );
    }

    #[tokio::test]
    async fn abandoned_half_open_step_does_not_block_the_dependency() {
        let f = fixture();
        f.core.workflow().register("truck-1", DispatchState::Queued).unwrap();
        for _ in 0..2 {
            f.core
                .execute_step("truck-1", "fleet-api", DispatchState::Allocated, fail())
                .await
                .unwrap_err();
        }
        f.clock.advance(1_000);

        let never = std::future::pending::<Result<u32, anyhow::Error>>();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            f.core
                .execute_step("truck-1", "fleet-api", DispatchState::Allocated, never),
        )
        .await;
        assert!(abandoned.is_err());

        let breaker = f.core.breakers().get("fleet-api").unwrap();
        assert_eq!(breaker.snapshot().half_open_in_flight, 0);
        f.core
            .execute_step("truck-1", "fleet-api", DispatchState::Allocated, ok())
            .await
            .unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_burst_escalates_policy_on_tick() {
        let f = fixture();
        let mut changes = f.core.policy().subscribe();
        for i in 0..6 {
            let id = format!("truck-{i}");
            f.core.workflow().register(&id, DispatchState::Queued).unwrap();
            let dependency = format!("dep-{i}");
            f.core
                .execute_step(&id, &dependency, DispatchState::Allocated, fail())
                .await
                .unwrap_err();
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let change = changes.recv().await.unwrap();
        assert_eq!(change.to, PolicyLevel::Watch);
        let snapshot = f.core.snapshot();
        assert_eq!(snapshot.policy.level, PolicyLevel::Watch);
        assert!(snapshot.failure_bursts.samples >= 1);
        assert!(snapshot.failure_bursts.max >= Some(6));
    }

    #[tokio::test]
    async fn snapshot_and_replay_share_checkpoints() {
        let mut f = fixture();
        f.core.workflow().register("a", DispatchState::Queued).unwrap();
        f.core.breakers().get_or_create("geo").unwrap();

        let events = vec![
            Event::new("a", 3, ()),
            Event::new("b", 1, ()),
        ];
        f.core
            .replay_worker()
            .run(events, 10, CancellationToken::new())
            .await
            .unwrap();

        let snapshot = f.core.snapshot();
        assert_eq!(snapshot.workflow.entities, 1);
        assert!(snapshot.breakers.contains_key("geo"));
        assert_eq!(snapshot.checkpoints.get("a"), Some(&3));
        assert_eq!(snapshot.policy.level, PolicyLevel::Normal);
        f.core.shutdown().await;
    }

    #[tokio::test]
    async fn admission_controller_follows_core_config() {
        let f = fixture();
        let admission = f.core.admission::<u32>().unwrap();
        admission.submit(1, 1).unwrap();
        assert_eq!(admission.queue_stats().depth, 1);
    }
}
