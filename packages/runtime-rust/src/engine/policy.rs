//! Shared policy engine with change broadcast.

use std::sync::Arc;

use bulwark_core::policy::EscalationReport;
use bulwark_core::{
    BurstStats, ClockSource, ConfigError, PolicyChange, PolicyConfig, PolicyEngine, PolicyLevel,
    PolicySnapshot,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::observability;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// A [`PolicyEngine`] shared between tasks.
///
/// Level changes are published on a broadcast channel for alerting
/// collaborators, in history order: the send happens before the engine lock
/// is released and never blocks. A slow subscriber lags and loses the oldest
/// changes; the engine history keeps all of them.
pub struct SharedPolicy {
    engine: Mutex<PolicyEngine>,
    clock: Arc<dyn ClockSource>,
    changes: broadcast::Sender<PolicyChange>,
}

impl SharedPolicy {
    /// # Errors
    ///
    /// Returns the validation error of an unusable configuration.
    pub fn new(config: PolicyConfig, clock: Arc<dyn ClockSource>) -> Result<Self, ConfigError> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            engine: Mutex::new(PolicyEngine::new(config)?),
            clock,
            changes,
        })
    }

    /// Receiver for every subsequent level change.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyChange> {
        self.changes.subscribe()
    }

    pub fn evaluate(&self, failure_burst: u32) -> Option<PolicyChange> {
        let now_ms = self.clock.now();
        let mut engine = self.engine.lock();
        let change = engine.evaluate(failure_burst, now_ms);
        self.publish(change);
        change
    }

    pub fn record_success(&self) -> Option<PolicyChange> {
        let now_ms = self.clock.now();
        let mut engine = self.engine.lock();
        let change = engine.record_success(now_ms);
        self.publish(change);
        change
    }

    #[must_use]
    pub fn evaluate_with_history(
        &self,
        window_ms: u64,
        rapid_escalation_count: usize,
    ) -> EscalationReport {
        let now_ms = self.clock.now();
        self.engine
            .lock()
            .evaluate_with_history(window_ms, rapid_escalation_count, now_ms)
    }

    #[must_use]
    pub fn current_level(&self) -> PolicyLevel {
        self.engine.lock().current_level()
    }

    #[must_use]
    pub fn snapshot(&self) -> PolicySnapshot {
        self.engine.lock().snapshot()
    }

    #[must_use]
    pub fn burst_stats(&self) -> BurstStats {
        self.engine.lock().burst_stats()
    }

    #[must_use]
    pub fn history(&self) -> Vec<PolicyChange> {
        self.engine.lock().history().to_vec()
    }

    fn publish(&self, change: Option<PolicyChange>) {
        if let Some(change) = change {
            observability::record_policy_level(change.to);
            // No subscribers is not an error.
            let _ = self.changes.send(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use bulwark_core::ManualClock;

    use super::*;

    #[tokio::test]
    async fn subscribers_receive_changes_in_order() {
        let clock = Arc::new(ManualClock::new(100));
        let policy = SharedPolicy::new(PolicyConfig::default(), clock.clone()).unwrap();
        let mut rx = policy.subscribe();

        policy.evaluate(50);
        clock.advance(10);
        policy.evaluate(50);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.from, first.to), (PolicyLevel::Normal, PolicyLevel::Watch));
        assert_eq!(second.to, PolicyLevel::Restricted);
        assert_eq!(second.at_ms, 110);
    }

    #[test]
    fn concurrent_escalations_broadcast_a_consistent_chain() {
        let policy = Arc::new(
            SharedPolicy::new(PolicyConfig::default(), Arc::new(ManualClock::new(0))).unwrap(),
        );
        let mut rx = policy.subscribe();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let policy = Arc::clone(&policy);
                std::thread::spawn(move || {
                    for _ in 0..4 {
                        policy.evaluate(u32::MAX);
                        policy.record_success();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let history = policy.history();
        let mut received = Vec::new();
        while let Ok(change) = rx.try_recv() {
            received.push(change);
        }
        assert_eq!(received, history);
        for pair in received.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
        assert_eq!(received.last().map(|c| c.to), Some(policy.current_level()));
    }

    #[test]
    fn publishing_without_subscribers_succeeds() {
        let policy = SharedPolicy::new(PolicyConfig::default(), Arc::new(ManualClock::new(0))).unwrap();
        assert!(policy.evaluate(50).is_some());
        assert_eq!(policy.current_level(), PolicyLevel::Watch);
        assert_eq!(policy.history().len(), 1);
    }

    #[test]
    fn successes_relax_the_shared_level() {
        let policy = SharedPolicy::new(PolicyConfig::default(), Arc::new(ManualClock::new(0))).unwrap();
        policy.evaluate(50);
        let needed = PolicyConfig::default().deescalation.watch;
        let changes: Vec<_> = (0..needed).filter_map(|_| policy.record_success()).collect();
        assert_eq!(changes.len(), 1);
        assert_eq!(policy.snapshot().level, PolicyLevel::Normal);
    }

    #[test]
    fn rapid_escalation_uses_the_clock() {
        let clock = Arc::new(ManualClock::new(0));
        let policy = SharedPolicy::new(PolicyConfig::default(), clock.clone()).unwrap();
        for _ in 0..3 {
            policy.evaluate(u32::MAX);
            clock.advance(100);
        }
        assert!(policy.evaluate_with_history(1_000, 2).rapid_escalation);
        clock.advance(10_000);
        assert!(!policy.evaluate_with_history(1_000, 2).rapid_escalation);
    }
}
