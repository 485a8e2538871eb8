//! Periodic policy evaluation.
//!
//! Failure signals accumulate between ticks; each tick hands the burst to
//! the policy engine and starts a new count. Success signals go straight to
//! the engine so de-escalation is not delayed by the tick interval. Stopping
//! the ticker evaluates whatever burst is still pending.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::ConfigHandle;
use crate::engine::SharedPolicy;
use crate::worker::{BackgroundRunnable, BackgroundWorker};

/// Outcome signal fed to the ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySignal {
    Failure,
    Success,
}

/// Runnable that turns outcome signals into policy evaluations.
pub struct PolicyTicker {
    policy: Arc<SharedPolicy>,
    config: Arc<ConfigHandle>,
    burst: u32,
}

impl PolicyTicker {
    #[must_use]
    pub fn new(policy: Arc<SharedPolicy>, config: Arc<ConfigHandle>) -> Self {
        Self {
            policy,
            config,
            burst: 0,
        }
    }

    /// Starts the ticker with the configured interval.
    pub fn spawn(self) -> BackgroundWorker<Self> {
        let interval = Duration::from_millis(self.config.load().ticker.tick_interval_ms);
        BackgroundWorker::start(self, interval)
    }

    /// Failures counted since the last tick.
    #[must_use]
    pub fn pending_burst(&self) -> u32 {
        self.burst
    }

    fn evaluate_burst(&mut self) {
        let burst = std::mem::take(&mut self.burst);
        if let Some(change) = self.policy.evaluate(burst) {
            let recent = self.policy.burst_stats();
            debug!(
                burst,
                level = %change.to,
                recent_p95 = ?recent.p95,
                recent_max = ?recent.max,
                "policy tick escalated"
            );
        }

        let ticker = self.config.load().ticker;
        let report = self
            .policy
            .evaluate_with_history(ticker.rapid_window_ms, ticker.rapid_escalation_count);
        if report.rapid_escalation {
            warn!(
                escalations = report.escalations_in_window,
                window_ms = ticker.rapid_window_ms,
                level = %report.level,
                "rapid policy escalation"
            );
        }
    }
}

#[async_trait]
impl BackgroundRunnable for PolicyTicker {
    type Task = PolicySignal;

    async fn run(&mut self, task: PolicySignal) {
        match task {
            PolicySignal::Failure => self.burst = self.burst.saturating_add(1),
            PolicySignal::Success => {
                self.policy.record_success();
            }
        }
    }

    async fn on_tick(&mut self) {
        self.evaluate_burst();
    }

    async fn shutdown(&mut self) {
        if self.burst > 0 {
            debug!(burst = self.burst, "evaluating failure burst on shutdown");
            self.evaluate_burst();
        }
    }
}
