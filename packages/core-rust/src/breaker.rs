//! Circuit breaker state machine.
//!
//! ```text
//!   Closed --(failure_count > failure_threshold)--> Open
//!   Open   --(read at/after reset_timeout_ms)-----> HalfOpen
//!   HalfOpen --(success_count >= success_threshold)--> Closed
//!   HalfOpen --(any failure)-----------------------> Open
//! ```
//!
//! The `Open -> HalfOpen` edge is taken lazily: no timer runs in the
//! background, the probe window opens when [`CircuitBreaker::state`] or
//! [`CircuitBreaker::try_acquire`] observes that the timeout has elapsed.
//!
//! Each admitted probe holds a [`ProbeTicket`]. A probe that ends without an
//! outcome hands its slot back with [`CircuitBreaker::release_probe`]. Slots
//! that are never handed back expire with the probe window: once
//! `reset_timeout_ms` has passed since the window opened, a spent window is
//! renewed instead of rejecting forever.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ConfigError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Thresholds and timeouts for a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Failures tolerated while closed; the next one trips the breaker.
    pub failure_threshold: u32,
    /// Half-open successes required to close again.
    pub success_threshold: u32,
    /// Time an open breaker waits before admitting probes.
    pub reset_timeout_ms: u64,
    /// Probes admitted per half-open probe window.
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_ms: 30_000,
            max_half_open_requests: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Rejects configurations under which the breaker could never close.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `success_threshold` or
    /// `max_half_open_requests` is zero, or when fewer probes are admitted
    /// than successes are required.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "must be at least 1"));
        }
        if self.max_half_open_requests == 0 {
            return Err(ConfigError::invalid(
                "max_half_open_requests",
                "must be at least 1",
            ));
        }
        if self.max_half_open_requests < self.success_threshold {
            return Err(ConfigError::invalid(
                "max_half_open_requests",
                "must be at least success_threshold",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected until the reset timeout elapses.
    Open,
    /// A limited number of probes test whether the dependency recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change, returned to the caller for logging and fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at_ms: u64,
}

/// Proof that a half-open probe was admitted in a given probe window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTicket {
    window: u64,
}

/// Rejections issued by [`CircuitBreaker::try_acquire`].
///
/// Both variants are retryable later; neither is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BreakerError {
    #[error("circuit open, retry in {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },
    #[error("half-open probe budget of {max} exhausted")]
    HalfOpenLimit { max: u32 },
}

/// Read-only view for observability collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
    pub last_failure_at: Option<u64>,
    pub times_opened: u64,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// Failure-isolation state machine for a single dependency.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    probe_window: u64,
    probe_window_opened_at: u64,
    last_failure_at: Option<u64>,
    times_opened: u64,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    ///
    /// # Errors
    ///
    /// Returns the validation error of an unusable configuration.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            probe_window: 0,
            probe_window_opened_at: 0,
            last_failure_at: None,
            times_opened: 0,
        })
    }

    /// Returns the configuration the breaker was built with.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, opening the probe window if the timeout has elapsed.
    pub fn state(&mut self, now_ms: u64) -> CircuitState {
        self.check_timeout(now_ms);
        self.state
    }

    /// Like [`state`](Self::state) but also reports the lazy transition, if any.
    pub fn poll_state(&mut self, now_ms: u64) -> (CircuitState, Option<BreakerTransition>) {
        let transition = self.check_timeout(now_ms);
        (self.state, transition)
    }

    /// Asks permission to call the protected dependency.
    ///
    /// Returns `Some(ticket)` when the call is admitted as a half-open probe
    /// and `None` when the breaker is closed.
    ///
    /// # Errors
    ///
    /// [`BreakerError::CircuitOpen`] while open, [`BreakerError::HalfOpenLimit`]
    /// once the probe budget of the current window is spent.
    pub fn try_acquire(&mut self, now_ms: u64) -> Result<Option<ProbeTicket>, BreakerError> {
        self.check_timeout(now_ms);
        match self.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => Err(BreakerError::CircuitOpen {
                retry_after_ms: self.retry_after_ms(now_ms),
            }),
            CircuitState::HalfOpen => {
                if self.half_open_in_flight >= self.config.max_half_open_requests {
                    let window_age = now_ms.saturating_sub(self.probe_window_opened_at);
                    if window_age < self.config.reset_timeout_ms {
                        return Err(BreakerError::HalfOpenLimit {
                            max: self.config.max_half_open_requests,
                        });
                    }
                    debug!(
                        unsettled = self.half_open_in_flight,
                        window_age, "probe window expired, renewing probe budget"
                    );
                    self.open_probe_window(now_ms);
                }
                self.half_open_in_flight += 1;
                Ok(Some(ProbeTicket {
                    window: self.probe_window,
                }))
            }
        }
    }

    /// Hands back the slot of a probe that ended without an outcome.
    ///
    /// Returns `false` when the ticket belongs to an earlier probe window,
    /// whose slots were already cleared.
    pub fn release_probe(&mut self, ticket: ProbeTicket) -> bool {
        if self.state != CircuitState::HalfOpen || ticket.window != self.probe_window {
            return false;
        }
        self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        true
    }

    /// Records a successful call.
    ///
    /// While closed this clears the failure streak; it is never counted
    /// toward `success_count`, which only measures half-open recovery.
    pub fn record_success(&mut self, now_ms: u64) -> Option<BreakerTransition> {
        self.check_timeout(now_ms);
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    debug!(
                        successes = self.success_count,
                        "circuit breaker closing after recovery"
                    );
                    return Some(self.transition_to(CircuitState::Closed, now_ms));
                }
                None
            }
            CircuitState::Open => {
                debug!("success recorded while circuit open");
                None
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&mut self, now_ms: u64) -> Option<BreakerTransition> {
        self.check_timeout(now_ms);
        self.failure_count = self.failure_count.saturating_add(1);
        match self.state {
            CircuitState::Closed => {
                self.last_failure_at = Some(now_ms);
                if self.failure_count > self.config.failure_threshold {
                    warn!(
                        failures = self.failure_count,
                        threshold = self.config.failure_threshold,
                        "circuit breaker opening"
                    );
                    return Some(self.transition_to(CircuitState::Open, now_ms));
                }
                None
            }
            CircuitState::HalfOpen => {
                self.last_failure_at = Some(now_ms);
                warn!("circuit breaker re-opening after half-open probe failure");
                Some(self.transition_to(CircuitState::Open, now_ms))
            }
            // Callers are rejected while open; a late failure from a call
            // admitted earlier does not extend the cool-down.
            CircuitState::Open => None,
        }
    }

    /// Forces the breaker back to closed with cleared counters.
    pub fn reset(&mut self, now_ms: u64) -> Option<BreakerTransition> {
        if self.state == CircuitState::Closed {
            self.failure_count = 0;
            self.success_count = 0;
            return None;
        }
        Some(self.transition_to(CircuitState::Closed, now_ms))
    }

    /// Counters and state as last observed, without applying the timeout.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            half_open_in_flight: self.half_open_in_flight,
            last_failure_at: self.last_failure_at,
            times_opened: self.times_opened,
        }
    }

    fn check_timeout(&mut self, now_ms: u64) -> Option<BreakerTransition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let opened_at = self.last_failure_at.unwrap_or(0);
        if now_ms.saturating_sub(opened_at) >= self.config.reset_timeout_ms {
            debug!("circuit breaker timeout elapsed, admitting probes");
            return Some(self.transition_to(CircuitState::HalfOpen, now_ms));
        }
        None
    }

    fn open_probe_window(&mut self, now_ms: u64) {
        self.probe_window += 1;
        self.probe_window_opened_at = now_ms;
        self.half_open_in_flight = 0;
    }

    fn retry_after_ms(&self, now_ms: u64) -> u64 {
        let opened_at = self.last_failure_at.unwrap_or(0);
        let elapsed = now_ms.saturating_sub(opened_at);
        self.config.reset_timeout_ms.saturating_sub(elapsed)
    }

    fn transition_to(&mut self, to: CircuitState, now_ms: u64) -> BreakerTransition {
        let from = self.state;
        self.state = to;
        match to {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.half_open_in_flight = 0;
            }
            CircuitState::Open => {
                self.success_count = 0;
                self.half_open_in_flight = 0;
                self.times_opened += 1;
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
                self.open_probe_window(now_ms);
            }
        }
        BreakerTransition {
            from,
            to,
            at_ms: now_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            reset_timeout_ms: 1_000,
            max_half_open_requests: success_threshold,
        })
        .unwrap()
    }

    fn open_breaker(cb: &mut CircuitBreaker, now_ms: u64) {
        for _ in 0..=cb.config().failure_threshold {
            cb.record_failure(now_ms);
        }
        assert_eq!(cb.state(now_ms), CircuitState::Open);
    }

    #[test]
    fn trips_on_threshold_plus_one_failure() {
        let mut cb = breaker(3, 1);
        for _ in 0..3 {
            assert!(cb.record_failure(0).is_none());
        }
        assert_eq!(cb.state(0), CircuitState::Closed);

        let transition = cb.record_failure(0).unwrap();
        assert_eq!(transition.from, CircuitState::Closed);
        assert_eq!(transition.to, CircuitState::Open);
        assert_eq!(cb.state(0), CircuitState::Open);
    }

    #[test]
    fn success_while_closed_resets_failure_streak() {
        let mut cb = breaker(3, 1);
        for _ in 0..3 {
            cb.record_failure(0);
        }
        cb.record_success(0);
        assert_eq!(cb.snapshot().failure_count, 0);
        assert_eq!(cb.snapshot().success_count, 0);
        for _ in 0..3 {
            cb.record_failure(0);
        }
        assert_eq!(cb.state(0), CircuitState::Closed);
    }

    #[test]
    fn open_rejects_with_retry_hint() {
        let mut cb = breaker(0, 1);
        cb.record_failure(100);
        assert_eq!(
            cb.try_acquire(400),
            Err(BreakerError::CircuitOpen {
                retry_after_ms: 700
            })
        );
    }

    #[test]
    fn state_read_opens_probe_window_lazily() {
        let mut cb = breaker(0, 1);
        open_breaker(&mut cb, 1_000);
        assert_eq!(cb.state(1_999), CircuitState::Open);
        // Internal state only changes when read at/after the timeout.
        assert_eq!(cb.snapshot().state, CircuitState::Open);
        assert_eq!(cb.state(2_000), CircuitState::HalfOpen);
        assert_eq!(cb.snapshot().state, CircuitState::HalfOpen);
    }

    #[test]
    fn poll_state_reports_lazy_transition() {
        let mut cb = breaker(0, 1);
        open_breaker(&mut cb, 0);
        let (state, transition) = cb.poll_state(1_000);
        assert_eq!(state, CircuitState::HalfOpen);
        assert_eq!(
            transition,
            Some(BreakerTransition {
                from: CircuitState::Open,
                to: CircuitState::HalfOpen,
                at_ms: 1_000
            })
        );
        assert_eq!(cb.poll_state(1_001).1, None);
    }

    #[test]
    fn half_open_failure_reopens_and_clears_successes() {
        let mut cb = breaker(0, 3);
        open_breaker(&mut cb, 0);
        assert_eq!(cb.state(1_000), CircuitState::HalfOpen);
        cb.record_success(1_000);
        cb.record_success(1_000);
        assert_eq!(cb.snapshot().success_count, 2);

        let transition = cb.record_failure(1_001).unwrap();
        assert_eq!(transition.to, CircuitState::Open);
        assert_eq!(cb.snapshot().success_count, 0);
        // Cool-down restarts from the probe failure.
        assert_eq!(cb.state(1_500), CircuitState::Open);
        assert_eq!(cb.state(2_001), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_success_threshold_and_clears_counters() {
        let mut cb = breaker(2, 2);
        open_breaker(&mut cb, 0);
        assert_eq!(cb.state(1_000), CircuitState::HalfOpen);

        assert!(cb.record_success(1_000).is_none());
        let transition = cb.record_success(1_000).unwrap();
        assert_eq!(transition.to, CircuitState::Closed);

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);

        // No stale failures: a full threshold is tolerated again.
        cb.record_failure(1_001);
        cb.record_failure(1_001);
        assert_eq!(cb.state(1_001), CircuitState::Closed);
    }

    #[test]
    fn half_open_limits_probes_with_distinct_error() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 0,
            success_threshold: 2,
            reset_timeout_ms: 10,
            max_half_open_requests: 2,
        })
        .unwrap();
        cb.record_failure(0);
        assert!(cb.try_acquire(10).is_ok());
        assert!(cb.try_acquire(10).is_ok());
        assert_eq!(
            cb.try_acquire(10),
            Err(BreakerError::HalfOpenLimit { max: 2 })
        );
    }

    #[test]
    fn probe_budget_refreshes_on_next_half_open_period() {
        let mut cb = breaker(0, 1);
        cb.record_failure(0);
        assert!(cb.try_acquire(1_000).is_ok());
        assert!(cb.try_acquire(1_000).is_err());
        cb.record_failure(1_000);
        assert!(matches!(
            cb.try_acquire(1_500),
            Err(BreakerError::CircuitOpen { .. })
        ));
        assert!(cb.try_acquire(2_000).is_ok());
    }

    #[test]
    fn released_half_open_slot_is_reusable() {
        let mut cb = breaker(0, 1);
        cb.record_failure(0);
        let ticket = cb.try_acquire(1_000).unwrap().unwrap();
        assert!(cb.try_acquire(1_000).is_err());

        assert!(cb.release_probe(ticket));
        assert_eq!(cb.snapshot().half_open_in_flight, 0);
        assert!(cb.try_acquire(1_001).unwrap().is_some());
    }

    #[test]
    fn stale_ticket_does_not_free_a_later_window() {
        let mut cb = breaker(0, 1);
        cb.record_failure(0);
        let stale = cb.try_acquire(1_000).unwrap().unwrap();
        cb.record_failure(1_000);
        assert!(cb.try_acquire(2_000).unwrap().is_some());

        assert!(!cb.release_probe(stale));
        assert_eq!(cb.snapshot().half_open_in_flight, 1);
    }

    #[test]
    fn unsettled_trial_call_expires_with_its_window() {
        let mut cb = breaker(0, 1);
        cb.record_failure(0);
        // Admitted, but no outcome is ever recorded.
        assert!(cb.try_acquire(1_000).unwrap().is_some());
        assert_eq!(
            cb.try_acquire(1_999),
            Err(BreakerError::HalfOpenLimit { max: 1 })
        );

        let later = 1_000 + 86_400_000;
        assert_eq!(cb.state(later), CircuitState::HalfOpen);
        assert!(cb.try_acquire(later).unwrap().is_some());
        assert!(cb.record_success(later).is_some());
        assert_eq!(cb.state(later), CircuitState::Closed);
    }

    #[test]
    fn closed_breaker_admits_without_ticket() {
        let mut cb = breaker(3, 1);
        assert_eq!(cb.try_acquire(0), Ok(None));
    }

    #[test]
    fn failure_while_open_does_not_extend_cooldown() {
        let mut cb = breaker(0, 1);
        cb.record_failure(0);
        cb.record_failure(900);
        assert_eq!(cb.state(1_000), CircuitState::HalfOpen);
    }

    #[test]
    fn reset_closes_and_counts_openings() {
        let mut cb = breaker(0, 1);
        cb.record_failure(0);
        assert_eq!(cb.snapshot().times_opened, 1);
        let transition = cb.reset(5).unwrap();
        assert_eq!(transition.to, CircuitState::Closed);
        assert_eq!(cb.state(5), CircuitState::Closed);
        assert!(cb.reset(6).is_none());
    }

    #[test]
    fn config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let no_success = CircuitBreakerConfig {
            success_threshold: 0,
            ..CircuitBreakerConfig::default()
        };
        assert!(CircuitBreaker::new(no_success).is_err());
        let starved = CircuitBreakerConfig {
            success_threshold: 3,
            max_half_open_requests: 2,
            ..CircuitBreakerConfig::default()
        };
        assert!(starved.validate().is_err());
    }
}
