//! Shared circuit breakers and the per-dependency registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bulwark_core::{
    BreakerError, BreakerTransition, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerSnapshot, CircuitState, ClockSource, ConfigError, ProbeTicket,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ConfigHandle;
use crate::observability;

// ---------------------------------------------------------------------------
// SharedCircuitBreaker
// ---------------------------------------------------------------------------

/// A [`CircuitBreaker`] guarding one named dependency.
pub struct SharedCircuitBreaker {
    dependency: String,
    breaker: Mutex<CircuitBreaker>,
    clock: Arc<dyn ClockSource>,
}

impl SharedCircuitBreaker {
    /// # Errors
    ///
    /// Returns the validation error of an unusable configuration.
    pub fn new(
        dependency: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            dependency: dependency.into(),
            breaker: Mutex::new(CircuitBreaker::new(config)?),
            clock,
        })
    }

    #[must_use]
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Asks permission to call the dependency.
    ///
    /// The permit carries the half-open probe slot, if one was taken, until
    /// an outcome is recorded through it or it is dropped.
    ///
    /// # Errors
    ///
    /// As [`CircuitBreaker::try_acquire`].
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, BreakerError> {
        let now_ms = self.clock.now();
        let (lazy, result) = {
            let mut breaker = self.breaker.lock();
            let (_, lazy) = breaker.poll_state(now_ms);
            (lazy, breaker.try_acquire(now_ms))
        };
        self.observe(lazy);
        result.map(|ticket| BreakerPermit {
            breaker: Arc::clone(self),
            ticket,
        })
    }

    pub fn record_success(&self) -> Option<BreakerTransition> {
        self.record(CircuitBreaker::record_success)
    }

    pub fn record_failure(&self) -> Option<BreakerTransition> {
        self.record(CircuitBreaker::record_failure)
    }

    /// Forces the breaker closed.
    pub fn reset(&self) -> Option<BreakerTransition> {
        self.record(CircuitBreaker::reset)
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        let now_ms = self.clock.now();
        let (state, lazy) = self.breaker.lock().poll_state(now_ms);
        self.observe(lazy);
        state
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        self.breaker.lock().snapshot()
    }

    fn release_probe(&self, ticket: ProbeTicket) {
        if self.breaker.lock().release_probe(ticket) {
            debug!(dependency = %self.dependency, "unsettled probe released");
        }
    }

    fn record(
        &self,
        op: impl FnOnce(&mut CircuitBreaker, u64) -> Option<BreakerTransition>,
    ) -> Option<BreakerTransition> {
        let now_ms = self.clock.now();
        let (lazy, transition) = {
            let mut breaker = self.breaker.lock();
            let (_, lazy) = breaker.poll_state(now_ms);
            (lazy, op(&mut *breaker, now_ms))
        };
        self.observe(lazy);
        self.observe(transition);
        transition
    }

    fn observe(&self, transition: Option<BreakerTransition>) {
        if let Some(t) = transition {
            info!(
                dependency = %self.dependency,
                from = %t.from,
                to = %t.to,
                "circuit breaker state changed"
            );
            observability::record_breaker_transition(&self.dependency, &t);
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerPermit
// ---------------------------------------------------------------------------

/// Admission to call a dependency, issued by [`SharedCircuitBreaker::try_acquire`].
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropped unsettled, it hands its half-open probe slot back, so a cancelled
/// call or one that ended without a verdict never uses up the probe budget.
#[must_use = "dropping a permit discards the call outcome"]
pub struct BreakerPermit {
    breaker: Arc<SharedCircuitBreaker>,
    ticket: Option<ProbeTicket>,
}

impl BreakerPermit {
    /// Whether this call was admitted as a half-open probe.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.ticket.is_some()
    }

    pub fn success(mut self) -> Option<BreakerTransition> {
        self.ticket = None;
        self.breaker.record_success()
    }

    pub fn failure(mut self) -> Option<BreakerTransition> {
        self.ticket = None;
        self.breaker.record_failure()
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.release_probe(ticket);
        }
    }
}

impl fmt::Debug for BreakerPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("dependency", &self.breaker.dependency)
            .field("probe", &self.ticket.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BreakerRegistry
// ---------------------------------------------------------------------------

/// One breaker per dependency, created on first use.
///
/// New breakers take the breaker section of the configuration current at
/// creation time; existing breakers keep theirs.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<SharedCircuitBreaker>>,
    config: Arc<ConfigHandle>,
    clock: Arc<dyn ClockSource>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: Arc<ConfigHandle>, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            clock,
        }
    }

    /// Breaker for `dependency`, created if missing.
    ///
    /// # Errors
    ///
    /// Returns the validation error if the breaker had to be created from an
    /// unusable configuration.
    pub fn get_or_create(
        &self,
        dependency: &str,
    ) -> Result<Arc<SharedCircuitBreaker>, ConfigError> {
        if let Some(existing) = self.breakers.get(dependency) {
            return Ok(Arc::clone(existing.value()));
        }
        let entry = self
            .breakers
            .entry(dependency.to_string())
            .or_try_insert_with(|| {
                let config = self.config.load().breaker;
                SharedCircuitBreaker::new(dependency, config, Arc::clone(&self.clock)).map(Arc::new)
            })?;
        Ok(Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn get(&self, dependency: &str) -> Option<Arc<SharedCircuitBreaker>> {
        self.breakers.get(dependency).map(|b| Arc::clone(b.value()))
    }

    pub fn remove(&self, dependency: &str) -> Option<Arc<SharedCircuitBreaker>> {
        self.breakers.remove(dependency).map(|(_, b)| b)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots of every breaker, keyed by dependency.
    #[must_use]
    pub fn snapshots(&self) -> BTreeMap<String, CircuitBreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}
