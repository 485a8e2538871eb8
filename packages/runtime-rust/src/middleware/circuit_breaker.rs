//! Circuit-breaker middleware.
//!
//! Asks the breaker for permission before each call and reports the outcome
//! afterwards. While the circuit is open calls fail fast with
//! `ResilienceError::Breaker` and never reach the inner service. The breaker
//! permit lives in the response future, so a dropped future or a retryable
//! rejection from further in hands its probe slot back.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use crate::engine::SharedCircuitBreaker;
use crate::error::ResilienceError;

// ---------------------------------------------------------------------------
// CircuitBreakerLayer
// ---------------------------------------------------------------------------

/// Tower layer guarding a service with one shared breaker.
#[derive(Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<SharedCircuitBreaker>,
}

impl CircuitBreakerLayer {
    #[must_use]
    pub fn new(breaker: Arc<SharedCircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: Arc::clone(&self.breaker),
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerService
// ---------------------------------------------------------------------------

/// Service wrapper that records every call outcome on the breaker.
#[derive(Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: Arc<SharedCircuitBreaker>,
}

impl<S, Req> Service<Req> for CircuitBreakerService<S>
where
    S: Service<Req, Error = ResilienceError> + Send,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, ResilienceError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejected) => {
                return Box::pin(async move { Err(ResilienceError::Breaker(rejected)) });
            }
        };

        let fut = self.inner.call(req);
        Box::pin(async move {
            let result = fut.await;
            match &result {
                Ok(_) => {
                    permit.success();
                }
                // Rejections from layers further in say nothing about the
                // dependency's health.
                Err(err) if err.is_retryable() => drop(permit),
                Err(_) => {
                    permit.failure();
                }
            }
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bulwark_core::{
        BreakerError, CircuitBreakerConfig, CircuitState, ManualClock, RateLimitExceeded,
    };
    use tower::{service_fn, ServiceExt};

    use super::*;

    fn breaker(clock: Arc<ManualClock>) -> Arc<SharedCircuitBreaker> {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout_ms: 500,
            max_half_open_requests: 1,
        };
        Arc::new(SharedCircuitBreaker::new("inventory", config, clock).unwrap())
    }

    macro_rules! flaky {
        () => {
            service_fn(|fail: bool| async move {
                if fail {
                    Err(ResilienceError::Dependency(anyhow::anyhow!("boom")))
                } else {
                    Ok("ok")
                }
            })
        };
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = breaker(clock);
        let svc = CircuitBreakerLayer::new(Arc::clone(&breaker)).layer(flaky!());

        assert!(svc.clone().oneshot(true).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(svc.clone().oneshot(true).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        // A healthy request is rejected without reaching the service.
        let err = svc.oneshot(false).await.unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::Breaker(BreakerError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn probe_success_closes_the_circuit() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = breaker(clock.clone());
        let svc = CircuitBreakerLayer::new(Arc::clone(&breaker)).layer(flaky!());

        svc.clone().oneshot(true).await.unwrap_err();
        svc.clone().oneshot(true).await.unwrap_err();
        clock.advance(500);

        assert_eq!(svc.clone().oneshot(false).await.unwrap(), "ok");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().times_opened, 1);
    }

    #[tokio::test]
    async fn retryable_inner_rejections_are_not_failures() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = breaker(clock);
        let inner = service_fn(|_: ()| async {
            Err::<(), _>(ResilienceError::Breaker(BreakerError::HalfOpenLimit { max: 1 }))
        });
        let svc = CircuitBreakerLayer::new(Arc::clone(&breaker)).layer(inner);
        for _ in 0..5 {
            svc.clone().oneshot(()).await.unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn retryable_trial_outcome_leaves_the_half_open_slot_free() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = breaker(clock.clone());
        let limited = service_fn(|_: ()| async {
            Err::<&str, _>(ResilienceError::RateLimited(RateLimitExceeded {
                requested: 1,
                available: 0.0,
                retry_after_ms: Some(10),
            }))
        });
        let healthy = flaky!();

        breaker.record_failure();
        breaker.record_failure();
        clock.advance(500);

        let svc = CircuitBreakerLayer::new(Arc::clone(&breaker)).layer(limited);
        assert!(matches!(
            svc.oneshot(()).await,
            Err(ResilienceError::RateLimited(_))
        ));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().half_open_in_flight, 0);

        let svc = CircuitBreakerLayer::new(Arc::clone(&breaker)).layer(healthy);
        assert_eq!(svc.oneshot(false).await.unwrap(), "ok");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dropped_response_future_frees_the_half_open_slot() {
        let clock = Arc::new(ManualClock::new(0));
        let breaker = breaker(clock.clone());
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(500);

        let pending = service_fn(|_: ()| std::future::pending::<Result<(), ResilienceError>>());
        let mut svc = CircuitBreakerLayer::new(Arc::clone(&breaker)).layer(pending);
        let fut = svc.ready().await.unwrap().call(());
        assert_eq!(breaker.snapshot().half_open_in_flight, 1);
        drop(fut);
        assert_eq!(breaker.snapshot().half_open_in_flight, 0);

        let svc = CircuitBreakerLayer::new(Arc::clone(&breaker)).layer(flaky!());
        assert_eq!(svc.oneshot(false).await.unwrap(), "ok");
    }
}
