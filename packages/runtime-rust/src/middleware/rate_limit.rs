//! Rate-limiting middleware.
//!
//! Rejects requests with `ResilienceError::RateLimited` when the shared token
//! bucket is empty. Requests are never queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bulwark_core::{ClockSource, ConfigError, RateLimiterConfig, TokenBucket};
use parking_lot::Mutex;
use tower::{Layer, Service};

use crate::error::ResilienceError;

// ---------------------------------------------------------------------------
// RateLimitLayer
// ---------------------------------------------------------------------------

/// Tower layer sharing one token bucket across every service it wraps.
#[derive(Clone)]
pub struct RateLimitLayer {
    bucket: Arc<Mutex<TokenBucket>>,
    clock: Arc<dyn ClockSource>,
}

impl RateLimitLayer {
    /// # Errors
    ///
    /// Returns the validation error of an unusable configuration.
    pub fn new(
        config: RateLimiterConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, ConfigError> {
        let bucket = TokenBucket::new(config, clock.now())?;
        Ok(Self {
            bucket: Arc::new(Mutex::new(bucket)),
            clock,
        })
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            bucket: Arc::clone(&self.bucket),
            clock: Arc::clone(&self.clock),
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitService
// ---------------------------------------------------------------------------

/// Service wrapper that spends one token per call.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    bucket: Arc<Mutex<TokenBucket>>,
    clock: Arc<dyn ClockSource>,
}

impl<S, Req> Service<Req> for RateLimitService<S>
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
        let now_ms = self.clock.now();
        if let Err(limited) = self.bucket.lock().try_acquire(now_ms) {
            tracing::debug!(retry_after_ms = ?limited.retry_after_ms, "request rate limited");
            return Box::pin(async move { Err(ResilienceError::RateLimited(limited)) });
        }
        Box::pin(self.inner.call(req))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
