//! Token-bucket rate limiter.
//!
//! Tokens refill continuously at `refill_rate_per_sec` up to
//! `burst_capacity`. A request is admitted only against a whole token: a
//! balance of `0.99` rejects. Burst acquisition is all-or-nothing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Configuration for a [`TokenBucket`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterConfig {
    /// Maximum number of tokens the bucket holds.
    pub burst_capacity: u32,
    /// Tokens added per second.
    pub refill_rate_per_sec: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst_capacity: 100,
            refill_rate_per_sec: 50.0,
        }
    }
}

impl RateLimiterConfig {
    /// Checks that the bucket can ever admit a request.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero capacity or a negative,
    /// NaN or infinite refill rate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.burst_capacity == 0 {
            return Err(ConfigError::invalid("burst_capacity", "must be at least 1"));
        }
        if !self.refill_rate_per_sec.is_finite() || self.refill_rate_per_sec < 0.0 {
            return Err(ConfigError::invalid(
                "refill_rate_per_sec",
                "must be a finite, non-negative number",
            ));
        }
        Ok(())
    }
}

/// Rejection returned when the bucket cannot cover a request.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rate limit exceeded: requested {requested} token(s), {available:.2} available")]
pub struct RateLimitExceeded {
    /// Tokens the caller asked for.
    pub requested: u32,
    /// Balance at the time of the rejection.
    pub available: f64,
    /// Time until the balance covers the request, if it ever can.
    pub retry_after_ms: Option<u64>,
}

/// Token bucket with continuous refill.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    config: RateLimiterConfig,
    tokens: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    /// Creates a full bucket whose refill clock starts at `now_ms`.
    ///
    /// # Errors
    ///
    /// Returns the validation error of an unusable configuration.
    pub fn new(config: RateLimiterConfig, now_ms: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            tokens: f64::from(config.burst_capacity),
            last_refill_ms: now_ms,
        })
    }

    /// Returns the configuration the bucket was built with.
    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admits one request if a whole token is available.
    pub fn allow(&mut self, now_ms: u64) -> bool {
        self.try_acquire_burst(1, now_ms).is_ok()
    }

    /// Takes one token.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] when less than one whole token is available.
    pub fn try_acquire(&mut self, now_ms: u64) -> Result<(), RateLimitExceeded> {
        self.try_acquire_burst(1, now_ms)
    }

    /// Takes `n` tokens at once or none at all.
    ///
    /// On rejection the balance is left exactly as refill made it; nothing is
    /// deducted. A request for zero tokens always succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] when the balance is below `n`.
    pub fn try_acquire_burst(&mut self, n: u32, now_ms: u64) -> Result<(), RateLimitExceeded> {
        self.refill(now_ms);
        let requested = f64::from(n);
        if self.tokens >= requested {
            self.tokens -= requested;
            return Ok(());
        }
        Err(RateLimitExceeded {
            requested: n,
            available: self.tokens,
            retry_after_ms: self.retry_after_ms(requested),
        })
    }

    /// Current balance after refilling to `now_ms`.
    pub fn available(&mut self, now_ms: u64) -> f64 {
        self.refill(now_ms);
        self.tokens
    }

    #[allow(clippy::cast_precision_loss)]
    fn refill(&mut self, now_ms: u64) {
        // A clock that moves backwards neither adds nor removes tokens.
        if now_ms <= self.last_refill_ms {
            return;
        }
        let elapsed_ms = (now_ms - self.last_refill_ms) as f64;
        let added = elapsed_ms * self.config.refill_rate_per_sec / 1000.0;
        self.tokens = (self.tokens + added).min(f64::from(self.config.burst_capacity));
        self.last_refill_ms = now_ms;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn retry_after_ms(&self, requested: f64) -> Option<u64> {
        if requested > f64::from(self.config.burst_capacity)
            || self.config.refill_rate_per_sec <= 0.0
        {
            return None;
        }
        let missing = requested - self.tokens;
        Some((missing * 1000.0 / self.config.refill_rate_per_sec).ceil() as u64)
    }
}
