//! Tower middleware layers.
//!
//! - [`rate_limit`]: Token-bucket admission in front of a service
//! - [`circuit_breaker`]: Failure isolation around a service

pub mod circuit_breaker;
pub mod rate_limit;

pub use circuit_breaker::CircuitBreakerLayer;
pub use rate_limit::RateLimitLayer;
