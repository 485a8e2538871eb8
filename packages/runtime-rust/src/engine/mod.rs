//! Thread-safe wrappers around the core engines.
//!
//! Each wrapper owns one engine behind a `parking_lot::Mutex`, so every call
//! is atomic end-to-end. No lock is held across an `.await`, and outbound
//! notifications (audit sinks, policy broadcasts, metrics) happen after the
//! lock is released.
//!
//! When one call needs several locks they are taken in this order:
//! admission, workflow, breaker, policy, checkpoints.

pub mod breaker;
pub mod checkpoint;
pub mod policy;
pub mod workflow;

pub use breaker::{BreakerPermit, BreakerRegistry, SharedCircuitBreaker};
pub use checkpoint::SharedCheckpoints;
pub use policy::SharedPolicy;
pub use workflow::SharedWorkflow;
