//! Bulwark Runtime: thread-safe engines, policy ticker, async replay, tower
//! middleware and hot-reloadable configuration over `bulwark-core`.

pub mod admission;
pub mod config;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod replay;
pub mod resilience;
pub mod sink;
pub mod ticker;
pub mod worker;

pub use admission::AdmissionController;
pub use config::{ConfigHandle, ResilienceConfig};
pub use engine::{
    BreakerPermit, BreakerRegistry, SharedCheckpoints, SharedCircuitBreaker, SharedPolicy,
    SharedWorkflow,
};
pub use error::{AdmissionError, ResilienceError};
pub use middleware::{CircuitBreakerLayer, RateLimitLayer};
pub use observability::init_tracing;
pub use replay::{ReplayReport, ReplayWorker};
pub use resilience::{ResilienceCore, ResilienceSnapshot};
pub use sink::{AuditSink, CompositeAuditSink, TracingAuditSink};
pub use ticker::{PolicySignal, PolicyTicker};
pub use worker::{BackgroundRunnable, BackgroundWorker};
