//! Bulwark Core: workflow state machine, circuit breaker, deterministic replay,
//! policy escalation and admission-control primitives.

pub mod admission;
pub mod breaker;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod policy;
pub mod queue;
pub mod rate_limit;
pub mod replay;
pub mod routing;
pub mod stats;
pub mod workflow;

pub use admission::{AdmissionDecision, AdmissionPolicy, LoadBand, ShedReason};
pub use breaker::{
    BreakerError, BreakerTransition, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerSnapshot, CircuitState, ProbeTicket,
};
pub use checkpoint::{CheckpointConfig, CheckpointManager};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use config::ConfigError;
pub use policy::{
    BurstStats, PolicyChange, PolicyConfig, PolicyEngine, PolicyLevel, PolicySnapshot,
};
pub use queue::{PriorityQueue, QueueStats};
pub use rate_limit::{RateLimitExceeded, RateLimiterConfig, TokenBucket};
pub use replay::{Event, RawEvent, ReplayEngine, ReplayError, ReplayOutcome};
pub use routing::RouteOption;
pub use workflow::{
    AuditEntry, AuditKind, DispatchState, GraphError, LifecycleState, TransitionOutcome,
    TransitionRecord, WorkflowEngine, WorkflowError, WorkflowGraph, WorkflowStats,
};
