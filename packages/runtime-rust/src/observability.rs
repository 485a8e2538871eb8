//! Logging setup and metric recording.
//!
//! Metrics go through the `metrics` facade; installing an exporter is left to
//! the embedding application. Without one, every call is a no-op.

use bulwark_core::{BreakerTransition, PolicyLevel};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const BREAKER_TRANSITIONS: &str = "bulwark_breaker_transitions_total";
pub const POLICY_LEVEL: &str = "bulwark_policy_level";
pub const POLICY_CHANGES: &str = "bulwark_policy_changes_total";
pub const ADMISSION_DECISIONS: &str = "bulwark_admission_decisions_total";
pub const WORKFLOW_TRANSITIONS: &str = "bulwark_workflow_transitions_total";
pub const REPLAY_WINNERS: &str = "bulwark_replay_winners_total";

/// Installs the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Output goes to
/// stderr, as JSON lines when `json` is set.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()?;
    Ok(())
}

pub(crate) fn record_breaker_transition(dependency: &str, transition: &BreakerTransition) {
    metrics::counter!(
        BREAKER_TRANSITIONS,
        "dependency" => dependency.to_string(),
        "to" => transition.to.to_string()
    )
    .increment(1);
}

pub(crate) fn record_policy_level(level: PolicyLevel) {
    let value = match level {
        PolicyLevel::Normal => 0.0,
        PolicyLevel::Watch => 1.0,
        PolicyLevel::Restricted => 2.0,
        PolicyLevel::Halted => 3.0,
    };
    metrics::gauge!(POLICY_LEVEL).set(value);
    metrics::counter!(POLICY_CHANGES, "to" => level.as_str()).increment(1);
}

pub(crate) fn record_admission(outcome: &'static str) {
    metrics::counter!(ADMISSION_DECISIONS, "outcome" => outcome).increment(1);
}

pub(crate) fn record_workflow_transition(kind: &'static str) {
    metrics::counter!(WORKFLOW_TRANSITIONS, "kind" => kind).increment(1);
}

pub(crate) fn record_replay_winners(count: usize) {
    metrics::counter!(REPLAY_WINNERS).increment(count as u64);
}
