//! Route selection and window planning helpers.

use std::cmp::Reverse;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A candidate channel and its observed latency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOption {
    pub channel: String,
    pub latency_ms: u64,
}

impl RouteOption {
    #[must_use]
    pub fn new(channel: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            channel: channel.into(),
            latency_ms,
        }
    }
}

/// Lowest-latency option whose channel is not blocked.
///
/// Equal latencies resolve to the earliest option in `options`. Returns
/// `None` when every channel is blocked or `options` is empty.
#[must_use]
pub fn choose_route<'a>(
    options: &'a [RouteOption],
    blocked: &HashSet<String>,
) -> Option<&'a RouteOption> {
    options
        .iter()
        .filter(|option| !blocked.contains(&option.channel))
        .min_by_key(|option| option.latency_ms)
}

/// Top `capacity` items by descending `key`; equal keys keep input order.
#[must_use]
pub fn plan_window<T, K, F>(mut items: Vec<T>, capacity: usize, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    // sort_by_key is stable, which gives the input-order tie-break.
    items.sort_by_key(|item| Reverse(key(item)));
    items.truncate(capacity);
    items
}
