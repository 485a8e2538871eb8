//! Admission control: token bucket, load-band shedding and a priority queue.

use std::sync::Arc;

use bulwark_core::admission::should_shed;
use bulwark_core::{
    AdmissionDecision, ClockSource, ConfigError, PriorityQueue, QueueStats, TokenBucket,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::ConfigHandle;
use crate::error::AdmissionError;
use crate::observability;

struct Pending<T> {
    priority: u32,
    item: T,
}

struct Inner<T> {
    bucket: TokenBucket,
    queue: PriorityQueue<Pending<T>>,
}

/// Gatekeeper in front of a work queue.
///
/// A submission is checked in this order: load shedding against the queue
/// depth, then the rate limiter, then it is queued. Shed work never spends a
/// token. Dequeue order is ascending priority; equal priorities leave in
/// submission order.
pub struct AdmissionController<T> {
    inner: Mutex<Inner<T>>,
    config: Arc<ConfigHandle>,
    clock: Arc<dyn ClockSource>,
}

impl<T: Send + 'static> AdmissionController<T> {
    /// # Errors
    ///
    /// Returns the validation error of the rate limiter configuration.
    pub fn new(
        config: Arc<ConfigHandle>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, ConfigError> {
        let bucket = TokenBucket::new(config.load().rate_limit, clock.now())?;
        Ok(Self {
            inner: Mutex::new(Inner {
                bucket,
                queue: PriorityQueue::min_by_key(|p: &Pending<T>| p.priority),
            }),
            config,
            clock,
        })
    }

    /// Queues `item` if it is admitted.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::Shed`] or [`AdmissionError::QueueFull`] when the
    /// queue is too loaded for this priority, [`AdmissionError::RateLimited`]
    /// when the bucket is empty.
    pub fn submit(&self, item: T, priority: u32) -> Result<(), AdmissionError> {
        let config = self.config.load();
        let now_ms = self.clock.now();
        let mut inner = self.inner.lock();

        if *inner.bucket.config() != config.rate_limit {
            // Reloaded limits take effect with a full bucket. The handle only
            // publishes validated configurations.
            if let Ok(bucket) = TokenBucket::new(config.rate_limit, now_ms) {
                inner.bucket = bucket;
            }
        }

        let depth = inner.queue.len();
        let capacity = config.admission.queue_capacity;
        if let AdmissionDecision::Shed(reason) =
            config.admission.policy.decide(depth as u64, capacity as u64, priority)
        {
            drop(inner);
            debug!(priority, depth, %reason, "admission shed");
            observability::record_admission("shed");
            return Err(AdmissionError::Shed(reason));
        }
        if should_shed(depth, capacity) {
            drop(inner);
            observability::record_admission("queue_full");
            return Err(AdmissionError::QueueFull { depth });
        }
        if let Err(limited) = inner.bucket.try_acquire(now_ms) {
            drop(inner);
            observability::record_admission("rate_limited");
            return Err(limited.into());
        }

        inner.queue.enqueue(Pending { priority, item });
        drop(inner);
        observability::record_admission("admitted");
        Ok(())
    }

    /// Takes the most important queued item.
    pub fn next(&self) -> Option<T> {
        self.inner.lock().queue.dequeue().map(|p| p.item)
    }

    /// Takes up to `n` items in dequeue order.
    pub fn drain(&self, n: usize) -> Vec<T> {
        self.inner
            .lock()
            .queue
            .drain(n)
            .into_iter()
            .map(|p| p.item)
            .collect()
    }

    /// Removes every queued item whose priority is above `max_priority`,
    /// for example after the policy level tightened.
    pub fn shed_above(&self, max_priority: u32) -> Vec<T> {
        self.inner
            .lock()
            .queue
            .remove_where(|p| p.priority > max_priority)
            .into_iter()
            .map(|p| p.item)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.lock().queue.stats()
    }
}
