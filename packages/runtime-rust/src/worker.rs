//! Background worker driving periodic engine evaluation.
//!
//! [`BackgroundWorker`] owns a [`BackgroundRunnable`] on a spawned task. Tasks
//! arrive over an mpsc channel and are handled one at a time, interleaved with
//! periodic ticks, so the runnable never needs its own lock.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TASK_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// BackgroundRunnable
// ---------------------------------------------------------------------------

/// Handler executed by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Handles one submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called on every tick. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once after the loop exits. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a runnable executing on its own task.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop. Must be called inside a tokio runtime.
    ///
    /// The first tick fires one full interval after start.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(
                tokio::time::Instant::now() + tick_interval,
                tick_interval,
            );
            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticks.tick() => runnable.on_tick().await,
                }
            }
            // Tasks accepted before the stop request are still handled.
            while let Ok(task) = rx.try_recv() {
                runnable.run(task).await;
            }
            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            cancel,
            handle: Some(handle),
        }
    }

    /// Queues a task, waiting for channel space.
    ///
    /// # Errors
    ///
    /// Fails once the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let Some(tx) = &self.tx else {
            anyhow::bail!("worker not running");
        };
        tx.send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker channel closed"))
    }

    /// Queues a task without waiting.
    ///
    /// # Errors
    ///
    /// Fails when the channel is full or the worker has been stopped.
    pub fn try_submit(&self, task: R::Task) -> anyhow::Result<()> {
        let Some(tx) = &self.tx else {
            anyhow::bail!("worker not running");
        };
        tx.try_send(task)
            .map_err(|e| anyhow::anyhow!("worker rejected task: {e}"))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop, handles already-queued tasks, runs `shutdown`, and
    /// waits for the task to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "background worker panicked");
            }
        }
    }
}

impl<R: BackgroundRunnable> Drop for BackgroundWorker<R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct Counters {
        runs: AtomicU32,
        ticks: AtomicU32,
        shutdowns: AtomicU32,
    }

    struct Counting(Arc<Counters>);

    #[async_trait]
    impl BackgroundRunnable for Counting {
        type Task = u32;

        async fn run(&mut self, task: u32) {
            self.0.runs.fetch_add(task, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn queued_tasks_are_handled_before_shutdown() {
        let counters = Arc::new(Counters::default());
        let mut worker =
            BackgroundWorker::start(Counting(Arc::clone(&counters)), Duration::from_secs(60));

        worker.submit(1).await.unwrap();
        worker.submit(2).await.unwrap();
        worker.try_submit(3).unwrap();
        worker.stop().await;

        assert_eq!(counters.runs.load(Ordering::SeqCst), 6);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
        assert!(worker.submit(4).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_follow_the_interval() {
        let counters = Arc::new(Counters::default());
        let mut worker =
            BackgroundWorker::start(Counting(Arc::clone(&counters)), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;
        worker.stop().await;

        assert_eq!(counters.ticks.load(Ordering::SeqCst), 3);
    }
}
