//! Asynchronous, cancellable replay over shared checkpoints.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use bulwark_core::replay::{self, Event, RawEvent, ReplayEngine, ReplayError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::engine::SharedCheckpoints;
use crate::error::ResilienceError;
use crate::observability;

/// Result of one replay run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport<P> {
    /// One winning event per entity, ascending by sequence.
    pub winners: Vec<Event<P>>,
    /// Windows processed.
    pub windows: usize,
    /// Window winners already covered by a checkpoint.
    pub skipped_stale: usize,
    /// Checkpoints that became due while recording the winners.
    pub checkpoints_due: usize,
}

/// Replays event logs window by window on top of [`SharedCheckpoints`].
///
/// Each window is reduced on its own and the task yields before the next,
/// so long logs do not starve other tasks. Checkpoints are merged into the
/// shared state only after the whole run has succeeded.
#[derive(Clone)]
pub struct ReplayWorker {
    checkpoints: Arc<SharedCheckpoints>,
}

impl ReplayWorker {
    #[must_use]
    pub fn new(checkpoints: Arc<SharedCheckpoints>) -> Self {
        Self { checkpoints }
    }

    /// Replays `events` in windows of `window` events.
    ///
    /// Cancellation is checked between windows; a cancelled run leaves the
    /// shared checkpoints untouched.
    ///
    /// # Errors
    ///
    /// [`ResilienceError::Cancelled`] if `cancel` fires before the last
    /// window, [`ResilienceError::Replay`] for a zero window or a malformed
    /// event (positions refer to the whole log).
    pub async fn run<P: Send>(
        &self,
        events: Vec<Event<P>>,
        window: usize,
        cancel: CancellationToken,
    ) -> Result<ReplayReport<P>, ResilienceError> {
        if window == 0 {
            return Err(ReplayError::InvalidWindow.into());
        }
        let span = info_span!("replay", events = events.len(), window);
        async move {
            let mut carried = Vec::new();
            let mut windows = 0;
            let mut iter = events.into_iter().peekable();
            while iter.peek().is_some() {
                if cancel.is_cancelled() {
                    info!(windows, "replay cancelled");
                    return Err(ResilienceError::Cancelled);
                }
                let chunk: Vec<Event<P>> = iter.by_ref().take(window).collect();
                let winners = replay::replay(chunk).map_err(|e| e.shifted(windows * window))?;
                carried.extend(winners);
                windows += 1;
                debug!(windows, carried = carried.len(), "replay window reduced");
                tokio::task::yield_now().await;
            }
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }

            let mut engine = ReplayEngine::new(self.checkpoints.snapshot());
            let outcome = engine.apply(carried)?;
            self.checkpoints.merge(engine.checkpoints());

            observability::record_replay_winners(outcome.winners.len());
            info!(
                windows,
                winners = outcome.winners.len(),
                skipped_stale = outcome.skipped_stale,
                "replay complete"
            );
            Ok(ReplayReport {
                winners: outcome.winners,
                windows,
                skipped_stale: outcome.skipped_stale,
                checkpoints_due: outcome.checkpoints_due,
            })
        }
        .instrument(span)
        .await
    }
}

/// Reads one JSON event per line, skipping blank lines, and validates each.
///
/// # Errors
///
/// Fails on the first unreadable line, malformed JSON, or event without an
/// entity id or sequence; the error names the 1-based line number.
pub fn read_event_lines<R: BufRead>(reader: R) -> anyhow::Result<Vec<Event<serde_json::Value>>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("reading line {line_no}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawEvent<serde_json::Value> = serde_json::from_str(&line)
            .with_context(|| format!("parsing event on line {line_no}"))?;
        let event = raw
            .validate(events.len())
            .with_context(|| format!("invalid event on line {line_no}"))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bulwark_core::CheckpointManager;
    use proptest::prelude::*;

    use super::*;

    fn ev(id: &str, seq: u64, v: u32) -> Event<u32> {
        Event::new(id, seq, v)
    }

    fn worker() -> (ReplayWorker, Arc<SharedCheckpoints>) {
        let shared = Arc::new(SharedCheckpoints::default());
        (ReplayWorker::new(Arc::clone(&shared)), shared)
    }

    #[tokio::test]
    async fn windowed_run_matches_single_pass() {
        let events = vec![
            ev("a", 1, 10),
            ev("b", 4, 20),
            ev("a", 3, 30),
            ev("b", 4, 40),
            ev("c", 2, 50),
            ev("a", 2, 60),
        ];
        let expected = replay::replay(events.clone()).unwrap();

        let (worker, shared) = worker();
        let report = worker
            .run(events, 2, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.winners, expected);
        assert_eq!(report.windows, 3);
        assert_eq!(shared.last_sequence("a"), Some(3));
        assert_eq!(shared.last_sequence("b"), Some(4));
        // Equal sequences resolve to the later arrival.
        let b = report.winners.iter().find(|e| e.entity_id == "b").unwrap();
        assert_eq!(b.payload, 40);
    }

    #[tokio::test]
    async fn second_run_skips_recovered_events() {
        let (worker, shared) = worker();
        worker
            .run(vec![ev("a", 5, 1)], 10, CancellationToken::new())
            .await
            .unwrap();
        let report = worker
            .run(vec![ev("a", 4, 2), ev("b", 1, 3)], 10, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped_stale, 1);
        assert_eq!(report.winners.len(), 1);
        assert_eq!(shared.last_sequence("a"), Some(5));
    }

    #[tokio::test]
    async fn cancelled_run_leaves_checkpoints_untouched() {
        let (worker, shared) = worker();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = worker
            .run(vec![ev("a", 1, 1)], 1, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Cancelled));
        assert!(shared.streams().is_empty());
    }

    #[tokio::test]
    async fn malformed_event_aborts_with_log_position() {
        let (worker, shared) = worker();
        let events = vec![ev("a", 1, 1), ev("b", 1, 1), ev("c", 1, 1), ev("", 2, 2)];
        let err = worker
            .run(events, 2, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::Replay(ReplayError::MissingEntityId { position: 3 })
        ));
        assert!(shared.streams().is_empty());
    }

    #[tokio::test]
    async fn zero_window_is_rejected() {
        let (worker, _) = worker();
        let err = worker
            .run(vec![ev("a", 1, 1)], 0, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Replay(ReplayError::InvalidWindow)));
    }

    #[tokio::test]
    async fn concurrent_runs_merge_to_the_maximum() {
        let shared = Arc::new(SharedCheckpoints::new(CheckpointManager::new()));
        let left = ReplayWorker::new(Arc::clone(&shared));
        let right = left.clone();
        let a = tokio::spawn(async move {
            left.run(vec![ev("s", 7, 0), ev("t", 1, 0)], 1, CancellationToken::new())
                .await
        });
        let b = tokio::spawn(async move {
            right
                .run(vec![ev("s", 3, 0), ev("t", 9, 0)], 1, CancellationToken::new())
                .await
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(shared.last_sequence("s"), Some(7));
        assert_eq!(shared.last_sequence("t"), Some(9));
    }

    #[test]
    fn reads_json_lines_with_aliases() {
        let input = "{\"entity_id\":\"a\",\"sequence\":1,\"payload\":{\"v\":1}}\n\n{\"id\":\"b\",\"seq\":2,\"payload\":null}\n";
        let events = read_event_lines(Cursor::new(input)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].entity_id, "b");
        assert_eq!(events[1].sequence, 2);
    }

    #[test]
    fn missing_sequence_names_the_line() {
        let input = "{\"entity_id\":\"a\",\"sequence\":1,\"payload\":1}\n{\"entity_id\":\"b\",\"payload\":2}\n";
        let err = read_event_lines(Cursor::new(input)).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    proptest! {
        #[test]
        fn any_window_size_gives_the_same_winners(
            raw in proptest::collection::vec(("[a-c]", 0u64..6, 0u32..100), 0..30),
            window in 1usize..8,
        ) {
            let events: Vec<Event<u32>> =
                raw.into_iter().map(|(id, seq, v)| Event::new(id, seq, v)).collect();
            let expected = replay::replay(events.clone()).unwrap();
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (worker, _) = worker();
            let report = rt
                .block_on(worker.run(events, window, CancellationToken::new()))
                .unwrap();
            prop_assert_eq!(report.winners, expected);
        }
    }
}
