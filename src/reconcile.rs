//! Convergence of the request counter against the fulfilment counter.
//!
//! A lightweight poller asks the metrics source for a fresh snapshot on a
//! fixed tick. Snapshots and source errors travel on separate channels so
//! "counts not yet equal" stays distinguishable from "cannot read counts".
//! At most one poll is outstanding at a time; ticks that land while a poll
//! is in flight are skipped, so a slow source never piles up tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::client::{LoadTestMetrics, MetricsSource};
use crate::error::Error;

/// Default snapshot poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `source` until its request and fulfilment counters are equal or
/// `timeout` elapses, returning the counter pair read from a single
/// snapshot.
///
/// `done` is the run-completion signal: the loop owns the sender and drops
/// it when it returns, on every exit path, so an outer caller can wait for a
/// set of these loops by holding the matching receiver until it closes.
///
/// On timeout the error carries the last-known counter pair (zeros if no
/// snapshot ever arrived), so partial progress stays visible.
pub async fn wait_for_request_count_equal_to_fulfilment_count(
    source: Arc<dyn MetricsSource>,
    timeout: Duration,
    done: mpsc::Sender<()>,
) -> Result<(u64, u64), Error> {
    wait_with_interval(source, timeout, DEFAULT_POLL_INTERVAL, done).await
}

/// [`wait_for_request_count_equal_to_fulfilment_count`] with an explicit
/// poll interval.
pub async fn wait_with_interval(
    source: Arc<dyn MetricsSource>,
    timeout: Duration,
    poll_interval: Duration,
    done: mpsc::Sender<()>,
) -> Result<(u64, u64), Error> {
    // Owning the sender is the completion contract: dropping it on return
    // signals exactly once for every exit path below.
    let _done = done;

    if poll_interval.is_zero() {
        return Err(Error::InvalidConfig(
            "metrics poll interval must be positive".into(),
        ));
    }

    let deadline = Instant::now() + timeout;
    let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<LoadTestMetrics>(1);
    let (error_tx, mut error_rx) = mpsc::channel::<Error>(1);

    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut poll_in_flight = false;
    let mut last: Option<LoadTestMetrics> = None;

    loop {
        tokio::select! {
            _ = time::sleep_until(deadline) => {
                let (request_count, fulfilment_count) = last
                    .map(|m| (m.request_count, m.fulfilment_count))
                    .unwrap_or((0, 0));
                warn!(
                    request_count,
                    fulfilment_count,
                    "Counts did not converge before the deadline"
                );
                return Err(Error::CountsNotConverged {
                    timeout,
                    request_count,
                    fulfilment_count,
                });
            }
            _ = ticker.tick() => {
                if !poll_in_flight {
                    poll_in_flight = true;
                    let source = source.clone();
                    let snapshot_tx = snapshot_tx.clone();
                    let error_tx = error_tx.clone();
                    tokio::spawn(async move {
                        match source.load_test_metrics().await {
                            Ok(metrics) => {
                                let _ = snapshot_tx.send(metrics).await;
                            }
                            Err(e) => {
                                let _ = error_tx.send(e).await;
                            }
                        }
                    });
                }
            }
            Some(metrics) = snapshot_rx.recv() => {
                poll_in_flight = false;
                debug!(
                    request_count = metrics.request_count,
                    fulfilment_count = metrics.fulfilment_count,
                    "Load test metrics snapshot"
                );
                last = Some(metrics);
                if metrics.request_count == metrics.fulfilment_count {
                    return Ok((metrics.request_count, metrics.fulfilment_count));
                }
            }
            Some(e) = error_rx.recv() => {
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;
    use std::time::Instant as StdInstant;

    fn snapshot(request_count: u64, fulfilment_count: u64) -> LoadTestMetrics {
        LoadTestMetrics {
            request_count,
            fulfilment_count,
            average_fulfillment_ms: 0,
            slowest_fulfillment_ms: 0,
            fastest_fulfillment_ms: 0,
        }
    }

    /// Returns queued snapshots in order, repeating the final one forever.
    struct ScriptedSource {
        steps: Mutex<Vec<LoadTestMetrics>>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<LoadTestMetrics>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps),
            })
        }
    }

    impl MetricsSource for ScriptedSource {
        fn load_test_metrics(&self) -> BoxFuture<'_, Result<LoadTestMetrics, Error>> {
            let next = {
                let mut steps = self.steps.lock().unwrap();
                if steps.len() > 1 { steps.remove(0) } else { steps[0] }
            };
            Box::pin(async move { Ok(next) })
        }
    }

    struct FailingSource;

    impl MetricsSource for FailingSource {
        fn load_test_metrics(&self) -> BoxFuture<'_, Result<LoadTestMetrics, Error>> {
            Box::pin(async { Err(Error::MetricsSource("metrics source unreachable".into())) })
        }
    }

    #[tokio::test]
    async fn converges_once_counts_are_equal() {
        let source = ScriptedSource::new(vec![snapshot(2, 1), snapshot(2, 2)]);
        let (done_tx, _done_rx) = mpsc::channel(1);

        let (requests, fulfilments) = wait_with_interval(
            source,
            Duration::from_secs(2),
            Duration::from_millis(20),
            done_tx,
        )
        .await
        .unwrap();
        assert_eq!((requests, fulfilments), (2, 2));
    }

    #[tokio::test]
    async fn timeout_reports_last_known_counts_and_does_not_overrun() {
        let source = ScriptedSource::new(vec![snapshot(3, 1)]);
        let (done_tx, _done_rx) = mpsc::channel(1);
        let timeout = Duration::from_millis(150);
        let poll_interval = Duration::from_millis(20);

        let started = StdInstant::now();
        let err = wait_with_interval(source, timeout, poll_interval, done_tx)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(
            err,
            Error::CountsNotConverged { request_count: 3, fulfilment_count: 1, .. }
        ));
        assert!(
            elapsed < timeout + poll_interval + Duration::from_millis(100),
            "loop overran the deadline: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn source_error_is_terminal_and_distinct_from_non_convergence() {
        let (done_tx, _done_rx) = mpsc::channel(1);

        let err = wait_with_interval(
            Arc::new(FailingSource),
            Duration::from_secs(2),
            Duration::from_millis(20),
            done_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::MetricsSource(_)));
    }

    #[tokio::test]
    async fn completion_signal_released_exactly_once_per_exit_path() {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        // Converged exit.
        let _ = wait_with_interval(
            ScriptedSource::new(vec![snapshot(1, 1)]),
            Duration::from_secs(1),
            Duration::from_millis(20),
            done_tx.clone(),
        )
        .await;
        // Timed-out exit.
        let _ = wait_with_interval(
            ScriptedSource::new(vec![snapshot(2, 1)]),
            Duration::from_millis(80),
            Duration::from_millis(20),
            done_tx.clone(),
        )
        .await;
        // Source-error exit.
        let _ = wait_with_interval(
            Arc::new(FailingSource),
            Duration::from_secs(1),
            Duration::from_millis(20),
            done_tx.clone(),
        )
        .await;

        // Every loop released its clone; dropping the original closes the
        // channel, which is what an outer caller waits on.
        drop(done_tx);
        assert!(done_rx.recv().await.is_none());
    }
}
