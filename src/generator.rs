//! Rate-paced execution of a gun.
//!
//! The generator fires `gun.call()` on a fixed tick for a fixed duration.
//! Each shot runs on its own task behind an in-flight semaphore, so a slow
//! round-trip delays nothing but itself; the run only returns once every
//! spawned shot has drained.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::error::Error;
use crate::gun::Gun;

/// How often a running generator logs progress.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Per-shot aggregates for one load run.
///
/// Thread-safe via atomics; share as `Arc<LoadStats>`.
#[derive(Debug)]
pub struct LoadStats {
    /// Shots handed to the gun.
    pub attempted: AtomicU64,
    /// Shots whose call returned without failure.
    pub succeeded: AtomicU64,
    /// Shots whose call returned a failed response.
    pub failed: AtomicU64,
    /// Shots currently executing.
    pub in_flight: AtomicU64,
    /// Sum of call latencies in milliseconds (for computing the average).
    pub call_latency_sum_ms: AtomicU64,
    pub slowest_call_ms: AtomicU64,
    /// `u64::MAX` until the first call completes.
    pub fastest_call_ms: AtomicU64,
}

impl LoadStats {
    pub fn new() -> Self {
        Self {
            attempted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            call_latency_sum_ms: AtomicU64::new(0),
            slowest_call_ms: AtomicU64::new(0),
            fastest_call_ms: AtomicU64::new(u64::MAX),
        }
    }

    pub fn record_success(&self, latency_ms: u64) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency_ms);
    }

    pub fn record_failure(&self, latency_ms: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency_ms);
    }

    fn record_latency(&self, latency_ms: u64) {
        self.call_latency_sum_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.slowest_call_ms.fetch_max(latency_ms, Ordering::Relaxed);
        self.fastest_call_ms.fetch_min(latency_ms, Ordering::Relaxed);
    }

    /// Average call latency in milliseconds, or 0 before any call completed.
    pub fn avg_call_ms(&self) -> u64 {
        let completed = self.succeeded.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed);
        if completed == 0 {
            return 0;
        }
        self.call_latency_sum_ms.load(Ordering::Relaxed) / completed
    }

    pub fn fastest_call_ms(&self) -> u64 {
        match self.fastest_call_ms.load(Ordering::Relaxed) {
            u64::MAX => 0,
            v => v,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "attempted": self.attempted.load(Ordering::Relaxed),
            "succeeded": self.succeeded.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "in_flight": self.in_flight.load(Ordering::Relaxed),
            "avg_call_ms": self.avg_call_ms(),
            "slowest_call_ms": self.slowest_call_ms.load(Ordering::Relaxed),
            "fastest_call_ms": self.fastest_call_ms(),
        })
    }
}

impl Default for LoadStats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Generator {
    gun: Arc<dyn Gun>,
    rps: u32,
    duration: Duration,
    max_in_flight: usize,
    stats: Arc<LoadStats>,
}

impl Generator {
    pub fn new(
        gun: Arc<dyn Gun>,
        rps: u32,
        duration: Duration,
        max_in_flight: usize,
        stats: Arc<LoadStats>,
    ) -> Result<Self, Error> {
        if rps == 0 {
            return Err(Error::InvalidConfig(
                "requests per second must be at least 1".into(),
            ));
        }
        if max_in_flight == 0 {
            return Err(Error::InvalidConfig(
                "max in-flight shots must be at least 1".into(),
            ));
        }
        Ok(Self {
            gun,
            rps,
            duration,
            max_in_flight,
            stats,
        })
    }

    /// Fire the gun at the configured rate until the duration elapses, then
    /// drain in-flight shots before returning.
    pub async fn run(&self) -> Result<(), Error> {
        let mut ticker = time::interval(Duration::from_secs_f64(1.0 / f64::from(self.rps)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let started = Instant::now();
        let end = started + self.duration;
        let mut last_progress = Instant::now();

        info!(
            rps = self.rps,
            duration = ?self.duration,
            max_in_flight = self.max_in_flight,
            "Starting load generation"
        );

        while Instant::now() < end {
            ticker.tick().await;

            if last_progress.elapsed() >= PROGRESS_LOG_INTERVAL {
                self.log_progress(started);
                last_progress = Instant::now();
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    error!("Semaphore closed, stopping generator");
                    break;
                }
            };

            self.stats.attempted.fetch_add(1, Ordering::Relaxed);
            self.stats.in_flight.fetch_add(1, Ordering::Relaxed);

            let gun = self.gun.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let result = gun.call().await;
                let latency_ms = start.elapsed().as_millis() as u64;
                if result.failed {
                    stats.record_failure(latency_ms);
                } else {
                    stats.record_success(latency_ms);
                }
                stats.in_flight.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
            });
        }

        info!("Load window closed, draining in-flight shots");
        // All permits returned means every spawned shot has completed.
        if let Err(e) = semaphore.acquire_many(self.max_in_flight as u32).await {
            error!(error = %e, "Semaphore closed while draining");
        }
        self.log_progress(started);
        Ok(())
    }

    fn log_progress(&self, started: Instant) {
        let elapsed_secs = started.elapsed().as_secs().max(1);
        let succeeded = self.stats.succeeded.load(Ordering::Relaxed);
        info!(
            attempted = self.stats.attempted.load(Ordering::Relaxed),
            succeeded,
            failed = self.stats.failed.load(Ordering::Relaxed),
            in_flight = self.stats.in_flight.load(Ordering::Relaxed),
            achieved_rps = succeeded / elapsed_secs,
            avg_call_ms = self.stats.avg_call_ms(),
            "Load progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gun::ShotResult;
    use futures_util::future::BoxFuture;

    struct NoopGun;

    impl Gun for NoopGun {
        fn call(&self) -> BoxFuture<'_, ShotResult> {
            Box::pin(async { ShotResult::ok() })
        }
    }

    struct AlwaysFailingGun;

    impl Gun for AlwaysFailingGun {
        fn call(&self) -> BoxFuture<'_, ShotResult> {
            Box::pin(async { ShotResult::failure(Error::EmptyPool) })
        }
    }

    #[test]
    fn stats_track_min_max_and_average() {
        let stats = LoadStats::new();
        stats.record_success(10);
        stats.record_success(30);
        stats.record_failure(20);

        assert_eq!(stats.avg_call_ms(), 20);
        assert_eq!(stats.slowest_call_ms.load(Ordering::Relaxed), 30);
        assert_eq!(stats.fastest_call_ms(), 10);
    }

    #[test]
    fn fastest_reads_zero_before_any_call() {
        assert_eq!(LoadStats::new().fastest_call_ms(), 0);
    }

    #[test]
    fn zero_rate_is_rejected() {
        let stats = Arc::new(LoadStats::new());
        let result = Generator::new(
            Arc::new(NoopGun),
            0,
            Duration::from_secs(1),
            10,
            stats,
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn run_drains_all_shots_and_accounts_for_each() {
        let stats = Arc::new(LoadStats::new());
        let generator = Generator::new(
            Arc::new(NoopGun),
            100,
            Duration::from_millis(200),
            8,
            stats.clone(),
        )
        .unwrap();
        generator.run().await.unwrap();

        let attempted = stats.attempted.load(Ordering::Relaxed);
        let completed =
            stats.succeeded.load(Ordering::Relaxed) + stats.failed.load(Ordering::Relaxed);
        assert!(attempted > 0);
        assert_eq!(attempted, completed);
        assert_eq!(stats.in_flight.load(Ordering::Relaxed), 0);
        assert_eq!(stats.failed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn failed_calls_are_counted_as_failures() {
        let stats = Arc::new(LoadStats::new());
        let generator = Generator::new(
            Arc::new(AlwaysFailingGun),
            50,
            Duration::from_millis(100),
            8,
            stats.clone(),
        )
        .unwrap();
        generator.run().await.unwrap();

        assert!(stats.failed.load(Ordering::Relaxed) > 0);
        assert_eq!(stats.succeeded.load(Ordering::Relaxed), 0);
    }
}
