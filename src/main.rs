//! VRF Load Harness
//!
//! Drives an on-chain randomness workflow under load and verifies that every
//! request eventually produces a matching fulfillment. One run is four
//! phases:
//!
//! 1. **Setup** — start the simulated coordinator and fund the subscription
//!    pool (single-writer phase, before any traffic).
//! 2. **Load** — fire the configured gun at a fixed rate for the configured
//!    duration.
//! 3. **Reconcile** — poll the load-test metrics until the request and
//!    fulfilment counters converge or the deadline passes.
//! 4. **Report** — log the final snapshot, optionally push it to the report
//!    sink, and cancel the pool.
//!
//! An HTTP server exposes `/health`, `/status` and `/metrics` throughout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Instant;

use actix_web::{App, HttpResponse, HttpServer, web};
use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use vrf_loadgen::client::{Address, ConsumerClient, MetricsSource};
use vrf_loadgen::config::{AppConfig, GunMode};
use vrf_loadgen::correlate::ObservationTimeouts;
use vrf_loadgen::generator::{Generator, LoadStats};
use vrf_loadgen::gun::{FireAndForgetGun, Gun, ShotSettings, SingleHashGun};
use vrf_loadgen::pool::{PoolFunding, SubscriptionPool};
use vrf_loadgen::reconcile;
use vrf_loadgen::report::{self, FinalReport};
use vrf_loadgen::sim::{SimConsumer, SimCoordinator, SimSettings};

/// Shared application state accessible from HTTP handlers.
struct AppState {
    stats: Arc<LoadStats>,
    metrics_source: Arc<dyn MetricsSource>,
    /// Most recent deviated per-tx request count.
    last_request_count: Arc<AtomicU16>,
}

/// Liveness probe — returns 200 if the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Live per-shot load statistics.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "load": data.stats.to_json(),
        "last_request_count_per_tx": data.last_request_count.load(Ordering::Relaxed),
    }))
}

/// Current load-test metrics snapshot from the coordinator side.
async fn metrics(data: web::Data<AppState>) -> HttpResponse {
    match data.metrics_source.load_test_metrics().await {
        Ok(snapshot) => HttpResponse::Ok().json(snapshot),
        Err(e) => {
            HttpResponse::InternalServerError().json(serde_json::json!({"error": e.to_string()}))
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    info!(
        rps = config.rps,
        duration = ?config.test_duration,
        gun_mode = ?config.gun_mode,
        billing = %config.billing_type,
        subscriptions = config.subscription_count,
        "Starting VRF load harness"
    );

    let coordinator = SimCoordinator::start(SimSettings {
        hmac_secret: config.sim_hmac_secret.clone(),
        fulfillment_delay: config.sim_fulfillment_delay,
        fulfillment_concurrency: config.sim_fulfillment_concurrency,
    });
    info!(
        key_hash = %coordinator.key_hash(),
        owner = %coordinator.owner(),
        fulfillment_delay = ?config.sim_fulfillment_delay,
        "Simulated coordinator running"
    );

    let consumer = Arc::new(SimConsumer::new(&coordinator, Address::from_low_u64(0xCAFE)));

    // Single-writer setup phase: the pool is immutable once load starts.
    let pool = Arc::new(
        SubscriptionPool::setup(
            &coordinator,
            consumer.address(),
            config.subscription_count,
            PoolFunding {
                link_juels: config.sub_funding_link_juels,
                native_wei: config.sub_funding_native_wei,
            },
            config.billing_type,
        )
        .await?,
    );

    let settings = ShotSettings {
        key_hash: coordinator.key_hash(),
        billing: config.billing_type,
        min_confirmations: config.min_confirmations,
        callback_gas_limit: config.callback_gas_limit,
        num_words: config.num_words,
        request_count_per_tx: config.request_count_per_tx,
        request_count_deviation: config.request_count_deviation,
        timeouts: ObservationTimeouts {
            requested: config.requested_event_timeout,
            fulfilled: config.fulfilled_event_timeout,
        },
    };

    let (gun, last_request_count): (Arc<dyn Gun>, Arc<AtomicU16>) = match config.gun_mode {
        GunMode::ClosedLoop => {
            let gun = SingleHashGun::new(
                Arc::new(coordinator.clone()),
                consumer.clone(),
                pool.clone(),
                settings,
            );
            let gauge = gun.last_request_count();
            (Arc::new(gun), gauge)
        }
        GunMode::FireAndForget => {
            let gun = FireAndForgetGun::new(consumer.clone(), pool.clone(), settings);
            let gauge = gun.last_request_count();
            (Arc::new(gun), gauge)
        }
    };

    let stats = Arc::new(LoadStats::new());
    let metrics_source: Arc<dyn MetricsSource> = Arc::new(coordinator.clone());

    let state = web::Data::new(AppState {
        stats: stats.clone(),
        metrics_source: metrics_source.clone(),
        last_request_count,
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
            .route("/metrics", web::get().to(metrics))
    })
    .bind(("0.0.0.0", config.http_port))?
    .run();
    let server_handle = server.handle();
    tokio::spawn(server);
    info!(port = config.http_port, "HTTP server started");

    // Load phase.
    let started = Instant::now();
    let generator = Generator::new(
        gun,
        config.rps,
        config.test_duration,
        config.max_in_flight,
        stats.clone(),
    )?;
    generator.run().await?;

    // Reconciliation phase: run the loop on its own task and wait for its
    // completion signal before collecting the outcome.
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let reconcile_handle = tokio::spawn(reconcile::wait_with_interval(
        metrics_source.clone(),
        config.converge_timeout,
        config.metrics_poll_interval,
        done_tx,
    ));
    let _ = done_rx.recv().await;
    match reconcile_handle
        .await
        .context("reconciliation task panicked")?
    {
        Ok((requests, fulfilments)) => {
            info!(requests, fulfilments, "Request and fulfilment counts converged");
        }
        Err(e) => error!(error = %e, "Run finished without convergence"),
    }

    let final_metrics = metrics_source.load_test_metrics().await?;
    info!(
        request_count = final_metrics.request_count,
        fulfilment_count = final_metrics.fulfilment_count,
        average_fulfillment_ms = final_metrics.average_fulfillment_ms,
        slowest_fulfillment_ms = final_metrics.slowest_fulfillment_ms,
        fastest_fulfillment_ms = final_metrics.fastest_fulfillment_ms,
        shots_attempted = stats.attempted.load(Ordering::Relaxed),
        shots_failed = stats.failed.load(Ordering::Relaxed),
        "Final load test metrics"
    );

    if let Some(url) = &config.report_url {
        let report = FinalReport {
            test_name: "vrf-loadgen".into(),
            finished_at: chrono::Utc::now().to_rfc3339(),
            duration_ms: started.elapsed().as_millis() as u64,
            target_rps: config.rps,
            shots_attempted: stats.attempted.load(Ordering::Relaxed),
            shots_succeeded: stats.succeeded.load(Ordering::Relaxed),
            shots_failed: stats.failed.load(Ordering::Relaxed),
            metrics: final_metrics,
            labels: BTreeMap::from_iter(config.report_labels.iter().cloned()),
        };
        report::push(url, &report).await;
    }

    pool.teardown(&coordinator, coordinator.owner()).await?;
    server_handle.stop(true).await;
    info!("Run complete");
    Ok(())
}
