//! Load-generation units ("guns").
//!
//! A gun is one unit of work fired repeatedly by the rate-paced generator.
//! Every shot resolves a billing flag, deviates the per-tx request count,
//! picks a random subscription and submits; the closed-loop variant then
//! blocks on the full request/fulfillment round-trip while the
//! fire-and-forget variant returns as soon as the request is accepted. Both
//! sit behind the same [`Gun`] trait so the scheduler driving them stays
//! agnostic to which is in use.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use futures_util::future::BoxFuture;
use tracing::warn;

use crate::billing::{self, BillingType};
use crate::client::{ConsumerClient, CoordinatorClient, KeyHash, RequestParams};
use crate::correlate::{self, ObservationTimeouts};
use crate::deviation;
use crate::error::Error;
use crate::pool::SubscriptionPool;

/// Outcome of a single shot, flattened so the scheduler does not need to
/// understand the error taxonomy.
#[derive(Debug)]
pub struct ShotResult {
    pub failed: bool,
    pub error: Option<Error>,
}

impl ShotResult {
    pub fn ok() -> Self {
        Self {
            failed: false,
            error: None,
        }
    }

    pub fn failure(error: Error) -> Self {
        Self {
            failed: true,
            error: Some(error),
        }
    }
}

pub trait Gun: Send + Sync {
    fn call(&self) -> BoxFuture<'_, ShotResult>;
}

/// Request shape shared by every shot of a run. Per-shot values (billing
/// flag, deviated count, subscription) are resolved inside `call`.
#[derive(Debug, Clone)]
pub struct ShotSettings {
    pub key_hash: KeyHash,
    pub billing: BillingType,
    pub min_confirmations: u16,
    pub callback_gas_limit: u32,
    pub num_words: u32,
    pub request_count_per_tx: u16,
    pub request_count_deviation: u16,
    pub timeouts: ObservationTimeouts,
}

fn next_params(
    settings: &ShotSettings,
    pool: &SubscriptionPool,
    last_request_count: &AtomicU16,
) -> Result<RequestParams, Error> {
    let native_payment = billing::select_billing_type(settings.billing, billing::fair_coin);
    let request_count =
        deviation::deviate(settings.request_count_per_tx, settings.request_count_deviation);
    // Monitoring gauge only; the deviated value itself travels in the
    // per-shot params rather than through any shared configuration.
    last_request_count.store(request_count, Ordering::Relaxed);
    let sub_id = pool.pick()?;

    Ok(RequestParams {
        key_hash: settings.key_hash,
        sub_id,
        min_confirmations: settings.min_confirmations,
        callback_gas_limit: settings.callback_gas_limit,
        num_words: settings.num_words,
        native_payment,
        request_count,
    })
}

/// Closed-loop gun: each shot blocks on the full correlation round-trip, for
/// latency testing under load.
pub struct SingleHashGun {
    coordinator: Arc<dyn CoordinatorClient>,
    consumer: Arc<dyn ConsumerClient>,
    pool: Arc<SubscriptionPool>,
    settings: ShotSettings,
    last_request_count: Arc<AtomicU16>,
}

impl SingleHashGun {
    pub fn new(
        coordinator: Arc<dyn CoordinatorClient>,
        consumer: Arc<dyn ConsumerClient>,
        pool: Arc<SubscriptionPool>,
        settings: ShotSettings,
    ) -> Self {
        Self {
            coordinator,
            consumer,
            pool,
            settings,
            last_request_count: Arc::new(AtomicU16::new(0)),
        }
    }

    /// Gauge holding the most recently used per-tx request count.
    pub fn last_request_count(&self) -> Arc<AtomicU16> {
        self.last_request_count.clone()
    }

    async fn shoot(&self) -> Result<(), Error> {
        let params = next_params(&self.settings, &self.pool, &self.last_request_count)?;
        let fulfilled = correlate::request_randomness_and_wait_for_fulfillment(
            self.consumer.as_ref(),
            self.coordinator.as_ref(),
            &params,
            self.settings.timeouts,
        )
        .await?;

        if !fulfilled.success {
            // On-chain callback failure is reported, not a correlation error.
            warn!(
                request_id = fulfilled.request_id,
                sub_id = fulfilled.sub_id,
                "Fulfillment callback reported failure"
            );
        }
        Ok(())
    }
}

impl Gun for SingleHashGun {
    fn call(&self) -> BoxFuture<'_, ShotResult> {
        Box::pin(async move {
            match self.shoot().await {
                Ok(()) => ShotResult::ok(),
                Err(e) => {
                    warn!(error = %e, "Shot failed");
                    ShotResult::failure(e)
                }
            }
        })
    }
}

/// Fire-and-forget gun: submits without waiting for any event, for pure
/// throughput and backlog testing.
pub struct FireAndForgetGun {
    consumer: Arc<dyn ConsumerClient>,
    pool: Arc<SubscriptionPool>,
    settings: ShotSettings,
    last_request_count: Arc<AtomicU16>,
}

impl FireAndForgetGun {
    pub fn new(
        consumer: Arc<dyn ConsumerClient>,
        pool: Arc<SubscriptionPool>,
        settings: ShotSettings,
    ) -> Self {
        Self {
            consumer,
            pool,
            settings,
            last_request_count: Arc::new(AtomicU16::new(0)),
        }
    }

    /// Gauge holding the most recently used per-tx request count.
    pub fn last_request_count(&self) -> Arc<AtomicU16> {
        self.last_request_count.clone()
    }

    async fn shoot(&self) -> Result<(), Error> {
        let params = next_params(&self.settings, &self.pool, &self.last_request_count)?;
        self.consumer
            .request_randomness(&params)
            .await
            .map_err(|e| Error::Submission(e.to_string()))?;
        Ok(())
    }
}

impl Gun for FireAndForgetGun {
    fn call(&self) -> BoxFuture<'_, ShotResult> {
        Box::pin(async move {
            match self.shoot().await {
                Ok(()) => ShotResult::ok(),
                Err(e) => {
                    warn!(error = %e, "Shot failed");
                    ShotResult::failure(e)
                }
            }
        })
    }
}
