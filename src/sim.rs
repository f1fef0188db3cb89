//! In-process coordinator and oracle used by the binary and the test suite.
//!
//! Stands in for the deployed coordinator contract plus the off-chain
//! fulfiller: it validates subscriptions and billing, emits
//! `RandomWordsRequested` / `RandomWordsFulfilled` events over a broadcast
//! channel, and fulfills asynchronously after a configurable delay with
//! bounded concurrency. Random words are derived with HMAC-SHA256 so a given
//! request always produces the same output.
//!
//! Fault knobs for tests: [`SimCoordinator::pause_fulfillment`] leaves
//! requests permanently pending (timeout and non-convergence scenarios) and
//! [`SimCoordinator::set_callback_success`] makes fulfillment callbacks
//! report failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc};
use tracing::{debug, error, info};

use crate::client::{
    Address, ConsumerClient, CoordinatorClient, CoordinatorEvent, KeyHash, LoadTestMetrics,
    MetricsSource, RandomWordsFulfilled, RandomWordsRequested, RequestParams, Subscription,
    TxHash,
};
use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Capacity of the coordinator event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Queue depth between request submission and the oracle task.
const PENDING_QUEUE_CAPACITY: usize = 1024;

/// Flat fee debited per individual randomness request, in juels or wei.
pub const FLAT_FEE: u128 = 250_000;

/// Tuning for the simulated coordinator.
#[derive(Debug, Clone)]
pub struct SimSettings {
    /// Secret key for HMAC-SHA256 word derivation.
    pub hmac_secret: Vec<u8>,
    /// Simulated latency between request and fulfillment.
    pub fulfillment_delay: Duration,
    /// Maximum concurrent fulfillment tasks.
    pub fulfillment_concurrency: usize,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            hmac_secret: b"vrf-loadgen-dev-secret".to_vec(),
            fulfillment_delay: Duration::from_millis(50),
            fulfillment_concurrency: 4,
        }
    }
}

struct PendingFulfillment {
    request_id: u64,
    sub_id: u64,
    num_words: u32,
    requested_at: Instant,
}

struct MetricsInner {
    request_count: u64,
    fulfilment_count: u64,
    latency_sum_ms: u64,
    slowest_ms: u64,
    fastest_ms: u64,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            request_count: 0,
            fulfilment_count: 0,
            latency_sum_ms: 0,
            slowest_ms: 0,
            fastest_ms: u64::MAX,
        }
    }
}

struct Inner {
    events: broadcast::Sender<CoordinatorEvent>,
    pending_tx: mpsc::Sender<PendingFulfillment>,
    key_hash: KeyHash,
    owner: Address,
    hmac_secret: Vec<u8>,
    subs: Mutex<HashMap<u64, Subscription>>,
    next_sub_id: AtomicU64,
    next_request_id: AtomicU64,
    // Counter pair and latency aggregates live under one lock so a snapshot
    // always reads an internally consistent state.
    metrics: Mutex<MetricsInner>,
    fulfillment_paused: AtomicBool,
    callback_success: AtomicBool,
}

#[derive(Clone)]
pub struct SimCoordinator {
    inner: Arc<Inner>,
}

impl SimCoordinator {
    /// Start the coordinator and spawn its oracle task.
    pub fn start(settings: SimSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (pending_tx, pending_rx) = mpsc::channel(PENDING_QUEUE_CAPACITY);

        let inner = Arc::new(Inner {
            events,
            pending_tx,
            key_hash: derive_key_hash(&settings.hmac_secret),
            owner: derive_owner(&settings.hmac_secret),
            hmac_secret: settings.hmac_secret,
            subs: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
            metrics: Mutex::new(MetricsInner::new()),
            fulfillment_paused: AtomicBool::new(false),
            callback_success: AtomicBool::new(true),
        });

        let oracle = inner.clone();
        tokio::spawn(run_oracle(
            oracle,
            pending_rx,
            settings.fulfillment_delay,
            settings.fulfillment_concurrency,
        ));

        Self { inner }
    }

    /// Key hash of the simulated proving key.
    pub fn key_hash(&self) -> KeyHash {
        self.inner.key_hash
    }

    /// Owner identity subscriptions are created under.
    pub fn owner(&self) -> Address {
        self.inner.owner
    }

    /// Stop fulfilling; requests accepted while paused stay pending forever.
    pub fn pause_fulfillment(&self, paused: bool) {
        self.inner.fulfillment_paused.store(paused, Ordering::Relaxed);
    }

    /// Make subsequent fulfillment callbacks report failure.
    pub fn set_callback_success(&self, success: bool) {
        self.inner.callback_success.store(success, Ordering::Relaxed);
    }

    async fn submit(&self, sender: Address, params: &RequestParams) -> Result<TxHash, Error> {
        if params.key_hash != self.inner.key_hash {
            return Err(Error::UnknownKeyHash(params.key_hash));
        }

        // Validate and debit under the subscription lock, before any event
        // becomes visible.
        {
            let mut subs = self.inner.subs.lock().await;
            let sub = subs
                .get_mut(&params.sub_id)
                .ok_or(Error::UnknownSubscription(params.sub_id))?;
            if !sub.consumers.contains(&sender) {
                return Err(Error::UnauthorizedConsumer {
                    sub_id: params.sub_id,
                    consumer: sender,
                });
            }

            let total_fee = FLAT_FEE * u128::from(params.request_count);
            if params.native_payment {
                if sub.native_balance < total_fee {
                    return Err(Error::InsufficientBalance {
                        sub_id: params.sub_id,
                        currency: "native",
                    });
                }
                sub.native_balance -= total_fee;
            } else {
                if sub.link_balance < total_fee {
                    return Err(Error::InsufficientBalance {
                        sub_id: params.sub_id,
                        currency: "LINK",
                    });
                }
                sub.link_balance -= total_fee;
            }
        }

        let mut first_request_id = 0u64;
        for _ in 0..params.request_count {
            let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
            if first_request_id == 0 {
                first_request_id = request_id;
            }

            self.inner.metrics.lock().await.request_count += 1;

            let event = CoordinatorEvent::Requested(RandomWordsRequested {
                key_hash: params.key_hash,
                sub_id: params.sub_id,
                request_id,
                sender,
                min_confirmations: params.min_confirmations,
                callback_gas_limit: params.callback_gas_limit,
                num_words: params.num_words,
                native_payment: params.native_payment,
            });
            // A send error only means nobody is subscribed right now.
            let _ = self.inner.events.send(event);

            let pending = PendingFulfillment {
                request_id,
                sub_id: params.sub_id,
                num_words: params.num_words,
                requested_at: Instant::now(),
            };
            if self.inner.pending_tx.send(pending).await.is_err() {
                error!(request_id, "Oracle queue closed, request will stay pending");
            }
        }

        debug!(
            sender = %sender,
            sub_id = params.sub_id,
            count = params.request_count,
            first_request_id,
            "Accepted randomness request"
        );
        Ok(tx_hash(first_request_id, sender))
    }
}

/// Consume pending requests and fulfill each on its own task, gated by a
/// concurrency semaphore.
async fn run_oracle(
    inner: Arc<Inner>,
    mut pending_rx: mpsc::Receiver<PendingFulfillment>,
    delay: Duration,
    concurrency: usize,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));

    while let Some(pending) = pending_rx.recv().await {
        if inner.fulfillment_paused.load(Ordering::Relaxed) {
            debug!(
                request_id = pending.request_id,
                "Fulfillment paused, dropping request"
            );
            continue;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!("Semaphore closed, stopping oracle");
                break;
            }
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            tokio::time::sleep(delay).await;
            fulfill(&inner, pending).await;
        });
    }

    info!("Oracle queue closed, shutting down");
}

async fn fulfill(inner: &Inner, pending: PendingFulfillment) {
    let words = derive_random_words(
        &inner.hmac_secret,
        pending.sub_id,
        pending.request_id,
        pending.num_words,
    );
    let success = inner.callback_success.load(Ordering::Relaxed);
    let latency_ms = pending.requested_at.elapsed().as_millis() as u64;

    {
        let mut metrics = inner.metrics.lock().await;
        // A failed callback never bumps the fulfilment counter; the consumer
        // only counts deliveries that reached it.
        if success {
            metrics.fulfilment_count += 1;
            metrics.latency_sum_ms += latency_ms;
            metrics.slowest_ms = metrics.slowest_ms.max(latency_ms);
            metrics.fastest_ms = metrics.fastest_ms.min(latency_ms);
        }
    }

    debug!(
        request_id = pending.request_id,
        sub_id = pending.sub_id,
        words = words.len(),
        latency_ms,
        success,
        "Fulfilled randomness request"
    );

    let event = CoordinatorEvent::Fulfilled(RandomWordsFulfilled {
        request_id: pending.request_id,
        sub_id: pending.sub_id,
        payment: FLAT_FEE,
        success,
    });
    let _ = inner.events.send(event);
}

impl CoordinatorClient for SimCoordinator {
    fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    fn create_subscription(&self) -> BoxFuture<'_, Result<u64, Error>> {
        Box::pin(async move {
            let sub_id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed) + 1;
            let sub = Subscription {
                id: sub_id,
                owner: self.inner.owner,
                link_balance: 0,
                native_balance: 0,
                consumers: Vec::new(),
            };
            self.inner.subs.lock().await.insert(sub_id, sub);
            debug!(sub_id, "Created subscription");
            Ok(sub_id)
        })
    }

    fn fund_subscription_link(&self, sub_id: u64, juels: u128) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut subs = self.inner.subs.lock().await;
            let sub = subs.get_mut(&sub_id).ok_or(Error::UnknownSubscription(sub_id))?;
            sub.link_balance += juels;
            debug!(sub_id, juels = %juels, "Funded subscription with LINK");
            Ok(())
        })
    }

    fn fund_subscription_native(&self, sub_id: u64, wei: u128) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut subs = self.inner.subs.lock().await;
            let sub = subs.get_mut(&sub_id).ok_or(Error::UnknownSubscription(sub_id))?;
            sub.native_balance += wei;
            debug!(sub_id, wei = %wei, "Funded subscription with native token");
            Ok(())
        })
    }

    fn add_consumer(&self, sub_id: u64, consumer: Address) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut subs = self.inner.subs.lock().await;
            let sub = subs.get_mut(&sub_id).ok_or(Error::UnknownSubscription(sub_id))?;
            if !sub.consumers.contains(&consumer) {
                sub.consumers.push(consumer);
            }
            debug!(sub_id, consumer = %consumer, "Authorized consumer");
            Ok(())
        })
    }

    fn get_subscription(&self, sub_id: u64) -> BoxFuture<'_, Result<Subscription, Error>> {
        Box::pin(async move {
            let subs = self.inner.subs.lock().await;
            subs.get(&sub_id)
                .cloned()
                .ok_or(Error::UnknownSubscription(sub_id))
        })
    }

    fn cancel_subscription(&self, sub_id: u64, to: Address) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut subs = self.inner.subs.lock().await;
            let sub = subs.remove(&sub_id).ok_or(Error::UnknownSubscription(sub_id))?;
            info!(
                sub_id,
                refund_to = %to,
                link_refund = %sub.link_balance,
                native_refund = %sub.native_balance,
                "Cancelled subscription"
            );
            Ok(())
        })
    }
}

impl MetricsSource for SimCoordinator {
    fn load_test_metrics(&self) -> BoxFuture<'_, Result<LoadTestMetrics, Error>> {
        Box::pin(async move {
            let m = self.inner.metrics.lock().await;
            Ok(LoadTestMetrics {
                request_count: m.request_count,
                fulfilment_count: m.fulfilment_count,
                average_fulfillment_ms: if m.fulfilment_count == 0 {
                    0
                } else {
                    m.latency_sum_ms / m.fulfilment_count
                },
                slowest_fulfillment_ms: m.slowest_ms,
                fastest_fulfillment_ms: if m.fastest_ms == u64::MAX { 0 } else { m.fastest_ms },
            })
        })
    }
}

/// Consumer-contract stand-in bound to one simulated coordinator.
pub struct SimConsumer {
    address: Address,
    coordinator: SimCoordinator,
}

impl SimConsumer {
    pub fn new(coordinator: &SimCoordinator, address: Address) -> Self {
        Self {
            address,
            coordinator: coordinator.clone(),
        }
    }
}

impl ConsumerClient for SimConsumer {
    fn address(&self) -> Address {
        self.address
    }

    fn request_randomness<'a>(
        &'a self,
        params: &'a RequestParams,
    ) -> BoxFuture<'a, Result<TxHash, Error>> {
        Box::pin(async move { self.coordinator.submit(self.address, params).await })
    }
}

/// Derive `num_words` 32-byte random words for a request.
///
/// ```text
/// word[i] = HMAC-SHA256(secret, sub_id_le || request_id_le || i_le)
/// ```
pub fn derive_random_words(
    secret: &[u8],
    sub_id: u64,
    request_id: u64,
    num_words: u32,
) -> Vec<[u8; 32]> {
    (0..num_words)
        .map(|i| {
            let mut mac =
                HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any size");
            mac.update(&sub_id.to_le_bytes());
            mac.update(&request_id.to_le_bytes());
            mac.update(&i.to_le_bytes());
            let bytes = mac.finalize().into_bytes();
            let mut word = [0u8; 32];
            word.copy_from_slice(&bytes);
            word
        })
        .collect()
}

fn derive_key_hash(secret: &[u8]) -> KeyHash {
    let mut hasher = Sha256::new();
    hasher.update(b"key:");
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    KeyHash::new(bytes)
}

fn derive_owner(secret: &[u8]) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(b"owner:");
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[..20]);
    Address::new(bytes)
}

fn tx_hash(first_request_id: u64, sender: Address) -> TxHash {
    let mut hasher = Sha256::new();
    hasher.update(b"tx:");
    hasher.update(first_request_id.to_le_bytes());
    hasher.update(sender.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    TxHash::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_deterministic_for_the_same_request() {
        let w1 = derive_random_words(b"secret", 1, 10, 3);
        let w2 = derive_random_words(b"secret", 1, 10, 3);
        assert_eq!(w1, w2);
        assert_eq!(w1.len(), 3);
    }

    #[test]
    fn words_differ_across_requests_and_indices() {
        let a = derive_random_words(b"secret", 1, 10, 2);
        let b = derive_random_words(b"secret", 1, 11, 2);
        assert_ne!(a[0], b[0]);
        assert_ne!(a[0], a[1]);
    }

    fn params(coordinator: &SimCoordinator, sub_id: u64, request_count: u16) -> RequestParams {
        RequestParams {
            key_hash: coordinator.key_hash(),
            sub_id,
            min_confirmations: 3,
            callback_gas_limit: 100_000,
            num_words: 1,
            native_payment: false,
            request_count,
        }
    }

    #[tokio::test]
    async fn submission_is_validated_before_any_event() {
        let coordinator = SimCoordinator::start(SimSettings::default());
        let sender = Address::from_low_u64(1);

        let err = coordinator.submit(sender, &params(&coordinator, 99, 1)).await;
        assert!(matches!(err, Err(Error::UnknownSubscription(99))));

        let sub_id = coordinator.create_subscription().await.unwrap();
        let err = coordinator.submit(sender, &params(&coordinator, sub_id, 1)).await;
        assert!(matches!(err, Err(Error::UnauthorizedConsumer { .. })));

        coordinator.add_consumer(sub_id, sender).await.unwrap();
        let err = coordinator.submit(sender, &params(&coordinator, sub_id, 1)).await;
        assert!(matches!(err, Err(Error::InsufficientBalance { .. })));

        let metrics = coordinator.load_test_metrics().await.unwrap();
        assert_eq!(metrics.request_count, 0);
    }

    #[tokio::test]
    async fn each_unit_of_the_request_count_is_billed_and_counted() {
        let coordinator = SimCoordinator::start(SimSettings::default());
        let sender = Address::from_low_u64(1);
        let sub_id = coordinator.create_subscription().await.unwrap();
        coordinator.add_consumer(sub_id, sender).await.unwrap();
        coordinator
            .fund_subscription_link(sub_id, FLAT_FEE * 10)
            .await
            .unwrap();

        coordinator
            .submit(sender, &params(&coordinator, sub_id, 3))
            .await
            .unwrap();

        let sub = coordinator.get_subscription(sub_id).await.unwrap();
        assert_eq!(sub.link_balance, FLAT_FEE * 7);

        let metrics = coordinator.load_test_metrics().await.unwrap();
        assert_eq!(metrics.request_count, 3);
    }

    #[tokio::test]
    async fn wrong_key_hash_is_rejected() {
        let coordinator = SimCoordinator::start(SimSettings::default());
        let sender = Address::from_low_u64(1);
        let sub_id = coordinator.create_subscription().await.unwrap();
        coordinator.add_consumer(sub_id, sender).await.unwrap();

        let mut p = params(&coordinator, sub_id, 1);
        p.key_hash = KeyHash::new([9u8; 32]);
        let err = coordinator.submit(sender, &p).await;
        assert!(matches!(err, Err(Error::UnknownKeyHash(_))));
    }
}
