//! Two-phase correlation of a randomness request against the coordinator
//! event stream.
//!
//! A request's id is only assigned on-chain, so it cannot be filtered for up
//! front: the first phase matches a `RandomWordsRequested` event on
//! (key hash, subscription, sender), the second re-filters for the
//! `RandomWordsFulfilled` event on (subscription, request id) extracted from
//! the first. Both phases are deadline-bounded and skip over interleaved
//! events belonging to other in-flight requests on the same filter.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{
    Address, ConsumerClient, CoordinatorClient, CoordinatorEvent, KeyHash, RandomWordsFulfilled,
    RandomWordsRequested, RequestParams,
};
use crate::error::Error;

/// Default bound on the wait for the `RandomWordsRequested` event.
pub const DEFAULT_REQUESTED_EVENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on the wait for the `RandomWordsFulfilled` event.
pub const DEFAULT_FULFILLED_EVENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-phase deadlines for one correlation round-trip.
#[derive(Debug, Clone, Copy)]
pub struct ObservationTimeouts {
    pub requested: Duration,
    pub fulfilled: Duration,
}

impl Default for ObservationTimeouts {
    fn default() -> Self {
        Self {
            requested: DEFAULT_REQUESTED_EVENT_TIMEOUT,
            fulfilled: DEFAULT_FULFILLED_EVENT_TIMEOUT,
        }
    }
}

/// Submit one randomness request and wait for its matching requested and
/// fulfilled events, in that order.
///
/// Submission failure is terminal and surfaced as [`Error::Submission`];
/// each event wait is bounded by its own timeout. A fulfillment whose
/// callback failed is still returned (with `success == false`), not treated
/// as an error. The event subscription is dropped on every exit path.
pub async fn request_randomness_and_wait_for_fulfillment(
    consumer: &dyn ConsumerClient,
    coordinator: &dyn CoordinatorClient,
    params: &RequestParams,
    timeouts: ObservationTimeouts,
) -> Result<RandomWordsFulfilled, Error> {
    // Subscribe before submitting so an immediately-fulfilled request cannot
    // slip past the filter.
    let mut events = coordinator.events();

    debug!(
        sender = %consumer.address(),
        sub_id = params.sub_id,
        key_hash = %params.key_hash,
        native_payment = params.native_payment,
        min_confirmations = params.min_confirmations,
        callback_gas_limit = params.callback_gas_limit,
        num_words = params.num_words,
        request_count = params.request_count,
        "Requesting randomness"
    );

    let tx_hash = consumer
        .request_randomness(params)
        .await
        .map_err(|e| Error::Submission(e.to_string()))?;
    debug!(tx = %tx_hash, "Randomness request submitted");

    let requested = wait_for_requested_event(
        &mut events,
        params.key_hash,
        params.sub_id,
        consumer.address(),
        timeouts.requested,
    )
    .await?;
    info!(
        request_id = requested.request_id,
        sub_id = requested.sub_id,
        sender = %requested.sender,
        num_words = requested.num_words,
        native_payment = requested.native_payment,
        "Observed RandomWordsRequested"
    );

    let fulfilled = wait_for_fulfilled_event(
        &mut events,
        params.sub_id,
        requested.request_id,
        timeouts.fulfilled,
    )
    .await?;
    info!(
        request_id = fulfilled.request_id,
        sub_id = fulfilled.sub_id,
        payment = %fulfilled.payment,
        success = fulfilled.success,
        "Observed RandomWordsFulfilled"
    );

    Ok(fulfilled)
}

/// Wait for a `RandomWordsRequested` event matching (key hash, sub, sender).
///
/// Events for other in-flight requests sharing the stream are skipped, not
/// errors. Lagged (dropped) stream messages are logged and skipped; the
/// deadline bounds the damage if the awaited event was among them.
pub async fn wait_for_requested_event(
    events: &mut broadcast::Receiver<CoordinatorEvent>,
    key_hash: KeyHash,
    sub_id: u64,
    sender: Address,
    timeout: Duration,
) -> Result<RandomWordsRequested, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => {
                return Err(Error::RequestEventTimeout {
                    timeout,
                    key_hash,
                    sub_id,
                    sender,
                });
            }
            Ok(Err(RecvError::Closed)) => return Err(Error::EventStreamClosed),
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "Event stream lagged, continuing");
            }
            Ok(Ok(CoordinatorEvent::Requested(ev)))
                if ev.key_hash == key_hash && ev.sub_id == sub_id && ev.sender == sender =>
            {
                return Ok(ev);
            }
            Ok(Ok(_)) => {}
        }
    }
}

/// Wait for the `RandomWordsFulfilled` event matching (sub, request id).
pub async fn wait_for_fulfilled_event(
    events: &mut broadcast::Receiver<CoordinatorEvent>,
    sub_id: u64,
    request_id: u64,
    timeout: Duration,
) -> Result<RandomWordsFulfilled, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => {
                return Err(Error::FulfillmentEventTimeout {
                    timeout,
                    sub_id,
                    request_id,
                });
            }
            Ok(Err(RecvError::Closed)) => return Err(Error::EventStreamClosed),
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "Event stream lagged, continuing");
            }
            Ok(Ok(CoordinatorEvent::Fulfilled(ev)))
                if ev.sub_id == sub_id && ev.request_id == request_id =>
            {
                return Ok(ev);
            }
            Ok(Ok(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested(key_hash: KeyHash, sub_id: u64, request_id: u64, sender: Address) -> CoordinatorEvent {
        CoordinatorEvent::Requested(RandomWordsRequested {
            key_hash,
            sub_id,
            request_id,
            sender,
            min_confirmations: 3,
            callback_gas_limit: 100_000,
            num_words: 1,
            native_payment: false,
        })
    }

    fn fulfilled(sub_id: u64, request_id: u64) -> CoordinatorEvent {
        CoordinatorEvent::Fulfilled(RandomWordsFulfilled {
            request_id,
            sub_id,
            payment: 1,
            success: true,
        })
    }

    #[tokio::test]
    async fn fulfilled_wait_matches_only_its_own_request_id() {
        let (tx, _keep) = broadcast::channel(16);
        let mut rx_a = tx.subscribe();
        let mut rx_b = tx.subscribe();

        let waiter_a = tokio::spawn(async move {
            wait_for_fulfilled_event(&mut rx_a, 42, 7, Duration::from_secs(1)).await
        });
        let waiter_b = tokio::spawn(async move {
            wait_for_fulfilled_event(&mut rx_b, 42, 8, Duration::from_secs(1)).await
        });

        // B's fulfillment lands first; A must skip it and keep waiting.
        tx.send(fulfilled(42, 8)).unwrap();
        tx.send(fulfilled(42, 7)).unwrap();

        let got_a = waiter_a.await.unwrap().unwrap();
        let got_b = waiter_b.await.unwrap().unwrap();
        assert_eq!(got_a.request_id, 7);
        assert_eq!(got_b.request_id, 8);
    }

    #[tokio::test]
    async fn requested_wait_skips_other_senders_on_the_same_subscription() {
        let (tx, mut rx) = broadcast::channel(16);
        let key_hash = KeyHash::new([1u8; 32]);
        let ours = Address::from_low_u64(1);
        let theirs = Address::from_low_u64(2);

        tx.send(requested(key_hash, 42, 10, theirs)).unwrap();
        tx.send(requested(key_hash, 42, 11, ours)).unwrap();

        let got = wait_for_requested_event(&mut rx, key_hash, 42, ours, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got.request_id, 11);
        assert_eq!(got.sender, ours);
    }

    #[tokio::test]
    async fn requested_wait_times_out_without_a_match() {
        let (tx, mut rx) = broadcast::channel(16);
        let key_hash = KeyHash::new([1u8; 32]);
        tx.send(requested(key_hash, 42, 10, Address::from_low_u64(2)))
            .unwrap();

        let err = wait_for_requested_event(
            &mut rx,
            key_hash,
            42,
            Address::from_low_u64(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::RequestEventTimeout { sub_id: 42, .. }));
    }

    #[tokio::test]
    async fn closed_stream_is_an_error_not_a_hang() {
        let (tx, mut rx) = broadcast::channel::<CoordinatorEvent>(16);
        drop(tx);

        let err = wait_for_fulfilled_event(&mut rx, 42, 7, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EventStreamClosed));
    }
}
