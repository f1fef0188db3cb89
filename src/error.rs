//! Error taxonomy for the load harness.
//!
//! Every failure a caller may want to react to gets its own variant; the
//! binary layers `anyhow` context on top of these at its boundary.

use std::time::Duration;

use crate::client::{Address, KeyHash};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The randomness request transaction was rejected at submission.
    #[error("randomness request submission rejected: {0}")]
    Submission(String),

    /// No matching `RandomWordsRequested` event arrived in time.
    #[error(
        "timed out after {timeout:?} waiting for RandomWordsRequested event \
         (key hash {key_hash}, sub {sub_id}, sender {sender})"
    )]
    RequestEventTimeout {
        timeout: Duration,
        key_hash: KeyHash,
        sub_id: u64,
        sender: Address,
    },

    /// No matching `RandomWordsFulfilled` event arrived in time.
    #[error(
        "timed out after {timeout:?} waiting for RandomWordsFulfilled event \
         (sub {sub_id}, request {request_id})"
    )]
    FulfillmentEventTimeout {
        timeout: Duration,
        sub_id: u64,
        request_id: u64,
    },

    /// The coordinator event stream shut down while a wait was in progress.
    #[error("coordinator event stream closed")]
    EventStreamClosed,

    /// The metrics source could not be read at all.
    #[error("metrics source: {0}")]
    MetricsSource(String),

    /// Request and fulfilment counts were still unequal at the deadline.
    /// Carries the last-known counter pair so partial progress stays visible.
    #[error(
        "request and fulfilment counts did not converge within {timeout:?}: \
         requests={request_count} fulfilments={fulfilment_count}"
    )]
    CountsNotConverged {
        timeout: Duration,
        request_count: u64,
        fulfilment_count: u64,
    },

    #[error("unknown billing mode: {0}")]
    InvalidBillingMode(String),

    #[error("unknown key hash: {0}")]
    UnknownKeyHash(KeyHash),

    #[error("subscription {0} not found")]
    UnknownSubscription(u64),

    #[error("consumer {consumer} not authorized for subscription {sub_id}")]
    UnauthorizedConsumer { sub_id: u64, consumer: Address },

    #[error("subscription {sub_id} has insufficient {currency} balance")]
    InsufficientBalance {
        sub_id: u64,
        currency: &'static str,
    },

    #[error("subscription pool is empty")]
    EmptyPool,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
