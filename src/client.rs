//! Ledger-facing types and collaborator traits.
//!
//! The harness never talks to a chain directly; it depends on three narrow
//! capabilities, each behind a trait object so tests and the binary can plug
//! in the in-process simulator:
//!
//! - [`CoordinatorClient`] — subscription management plus a broadcast event
//!   stream that delivers every coordinator event in arrival order.
//! - [`ConsumerClient`] — submits randomness requests on behalf of one
//!   consumer identity.
//! - [`MetricsSource`] — point-in-time load-test counters read as a single
//!   consistent snapshot.

use std::fmt;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::Error;

/// 20-byte account identity, displayed as 0x-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Build an address whose trailing 8 bytes hold `n` big-endian.
    pub fn from_low_u64(n: u64) -> Self {
        let mut bytes = [0u8; 20];
        bytes[12..].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 32-byte identifier of a registered oracle proving key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHash([u8; 32]);

impl KeyHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 32-byte transaction hash returned by a successful submission.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A funded logical account that requests are billed against.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u64,
    pub owner: Address,
    /// LINK balance in juels.
    pub link_balance: u128,
    /// Native-token balance in wei.
    pub native_balance: u128,
    /// Consumer identities authorized to request against this subscription.
    pub consumers: Vec<Address>,
}

/// Per-call request shape handed to [`ConsumerClient::request_randomness`].
#[derive(Debug, Clone, Copy)]
pub struct RequestParams {
    pub key_hash: KeyHash,
    pub sub_id: u64,
    pub min_confirmations: u16,
    pub callback_gas_limit: u32,
    pub num_words: u32,
    /// Pay in native token instead of LINK.
    pub native_payment: bool,
    /// How many individual coordinator requests this one transaction fans
    /// out into; each gets its own request id and event pair.
    pub request_count: u16,
}

/// Emitted by the coordinator once a request transaction lands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomWordsRequested {
    pub key_hash: KeyHash,
    pub sub_id: u64,
    pub request_id: u64,
    pub sender: Address,
    pub min_confirmations: u16,
    pub callback_gas_limit: u32,
    pub num_words: u32,
    pub native_payment: bool,
}

/// Emitted by the coordinator once the oracle response lands. `success`
/// reports whether the consumer callback succeeded; a failed callback is
/// still a delivered fulfillment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomWordsFulfilled {
    pub request_id: u64,
    pub sub_id: u64,
    /// Fee charged for the fulfillment, in juels or wei per the billing flag.
    pub payment: u128,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoordinatorEvent {
    Requested(RandomWordsRequested),
    Fulfilled(RandomWordsFulfilled),
}

/// Point-in-time load-test counters. The two counts always come from the
/// same snapshot; comparing counts read across two snapshots is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadTestMetrics {
    pub request_count: u64,
    pub fulfilment_count: u64,
    pub average_fulfillment_ms: u64,
    pub slowest_fulfillment_ms: u64,
    pub fastest_fulfillment_ms: u64,
}

pub trait CoordinatorClient: Send + Sync {
    /// Subscribe to the coordinator event stream. Every subscriber observes
    /// every event, in arrival order.
    fn events(&self) -> broadcast::Receiver<CoordinatorEvent>;

    fn create_subscription(&self) -> BoxFuture<'_, Result<u64, Error>>;

    fn fund_subscription_link(&self, sub_id: u64, juels: u128) -> BoxFuture<'_, Result<(), Error>>;

    fn fund_subscription_native(&self, sub_id: u64, wei: u128) -> BoxFuture<'_, Result<(), Error>>;

    fn add_consumer(&self, sub_id: u64, consumer: Address) -> BoxFuture<'_, Result<(), Error>>;

    fn get_subscription(&self, sub_id: u64) -> BoxFuture<'_, Result<Subscription, Error>>;

    /// Cancel the subscription, refunding any remaining balances to `to`.
    fn cancel_subscription(&self, sub_id: u64, to: Address) -> BoxFuture<'_, Result<(), Error>>;
}

pub trait ConsumerClient: Send + Sync {
    /// The consumer identity requests are sent as; part of the correlation
    /// key for the requested-event wait.
    fn address(&self) -> Address;

    fn request_randomness<'a>(
        &'a self,
        params: &'a RequestParams,
    ) -> BoxFuture<'a, Result<TxHash, Error>>;
}

pub trait MetricsSource: Send + Sync {
    fn load_test_metrics(&self) -> BoxFuture<'_, Result<LoadTestMetrics, Error>>;
}
