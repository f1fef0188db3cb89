//! Load-test harness for an on-chain randomness (VRF) workflow.
//!
//! Drives randomness requests at a controlled rate across a pool of funded
//! subscriptions, correlates every request against its asynchronously
//! observed `RandomWordsRequested` / `RandomWordsFulfilled` events, and then
//! polls a metrics source until the request and fulfilment counters
//! converge.

pub mod billing;
pub mod client;
pub mod config;
pub mod correlate;
pub mod deviation;
pub mod error;
pub mod generator;
pub mod gun;
pub mod pool;
pub mod reconcile;
pub mod report;
pub mod sim;

pub use error::Error;
