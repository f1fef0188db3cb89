//! Harness configuration loaded from environment variables.
//!
//! Every option has a default; a `.env` file is honored when present.
//! Recognized variables:
//!
//! Load: `REQUESTS_PER_SECOND`, `TEST_DURATION_SECS`, `MAX_IN_FLIGHT`,
//!       `GUN_MODE` (`closed-loop` | `fire-and-forget`)
//! Pool: `SUBSCRIPTION_COUNT`, `SUB_FUNDING_LINK_JUELS`,
//!       `SUB_FUNDING_NATIVE_WEI`, `BILLING_TYPE` (`LINK` | `NATIVE` |
//!       `LINK_AND_NATIVE`)
//! Requests: `MIN_CONFIRMATIONS`, `CALLBACK_GAS_LIMIT`, `NUM_WORDS`,
//!       `REQUEST_COUNT_PER_TX`, `REQUEST_COUNT_DEVIATION`
//! Timeouts: `REQUESTED_EVENT_TIMEOUT_SECS`, `FULFILLED_EVENT_TIMEOUT_SECS`,
//!       `CONVERGE_TIMEOUT_SECS`, `METRICS_POLL_INTERVAL_MS`
//! Observability: `HTTP_PORT`, `REPORT_URL`, `REPORT_LABELS`
//!       (comma-separated `key=value` pairs)
//! Simulator: `SIM_HMAC_SECRET`, `SIM_FULFILLMENT_DELAY_MS`,
//!       `SIM_FULFILLMENT_CONCURRENCY`

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::billing::BillingType;
use crate::correlate::{DEFAULT_FULFILLED_EVENT_TIMEOUT, DEFAULT_REQUESTED_EVENT_TIMEOUT};
use crate::reconcile::DEFAULT_POLL_INTERVAL;

/// Which gun variant the generator fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GunMode {
    /// Block each shot on the full request/fulfillment round-trip.
    ClosedLoop,
    /// Submit only; the fulfillment backlog is left to the reconciliation
    /// phase.
    FireAndForget,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rps: u32,
    pub test_duration: Duration,
    pub max_in_flight: usize,
    pub gun_mode: GunMode,

    pub subscription_count: usize,
    pub sub_funding_link_juels: u128,
    pub sub_funding_native_wei: u128,
    pub billing_type: BillingType,

    pub min_confirmations: u16,
    pub callback_gas_limit: u32,
    pub num_words: u32,
    pub request_count_per_tx: u16,
    pub request_count_deviation: u16,

    pub requested_event_timeout: Duration,
    pub fulfilled_event_timeout: Duration,
    pub converge_timeout: Duration,
    pub metrics_poll_interval: Duration,

    pub http_port: u16,
    pub report_url: Option<String>,
    pub report_labels: Vec<(String, String)>,

    pub sim_hmac_secret: Vec<u8>,
    pub sim_fulfillment_delay: Duration,
    pub sim_fulfillment_concurrency: usize,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let billing_str =
            std::env::var("BILLING_TYPE").unwrap_or_else(|_| "LINK_AND_NATIVE".into());
        let billing_type = billing_str
            .parse::<BillingType>()
            .with_context(|| format!("invalid BILLING_TYPE: {billing_str}"))?;

        let gun_mode_str = std::env::var("GUN_MODE").unwrap_or_else(|_| "closed-loop".into());
        let gun_mode = parse_gun_mode(&gun_mode_str)
            .with_context(|| format!("invalid GUN_MODE: {gun_mode_str}"))?;

        let report_labels = match std::env::var("REPORT_LABELS") {
            Ok(raw) => {
                parse_report_labels(&raw).with_context(|| format!("invalid REPORT_LABELS: {raw}"))?
            }
            Err(_) => Vec::new(),
        };

        let sim_hmac_secret = std::env::var("SIM_HMAC_SECRET")
            .unwrap_or_else(|_| "vrf-loadgen-dev-secret".into())
            .into_bytes();

        Ok(Self {
            rps: env_or("REQUESTS_PER_SECOND", 10),
            test_duration: Duration::from_secs(env_or("TEST_DURATION_SECS", 30)),
            max_in_flight: env_or("MAX_IN_FLIGHT", 100),
            gun_mode,

            subscription_count: env_or("SUBSCRIPTION_COUNT", 5),
            sub_funding_link_juels: env_or("SUB_FUNDING_LINK_JUELS", 1_000_000_000u128),
            sub_funding_native_wei: env_or("SUB_FUNDING_NATIVE_WEI", 1_000_000_000u128),
            billing_type,

            min_confirmations: env_or("MIN_CONFIRMATIONS", 3),
            callback_gas_limit: env_or("CALLBACK_GAS_LIMIT", 1_000_000),
            num_words: env_or("NUM_WORDS", 3),
            request_count_per_tx: env_or("REQUEST_COUNT_PER_TX", 3),
            request_count_deviation: env_or("REQUEST_COUNT_DEVIATION", 2),

            requested_event_timeout: Duration::from_secs(env_or(
                "REQUESTED_EVENT_TIMEOUT_SECS",
                DEFAULT_REQUESTED_EVENT_TIMEOUT.as_secs(),
            )),
            fulfilled_event_timeout: Duration::from_secs(env_or(
                "FULFILLED_EVENT_TIMEOUT_SECS",
                DEFAULT_FULFILLED_EVENT_TIMEOUT.as_secs(),
            )),
            converge_timeout: Duration::from_secs(env_or("CONVERGE_TIMEOUT_SECS", 120)),
            metrics_poll_interval: Duration::from_millis(env_or(
                "METRICS_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL.as_millis() as u64,
            )),

            http_port: env_or("HTTP_PORT", 8080),
            report_url: std::env::var("REPORT_URL").ok(),
            report_labels,

            sim_hmac_secret,
            sim_fulfillment_delay: Duration::from_millis(env_or("SIM_FULFILLMENT_DELAY_MS", 250)),
            sim_fulfillment_concurrency: env_or("SIM_FULFILLMENT_CONCURRENCY", 4),
        })
    }
}

fn parse_gun_mode(s: &str) -> Result<GunMode> {
    match s.to_ascii_lowercase().replace('_', "-").as_str() {
        "closed-loop" => Ok(GunMode::ClosedLoop),
        "fire-and-forget" => Ok(GunMode::FireAndForget),
        other => anyhow::bail!("unknown gun mode: {other}"),
    }
}

fn parse_report_labels(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("label `{pair}` is not key=value"))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
