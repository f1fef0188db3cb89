//! Final-report push to an external collection endpoint.
//!
//! The push is fire-and-forget: a dead or rejecting sink is logged and never
//! fails the run.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::client::LoadTestMetrics;

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot pushed once at run completion.
#[derive(Debug, Serialize)]
pub struct FinalReport {
    pub test_name: String,
    pub finished_at: String,
    pub duration_ms: u64,
    pub target_rps: u32,
    pub shots_attempted: u64,
    pub shots_succeeded: u64,
    pub shots_failed: u64,
    pub metrics: LoadTestMetrics,
    pub labels: BTreeMap<String, String>,
}

/// POST the report as JSON to `url`.
pub async fn push(url: &str, report: &FinalReport) {
    let client = match reqwest::Client::builder().timeout(PUSH_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to build report client");
            return;
        }
    };

    match client.post(url).json(report).send().await {
        Ok(resp) if resp.status().is_success() => {
            info!(url = %url, status = %resp.status(), "Pushed final report");
        }
        Ok(resp) => {
            warn!(url = %url, status = %resp.status(), "Report sink rejected final report");
        }
        Err(e) => {
            warn!(url = %url, error = %e, "Failed to push final report");
        }
    }
}
