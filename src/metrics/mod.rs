//! Metrics recording and Prometheus exposition.
//!
//! Counters and histograms are recorded inline at their sources; gauges
//! that mirror live state (active requests, health and circuit states,
//! remaining retry budget) are exported on a fixed cadence by a
//! background task. Gauge reads race with transitions and may be off by
//! one momentarily; counters and histograms are lossless.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;

use crate::circuit::CircuitRegistry;
use crate::lb::pool::Pool;
use crate::retry::RetryBudget;

/// Cadence of the gauge export loop.
const EXPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Installs the global Prometheus recorder. The returned handle renders
/// the text exposition for the `/metrics` route.
pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Records one proxy attempt against a backend.
pub fn record_request(backend: &str, method: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("backend", backend.to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];
    counter!("requests_total", &labels).increment(1);

    let labels = [
        ("backend", backend.to_string()),
        ("method", method.to_string()),
    ];
    histogram!("request_duration_seconds", &labels).record(duration_secs);
}

/// Records a retry continuation and why it happened.
pub fn record_retry(reason: &'static str) {
    counter!("retries_total", "reason" => reason).increment(1);
}

/// Records one health-check observation: an `attempt` plus its outcome.
pub fn record_health_check(backend: &str, success: bool, duration_secs: f64) {
    counter!("health_checks_total", "backend" => backend.to_string(), "result" => "attempt")
        .increment(1);
    let result = if success { "success" } else { "failure" };
    counter!("health_checks_total", "backend" => backend.to_string(), "result" => result)
        .increment(1);
    histogram!("health_check_duration_seconds", "backend" => backend.to_string())
        .record(duration_secs);
}

/// Starts the periodic gauge export task.
pub fn spawn_gauge_exporter(
    pool: Arc<Pool>,
    breakers: Arc<CircuitRegistry>,
    budget: Option<Arc<RetryBudget>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(EXPORT_INTERVAL);
        loop {
            tick.tick().await;
            export_gauges(&pool, &breakers, budget.as_deref());
        }
    })
}

fn export_gauges(pool: &Pool, breakers: &CircuitRegistry, budget: Option<&RetryBudget>) {
    for backend in pool.snapshot_all() {
        gauge!("backend_state", "backend" => backend.key().to_string())
            .set(backend.state().as_gauge());
        gauge!("active_requests", "backend" => backend.key().to_string())
            .set(backend.active_count() as f64);
    }

    for (key, breaker) in breakers.snapshot() {
        gauge!("circuit_breaker_state", "backend" => key).set(breaker.state().as_gauge());
    }

    if let Some(budget) = budget {
        gauge!("retry_budget_tokens").set(budget.available() as f64);
    }
}
