use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;

use super::backend::{Backend, HealthState};
use super::pool::Pool;

/// Active probing parameters.
#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub enabled: bool,
    /// Time between probe sweeps.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// Consecutive successes to promote a non-HEALTHY backend.
    pub healthy_threshold: u32,
    /// Consecutive failures to demote a HEALTHY backend.
    pub unhealthy_threshold: u32,
    /// Path probed on every backend.
    pub path: String,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            path: "/health".to_string(),
        }
    }
}

/// Periodically probes every backend in the pool and drives the health
/// state machine from the results.
///
/// A probe succeeds iff the response status is in [200, 300). Probes for
/// distinct backends run as separate tasks, so one slow backend cannot
/// delay the others. The task returned by `start` is aborted at
/// shutdown, cancelling in-flight probes with it.
pub struct ActiveProber {
    pool: Arc<Pool>,
    config: ProberConfig,
    client: HyperClient<HttpConnector, Full<Bytes>>,
}

impl ActiveProber {
    pub fn new(pool: Arc<Pool>, config: ProberConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(config.timeout));
        let client = HyperClient::builder(TokioExecutor::new()).build(connector);
        Self {
            pool,
            config,
            client,
        }
    }

    /// Starts the probe loop. An initial sweep runs immediately so a
    /// dead backend is detected before the first interval elapses.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("active_health_checks_disabled");
                return;
            }

            info!(
                interval_secs = self.config.interval.as_secs(),
                timeout_secs = self.config.timeout.as_secs(),
                path = %self.config.path,
                "active_prober_started"
            );

            let mut tick = tokio::time::interval(self.config.interval);
            loop {
                tick.tick().await;
                self.sweep().await;
            }
        })
    }

    /// Probes all backends in parallel and waits for the stragglers,
    /// which the per-probe timeout bounds.
    pub async fn sweep(&self) {
        let mut probes = Vec::new();
        for backend in self.pool.snapshot_all() {
            let prober = ProbeRun {
                client: self.client.clone(),
                config: self.config.clone(),
            };
            probes.push(tokio::spawn(async move { prober.probe(backend).await }));
        }
        for probe in probes {
            let _ = probe.await;
        }
    }
}

struct ProbeRun {
    client: HyperClient<HttpConnector, Full<Bytes>>,
    config: ProberConfig,
}

impl ProbeRun {
    async fn probe(&self, backend: Arc<Backend>) {
        let base = backend.url().as_str().trim_end_matches('/');
        let uri = format!("{}{}", base, self.config.path);

        let started = Instant::now();
        let outcome = self.send_probe(&uri).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                metrics::record_health_check(backend.key(), true, elapsed.as_secs_f64());
                self.handle_success(&backend);
            }
            Err(reason) => {
                metrics::record_health_check(backend.key(), false, elapsed.as_secs_f64());
                self.handle_failure(&backend, &reason);
            }
        }
    }

    async fn send_probe(&self, uri: &str) -> Result<(), String> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| format!("invalid probe request: {e}"))?;

        let response = tokio::time::timeout(self.config.timeout, self.client.request(request))
            .await
            .map_err(|_| "probe timed out".to_string())?
            .map_err(|e| format!("probe failed: {e}"))?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(format!("status code: {status}"))
        }
    }

    fn handle_success(&self, backend: &Backend) {
        backend.record_success();
        let record = backend.health_record();
        let state = backend.state();

        if state != HealthState::Healthy
            && record.consecutive_successes >= self.config.healthy_threshold
        {
            info!(
                backend = backend.key(),
                from = %state,
                successes = record.consecutive_successes,
                "backend_recovered"
            );
            backend.set_state(HealthState::Healthy);
        }
    }

    fn handle_failure(&self, backend: &Backend, reason: &str) {
        backend.record_failure();
        let record = backend.health_record();

        debug!(
            backend = backend.key(),
            error = reason,
            failures = record.consecutive_failures,
            "health_check_failed"
        );

        if backend.state() == HealthState::Healthy
            && record.consecutive_failures >= self.config.unhealthy_threshold
        {
            warn!(
                backend = backend.key(),
                failures = record.consecutive_failures,
                "backend_unhealthy"
            );
            backend.set_state(HealthState::Unhealthy);
        }
    }
}
