use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use url::Url;

/// Health state of a backend.
///
/// `Draining` is an administrative state: nothing transitions into it
/// automatically, but a draining backend is excluded from selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Draining,
    Down,
}

impl HealthState {
    /// Gauge encoding: DOWN=0, UNHEALTHY=1, DRAINING=2, HEALTHY=3.
    pub fn as_gauge(self) -> f64 {
        match self {
            HealthState::Down => 0.0,
            HealthState::Unhealthy => 1.0,
            HealthState::Draining => 2.0,
            HealthState::Healthy => 3.0,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::Unhealthy => "UNHEALTHY",
            HealthState::Draining => "DRAINING",
            HealthState::Down => "DOWN",
        };
        f.write_str(s)
    }
}

/// Rolling health-check bookkeeping, shared by the active prober and the
/// passive tracker. A success zeroes the failure streak and vice versa.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthRecord {
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_check: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
}

#[derive(Debug)]
struct HealthSlot {
    state: HealthState,
    record: HealthRecord,
}

/// A single upstream server, keyed by its authority (`host:port`).
///
/// The selection hot path reads only the `alive` flag and the active
/// counter; state and rolling counters sit behind a small RwLock that is
/// touched by the prober and the passive tracker.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    key: String,
    weight: AtomicU32,
    active: AtomicI64,
    alive: AtomicBool,
    health: RwLock<HealthSlot>,
}

impl Backend {
    pub fn new(url: Url) -> Self {
        let host = url.host_str().unwrap_or("unknown");
        let port = url.port_or_known_default().unwrap_or(80);
        Self {
            key: format!("{}:{}", host, port),
            url,
            weight: AtomicU32::new(1),
            active: AtomicI64::new(0),
            alive: AtomicBool::new(true),
            health: RwLock::new(HealthSlot {
                state: HealthState::Healthy,
                record: HealthRecord::default(),
            }),
        }
    }

    /// Full URL of the backend (e.g. `http://10.0.0.1:9000`).
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Authority key (`host:port`) used for circuit breakers, strategy
    /// tables, and metric labels.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Hot-path health read. True iff the state is `Healthy`.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> HealthState {
        self.health.read().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Sets the health state. The `alive` mirror is updated inside the
    /// same critical section so no observer sees them disagree.
    pub fn set_state(&self, state: HealthState) {
        let mut slot = self.health.write().unwrap_or_else(|e| e.into_inner());
        slot.state = state;
        self.alive.store(state == HealthState::Healthy, Ordering::Relaxed);
    }

    /// Records a successful health observation (active probe or real
    /// request). Resets the failure streak.
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut slot = self.health.write().unwrap_or_else(|e| e.into_inner());
        slot.record.consecutive_successes += 1;
        slot.record.consecutive_failures = 0;
        slot.record.last_check = Some(now);
        slot.record.last_success = Some(now);
    }

    /// Records a failed health observation. Resets the success streak.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut slot = self.health.write().unwrap_or_else(|e| e.into_inner());
        slot.record.consecutive_failures += 1;
        slot.record.consecutive_successes = 0;
        slot.record.last_check = Some(now);
        slot.record.last_failure = Some(now);
    }

    pub fn health_record(&self) -> HealthRecord {
        self.health.read().unwrap_or_else(|e| e.into_inner()).record
    }

    /// Copies health state and rolling counters from a previous instance
    /// of the same backend. Used by `Pool::replace` so a reload does not
    /// reset a backend's standing.
    pub fn adopt_health_from(&self, old: &Backend) {
        let (state, record) = {
            let slot = old.health.read().unwrap_or_else(|e| e.into_inner());
            (slot.state, slot.record)
        };
        let mut slot = self.health.write().unwrap_or_else(|e| e.into_inner());
        slot.state = state;
        slot.record = record;
        self.alive.store(state == HealthState::Healthy, Ordering::Relaxed);
    }

    /// Weight for weighted strategies, clamped to [1, 100].
    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight.clamp(1, 100), Ordering::Relaxed);
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn active_count(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Marks a request as in flight. The returned guard decrements the
    /// counter on drop, so the pairing holds on every exit path.
    pub fn begin_request(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            backend: Arc::clone(self),
        }
    }
}

/// RAII guard for the active-request counter.
#[derive(Debug)]
pub struct ActiveGuard {
    backend: Arc<Backend>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.backend.active.fetch_sub(1, Ordering::Relaxed);
    }
}
