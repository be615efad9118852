//! Per-backend circuit breaking.
//!
//! Each backend gets its own breaker with a sliding failure window:
//! recovery is judged on recent behavior, so old failures never penalize
//! a backend that has come back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::info;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    Closed,
    /// Backend assumed down, requests fail fast.
    Open,
    /// Testing recovery, requests are admitted and counted.
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: CLOSED=0, HALF_OPEN=1, OPEN=2.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Breaker thresholds and timing.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window before the circuit opens.
    pub failure_threshold: usize,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u64,
    /// How long an open circuit rejects before probing.
    pub cooldown: Duration,
    /// Sliding window over which failures are counted.
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
            window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    successes: u64,
    last_failure: Option<Instant>,
    recent_failures: Vec<Instant>,
}

/// Fast-fail gate for a single backend.
///
/// One short mutex guards the state and the failure list; critical
/// sections are an append, an eviction sweep, and a comparison.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                successes: 0,
                last_failure: None,
                recent_failures: Vec::new(),
            }),
        }
    }

    /// Asks the breaker whether a request may go to this backend.
    ///
    /// An open circuit past its cooldown flips to half-open and admits
    /// the asking request as the probe.
    pub fn admit(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .is_some_and(|t| t.elapsed() >= self.config.cooldown);
                if cooled {
                    info!(backend = %self.name, "circuit_half_open");
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.successes += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                if inner.successes >= self.config.success_threshold {
                    info!(
                        backend = %self.name,
                        successes = inner.successes,
                        "circuit_closed"
                    );
                    inner.state = CircuitState::Closed;
                    inner.recent_failures.clear();
                    inner.successes = 0;
                }
            }
            CircuitState::Closed => {
                if let Some(cutoff) = Instant::now().checked_sub(self.config.window) {
                    inner.recent_failures.retain(|t| *t > cutoff);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.recent_failures.push(now);
        inner.last_failure = Some(now);

        if let Some(cutoff) = now.checked_sub(self.config.window) {
            inner.recent_failures.retain(|t| *t > cutoff);
        }

        match inner.state {
            CircuitState::HalfOpen => {
                info!(backend = %self.name, "circuit_reopened");
                inner.state = CircuitState::Open;
                inner.successes = 0;
            }
            CircuitState::Closed => {
                if inner.recent_failures.len() >= self.config.failure_threshold {
                    info!(
                        backend = %self.name,
                        failures = inner.recent_failures.len(),
                        window_secs = self.config.window.as_secs(),
                        "circuit_opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }
}

/// Lazily-populated map of breakers keyed by backend authority.
///
/// Readers take the read lock; a miss upgrades to the write lock with a
/// second lookup before inserting. Entries for backends removed by a
/// reload are left in place.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        {
            let map = self.breakers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cb) = map.get(key) {
                return Arc::clone(cb);
            }
        }

        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(cb) = map.get(key) {
            return Arc::clone(cb);
        }
        let cb = Arc::new(CircuitBreaker::new(key));
        map.insert(key.to_string(), Arc::clone(&cb));
        cb
    }

    /// Current (key, breaker) pairs, for the gauge exporter.
    pub fn snapshot(&self) -> Vec<(String, Arc<CircuitBreaker>)> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }
}
