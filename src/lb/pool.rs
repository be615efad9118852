use std::sync::{Arc, RwLock};

use super::backend::Backend;

/// Ordered collection of backends with copy-on-read snapshots.
///
/// Readers (strategies, the prober, the gauge exporter) take a snapshot
/// and iterate without holding the lock. `replace` installs a whole new
/// list in one write, so any single selection observes either the old
/// list or the new one, never a mix.
#[derive(Debug, Default)]
pub struct Pool {
    backends: RwLock<Vec<Arc<Backend>>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, backend: Arc<Backend>) {
        let mut guard = self.backends.write().unwrap_or_else(|e| e.into_inner());
        guard.push(backend);
    }

    /// Copy of the full backend list.
    pub fn snapshot_all(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Copy of the backends whose state is HEALTHY, in pool order.
    pub fn snapshot_healthy(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|b| b.is_alive())
            .cloned()
            .collect()
    }

    pub fn size(&self) -> usize {
        self.backends.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Atomically installs a new backend list.
    ///
    /// Any new backend whose key matches a current one inherits the old
    /// instance's health state and rolling counters before the swap, so
    /// a config reload does not reset the standing of unchanged
    /// backends. New keys start fresh (HEALTHY, zero counters).
    pub fn replace(&self, new_backends: Vec<Arc<Backend>>) {
        let mut guard = self.backends.write().unwrap_or_else(|e| e.into_inner());
        for fresh in &new_backends {
            if let Some(old) = guard.iter().find(|b| b.key() == fresh.key()) {
                fresh.adopt_health_from(old);
            }
        }
        *guard = new_backends;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::backend::HealthState;

    fn backend(addr: &str) -> Arc<Backend> {
        Arc::new(Backend::new(addr.parse().unwrap()))
    }

    #[test]
    fn snapshot_all_preserves_order() {
        let pool = Pool::new();
        let addrs = [
            "http://127.0.0.1:9001",
            "http://127.0.0.1:9002",
            "http://127.0.0.1:9003",
        ];
        for a in addrs {
            pool.add(backend(a));
        }

        assert_eq!(pool.size(), 3);
        let snap = pool.snapshot_all();
        let keys: Vec<&str> = snap.iter().map(|b| b.key()).collect();
        assert_eq!(keys, ["127.0.0.1:9001", "127.0.0.1:9002", "127.0.0.1:9003"]);
    }

    #[test]
    fn snapshot_healthy_filters_non_healthy_states() {
        let pool = Pool::new();
        let b1 = backend("http://127.0.0.1:9001");
        let b2 = backend("http://127.0.0.1:9002");
        let b3 = backend("http://127.0.0.1:9003");
        pool.add(Arc::clone(&b1));
        pool.add(Arc::clone(&b2));
        pool.add(Arc::clone(&b3));

        b1.set_state(HealthState::Unhealthy);
        b3.set_state(HealthState::Draining);

        let healthy = pool.snapshot_healthy();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].key(), "127.0.0.1:9002");
    }

    #[test]
    fn replace_swaps_whole_list() {
        let pool = Pool::new();
        pool.add(backend("http://127.0.0.1:9001"));
        pool.add(backend("http://127.0.0.1:9002"));

        pool.replace(vec![backend("http://127.0.0.1:9003")]);
        let snap = pool.snapshot_all();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].key(), "127.0.0.1:9003");
    }

    #[test]
    fn replace_carries_health_over_matching_keys() {
        let pool = Pool::new();
        let old = backend("http://127.0.0.1:9001");
        old.set_state(HealthState::Unhealthy);
        old.record_failure();
        old.record_failure();
        old.record_failure();
        pool.add(old);
        pool.add(backend("http://127.0.0.1:9002"));

        // One surviving key, one new key.
        pool.replace(vec![
            backend("http://127.0.0.1:9001"),
            backend("http://127.0.0.1:9004"),
        ]);

        let snap = pool.snapshot_all();
        let survivor = snap.iter().find(|b| b.key() == "127.0.0.1:9001").unwrap();
        assert_eq!(survivor.state(), HealthState::Unhealthy);
        assert!(!survivor.is_alive());
        assert_eq!(survivor.health_record().consecutive_failures, 3);

        let newcomer = snap.iter().find(|b| b.key() == "127.0.0.1:9004").unwrap();
        assert_eq!(newcomer.state(), HealthState::Healthy);
        assert_eq!(newcomer.health_record().consecutive_failures, 0);
    }

    #[test]
    fn replace_under_concurrent_snapshots_never_mixes_lists() {
        let pool = Arc::new(Pool::new());
        pool.add(backend("http://127.0.0.1:9001"));
        pool.add(backend("http://127.0.0.1:9002"));

        let reader = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let snap = pool.snapshot_all();
                    // Generations never mix: either both old keys or both new.
                    let old = snap.iter().all(|b| b.key().ends_with("01") || b.key().ends_with("02"));
                    let new = snap.iter().all(|b| b.key().ends_with("03") || b.key().ends_with("04"));
                    assert!(old || new, "saw a half-replaced list");
                }
            })
        };

        let writer = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let list = if i % 2 == 0 {
                        vec![
                            backend("http://127.0.0.1:9003"),
                            backend("http://127.0.0.1:9004"),
                        ]
                    } else {
                        vec![
                            backend("http://127.0.0.1:9001"),
                            backend("http://127.0.0.1:9002"),
                        ]
                    };
                    pool.replace(list);
                }
            })
        };

        reader.join().unwrap();
        writer.join().unwrap();
    }
}
