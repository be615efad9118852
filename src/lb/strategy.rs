use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::backend::Backend;

/// A load-balancing strategy picks one backend from the healthy subset.
///
/// `select` returns `None` iff the subset is empty. Strategies hold only
/// derived state keyed by backend authority, reconciled lazily, so a pool
/// replacement needs no coordination with them.
pub trait Strategy: Send + Sync {
    fn select(&self, healthy: &[Arc<Backend>]) -> Option<Arc<Backend>>;
    fn name(&self) -> &'static str;
}

/// Sequential rotation through the healthy subset. Lock-free.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobin {
    fn select(&self, healthy: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if healthy.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = (n % healthy.len() as u64) as usize;
        Some(Arc::clone(&healthy[index]))
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Picks the backend with the fewest in-flight requests. Ties go to the
/// first backend in pool order. Counter reads may be slightly stale,
/// which is acceptable for distribution purposes.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Strategy for LeastConnections {
    fn select(&self, healthy: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        healthy.iter().min_by_key(|b| b.active_count()).cloned()
    }

    fn name(&self) -> &'static str {
        "least-connections"
    }
}

#[derive(Debug)]
struct WeightedSlot {
    weight: i64,
    current: i64,
}

/// Smooth weighted round-robin (the nginx algorithm).
///
/// Per selection every entry gains its configured weight, the entry with
/// the highest running weight is chosen, and the chosen entry loses the
/// weight total. Over any window of sum-of-weights selections each
/// backend is chosen exactly its weight times, without consecutive runs
/// to one backend while an equal-or-heavier alternative exists.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    table: Mutex<BTreeMap<String, WeightedSlot>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for WeightedRoundRobin {
    fn select(&self, healthy: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if healthy.is_empty() {
            return None;
        }

        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());

        // Reconcile the table against the current healthy subset: new
        // keys start at zero, configured weights track the backend, and
        // departed keys are dropped.
        for b in healthy {
            let weight = i64::from(b.weight());
            table
                .entry(b.key().to_string())
                .and_modify(|slot| slot.weight = weight)
                .or_insert(WeightedSlot { weight, current: 0 });
        }
        table.retain(|key, _| healthy.iter().any(|b| b.key() == key.as_str()));

        let mut total = 0;
        let mut best_key: Option<String> = None;
        let mut best_current = i64::MIN;
        for (key, slot) in table.iter_mut() {
            slot.current += slot.weight;
            total += slot.weight;
            if slot.current > best_current {
                best_current = slot.current;
                best_key = Some(key.clone());
            }
        }

        let key = best_key?;
        if let Some(slot) = table.get_mut(&key) {
            slot.current -= total;
        }
        healthy.iter().find(|b| b.key() == key.as_str()).cloned()
    }

    fn name(&self) -> &'static str {
        "weighted-round-robin"
    }
}
