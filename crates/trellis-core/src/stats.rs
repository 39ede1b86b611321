//! Stats storage.
//!
//! Counters and gauges are allocated by dotted name from a [Store] and handed
//! out as cheap atomic handles. Reads and writes are lock-free; the store's
//! registry lock is only taken at allocation time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A monotonic counter.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge that can move in both directions.
#[derive(Clone, Debug, Default)]
pub struct Gauge(Arc<AtomicU64>);

impl Gauge {
    #[inline]
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Registry {
    counters: Mutex<HashMap<String, Counter>>,
    gauges: Mutex<HashMap<String, Gauge>>,
}

/// A store of named counters and gauges. Cloning a store shares the
/// underlying registry.
#[derive(Clone, Debug, Default)]
pub struct Store {
    registry: Arc<Registry>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate (or look up) a counter by full dotted name.
    pub fn counter(&self, name: &str) -> Counter {
        let mut counters = self.registry.counters.lock().unwrap();
        counters.entry(name.to_string()).or_default().clone()
    }

    /// Allocate (or look up) a gauge by full dotted name.
    pub fn gauge(&self, name: &str) -> Gauge {
        let mut gauges = self.registry.gauges.lock().unwrap();
        gauges.entry(name.to_string()).or_default().clone()
    }

    /// Create a scope that prefixes every allocation with `prefix`.
    pub fn scope(&self, prefix: impl Into<String>) -> Scope {
        Scope {
            store: self.clone(),
            prefix: prefix.into(),
        }
    }

    /// Snapshot every counter with a nonzero value, for admin/debug dumps.
    pub fn counters(&self) -> Vec<(String, u64)> {
        let counters = self.registry.counters.lock().unwrap();
        let mut out: Vec<_> = counters
            .iter()
            .filter(|(_, c)| c.value() > 0)
            .map(|(name, c)| (name.clone(), c.value()))
            .collect();
        out.sort();
        out
    }
}

/// A named prefix into a [Store].
#[derive(Clone, Debug)]
pub struct Scope {
    store: Store,
    prefix: String,
}

impl Scope {
    pub fn counter(&self, name: &str) -> Counter {
        self.store.counter(&format!("{}{}", self.prefix, name))
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        self.store.gauge(&format!("{}{}", self.prefix, name))
    }

    /// A nested scope: `scope("a.").scope("b.")` allocates under `a.b.`.
    pub fn scope(&self, prefix: &str) -> Scope {
        Scope {
            store: self.store.clone(),
            prefix: format!("{}{}", self.prefix, prefix),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counter_shared_by_name() {
        let store = Store::new();
        let a = store.counter("cluster_manager.cluster_added");
        let b = store.counter("cluster_manager.cluster_added");

        a.inc();
        a.inc();
        b.inc();
        assert_eq!(a.value(), 3);
        assert_eq!(b.value(), 3);
    }

    #[test]
    fn test_gauge() {
        let store = Store::new();
        let g = store.gauge("cluster_manager.total_clusters");
        g.set(3);
        g.dec();
        g.inc();
        assert_eq!(g.value(), 3);
    }

    #[test]
    fn test_scopes_prefix() {
        let store = Store::new();
        let scope = store.scope("cluster_manager.").scope("cds.");
        scope.counter("update_attempt").inc();

        assert_eq!(
            store.counter("cluster_manager.cds.update_attempt").value(),
            1
        );
    }
}
