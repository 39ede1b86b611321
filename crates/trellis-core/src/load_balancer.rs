//! Load balancing.
//!
//! A [LoadBalancer] picks a host from a cluster's current host set. The
//! policy variants here are the built-ins; anything fancier plugs in at the
//! same interface. Balancers only ever see healthy hosts.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, RwLock,
};

use trellis_api::LbPolicy;

use crate::host::{Host, HostSet};

/// Per-request context handed to the load balancer, carrying whatever the
/// request path wants to influence host selection with.
#[derive(Debug, Default)]
pub struct LbContext {
    /// A precomputed hash of the request, for affinity-based policies.
    pub hash_key: Option<u64>,
}

impl LbContext {
    pub fn with_hash(hash: u64) -> Self {
        Self {
            hash_key: Some(hash),
        }
    }
}

#[derive(Debug)]
pub enum LoadBalancer {
    RoundRobin(RoundRobinLb),
    Random(RandomLb),
    RingHash(RingHashLb),
}

impl LoadBalancer {
    pub fn from_policy(policy: LbPolicy) -> Self {
        match policy {
            LbPolicy::RoundRobin => LoadBalancer::RoundRobin(RoundRobinLb::default()),
            LbPolicy::Random => LoadBalancer::Random(RandomLb),
            LbPolicy::RingHash => LoadBalancer::RingHash(RingHashLb::new(DEFAULT_MIN_RING_SIZE)),
        }
    }

    /// Pick a healthy host, or `None` if the set has no healthy hosts.
    pub fn choose_host(&self, hosts: &HostSet, context: &LbContext) -> Option<Arc<Host>> {
        let healthy: Vec<&Arc<Host>> = hosts.healthy_hosts().collect();
        if healthy.is_empty() {
            return None;
        }

        let picked = match self {
            LoadBalancer::RoundRobin(lb) => lb.pick(&healthy),
            LoadBalancer::Random(lb) => lb.pick(&healthy),
            LoadBalancer::RingHash(lb) => lb.pick(hosts, &healthy, context),
        };

        Some(Arc::clone(picked))
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinLb {
    idx: AtomicUsize,
}

impl RoundRobinLb {
    fn pick<'h>(&self, healthy: &[&'h Arc<Host>]) -> &'h Arc<Host> {
        let idx = self.idx.fetch_add(1, Ordering::Relaxed) % healthy.len();
        healthy[idx]
    }
}

#[derive(Debug)]
pub struct RandomLb;

impl RandomLb {
    fn pick<'h>(&self, healthy: &[&'h Arc<Host>]) -> &'h Arc<Host> {
        let idx = crate::rand::with_thread_rng(|rng| rand::Rng::gen_range(rng, 0..healthy.len()));
        healthy[idx]
    }
}

const DEFAULT_MIN_RING_SIZE: usize = 1024;

/// A ring hash LB using Ketama hashing.
///
/// All hosts are flattened into a single hash ring, rebuilt lazily whenever
/// the host set changes. Requests without a hash in their context get a
/// random one, which degrades to random balancing.
#[derive(Debug)]
pub struct RingHashLb {
    min_ring_size: usize,
    ring: RwLock<Ring>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RingEntry {
    hash: u64,
    idx: usize,
}

impl RingHashLb {
    fn new(min_ring_size: usize) -> Self {
        Self {
            min_ring_size,
            ring: RwLock::new(Ring {
                host_set_hash: 0,
                entries: Vec::new(),
            }),
        }
    }

    fn pick<'h>(
        &self,
        hosts: &HostSet,
        healthy: &[&'h Arc<Host>],
        context: &LbContext,
    ) -> &'h Arc<Host> {
        let request_hash = context.hash_key.unwrap_or_else(crate::rand::random);

        // the ring indexes the full host set, not just the healthy slice, so
        // hashing stays stable while hosts flap. walk forward from the picked
        // entry until a healthy host comes up.
        let all = hosts.hosts();
        let idx = self.with_ring(hosts, |ring| ring.pick(request_hash));
        if let Some(idx) = idx {
            for offset in 0..all.len() {
                let host = &all[(idx + offset) % all.len()];
                if host.healthy() {
                    if let Some(h) = healthy.iter().copied().find(|h| h.address() == host.address())
                    {
                        return h;
                    }
                }
            }
        }

        // only reachable if the ring is out of sync with the set, so fall
        // back to the first healthy host.
        healthy[0]
    }

    // std's RwLock isn't upgradeable, so instead of an RAII guard that goes
    // from read to write this takes a callback and does the upgrade itself.
    fn with_ring<F, T>(&self, hosts: &HostSet, mut cb: F) -> T
    where
        F: FnMut(&Ring) -> T,
    {
        let ring = self.ring.read().unwrap();
        if ring.host_set_hash == hosts.hash() {
            return cb(&ring);
        }
        std::mem::drop(ring);

        let mut ring = self.ring.write().unwrap();
        ring.rebuild(self.min_ring_size, hosts);
        cb(&ring)
    }
}

#[derive(Debug)]
struct Ring {
    host_set_hash: u64,
    entries: Vec<RingEntry>,
}

impl Ring {
    fn rebuild(&mut self, min_size: usize, hosts: &HostSet) {
        let host_count = hosts.len();
        if host_count == 0 {
            self.entries.clear();
            self.host_set_hash = hosts.hash();
            return;
        }

        let repeats = usize::max((min_size as f64 / host_count as f64).ceil() as usize, 1);
        let ring_size = repeats * host_count;

        self.entries.clear();
        self.entries.reserve(ring_size);

        for (idx, host) in hosts.hosts().iter().enumerate() {
            let address = host.address().to_string();
            for i in 0..repeats {
                let hash = xxhash_rust::xxh64::xxh64(format!("{address}|{i}").as_bytes(), 0);
                self.entries.push(RingEntry { hash, idx });
            }
        }

        self.host_set_hash = hosts.hash();
        self.entries.sort_by_key(|e| e.hash);
    }

    fn pick(&self, request_hash: u64) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }

        // partition_point returns the first entry whose hash is >= the
        // request hash - a stdlib binary search instead of the hand-rolled
        // one in the original ketama implementation.
        let entry_idx = self.entries.partition_point(|e| e.hash < request_hash);
        let entry_idx = entry_idx % self.entries.len();
        Some(self.entries[entry_idx].idx)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Weak;

    use super::*;

    fn host_set(addrs: &[&str]) -> Arc<HostSet> {
        HostSet::new(
            addrs
                .iter()
                .map(|a| Host::new(a.parse().unwrap(), "", None, 1, Weak::new()))
                .collect(),
        )
    }

    #[test]
    fn test_round_robin_cycles() {
        let lb = LoadBalancer::from_policy(LbPolicy::RoundRobin);
        let hosts = host_set(&["127.0.0.1:80", "127.0.0.2:80", "127.0.0.3:80"]);

        let picks: Vec<_> = (0..6)
            .map(|_| {
                lb.choose_host(&hosts, &LbContext::default())
                    .unwrap()
                    .address()
            })
            .collect();

        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_eq!(picks[2], picks[5]);
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let lb = LoadBalancer::from_policy(LbPolicy::RoundRobin);
        let hosts = host_set(&["127.0.0.1:80", "127.0.0.2:80"]);
        hosts.hosts()[0].set_healthy(false);

        for _ in 0..4 {
            let picked = lb.choose_host(&hosts, &LbContext::default()).unwrap();
            assert_eq!(picked.address(), "127.0.0.2:80".parse().unwrap());
        }
    }

    #[test]
    fn test_no_healthy_hosts() {
        let lb = LoadBalancer::from_policy(LbPolicy::Random);
        let hosts = host_set(&["127.0.0.1:80"]);
        hosts.hosts()[0].set_healthy(false);

        assert!(lb.choose_host(&hosts, &LbContext::default()).is_none());

        let empty = HostSet::empty();
        assert!(lb.choose_host(&empty, &LbContext::default()).is_none());
    }

    #[test]
    fn test_ring_hash_is_sticky() {
        let lb = LoadBalancer::from_policy(LbPolicy::RingHash);
        let hosts = host_set(&["127.0.0.1:80", "127.0.0.2:80", "127.0.0.3:80"]);

        let context = LbContext::with_hash(0xfeed_beef);
        let first = lb.choose_host(&hosts, &context).unwrap().address();
        for _ in 0..10 {
            assert_eq!(lb.choose_host(&hosts, &context).unwrap().address(), first);
        }
    }

    #[test]
    fn test_ring_hash_rebuilds_on_membership_change() {
        let lb = LoadBalancer::from_policy(LbPolicy::RingHash);
        let hosts = host_set(&["127.0.0.1:80", "127.0.0.2:80"]);
        let context = LbContext::with_hash(42);

        let first = lb.choose_host(&hosts, &context).unwrap().address();

        // shrink the set to one host; the pick has to land on it
        let shrunk = host_set(&["127.0.0.9:80"]);
        let second = lb.choose_host(&shrunk, &context).unwrap().address();
        assert_eq!(second, "127.0.0.9:80".parse().unwrap());
        assert_ne!(first, second);
    }
}
