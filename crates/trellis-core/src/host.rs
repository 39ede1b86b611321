//! Upstream hosts and host sets.
//!
//! A [Host] is immutable after construction apart from its health flag, and
//! is shared by the primary cluster, every per-worker view, and any in-flight
//! connection pools. A [HostSet] is an immutable snapshot of a cluster's
//! current membership; membership changes publish a whole new snapshot.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use trellis_api::cluster::Thresholds;

use crate::cluster::ClusterInfo;

/// Request priority. Resource limits and connection pools are segregated by
/// priority so high-priority traffic isn't starved by default traffic.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    #[default]
    Default,
    High,
}

impl Priority {
    pub const ALL: [Priority; 2] = [Priority::Default, Priority::High];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::Default => 0,
            Priority::High => 1,
        }
    }
}

/// Where a host lives, for locality-aware balancing and stats.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locality {
    pub region: String,
    pub zone: String,
}

/// A single upstream endpoint.
#[derive(Debug)]
pub struct Host {
    address: SocketAddr,
    hostname: String,
    locality: Option<Locality>,
    weight: u32,
    healthy: AtomicBool,
    cluster: Weak<ClusterInfo>,
}

impl Host {
    pub(crate) fn new(
        address: SocketAddr,
        hostname: impl Into<String>,
        locality: Option<Locality>,
        weight: u32,
        cluster: Weak<ClusterInfo>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            hostname: hostname.into(),
            locality,
            weight,
            healthy: AtomicBool::new(true),
            cluster,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The configured hostname label, or the empty string for hosts that came
    /// from a literal address.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn locality(&self) -> Option<&Locality> {
        self.locality.as_ref()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Flip the health flag. Called by health checking and outlier ejection,
    /// which run outside this crate.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// The owning cluster's info, if the cluster is still alive.
    pub fn cluster(&self) -> Option<Arc<ClusterInfo>> {
        self.cluster.upgrade()
    }
}

/// An immutable snapshot of a cluster's member hosts.
#[derive(Debug, Default)]
pub struct HostSet {
    hosts: Vec<Arc<Host>>,
    /// Hash of the member addresses, used to skip no-op republication and to
    /// key lazily built load balancer state.
    hash: u64,
}

impl HostSet {
    pub fn new(hosts: Vec<Arc<Host>>) -> Arc<Self> {
        let hash = xxhash_rust::xxh64::xxh64(
            hosts
                .iter()
                .map(|h| h.address().to_string())
                .collect::<Vec<_>>()
                .join(",")
                .as_bytes(),
            0,
        );
        Arc::new(Self { hosts, hash })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn healthy_hosts(&self) -> impl Iterator<Item = &Arc<Host>> {
        self.hosts.iter().filter(|h| h.healthy())
    }

    pub fn contains_address(&self, address: SocketAddr) -> bool {
        self.hosts.iter().any(|h| h.address() == address)
    }
}

/// A single bounded resource: connections, pending requests, and so on.
///
/// Units are taken as RAII [ResourcePermit]s and released on drop. Counts
/// are shared atomics, so a cluster's ceiling holds across every worker.
#[derive(Clone, Debug)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

#[derive(Debug)]
struct ResourceInner {
    max: u64,
    active: AtomicU64,
}

impl Resource {
    fn new(max: u32) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                max: max as u64,
                active: AtomicU64::new(0),
            }),
        }
    }

    pub fn can_create(&self) -> bool {
        self.inner.active.load(Ordering::Relaxed) < self.inner.max
    }

    /// Take one unit, or `None` if the ceiling has been reached.
    pub fn try_acquire(&self) -> Option<ResourcePermit> {
        let prev = self.inner.active.fetch_add(1, Ordering::AcqRel);
        if prev >= self.inner.max {
            self.inner.active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(ResourcePermit {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn active(&self) -> u64 {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.inner.max
    }
}

/// A held unit of a [Resource], released on drop.
#[derive(Debug)]
pub struct ResourcePermit {
    inner: Arc<ResourceInner>,
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Circuit-breaker resource ceilings for one priority level.
#[derive(Debug)]
pub struct ResourceManager {
    pub connections: Resource,
    pub pending_requests: Resource,
    pub requests: Resource,
    pub retries: Resource,
}

impl ResourceManager {
    pub fn from_thresholds(thresholds: &Thresholds) -> Self {
        Self {
            connections: Resource::new(thresholds.max_connections),
            pending_requests: Resource::new(thresholds.max_pending_requests),
            requests: Resource::new(thresholds.max_requests),
            retries: Resource::new(thresholds.max_retries),
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::from_thresholds(&Thresholds::default())
    }
}
