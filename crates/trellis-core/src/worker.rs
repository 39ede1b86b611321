//! Per-worker cluster views.
//!
//! Each worker thread owns a [WorkerClusterView]: a read-only projection of
//! the cluster set plus the worker's connection pool cache. The main thread
//! never touches a view directly - it posts closures to the worker's inbox,
//! and the worker applies them in its own loop. Posts are FIFO per worker,
//! so updates to a single cluster are observed in order; snapshots
//! themselves are immutable and shared.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use trellis_api::Name;

use crate::cluster::ClusterInfo;
use crate::factory::ClusterManagerFactory;
use crate::host::{HostSet, Priority, ResourcePermit};
use crate::load_balancer::{LbContext, LoadBalancer};
use crate::pool::{ConnPool, PoolKey, Protocol, TcpConnData, UpstreamConnection};
use crate::{Error, Result};

/// A closure applied to a worker's view, in that worker's thread.
pub type WorkerPost = Box<dyn FnOnce(&mut WorkerClusterView) + Send>;

/// Completion tracking for a cluster removal.
///
/// The manager creates one guard per removal and clones it into every
/// worker post and every pool drained-callback involved. When the last clone
/// drops - meaning every worker has forgotten the cluster and every one of
/// its pools has drained - the completion callback fires and the cluster
/// entity can be destroyed.
#[derive(Clone)]
pub struct DrainGuard {
    inner: Arc<DrainNotify>,
}

struct DrainNotify {
    on_drained: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl DrainGuard {
    pub(crate) fn new(on_drained: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(DrainNotify {
                on_drained: Mutex::new(Some(Box::new(on_drained))),
            }),
        }
    }
}

impl Drop for DrainNotify {
    fn drop(&mut self) {
        if let Some(cb) = self.on_drained.lock().unwrap().take() {
            cb();
        }
    }
}

/// The sending half of a worker's inbox, held by the cluster manager.
#[derive(Clone)]
pub struct WorkerHandle {
    index: usize,
    tx: mpsc::UnboundedSender<WorkerPost>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Enqueue a post. Returns false if the worker is gone.
    pub(crate) fn post(&self, post: WorkerPost) -> bool {
        self.tx.send(post).is_ok()
    }
}

/// A worker thread's half: the view plus its inbox.
pub struct Worker {
    index: usize,
    view: WorkerClusterView,
    rx: mpsc::UnboundedReceiver<WorkerPost>,
}

impl Worker {
    pub(crate) fn new(index: usize, factory: Arc<dyn ClusterManagerFactory>) -> (WorkerHandle, Worker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle { index, tx };
        let worker = Worker {
            index,
            view: WorkerClusterView::new(factory),
            rx,
        };
        (handle, worker)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn view(&self) -> &WorkerClusterView {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut WorkerClusterView {
        &mut self.view
    }

    /// Run this worker's event loop until the manager goes away.
    pub async fn run(mut self) {
        while let Some(post) = self.rx.recv().await {
            post(&mut self.view);
        }
        tracing::debug!(worker = self.index, "worker inbox closed, exiting");
    }

    /// Apply every post already in the inbox, without waiting for more.
    /// This is the synchronous driver used by tests and by embedders that
    /// own their own event loop.
    pub fn run_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(post) = self.rx.try_recv() {
            post(&mut self.view);
            applied += 1;
        }
        applied
    }
}

/// A cached pool plus the connection circuit-breaker slot it occupies. The
/// slot is released only when the pool has drained.
struct PoolSlot {
    pool: Box<dyn ConnPool>,
    permit: ResourcePermit,
}

/// One cluster as a worker sees it: immutable metadata, the current host-set
/// snapshot, the shared load balancer, and this worker's pools.
pub struct LocalCluster {
    info: Arc<ClusterInfo>,
    hosts: Arc<HostSet>,
    lb: Arc<LoadBalancer>,
    pools: HashMap<PoolKey, PoolSlot>,
}

impl LocalCluster {
    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn host_set(&self) -> &Arc<HostSet> {
        &self.hosts
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

/// A pool that has been taken out of service and is finishing its in-flight
/// requests before deletion.
struct DrainingPool {
    pool: Box<dyn ConnPool>,
    drained: Arc<AtomicBool>,
}

/// A per-worker, read-only projection of the cluster set.
pub struct WorkerClusterView {
    factory: Arc<dyn ClusterManagerFactory>,
    clusters: HashMap<Name, LocalCluster>,
    draining: Vec<DrainingPool>,
}

impl WorkerClusterView {
    fn new(factory: Arc<dyn ClusterManagerFactory>) -> Self {
        Self {
            factory,
            clusters: HashMap::new(),
            draining: Vec::new(),
        }
    }

    /// Look up a cluster in this worker's view. Returns `None` if the
    /// cluster doesn't exist; an existing cluster with no healthy hosts is
    /// still returned.
    pub fn cluster(&self, name: &str) -> Option<&LocalCluster> {
        self.clusters.get(name)
    }

    pub fn cluster_names(&self) -> Vec<Name> {
        let mut names: Vec<_> = self.clusters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get (or allocate and cache) the connection pool for a load-balanced
    /// host of `cluster` at `priority`. Returns `None` when the cluster is
    /// unknown, has no healthy host (counting `upstream_cx_none_healthy`),
    /// or is at its connection circuit-breaker ceiling (counting
    /// `upstream_cx_overflow`).
    pub fn http_conn_pool_for_cluster(
        &mut self,
        cluster: &str,
        priority: Priority,
        protocol: Protocol,
        context: &LbContext,
    ) -> Option<&mut (dyn ConnPool + 'static)> {
        self.sweep_drained();

        let factory = Arc::clone(&self.factory);
        let entry = self.clusters.get_mut(cluster)?;

        let Some(host) = entry.lb.choose_host(&entry.hosts, context) else {
            entry.info.stats().upstream_cx_none_healthy.inc();
            return None;
        };

        let key = PoolKey {
            address: host.address(),
            priority,
            protocol,
        };
        match entry.pools.entry(key) {
            Entry::Occupied(slot) => Some(slot.into_mut().pool.as_mut()),
            Entry::Vacant(vacant) => {
                // a new pool occupies one connection slot for its lifetime
                let resources = entry.info.resource_manager(priority);
                let Some(permit) = resources.connections.try_acquire() else {
                    entry.info.stats().upstream_cx_overflow.inc();
                    return None;
                };

                let pool = factory.allocate_conn_pool(host, priority, protocol);
                let slot = vacant.insert(PoolSlot { pool, permit });
                Some(slot.pool.as_mut())
            }
        }
    }

    /// Open a load-balanced raw connection to `cluster`.
    ///
    /// An unknown cluster is an error by contract; a known cluster with no
    /// healthy host, or at its connection circuit-breaker ceiling, returns
    /// `connection: None`.
    pub fn tcp_conn_for_cluster(&mut self, cluster: &str) -> Result<TcpConnData> {
        self.sweep_drained();

        let entry = self
            .clusters
            .get(cluster)
            .ok_or_else(|| Error::NoSuchCluster(cluster.to_string()))?;

        let Some(host) = entry.lb.choose_host(&entry.hosts, &LbContext::default()) else {
            entry.info.stats().upstream_cx_none_healthy.inc();
            return Ok(TcpConnData {
                connection: None,
                host: None,
            });
        };

        let resources = entry.info.resource_manager(Priority::Default);
        let Some(permit) = resources.connections.try_acquire() else {
            entry.info.stats().upstream_cx_overflow.inc();
            return Ok(TcpConnData {
                connection: None,
                host: None,
            });
        };

        entry.info.stats().upstream_cx_total.inc();
        let connection = UpstreamConnection::new(
            host.address(),
            entry.info.connect_timeout(),
            entry.info.per_connection_buffer_limit_bytes(),
            permit,
        );
        Ok(TcpConnData {
            connection: Some(connection),
            host: Some(host),
        })
    }

    /// A handle for async HTTP calls against `cluster`. Unknown clusters are
    /// an error by contract.
    pub fn http_async_client_for_cluster(&self, cluster: &str) -> Result<AsyncClient> {
        let entry = self
            .clusters
            .get(cluster)
            .ok_or_else(|| Error::NoSuchCluster(cluster.to_string()))?;
        Ok(AsyncClient {
            info: Arc::clone(&entry.info),
        })
    }

    /// Install or update a cluster. Pools bound to hosts that are absent
    /// from the new snapshot are taken out of service and drained.
    pub(crate) fn apply_cluster_update(
        &mut self,
        info: Arc<ClusterInfo>,
        hosts: Arc<HostSet>,
        lb: Arc<LoadBalancer>,
    ) {
        self.sweep_drained();

        match self.clusters.get_mut(info.name()) {
            Some(entry) => {
                entry.info = info;
                entry.lb = lb;
                entry.hosts = Arc::clone(&hosts);

                let stale: Vec<PoolKey> = entry
                    .pools
                    .keys()
                    .filter(|key| !hosts.contains_address(key.address))
                    .cloned()
                    .collect();
                for key in stale {
                    if let Some(slot) = entry.pools.remove(&key) {
                        tracing::debug!(
                            cluster = %entry.info.name(),
                            address = %key.address,
                            "draining pool for removed host"
                        );
                        drain_pool(&mut self.draining, slot, None);
                    }
                }
            }
            None => {
                self.clusters.insert(
                    info.name().clone(),
                    LocalCluster {
                        info,
                        hosts,
                        lb,
                        pools: HashMap::new(),
                    },
                );
            }
        }
    }

    /// Forget a cluster and drain every pool this worker held for it. The
    /// guard clone is released once each pool reports drained.
    pub(crate) fn apply_cluster_removal(&mut self, name: &Name, guard: DrainGuard) {
        self.sweep_drained();

        let Some(entry) = self.clusters.remove(name) else {
            return;
        };
        for (_, slot) in entry.pools {
            drain_pool(&mut self.draining, slot, Some(guard.clone()));
        }
    }

    /// Throw away pools whose drained callback has fired.
    fn sweep_drained(&mut self) {
        self.draining.retain(|p| !p.drained.load(Ordering::Acquire));
    }

    #[cfg(test)]
    pub(crate) fn draining_count(&self) -> usize {
        self.draining.len()
    }
}

/// Move a pool out of service: register the drained callback and hold the
/// pool until it fires. Already-idle pools complete synchronously. The
/// pool's connection slot is released when the drain completes.
fn drain_pool(draining: &mut Vec<DrainingPool>, slot: PoolSlot, guard: Option<DrainGuard>) {
    let PoolSlot { mut pool, permit } = slot;
    let drained = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&drained);
    pool.add_drained_callback(Box::new(move || {
        flag.store(true, Ordering::Release);
        drop(permit);
        drop(guard);
    }));

    if !drained.load(Ordering::Acquire) {
        draining.push(DrainingPool { pool, drained });
    }
}

/// A client handle for async HTTP calls against one cluster, backed by the
/// worker's pools.
pub struct AsyncClient {
    info: Arc<ClusterInfo>,
}

impl AsyncClient {
    pub fn cluster_info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }
}
