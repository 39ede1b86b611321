//! The cluster manager.
//!
//! The manager owns the authoritative map from cluster name to running
//! cluster, drives warm-up ordering through the init helper, hosts the CDS
//! subscription, and publishes immutable snapshots to every worker's
//! [WorkerClusterView][crate::worker::WorkerClusterView]. The registry lives
//! on the main thread; workers only ever see posted snapshots, and the
//! request hot path (pool and connection lookup) happens on the worker's
//! own view without taking any lock here.
//!
//! Lock discipline: the registry lock is never held across calls into the
//! init helper, a cluster entity, or a user callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use trellis_api::bootstrap::ConfigSource;
use trellis_api::{Bootstrap, ClusterSpec, DiscoveryType, EndpointAssignment, Name};

use crate::access_log::{AccessLogManager, OutlierEventLogger};
use crate::cds::CdsApi;
use crate::cluster::{Cluster, ClusterInfo};
use crate::factory::{management_uri, ClusterManagerFactory};
use crate::host::HostSet;
use crate::init::InitHelper;
use crate::load_balancer::LoadBalancer;
use crate::stats::{Counter, Gauge, Scope, Store};
use crate::subscription::Subscription;
use crate::worker::{DrainGuard, Worker, WorkerHandle};
use crate::{Error, Result};

/// Top-level cluster manager counters, under `cluster_manager.`.
#[derive(Clone, Debug)]
pub struct ClusterManagerStats {
    pub cluster_added: Counter,
    pub cluster_modified: Counter,
    pub cluster_removed: Counter,
    pub total_clusters: Gauge,
}

impl ClusterManagerStats {
    fn new(scope: &Scope) -> Self {
        Self {
            cluster_added: scope.counter("cluster_added"),
            cluster_modified: scope.counter("cluster_modified"),
            cluster_removed: scope.counter("cluster_removed"),
            total_clusters: scope.gauge("total_clusters"),
        }
    }
}

struct ClusterEntry {
    cluster: Arc<Cluster>,
    spec: ClusterSpec,
    spec_hash: u64,
    added_via_api: bool,
    init_id: u64,
}

struct ManagerState {
    clusters: HashMap<Name, ClusterEntry>,
    /// Removed entities held alive until every worker has forgotten them
    /// and all of their pools have drained.
    draining: HashMap<u64, Arc<Cluster>>,
    next_drain_token: u64,
    worker_acks_pending: usize,
    ready: bool,
    initialized_cb: Option<Box<dyn FnOnce() + Send>>,
    cds: Option<CdsApi>,
}

pub(crate) struct ManagerInner {
    state: Mutex<ManagerState>,
    init_helper: InitHelper,
    factory: Arc<dyn ClusterManagerFactory>,
    workers: Vec<WorkerHandle>,
    stats: ClusterManagerStats,
    scope: Scope,
    local_cluster_name: Option<Name>,
    outlier_logger: Option<OutlierEventLogger>,
    sds_config: Option<ConfigSource>,
    /// The bootstrap cluster list, for resolving discovery sources that
    /// name a cluster configured later in the same document.
    static_specs: HashMap<Name, ClusterSpec>,
}

/// The cluster manager handle. Cloning shares the same manager.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<ManagerInner>,
}

impl ClusterManager {
    /// Build a manager from a bootstrap document.
    ///
    /// Creates every static cluster, registers each with init ordering,
    /// attaches the CDS subscription if one is configured, and kicks off the
    /// primary warm-up phase. Returns the manager handle plus `concurrency`
    /// workers; the caller runs each worker's loop (or pumps it by hand).
    pub fn new(
        bootstrap: &Bootstrap,
        factory: Arc<dyn ClusterManagerFactory>,
        store: &Store,
        access_logs: &AccessLogManager,
        concurrency: usize,
    ) -> Result<(ClusterManager, Vec<Worker>)> {
        bootstrap.validate()?;

        let outlier_logger = match &bootstrap.outlier_detection.event_log_path {
            Some(path) => Some(OutlierEventLogger::new(access_logs.create_access_log(path)?)),
            None => None,
        };

        let mut handles = Vec::with_capacity(concurrency);
        let mut workers = Vec::with_capacity(concurrency);
        for index in 0..concurrency {
            let (handle, worker) = Worker::new(index, Arc::clone(&factory));
            handles.push(handle);
            workers.push(worker);
        }

        let static_specs = bootstrap
            .clusters
            .iter()
            .map(|spec| (spec.name.clone(), spec.clone()))
            .collect();

        let manager = ClusterManager {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(ManagerState {
                    clusters: HashMap::new(),
                    draining: HashMap::new(),
                    next_drain_token: 0,
                    worker_acks_pending: 0,
                    ready: false,
                    initialized_cb: None,
                    cds: None,
                }),
                init_helper: InitHelper::new(),
                factory,
                workers: handles,
                stats: ClusterManagerStats::new(&store.scope("cluster_manager.")),
                scope: store.scope(""),
                local_cluster_name: bootstrap.local_cluster_name.clone(),
                outlier_logger,
                sds_config: bootstrap.sds_config.clone(),
                static_specs,
            }),
        };

        for spec in &bootstrap.clusters {
            manager.load_static_cluster(spec.clone())?;
        }

        // cds attaches after static registration, so its backing cluster is
        // already among the primary clusters
        if let Some(cds_config) = &bootstrap.cds_config {
            manager.attach_cds(cds_config)?;
        }

        {
            let weak = manager.downgrade();
            manager.inner.init_helper.set_initialized_cb(Box::new(move || {
                if let Some(manager) = ClusterManager::upgrade(&weak) {
                    manager.on_all_clusters_warm();
                }
            }));
        }
        manager.inner.init_helper.on_static_load_complete();

        Ok((manager, workers))
    }

    pub(crate) fn downgrade(&self) -> Weak<ManagerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ManagerInner>) -> Option<ClusterManager> {
        weak.upgrade().map(|inner| ClusterManager { inner })
    }

    /// Add a cluster, or update the one already registered under the same
    /// name.
    ///
    /// Returns `Ok(true)` if anything changed. A cluster whose spec hash
    /// matches the running one is a no-op `Ok(false)`, as is a name that
    /// collides with a statically defined cluster. A spec the factory can't
    /// build is an error; prior state is untouched.
    pub fn add_or_update_cluster(&self, spec: ClusterSpec) -> Result<bool> {
        let name = spec.name.clone();
        let spec_hash = spec.spec_hash();

        {
            let state = self.inner.state.lock().unwrap();
            if let Some(entry) = state.clusters.get(&name) {
                if !entry.added_via_api {
                    tracing::warn!(
                        cluster = %name,
                        "rejecting update: name collides with a statically defined cluster"
                    );
                    return Ok(false);
                }
                if entry.spec_hash == spec_hash {
                    return Ok(false);
                }
            }
        }

        // build the replacement entity before touching the registry, so a
        // factory failure leaves prior state intact
        let cluster = self.create_cluster_entity(&spec, true)?;

        let replaced = {
            let mut state = self.inner.state.lock().unwrap();
            state.clusters.insert(
                name.clone(),
                ClusterEntry {
                    cluster: Arc::clone(&cluster),
                    spec,
                    spec_hash,
                    added_via_api: true,
                    init_id: u64::MAX,
                },
            )
        };

        match replaced {
            Some(prev) => {
                prev.cluster.cancel_discovery();
                self.inner.init_helper.remove_cluster(prev.init_id);
                self.inner.stats.cluster_modified.inc();
                tracing::info!(cluster = %name, "updated cluster");
            }
            None => {
                self.inner.stats.cluster_added.inc();
                tracing::info!(cluster = %name, "added cluster");
            }
        }
        self.refresh_total_clusters();

        self.post_cluster_snapshot(&cluster);
        let init_id = self.inner.init_helper.add_cluster(cluster);
        if let Some(entry) = self.inner.state.lock().unwrap().clusters.get_mut(&name) {
            entry.init_id = init_id;
        }

        Ok(true)
    }

    /// Remove an API-added cluster. Returns `false` for unknown or static
    /// clusters. The entity is destroyed only after every worker has
    /// forgotten it and all of its connection pools have drained.
    pub fn remove_cluster(&self, name: &str) -> bool {
        let entry = {
            let mut state = self.inner.state.lock().unwrap();
            let removable = matches!(state.clusters.get(name), Some(entry) if entry.added_via_api);
            if !removable {
                return false;
            }
            match state.clusters.remove(name) {
                Some(entry) => entry,
                None => return false,
            }
        };

        tracing::info!(cluster = %name, "removing cluster");
        self.inner.stats.cluster_removed.inc();
        self.refresh_total_clusters();

        entry.cluster.cancel_discovery();
        self.inner.init_helper.remove_cluster(entry.init_id);

        let token = {
            let mut state = self.inner.state.lock().unwrap();
            let token = state.next_drain_token;
            state.next_drain_token += 1;
            state.draining.insert(token, Arc::clone(&entry.cluster));
            token
        };

        let guard = {
            let weak = self.downgrade();
            DrainGuard::new(move || {
                if let Some(manager) = ClusterManager::upgrade(&weak) {
                    manager.on_cluster_drained(token);
                }
            })
        };

        let cluster_name = entry.cluster.name().clone();
        for worker in &self.inner.workers {
            let name = cluster_name.clone();
            let guard = guard.clone();
            worker.post(Box::new(move |view| view.apply_cluster_removal(&name, guard)));
        }

        true
    }

    /// The primary cluster info for `name`, or `None` if absent. Workers
    /// read their own views; this accessor is for stats and admin use.
    pub fn get(&self, name: &str) -> Option<Arc<ClusterInfo>> {
        let state = self.inner.state.lock().unwrap();
        state
            .clusters
            .get(name)
            .map(|entry| Arc::clone(entry.cluster.info()))
    }

    /// Every current cluster's info, for stats and admin use.
    pub fn clusters(&self) -> Vec<Arc<ClusterInfo>> {
        let state = self.inner.state.lock().unwrap();
        state
            .clusters
            .values()
            .map(|entry| Arc::clone(entry.cluster.info()))
            .collect()
    }

    pub(crate) fn cluster_names(&self) -> Vec<Name> {
        let state = self.inner.state.lock().unwrap();
        let mut names: Vec<_> = state.clusters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn local_cluster_name(&self) -> Option<&Name> {
        self.inner.local_cluster_name.as_ref()
    }

    pub fn stats(&self) -> &ClusterManagerStats {
        &self.inner.stats
    }

    pub fn outlier_event_logger(&self) -> Option<&OutlierEventLogger> {
        self.inner.outlier_logger.as_ref()
    }

    /// Register the callback fired once every statically declared cluster
    /// (primary, secondary, and any CDS bootstrap clusters) has completed
    /// its first warm-up and every worker has acknowledged the initial
    /// snapshot. Fires synchronously if that already happened.
    pub fn set_initialized_cb(&self, cb: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.ready {
                state.initialized_cb = Some(Box::new(cb));
                return;
            }
        }
        cb();
    }

    /// Stop discovery: drops the CDS subscription and cancels every
    /// cluster's DNS watches and endpoint streams. Worker views and pools
    /// are left to the normal drain path.
    pub fn shutdown(&self) {
        let (cds, clusters) = {
            let mut state = self.inner.state.lock().unwrap();
            let clusters: Vec<_> = state
                .clusters
                .values()
                .map(|entry| Arc::clone(&entry.cluster))
                .collect();
            (state.cds.take(), clusters)
        };

        if let Some(cds) = cds {
            cds.shutdown();
        }
        for cluster in clusters {
            cluster.cancel_discovery();
        }
    }

    fn load_static_cluster(&self, spec: ClusterSpec) -> Result<()> {
        let name = spec.name.clone();
        let cluster = self.create_cluster_entity(&spec, false)?;

        let spec_hash = spec.spec_hash();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.clusters.insert(
                name.clone(),
                ClusterEntry {
                    cluster: Arc::clone(&cluster),
                    spec,
                    spec_hash,
                    added_via_api: false,
                    init_id: u64::MAX,
                },
            );
        }
        self.inner.stats.cluster_added.inc();
        self.refresh_total_clusters();

        self.post_cluster_snapshot(&cluster);
        let init_id = self.inner.init_helper.add_cluster(cluster);
        if let Some(entry) = self.inner.state.lock().unwrap().clusters.get_mut(&name) {
            entry.init_id = init_id;
        }

        Ok(())
    }

    /// Build a cluster entity: wire up its endpoint subscription (for EDS)
    /// and its membership fan-out callback.
    fn create_cluster_entity(&self, spec: &ClusterSpec, added_via_api: bool) -> Result<Arc<Cluster>> {
        let eds_subscription = if spec.discovery == DiscoveryType::Eds {
            self.create_endpoint_subscription(spec)?
        } else {
            None
        };

        let cluster = self.inner.factory.cluster_from_spec(
            spec,
            &self.inner.scope,
            added_via_api,
            eds_subscription,
            self.inner.outlier_logger.clone(),
        )?;

        // fan each new host-set snapshot out to every worker. the callback
        // holds the info and lb handles, not the cluster, so it can't keep
        // a removed entity alive.
        let weak = self.downgrade();
        let info = Arc::clone(cluster.info());
        let lb = Arc::clone(cluster.load_balancer());
        cluster.set_member_update_cb(Box::new(move |_, hosts| {
            if let Some(manager) = ClusterManager::upgrade(&weak) {
                manager.post_update(Arc::clone(&info), hosts, Arc::clone(&lb));
            }
        }));

        Ok(cluster)
    }

    fn create_endpoint_subscription(
        &self,
        spec: &ClusterSpec,
    ) -> Result<Option<Subscription<EndpointAssignment>>> {
        let Some(sds_config) = self.inner.sds_config.clone() else {
            return Err(Error::bootstrap(format!(
                "cluster {:?}: cannot create an eds cluster without an sds config",
                spec.name.as_str(),
            )));
        };

        let uri = self.resolve_source_uri(&sds_config)?;
        let scope = self.inner.scope.scope(&format!("cluster.{}.eds.", spec.name));
        self.inner
            .factory
            .create_endpoint_subscription(&sds_config, uri, &scope)
    }

    fn attach_cds(&self, cds_config: &ConfigSource) -> Result<()> {
        let uri = self.resolve_source_uri(cds_config)?;
        let scope = self.inner.scope.scope("cluster_manager.cds.");
        let Some(subscription) =
            self.inner
                .factory
                .create_cluster_subscription(cds_config, uri, &scope)?
        else {
            return Ok(());
        };

        let cds = CdsApi::new(self, subscription, cds_config.block_on_first_update);
        self.inner.init_helper.add_cluster(Arc::new(cds.clone()));
        self.inner.state.lock().unwrap().cds = Some(cds);
        Ok(())
    }

    /// The management-server uri for a cluster-backed discovery source.
    /// `None` for filesystem sources.
    fn resolve_source_uri(&self, source: &ConfigSource) -> Result<Option<String>> {
        if source.path.is_some() {
            return Ok(None);
        }
        let cluster_name = source
            .cluster
            .as_ref()
            .ok_or_else(|| Error::bootstrap("config source has neither path nor cluster"))?;

        let backing = {
            let state = self.inner.state.lock().unwrap();
            state
                .clusters
                .get(cluster_name)
                .map(|entry| entry.spec.clone())
                .or_else(|| self.inner.static_specs.get(cluster_name).cloned())
        };
        let backing = backing.ok_or_else(|| {
            Error::bootstrap(format!(
                "discovery source names unknown cluster {:?}",
                cluster_name.as_str(),
            ))
        })?;

        if backing.discovery == DiscoveryType::Eds {
            return Err(Error::bootstrap(format!(
                "discovery source cluster {:?} must be a primary cluster, not eds",
                cluster_name.as_str(),
            )));
        }

        management_uri(&backing).map(Some)
    }

    fn post_cluster_snapshot(&self, cluster: &Arc<Cluster>) {
        self.post_update(
            Arc::clone(cluster.info()),
            cluster.host_set(),
            Arc::clone(cluster.load_balancer()),
        );
    }

    fn post_update(&self, info: Arc<ClusterInfo>, hosts: Arc<HostSet>, lb: Arc<LoadBalancer>) {
        for worker in &self.inner.workers {
            let info = Arc::clone(&info);
            let hosts = Arc::clone(&hosts);
            let lb = Arc::clone(&lb);
            worker.post(Box::new(move |view| {
                view.apply_cluster_update(info, hosts, lb)
            }));
        }
    }

    fn refresh_total_clusters(&self) {
        let total = self.inner.state.lock().unwrap().clusters.len();
        self.inner.stats.total_clusters.set(total as u64);
    }

    /// Every tracked cluster has warmed. The manager is initialized once
    /// each worker additionally acknowledges the static-initial snapshot.
    fn on_all_clusters_warm(&self) {
        if self.inner.workers.is_empty() {
            self.finish_initialization();
            return;
        }

        self.inner.state.lock().unwrap().worker_acks_pending = self.inner.workers.len();
        for worker in &self.inner.workers {
            let weak = self.downgrade();
            worker.post(Box::new(move |_| {
                if let Some(manager) = ClusterManager::upgrade(&weak) {
                    manager.on_worker_ack();
                }
            }));
        }
    }

    fn on_worker_ack(&self) {
        let all_acked = {
            let mut state = self.inner.state.lock().unwrap();
            state.worker_acks_pending -= 1;
            state.worker_acks_pending == 0
        };
        if all_acked {
            self.finish_initialization();
        }
    }

    fn finish_initialization(&self) {
        let cb = {
            let mut state = self.inner.state.lock().unwrap();
            state.ready = true;
            state.initialized_cb.take()
        };
        tracing::info!("cluster manager initialized");
        if let Some(cb) = cb {
            cb();
        }
    }

    fn on_cluster_drained(&self, token: u64) {
        let cluster = self.inner.state.lock().unwrap().draining.remove(&token);
        if let Some(cluster) = cluster {
            tracing::debug!(cluster = %cluster.name(), "cluster drained, destroying");
        }
    }

    #[cfg(test)]
    fn draining_count(&self) -> usize {
        self.inner.state.lock().unwrap().draining.len()
    }
}
