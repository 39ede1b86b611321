//! Cluster runtime entities.
//!
//! A [Cluster] is built from a `ClusterSpec` and owns the machinery that
//! keeps its member set current: a fixed list for static clusters, DNS
//! watches for dns-discovered clusters, or an endpoint subscription for EDS.
//! Membership is published as immutable [HostSet] snapshots; the manager
//! registers a member-update callback to fan each snapshot out to workers.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use trellis_api::cluster::{EndpointSpec, Thresholds};
use trellis_api::{ClusterSpec, DiscoveryType, EndpointAssignment, LbPolicy, Name};

use crate::access_log::OutlierEventLogger;
use crate::dns::{DnsResolver, DnsWatch, IpFamily};
use crate::host::{Host, HostSet, Locality, Priority, ResourceManager};
use crate::init::{InitPhase, InitTarget};
use crate::load_balancer::LoadBalancer;
use crate::stats::{Counter, Gauge, Scope};
use crate::subscription::{
    Subscription, SubscriptionCallbacks, SubscriptionError, UpdateRejection,
};
use crate::{Error, Result};

/// Per-cluster counters and gauges, allocated under `cluster.<name>.`.
#[derive(Clone, Debug)]
pub struct ClusterStats {
    pub upstream_cx_total: Counter,
    pub upstream_cx_none_healthy: Counter,
    pub upstream_cx_overflow: Counter,
    pub upstream_rq_total: Counter,
    pub membership_change: Counter,
    pub membership_total: Gauge,
}

impl ClusterStats {
    pub fn new(scope: &Scope) -> Self {
        Self {
            upstream_cx_total: scope.counter("upstream_cx_total"),
            upstream_cx_none_healthy: scope.counter("upstream_cx_none_healthy"),
            upstream_cx_overflow: scope.counter("upstream_cx_overflow"),
            upstream_rq_total: scope.counter("upstream_rq_total"),
            membership_change: scope.counter("membership_change"),
            membership_total: scope.gauge("membership_total"),
        }
    }
}

/// An upstream TLS context allocated for one cluster. The handshake stack is
/// out of scope here; the context carries the validated declarative config
/// and lives exactly as long as its cluster.
#[derive(Clone, Debug)]
pub struct TlsContext {
    pub sni: Option<String>,
    pub cert_chain_file: Option<String>,
    pub private_key_file: Option<String>,
    pub ca_cert_file: Option<String>,
}

/// Immutable metadata about a cluster, shared between the primary entity,
/// per-worker views, and hosts.
#[derive(Debug)]
pub struct ClusterInfo {
    name: Name,
    discovery: DiscoveryType,
    lb_policy: LbPolicy,
    connect_timeout: Duration,
    per_connection_buffer_limit_bytes: Option<u32>,
    added_via_api: bool,
    stats: ClusterStats,
    resource_managers: [ResourceManager; 2],
    tls: Option<Arc<TlsContext>>,
    outlier: Option<OutlierDetector>,
}

/// Passive health detection state for one cluster: the configured thresholds
/// plus the shared event log sink. The detection algorithm itself runs in
/// the health-checking layer; it reads config and writes events through
/// this.
#[derive(Clone, Debug)]
pub struct OutlierDetector {
    pub config: trellis_api::cluster::OutlierDetectionSpec,
    pub event_logger: Option<OutlierEventLogger>,
}

impl ClusterInfo {
    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn discovery(&self) -> DiscoveryType {
        self.discovery
    }

    pub fn lb_policy(&self) -> LbPolicy {
        self.lb_policy
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn per_connection_buffer_limit_bytes(&self) -> Option<u32> {
        self.per_connection_buffer_limit_bytes
    }

    pub fn added_via_api(&self) -> bool {
        self.added_via_api
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    pub fn resource_manager(&self, priority: Priority) -> &ResourceManager {
        &self.resource_managers[priority.index()]
    }

    pub fn tls_context(&self) -> Option<&Arc<TlsContext>> {
        self.tls.as_ref()
    }

    pub fn outlier_detector(&self) -> Option<&OutlierDetector> {
        self.outlier.as_ref()
    }
}

type MemberUpdateCb = Box<dyn Fn(&Name, Arc<HostSet>) + Send + Sync>;

struct InitSlot {
    done: Option<Box<dyn FnOnce() + Send>>,
    initialized: bool,
}

/// Discovery machinery, by cluster type.
enum DiscoveryGuts {
    Fixed,
    Dns {
        targets: Vec<(String, u16)>,
        logical: bool,
        resolver: Option<Arc<dyn DnsResolver>>,
        watches: Vec<DnsWatch>,
        answers: BTreeMap<(String, u16), Vec<SocketAddr>>,
        pending_first: HashSet<(String, u16)>,
    },
    Eds {
        subscription: Option<Subscription<EndpointAssignment>>,
    },
}

/// A running cluster.
pub struct Cluster {
    info: Arc<ClusterInfo>,
    phase: InitPhase,
    lb: Arc<LoadBalancer>,
    ip_family: IpFamily,
    hosts: Mutex<Arc<HostSet>>,
    init: Mutex<InitSlot>,
    member_cb: Mutex<Option<MemberUpdateCb>>,
    discovery: Mutex<DiscoveryGuts>,
    self_weak: Weak<Cluster>,
}

impl Cluster {
    pub(crate) fn new(
        spec: &ClusterSpec,
        stats_scope: &Scope,
        resolver: Option<Arc<dyn DnsResolver>>,
        eds_subscription: Option<Subscription<EndpointAssignment>>,
        tls: Option<Arc<TlsContext>>,
        outlier_event_logger: Option<OutlierEventLogger>,
        added_via_api: bool,
        ip_family: IpFamily,
    ) -> Result<Arc<Cluster>> {
        spec.validate()?;

        let default_thresholds = Thresholds::default();
        let breakers = spec.circuit_breakers.clone().unwrap_or_default();
        let resource_managers = [
            ResourceManager::from_thresholds(
                breakers.default.as_ref().unwrap_or(&default_thresholds),
            ),
            ResourceManager::from_thresholds(breakers.high.as_ref().unwrap_or(&default_thresholds)),
        ];

        let outlier = spec.outlier_detection.as_ref().map(|config| OutlierDetector {
            config: config.clone(),
            event_logger: outlier_event_logger,
        });

        let info = Arc::new(ClusterInfo {
            name: spec.name.clone(),
            discovery: spec.discovery,
            lb_policy: spec.lb_type,
            connect_timeout: spec.connect_timeout(),
            per_connection_buffer_limit_bytes: spec.per_connection_buffer_limit_bytes,
            added_via_api,
            stats: ClusterStats::new(&stats_scope.scope(&format!("cluster.{}.", spec.name))),
            resource_managers,
            tls,
            outlier,
        });

        let phase = match spec.discovery {
            DiscoveryType::Eds => InitPhase::Secondary,
            _ => InitPhase::Primary,
        };

        let guts = match spec.discovery {
            DiscoveryType::Static | DiscoveryType::OriginalDst => DiscoveryGuts::Fixed,
            DiscoveryType::StrictDns | DiscoveryType::LogicalDns => {
                let mut targets = Vec::with_capacity(spec.hosts.len());
                for host in &spec.hosts {
                    let (hostname, port) = host.host_port()?;
                    targets.push((hostname.to_string(), port));
                }
                DiscoveryGuts::Dns {
                    pending_first: targets.iter().cloned().collect(),
                    targets,
                    logical: spec.discovery == DiscoveryType::LogicalDns,
                    resolver,
                    watches: Vec::new(),
                    answers: BTreeMap::new(),
                }
            }
            DiscoveryType::Eds => DiscoveryGuts::Eds {
                subscription: eds_subscription,
            },
        };

        let cluster = Arc::new_cyclic(|self_weak| Cluster {
            info: Arc::clone(&info),
            phase,
            lb: Arc::new(LoadBalancer::from_policy(spec.lb_type)),
            ip_family,
            hosts: Mutex::new(HostSet::empty()),
            init: Mutex::new(InitSlot {
                done: None,
                initialized: false,
            }),
            member_cb: Mutex::new(None),
            discovery: Mutex::new(guts),
            self_weak: self_weak.clone(),
        });

        // static clusters know their members up front
        if spec.discovery == DiscoveryType::Static {
            let addrs = spec
                .hosts
                .iter()
                .map(EndpointSpec::socket_addr)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(Error::Config)?;
            cluster.install_hosts(addrs.into_iter().map(|a| (a, String::new(), None, 1)));
        }

        Ok(cluster)
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn name(&self) -> &Name {
        self.info.name()
    }

    pub fn init_phase(&self) -> InitPhase {
        self.phase
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.lb
    }

    /// The current membership snapshot.
    pub fn host_set(&self) -> Arc<HostSet> {
        Arc::clone(&self.hosts.lock().unwrap())
    }

    /// Register the callback invoked with each new membership snapshot.
    pub(crate) fn set_member_update_cb(&self, cb: MemberUpdateCb) {
        *self.member_cb.lock().unwrap() = Some(cb);
    }

    /// Start whatever discovery this cluster needs and arrange for `done` to
    /// fire once membership reaches steady state.
    pub(crate) fn start_initialize(&self, done: Box<dyn FnOnce() + Send>) {
        {
            let mut init = self.init.lock().unwrap();
            if init.initialized {
                drop(init);
                done();
                return;
            }
            init.done = Some(done);
        }

        // figure out what to start under the lock, but register DNS watches
        // outside it: a resolver that answers synchronously calls straight
        // back into on_dns_answer, which takes the same lock
        enum Plan {
            Warm,
            Dns(Arc<dyn DnsResolver>, Vec<(String, u16)>),
            Started,
        }

        let plan = {
            let mut guts = self.discovery.lock().unwrap();
            match &mut *guts {
                // fixed membership is warm the moment it exists
                DiscoveryGuts::Fixed => Plan::Warm,
                DiscoveryGuts::Dns {
                    targets, resolver, ..
                } => match resolver.clone() {
                    Some(resolver) => Plan::Dns(resolver, targets.clone()),
                    None => Plan::Warm,
                },
                DiscoveryGuts::Eds { subscription } => match subscription {
                    Some(subscription) => {
                        let callbacks = EndpointCallbacks {
                            cluster: self.self_weak.clone(),
                        };
                        subscription.start(vec![self.info.name.to_string()], Box::new(callbacks));
                        Plan::Started
                    }
                    None => Plan::Warm,
                },
            }
        };

        match plan {
            Plan::Warm => self.finish_initialize(),
            Plan::Started => {}
            Plan::Dns(resolver, targets) => {
                let mut new_watches = Vec::with_capacity(targets.len());
                for (hostname, port) in targets {
                    let weak = self.self_weak.clone();
                    let key = (hostname.clone(), port);
                    let watch = resolver.watch(
                        &hostname,
                        port,
                        self.ip_family,
                        Box::new(move |addrs| {
                            if let Some(cluster) = weak.upgrade() {
                                cluster.on_dns_answer(&key, addrs);
                            }
                        }),
                    );
                    new_watches.push(watch);
                }

                let mut guts = self.discovery.lock().unwrap();
                if let DiscoveryGuts::Dns { watches, .. } = &mut *guts {
                    watches.extend(new_watches);
                }
            }
        }
    }

    /// Drop discovery machinery: cancel DNS watches and stop subscriptions.
    /// Called when the cluster is removed from the registry.
    pub(crate) fn cancel_discovery(&self) {
        // take the watches out under the lock but cancel them after
        // releasing it; cancellation takes the resolver's lock, which the
        // resolver holds while delivering answers into this cluster
        let watches = {
            let mut guts = self.discovery.lock().unwrap();
            match &mut *guts {
                DiscoveryGuts::Fixed => Vec::new(),
                DiscoveryGuts::Dns { watches, .. } => std::mem::take(watches),
                DiscoveryGuts::Eds { subscription } => {
                    *subscription = None;
                    Vec::new()
                }
            }
        };

        for watch in watches {
            watch.cancel();
        }
    }

    fn on_dns_answer(&self, key: &(String, u16), addrs: Vec<SocketAddr>) {
        let (members, ready) = {
            let mut guts = self.discovery.lock().unwrap();
            let DiscoveryGuts::Dns {
                targets,
                logical,
                answers,
                pending_first,
                ..
            } = &mut *guts
            else {
                return;
            };

            answers.insert(key.clone(), addrs);
            pending_first.remove(key);

            let members: Vec<(SocketAddr, String, Option<Locality>, u32)> = if *logical {
                // logical dns: only the first address of the first target,
                // keeping the hostname label
                targets
                    .iter()
                    .find_map(|t| {
                        let addrs = answers.get(t)?;
                        let first = addrs.first()?;
                        Some(vec![(*first, t.0.clone(), None, 1)])
                    })
                    .unwrap_or_default()
            } else {
                targets
                    .iter()
                    .filter_map(|t| answers.get(t).map(|addrs| (t, addrs)))
                    .flat_map(|(t, addrs)| {
                        addrs.iter().map(move |addr| (*addr, t.0.clone(), None, 1))
                    })
                    .collect()
            };

            (members, pending_first.is_empty())
        };

        self.install_hosts(members);
        if ready {
            self.finish_initialize();
        }
    }

    fn on_endpoint_update(
        &self,
        assignments: Vec<EndpointAssignment>,
    ) -> std::result::Result<(), UpdateRejection> {
        let assignment = assignments
            .into_iter()
            .find(|a| a.cluster_name == self.info.name);

        let members = match assignment {
            Some(assignment) => {
                if let Err(e) = assignment.validate() {
                    return Err(UpdateRejection::new(e.to_string()));
                }
                assignment
                    .endpoints
                    .iter()
                    .map(|endpoint| {
                        let addr = endpoint
                            .socket_addr()
                            .expect("validated endpoint had a bad address");
                        let locality = endpoint.locality.as_ref().map(|l| Locality {
                            region: l.region.clone(),
                            zone: l.zone.clone(),
                        });
                        (addr, String::new(), locality, endpoint.weight)
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        self.install_hosts(members);
        self.finish_initialize();
        Ok(())
    }

    /// Build and publish a new host set. No-op if membership is unchanged.
    fn install_hosts(
        &self,
        members: impl IntoIterator<Item = (SocketAddr, String, Option<Locality>, u32)>,
    ) {
        let info_weak = Arc::downgrade(&self.info);
        let hosts: Vec<Arc<Host>> = members
            .into_iter()
            .map(|(addr, hostname, locality, weight)| {
                Host::new(addr, hostname, locality, weight, info_weak.clone())
            })
            .collect();
        let new_set = HostSet::new(hosts);

        {
            let mut current = self.hosts.lock().unwrap();
            if current.hash() == new_set.hash() {
                return;
            }
            *current = Arc::clone(&new_set);
        }

        self.info.stats.membership_change.inc();
        self.info.stats.membership_total.set(new_set.len() as u64);
        tracing::debug!(
            cluster = %self.info.name,
            hosts = new_set.len(),
            "cluster membership updated"
        );

        let member_cb = self.member_cb.lock().unwrap();
        if let Some(cb) = member_cb.as_ref() {
            cb(&self.info.name, new_set);
        }
    }

    /// Mark the cluster warm and fire the pending init-done callback, once.
    fn finish_initialize(&self) {
        let done = {
            let mut init = self.init.lock().unwrap();
            init.initialized = true;
            init.done.take()
        };
        if let Some(done) = done {
            done();
        }
    }
}

impl InitTarget for Cluster {
    fn name(&self) -> &Name {
        self.info.name()
    }

    fn init_phase(&self) -> InitPhase {
        self.phase
    }

    fn initialize(&self, done: Box<dyn FnOnce() + Send>) {
        self.start_initialize(done);
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.info.name)
            .field("discovery", &self.info.discovery)
            .field("phase", &self.phase)
            .finish()
    }
}

/// Feeds endpoint assignments from an EDS subscription into the cluster.
struct EndpointCallbacks {
    cluster: Weak<Cluster>,
}

impl SubscriptionCallbacks<EndpointAssignment> for EndpointCallbacks {
    fn on_config_update(
        &mut self,
        resources: Vec<EndpointAssignment>,
    ) -> std::result::Result<(), UpdateRejection> {
        match self.cluster.upgrade() {
            Some(cluster) => cluster.on_endpoint_update(resources),
            None => Ok(()),
        }
    }

    fn on_config_update_failed(&mut self, error: &SubscriptionError) {
        // an unreachable endpoint source must not wedge warm-up; the cluster
        // goes warm with whatever members it has
        if let Some(cluster) = self.cluster.upgrade() {
            tracing::warn!(cluster = %cluster.name(), err = %error, "endpoint discovery failed");
            cluster.finish_initialize();
        }
    }
}
