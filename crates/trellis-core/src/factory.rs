//! Construction of clusters, pools, resolvers, and subscriptions.
//!
//! The [ClusterManagerFactory] trait is the seam between the cluster manager
//! and everything it allocates. The production factory builds the real
//! thing; the [validation factory][ValidationClusterManagerFactory] builds a
//! side-effect-free rendition of it so a bootstrap can be driven end to end
//! without opening sockets, issuing DNS, or spawning workers.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use trellis_api::bootstrap::ConfigSource;
use trellis_api::cluster::TlsContextSpec;
use trellis_api::{ClusterSpec, EndpointAssignment};

use crate::access_log::OutlierEventLogger;
use crate::cluster::{Cluster, TlsContext};
use crate::dns::{DnsResolver, IpFamily, StdlibResolver};
use crate::host::{Host, Priority};
use crate::pool::{ConnPool, HttpConnPool, NullConnPool, Protocol};
use crate::stats::Scope;
use crate::subscription::{
    FilesystemSubscription, GrpcSubscription, Resource, Subscription, SubscriptionStats,
};
use crate::{Error, LocalInfo, Result};

const DNS_LOOKUP_INTERVAL: Duration = Duration::from_secs(5);
const DNS_THREADS: usize = 2;

/// Allocates the objects the cluster manager needs during operation.
pub trait ClusterManagerFactory: Send + Sync {
    /// Build a cluster runtime entity from its spec, attaching the outlier
    /// event sink when one is configured.
    fn cluster_from_spec(
        &self,
        spec: &ClusterSpec,
        stats_scope: &Scope,
        added_via_api: bool,
        eds_subscription: Option<Subscription<EndpointAssignment>>,
        outlier_event_logger: Option<OutlierEventLogger>,
    ) -> Result<Arc<Cluster>>;

    /// Allocate a connection pool bound to one host.
    fn allocate_conn_pool(
        &self,
        host: Arc<Host>,
        priority: Priority,
        protocol: Protocol,
    ) -> Box<dyn ConnPool>;

    /// The shared DNS resolver, or `None` when DNS must not be issued.
    fn create_dns_resolver(&self) -> Option<Arc<dyn DnsResolver>>;

    /// Build the cluster-discovery subscription for `source`. `None` means
    /// this factory does not run subscriptions.
    fn create_cluster_subscription(
        &self,
        source: &ConfigSource,
        uri: Option<String>,
        scope: &Scope,
    ) -> Result<Option<Subscription<ClusterSpec>>>;

    /// Build an endpoint-discovery subscription for one EDS cluster.
    fn create_endpoint_subscription(
        &self,
        source: &ConfigSource,
        uri: Option<String>,
        scope: &Scope,
    ) -> Result<Option<Subscription<EndpointAssignment>>>;
}

/// Allocates upstream TLS contexts from declarative config. Contexts live
/// exactly as long as the cluster that owns them.
#[derive(Debug, Default)]
pub struct TlsContextManager;

impl TlsContextManager {
    pub fn create_context(&self, spec: &TlsContextSpec) -> Result<Arc<TlsContext>> {
        match (&spec.cert_chain_file, &spec.private_key_file) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::cluster_creation(
                    "tls_context: cert_chain_file and private_key_file must be set together",
                ));
            }
            _ => {}
        }

        Ok(Arc::new(TlsContext {
            sni: spec.sni.clone(),
            cert_chain_file: spec.cert_chain_file.clone(),
            private_key_file: spec.private_key_file.clone(),
            ca_cert_file: spec.ca_cert_file.clone(),
        }))
    }
}

fn build_cluster(
    spec: &ClusterSpec,
    stats_scope: &Scope,
    tls_manager: &TlsContextManager,
    resolver: Option<Arc<dyn DnsResolver>>,
    eds_subscription: Option<Subscription<EndpointAssignment>>,
    outlier_event_logger: Option<OutlierEventLogger>,
    added_via_api: bool,
    ip_family: IpFamily,
) -> Result<Arc<Cluster>> {
    let tls = match &spec.tls_context {
        Some(tls_spec) => Some(tls_manager.create_context(tls_spec)?),
        None => None,
    };

    Cluster::new(
        spec,
        stats_scope,
        resolver,
        eds_subscription,
        tls,
        outlier_event_logger,
        added_via_api,
        ip_family,
    )
    .map_err(|e| match e {
        // everything that stops a spec from becoming a cluster is one error
        // kind with a readable message
        Error::Config(e) => Error::cluster_creation(e.to_string()),
        other => other,
    })
}

fn build_subscription<R: Resource>(
    source: &ConfigSource,
    uri: Option<String>,
    node: &LocalInfo,
    scope: &Scope,
) -> Result<Subscription<R>> {
    let stats = SubscriptionStats::new(scope);

    if let Some(path) = &source.path {
        let poll_interval = Duration::from_millis(source.refresh_delay_ms.max(100));
        return Ok(Subscription::Filesystem(FilesystemSubscription::new(
            path,
            poll_interval,
            stats,
        )));
    }

    let uri = uri.ok_or_else(|| Error::bootstrap("config source has no management cluster"))?;
    let subscription = GrpcSubscription::new(uri, node.node_name.clone(), stats)
        .map_err(|e| Error::bootstrap(format!("invalid management server uri: {e}")))?;
    Ok(Subscription::Grpc(subscription))
}

/// The production factory.
pub struct ProdClusterManagerFactory {
    local_info: LocalInfo,
    ip_family: IpFamily,
    tls_manager: TlsContextManager,
    resolver: OnceCell<Arc<StdlibResolver>>,
}

impl ProdClusterManagerFactory {
    pub fn new(local_info: LocalInfo, ip_family: IpFamily) -> Self {
        Self {
            local_info,
            ip_family,
            tls_manager: TlsContextManager,
            resolver: OnceCell::new(),
        }
    }
}

impl ClusterManagerFactory for ProdClusterManagerFactory {
    fn cluster_from_spec(
        &self,
        spec: &ClusterSpec,
        stats_scope: &Scope,
        added_via_api: bool,
        eds_subscription: Option<Subscription<EndpointAssignment>>,
        outlier_event_logger: Option<OutlierEventLogger>,
    ) -> Result<Arc<Cluster>> {
        build_cluster(
            spec,
            stats_scope,
            &self.tls_manager,
            self.create_dns_resolver(),
            eds_subscription,
            outlier_event_logger,
            added_via_api,
            self.ip_family,
        )
    }

    fn allocate_conn_pool(
        &self,
        host: Arc<Host>,
        _priority: Priority,
        protocol: Protocol,
    ) -> Box<dyn ConnPool> {
        Box::new(HttpConnPool::new(host, protocol))
    }

    fn create_dns_resolver(&self) -> Option<Arc<dyn DnsResolver>> {
        let resolver = self
            .resolver
            .get_or_init(|| Arc::new(StdlibResolver::new_with(DNS_LOOKUP_INTERVAL, DNS_THREADS)));
        Some(Arc::clone(resolver) as Arc<dyn DnsResolver>)
    }

    fn create_cluster_subscription(
        &self,
        source: &ConfigSource,
        uri: Option<String>,
        scope: &Scope,
    ) -> Result<Option<Subscription<ClusterSpec>>> {
        build_subscription(source, uri, &self.local_info, scope).map(Some)
    }

    fn create_endpoint_subscription(
        &self,
        source: &ConfigSource,
        uri: Option<String>,
        scope: &Scope,
    ) -> Result<Option<Subscription<EndpointAssignment>>> {
        build_subscription(source, uri, &self.local_info, scope).map(Some)
    }
}

/// A factory with zero observable side effects: no DNS, no sockets, no
/// subscriptions, no-op pools. Cluster construction and TLS validation still
/// run for real so that `--mode validate` reports the same config errors the
/// server would.
pub struct ValidationClusterManagerFactory {
    ip_family: IpFamily,
    tls_manager: TlsContextManager,
}

impl ValidationClusterManagerFactory {
    pub fn new(ip_family: IpFamily) -> Self {
        Self {
            ip_family,
            tls_manager: TlsContextManager,
        }
    }
}

impl ClusterManagerFactory for ValidationClusterManagerFactory {
    fn cluster_from_spec(
        &self,
        spec: &ClusterSpec,
        stats_scope: &Scope,
        added_via_api: bool,
        _eds_subscription: Option<Subscription<EndpointAssignment>>,
        outlier_event_logger: Option<OutlierEventLogger>,
    ) -> Result<Arc<Cluster>> {
        build_cluster(
            spec,
            stats_scope,
            &self.tls_manager,
            None,
            None,
            outlier_event_logger,
            added_via_api,
            self.ip_family,
        )
    }

    fn allocate_conn_pool(
        &self,
        host: Arc<Host>,
        _priority: Priority,
        protocol: Protocol,
    ) -> Box<dyn ConnPool> {
        Box::new(NullConnPool::new(host, protocol))
    }

    fn create_dns_resolver(&self) -> Option<Arc<dyn DnsResolver>> {
        None
    }

    fn create_cluster_subscription(
        &self,
        _source: &ConfigSource,
        _uri: Option<String>,
        _scope: &Scope,
    ) -> Result<Option<Subscription<ClusterSpec>>> {
        Ok(None)
    }

    fn create_endpoint_subscription(
        &self,
        _source: &ConfigSource,
        _uri: Option<String>,
        _scope: &Scope,
    ) -> Result<Option<Subscription<EndpointAssignment>>> {
        Ok(None)
    }
}

/// Derive the `http://host:port` uri for a discovery source backed by a
/// cluster, from the backing cluster's configured endpoints. Names are fine
/// here; the transport resolves them itself.
pub(crate) fn management_uri(backing: &ClusterSpec) -> Result<String> {
    let endpoint = backing.hosts.first().ok_or_else(|| {
        Error::bootstrap(format!(
            "cluster {:?} cannot host a discovery subscription: it has no configured endpoints",
            backing.name.as_str(),
        ))
    })?;
    let (host, port) = endpoint.host_port().map_err(Error::Config)?;
    Ok(format!("http://{host}:{port}"))
}
