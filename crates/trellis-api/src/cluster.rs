//! Cluster configuration.
//!
//! A [ClusterSpec] is the declarative description of an upstream cluster: how
//! its members are discovered, how connections to them are made, and how load
//! is spread across them. Specs are plain serde data; the runtime entity built
//! from a spec lives in `trellis-core`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Name};

/// How a cluster's member hosts are discovered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryType {
    /// A fixed list of addresses given in the spec.
    Static,
    /// Resolve every configured hostname and use all returned addresses as
    /// the member set.
    StrictDns,
    /// Resolve a single hostname and use only the first returned address,
    /// keeping the hostname for connection-level use.
    LogicalDns,
    /// Forward to the address the downstream connection was originally
    /// destined for. The cluster has no fixed member set.
    OriginalDst,
    /// Members are pushed by the management server as endpoint assignments.
    Eds,
}

/// The load balancing policy used to pick a host for each request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    Random,
    RingHash,
}

/// A single configured endpoint, in `tcp://host:port` form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub url: String,
}

impl EndpointSpec {
    /// Split this endpoint into its host and port parts, validating the
    /// `tcp://` scheme. The host may be a hostname for DNS cluster types.
    pub fn host_port(&self) -> Result<(&str, u16), Error> {
        let rest = self
            .url
            .strip_prefix("tcp://")
            .ok_or_else(|| Error::invalid_endpoint(&self.url, "expected a tcp:// url"))?;

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::invalid_endpoint(&self.url, "missing port"))?;
        if host.is_empty() {
            return Err(Error::invalid_endpoint(&self.url, "missing host"));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| Error::invalid_endpoint(&self.url, "invalid port"))?;

        Ok((host, port))
    }

    /// Parse this endpoint as a concrete socket address. Only valid for
    /// static clusters, where hostnames are not allowed.
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        let (host, port) = self.host_port()?;
        let ip = host
            .parse()
            .map_err(|_| Error::invalid_endpoint(&self.url, "expected an IP address"))?;
        Ok(SocketAddr::new(ip, port))
    }
}

/// Active health checking configuration. Health checking itself runs outside
/// the cluster manager; the spec is carried and validated here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheckSpec {
    Http {
        timeout_ms: u64,
        interval_ms: u64,
        unhealthy_threshold: u32,
        healthy_threshold: u32,
        path: String,
    },
    Tcp {
        timeout_ms: u64,
        interval_ms: u64,
        unhealthy_threshold: u32,
        healthy_threshold: u32,
    },
}

/// Outlier detection (passive health) configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutlierDetectionSpec {
    #[serde(default)]
    pub consecutive_5xx: Option<u32>,
    #[serde(default)]
    pub base_ejection_time_ms: Option<u64>,
    #[serde(default)]
    pub max_ejection_percent: Option<u32>,
}

/// Upstream TLS configuration. The cluster manager allocates a context from
/// this and binds its lifetime to the owning cluster; the handshake machinery
/// is out of scope here.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsContextSpec {
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub cert_chain_file: Option<String>,
    #[serde(default)]
    pub private_key_file: Option<String>,
    #[serde(default)]
    pub ca_cert_file: Option<String>,
}

/// Circuit breaker ceilings for one priority level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: u32,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_connections() -> u32 {
    1024
}
fn default_max_pending_requests() -> u32 {
    1024
}
fn default_max_requests() -> u32 {
    1024
}
fn default_max_retries() -> u32 {
    3
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_pending_requests: default_max_pending_requests(),
            max_requests: default_max_requests(),
            max_retries: default_max_retries(),
        }
    }
}

/// Circuit breaker configuration, split by request priority.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakers {
    #[serde(default)]
    pub default: Option<Thresholds>,
    #[serde(default)]
    pub high: Option<Thresholds>,
}

/// The declarative description of an upstream cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: Name,

    #[serde(rename = "type")]
    pub discovery: DiscoveryType,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub lb_type: LbPolicy,

    #[serde(default)]
    pub hosts: Vec<EndpointSpec>,

    #[serde(default)]
    pub dns_resolvers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier_detection: Option<OutlierDetectionSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_context: Option<TlsContextSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_connection_buffer_limit_bytes: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breakers: Option<CircuitBreakers>,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl ClusterSpec {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// The 64-bit hash of this spec. Two specs with the same hash are treated
    /// as identical by the cluster manager's add-or-update path.
    pub fn spec_hash(&self) -> u64 {
        // canonical JSON keeps the hash stable across reserialization
        let encoded = serde_json::to_vec(self).expect("ClusterSpec is always serializable");
        xxhash_rust::xxh64::xxh64(&encoded, 0)
    }

    /// Check cross-field constraints that serde can't express.
    pub fn validate(&self) -> Result<(), Error> {
        match self.discovery {
            DiscoveryType::Static => {
                if self.hosts.is_empty() {
                    return Err(Error::invalid_cluster(
                        &self.name,
                        "static clusters must configure at least one host",
                    ));
                }
                for host in &self.hosts {
                    host.socket_addr()?;
                }
            }
            DiscoveryType::StrictDns | DiscoveryType::LogicalDns => {
                if self.hosts.is_empty() {
                    return Err(Error::invalid_cluster(
                        &self.name,
                        "dns clusters must configure at least one host",
                    ));
                }
                for host in &self.hosts {
                    host.host_port()?;
                }
            }
            DiscoveryType::OriginalDst | DiscoveryType::Eds => {
                if !self.hosts.is_empty() {
                    return Err(Error::invalid_cluster(
                        &self.name,
                        "hosts may not be configured for this discovery type",
                    ));
                }
            }
        }

        if self.connect_timeout_ms == 0 {
            return Err(Error::invalid_cluster(
                &self.name,
                "connect_timeout_ms must be positive",
            ));
        }

        Ok(())
    }
}
