//! Upstream connections and connection pools.
//!
//! Pools are owned by a single worker and keyed by `(host, priority,
//! protocol)`. The only cross-cutting contract is draining: a pool invokes
//! its drained callbacks once it holds no in-flight requests, which is how
//! cluster removal and host churn tear pools down without dropping traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::host::{Host, Priority, ResourcePermit};

/// The HTTP protocol a pool speaks upstream, keyed off the downstream
/// connection's protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http1,
    Http2,
}

/// The key a worker caches connection pools under.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub address: SocketAddr,
    pub priority: Priority,
    pub protocol: Protocol,
}

/// A live connection pool for one `(host, priority, protocol)`.
///
/// The codec machinery behind a pool lives outside this crate; the cluster
/// manager cares only about the host a pool is bound to and the drain
/// contract.
pub trait ConnPool: Send {
    fn host(&self) -> &Arc<Host>;

    fn protocol(&self) -> Protocol;

    /// Register a callback invoked once the pool holds no in-flight
    /// requests. If the pool is already idle the callback fires immediately.
    /// Each callback fires exactly once.
    fn add_drained_callback(&mut self, cb: Box<dyn FnOnce() + Send>);
}

/// The production pool shell: tracks in-flight requests and fires drained
/// callbacks at idle.
pub struct HttpConnPool {
    host: Arc<Host>,
    protocol: Protocol,
    active_requests: usize,
    drained_cbs: Vec<Box<dyn FnOnce() + Send>>,
}

impl HttpConnPool {
    pub fn new(host: Arc<Host>, protocol: Protocol) -> Self {
        Self {
            host,
            protocol,
            active_requests: 0,
            drained_cbs: Vec::new(),
        }
    }

    /// Account a new in-flight request.
    pub fn attach_request(&mut self) {
        self.active_requests += 1;
    }

    /// Complete an in-flight request, firing drained callbacks if the pool
    /// went idle.
    pub fn complete_request(&mut self) {
        debug_assert!(self.active_requests > 0);
        self.active_requests = self.active_requests.saturating_sub(1);
        if self.active_requests == 0 {
            self.fire_drained();
        }
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests
    }

    fn fire_drained(&mut self) {
        for cb in self.drained_cbs.drain(..) {
            cb();
        }
    }
}

impl ConnPool for HttpConnPool {
    fn host(&self) -> &Arc<Host> {
        &self.host
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn add_drained_callback(&mut self, cb: Box<dyn FnOnce() + Send>) {
        if self.active_requests == 0 {
            cb();
        } else {
            self.drained_cbs.push(cb);
        }
    }
}

/// A pool that never connects and is always idle, used by the validation
/// pipeline.
pub struct NullConnPool {
    host: Arc<Host>,
    protocol: Protocol,
}

impl NullConnPool {
    pub fn new(host: Arc<Host>, protocol: Protocol) -> Self {
        Self { host, protocol }
    }
}

impl ConnPool for NullConnPool {
    fn host(&self) -> &Arc<Host> {
        &self.host
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn add_drained_callback(&mut self, cb: Box<dyn FnOnce() + Send>) {
        cb();
    }
}

/// A raw upstream connection handle, configured but not yet connected.
///
/// Obtaining one never blocks; the TCP connect happens when the caller
/// drives [connect][UpstreamConnection::connect]. The handle holds one of
/// the cluster's connection circuit-breaker slots, released when it drops.
#[derive(Debug)]
pub struct UpstreamConnection {
    address: SocketAddr,
    connect_timeout: Duration,
    buffer_limit_bytes: Option<u32>,
    _permit: ResourcePermit,
}

impl UpstreamConnection {
    pub(crate) fn new(
        address: SocketAddr,
        connect_timeout: Duration,
        buffer_limit_bytes: Option<u32>,
        permit: ResourcePermit,
    ) -> Self {
        Self {
            address,
            connect_timeout,
            buffer_limit_bytes,
            _permit: permit,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// The per-connection buffer limit from the owning cluster's spec,
    /// already applied to this connection's configuration.
    pub fn buffer_limit_bytes(&self) -> Option<u32> {
        self.buffer_limit_bytes
    }

    /// Establish the connection, honoring the cluster's connect timeout.
    pub async fn connect(&self) -> std::io::Result<TcpStream> {
        let connect = TcpStream::connect(self.address);
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {} timed out", self.address),
            )),
        }
    }
}

/// A connection paired with the host that backs it. `connection` is `None`
/// when the cluster exists but has no healthy host.
pub struct TcpConnData {
    pub connection: Option<UpstreamConnection>,
    pub host: Option<Arc<Host>>,
}
