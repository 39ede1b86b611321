//! Resource subscriptions.
//!
//! A [Subscription] is a one-consumer stream of versioned resource lists of a
//! single kind: cluster definitions, endpoint assignments, and so on. Every
//! delivery is the *entire* current set, never a diff; consumers recompute
//! their own diff against whatever registry they keep.
//!
//! Subscription failures are surfaced to the consumer and counted, and never
//! tear the consumer down - the manager keeps making progress on its
//! last-known-good state while the source retries.

use std::borrow::Cow;

use serde::Deserialize;
use trellis_api::{ClusterSpec, EndpointAssignment, Name};

use crate::stats::{Counter, Scope};

mod filesystem;
mod grpc;
mod proto;

pub use filesystem::FilesystemSubscription;
pub use grpc::GrpcSubscription;
pub use proto::{DiscoveryRequest, DiscoveryResponse, RpcStatus};

/// A resource kind that can be delivered by a subscription.
pub trait Resource: serde::de::DeserializeOwned + Send + 'static {
    /// The type url carried on the wire for this kind.
    const TYPE_URL: &'static str;

    /// The unique name of this resource within its kind.
    fn resource_name(&self) -> &Name;
}

impl Resource for ClusterSpec {
    const TYPE_URL: &'static str = "trellis.config.v1.Cluster";

    fn resource_name(&self) -> &Name {
        &self.name
    }
}

impl Resource for EndpointAssignment {
    const TYPE_URL: &'static str = "trellis.config.v1.EndpointAssignment";

    fn resource_name(&self) -> &Name {
        &self.cluster_name
    }
}

/// Returned by a consumer that parsed an update but found it semantically
/// invalid. A rejection NACKs the update where the transport supports it and
/// leaves the consumer's prior state intact.
#[derive(Clone, Debug)]
pub struct UpdateRejection(pub Cow<'static, str>);

impl UpdateRejection {
    pub fn new(message: impl Into<Cow<'static, str>>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for UpdateRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a subscription update didn't apply.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid discovery document: {0}")]
    Decode(String),

    #[error("update rejected: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream disconnected")]
    Disconnected,
}

impl SubscriptionError {
    /// True for errors where the consumer parsed the update but refused it,
    /// as opposed to transport or decode problems. Classification is by the
    /// error kind itself, never by where in the pipeline it surfaced.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SubscriptionError::Rejected(_))
    }
}

/// The consumer half of a subscription.
pub trait SubscriptionCallbacks<R>: Send + 'static {
    /// Deliver the entire current resource set. Must be idempotent. An `Err`
    /// marks the update rejected.
    fn on_config_update(&mut self, resources: Vec<R>) -> Result<(), UpdateRejection>;

    /// Deliver a transport, decode, or rejection failure. Must not tear down
    /// the consumer.
    fn on_config_update_failed(&mut self, error: &SubscriptionError);
}

/// Counters shared by every subscription variant.
#[derive(Clone, Debug)]
pub struct SubscriptionStats {
    pub update_attempt: Counter,
    pub update_success: Counter,
    pub update_rejected: Counter,
    pub update_failure: Counter,
}

impl SubscriptionStats {
    pub fn new(scope: &Scope) -> Self {
        Self {
            update_attempt: scope.counter("update_attempt"),
            update_success: scope.counter("update_success"),
            update_rejected: scope.counter("update_rejected"),
            update_failure: scope.counter("update_failure"),
        }
    }
}

/// A polymorphic source of versioned resource lists.
pub enum Subscription<R: Resource> {
    Filesystem(FilesystemSubscription<R>),
    Grpc(GrpcSubscription<R>),
}

impl<R: Resource> Subscription<R> {
    /// Start the subscription. Updates are delivered to `callbacks` until
    /// the subscription is dropped.
    pub fn start(&mut self, initial_resources: Vec<String>, callbacks: Box<dyn SubscriptionCallbacks<R>>) {
        match self {
            Subscription::Filesystem(s) => s.start(initial_resources, callbacks),
            Subscription::Grpc(s) => s.start(initial_resources, callbacks),
        }
    }

    /// Change the set of resource names this subscription asks for. Sources
    /// that always report everything ignore this.
    pub fn update_resources(&mut self, resources: Vec<String>) {
        match self {
            Subscription::Filesystem(s) => s.update_resources(resources),
            Subscription::Grpc(s) => s.update_resources(resources),
        }
    }
}

/// The JSON shape shared by watched files and stream payloads.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct DiscoveryDocument {
    #[serde(default)]
    pub version_info: String,

    #[serde(default)]
    pub resources: Vec<serde_json::Value>,
}

impl DiscoveryDocument {
    /// Decode every resource in the document, failing on the first invalid
    /// entry.
    pub(crate) fn decode<R: Resource>(self) -> Result<(String, Vec<R>), SubscriptionError> {
        let mut resources = Vec::with_capacity(self.resources.len());
        for value in self.resources {
            let resource =
                serde_json::from_value(value).map_err(|e| SubscriptionError::Decode(e.to_string()))?;
            resources.push(resource);
        }
        Ok((self.version_info, resources))
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_decode_document() {
        let doc: DiscoveryDocument = serde_json::from_value(serde_json::json!({
            "version_info": "v1",
            "resources": [
                {"name": "cluster_1", "type": "static", "hosts": [{"url": "tcp://127.0.0.1:80"}]},
            ],
        }))
        .unwrap();

        let (version, resources): (String, Vec<ClusterSpec>) = doc.decode().unwrap();
        assert_eq!(version, "v1");
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].resource_name().as_str(), "cluster_1");
    }

    #[test]
    fn test_decode_document_bad_resource() {
        let doc: DiscoveryDocument = serde_json::from_value(serde_json::json!({
            "version_info": "v1",
            "resources": [{"name": "cluster_1", "type": "carrier_pigeon"}],
        }))
        .unwrap();

        let result: Result<(String, Vec<ClusterSpec>), _> = doc.decode();
        assert!(matches!(result, Err(SubscriptionError::Decode(_))));
    }
}
