//! Discovery wire messages.
//!
//! The management stream speaks a small version/nonce discovery protocol.
//! Resource payloads ride inside responses as JSON documents so that the
//! filesystem and stream variants decode through the same serde path.

/// The gRPC method the stream variant calls.
pub(crate) const STREAM_METHOD: &str = "/trellis.discovery.v1.AggregatedDiscovery/StreamResources";

#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,

    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DiscoveryRequest {
    /// The most recent version the client has accepted for this type. Empty
    /// on the first request. Combined with `error_detail`, echoing this
    /// version is how a client NACKs a bad update.
    #[prost(string, tag = "1")]
    pub version_info: String,

    #[prost(string, tag = "2")]
    pub node: String,

    #[prost(string, repeated, tag = "3")]
    pub resource_names: Vec<String>,

    #[prost(string, tag = "4")]
    pub type_url: String,

    #[prost(string, tag = "5")]
    pub response_nonce: String,

    #[prost(message, optional, tag = "6")]
    pub error_detail: Option<RpcStatus>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DiscoveryResponse {
    #[prost(string, tag = "1")]
    pub version_info: String,

    /// JSON-encoded resources of `type_url`'s type.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub resources: Vec<Vec<u8>>,

    #[prost(string, tag = "3")]
    pub type_url: String,

    #[prost(string, tag = "4")]
    pub nonce: String,
}
