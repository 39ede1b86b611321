//! gRPC stream subscriptions.
//!
//! A [GrpcSubscription] drives a bidirectional discovery stream against a
//! management server: every response is ACKed by echoing its version and
//! nonce, and a bad response is NACKed by echoing the last *accepted* version
//! with an error detail. The stream reconnects with a fixed backoff on
//! disconnect; reconnecting resends the current resource names and the last
//! accepted version.

use std::marker::PhantomData;
use std::time::Duration;

use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::ProstCodec;
use tonic::transport::Endpoint;

use super::proto::{DiscoveryRequest, DiscoveryResponse, RpcStatus, STREAM_METHOD};
use super::{Resource, SubscriptionCallbacks, SubscriptionError, SubscriptionStats};

const RETRY_DELAY: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GrpcSubscription<R> {
    endpoint: Endpoint,
    node: String,
    stats: SubscriptionStats,
    names_tx: Option<mpsc::UnboundedSender<Vec<String>>>,
    task: Option<JoinHandle<()>>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Resource> GrpcSubscription<R> {
    /// Create a subscription that will stream from `uri` (for example
    /// `http://127.0.0.1:15010`), identifying itself as `node`.
    pub fn new(
        uri: String,
        node: String,
        stats: SubscriptionStats,
    ) -> Result<Self, tonic::transport::Error> {
        let endpoint = Endpoint::from_shared(uri)?
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_nodelay(true);

        Ok(Self {
            endpoint,
            node,
            stats,
            names_tx: None,
            task: None,
            _marker: PhantomData,
        })
    }

    pub(super) fn start(
        &mut self,
        initial_resources: Vec<String>,
        callbacks: Box<dyn SubscriptionCallbacks<R>>,
    ) {
        let (names_tx, names_rx) = mpsc::unbounded_channel();
        self.names_tx = Some(names_tx);

        let task = StreamTask::<R> {
            endpoint: self.endpoint.clone(),
            node: self.node.clone(),
            stats: self.stats.clone(),
            names: initial_resources,
            names_rx,
            callbacks,
            version_info: String::new(),
            _marker: PhantomData,
        };
        self.task = Some(tokio::spawn(task.run()));
    }

    pub(super) fn update_resources(&mut self, resources: Vec<String>) {
        if let Some(names_tx) = &self.names_tx {
            let _ = names_tx.send(resources);
        }
    }
}

impl<R> Drop for GrpcSubscription<R> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error(transparent)]
    Connect(#[from] tonic::transport::Error),

    #[error(transparent)]
    Status(#[from] tonic::Status),

    #[error("management server closed the stream")]
    Disconnected,
}

struct StreamTask<R> {
    endpoint: Endpoint,
    node: String,
    stats: SubscriptionStats,
    names: Vec<String>,
    names_rx: mpsc::UnboundedReceiver<Vec<String>>,
    callbacks: Box<dyn SubscriptionCallbacks<R>>,
    /// The last version the consumer accepted. Echoed on every request, and
    /// deliberately left unchanged by NACKs.
    version_info: String,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Resource> StreamTask<R> {
    async fn run(mut self) {
        loop {
            match self.run_connection().await {
                // the subscription was dropped; nothing left to stream for
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(err = %e, type_url = R::TYPE_URL, "discovery stream failed");
                    self.stats.update_failure.inc();
                    let error = match e {
                        ConnectionError::Disconnected => SubscriptionError::Disconnected,
                        other => SubscriptionError::Transport(other.to_string()),
                    };
                    self.callbacks.on_config_update_failed(&error);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn run_connection(&mut self) -> Result<(), ConnectionError> {
        tracing::debug!(type_url = R::TYPE_URL, "establishing discovery stream");
        let channel = self.endpoint.connect().await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await?;

        let (request_tx, request_rx) = mpsc::channel::<DiscoveryRequest>(16);
        let codec: ProstCodec<DiscoveryRequest, DiscoveryResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static(STREAM_METHOD);
        let response = grpc
            .streaming(
                tonic::Request::new(ReceiverStream::new(request_rx)),
                path,
                codec,
            )
            .await?;
        let mut incoming: tonic::Streaming<DiscoveryResponse> = response.into_inner();

        self.send_request(&request_tx, String::new(), None).await?;

        loop {
            tokio::select! {
                message = incoming.message() => {
                    let Some(response) = message? else {
                        return Err(ConnectionError::Disconnected);
                    };
                    let (nonce, error_detail) = self.handle_response(response);
                    self.send_request(&request_tx, nonce, error_detail).await?;
                }
                update = self.names_rx.recv() => {
                    let Some(names) = update else {
                        // subscription handle dropped
                        return Ok(());
                    };
                    self.names = names;
                    self.send_request(&request_tx, String::new(), None).await?;
                }
            }
        }
    }

    async fn send_request(
        &mut self,
        request_tx: &mpsc::Sender<DiscoveryRequest>,
        response_nonce: String,
        error_detail: Option<RpcStatus>,
    ) -> Result<(), ConnectionError> {
        let request = DiscoveryRequest {
            version_info: self.version_info.clone(),
            node: self.node.clone(),
            resource_names: self.names.clone(),
            type_url: R::TYPE_URL.to_string(),
            response_nonce,
            error_detail,
        };

        tracing::debug!(
            nack = request.error_detail.is_some(),
            version = %request.version_info,
            nonce = %request.response_nonce,
            type_url = %request.type_url,
            "DiscoveryRequest"
        );
        self.stats.update_attempt.inc();
        request_tx
            .send(request)
            .await
            .map_err(|_| ConnectionError::Disconnected)
    }

    /// Apply one response, returning the nonce to echo and the error detail
    /// for a NACK (`None` means ACK).
    fn handle_response(&mut self, response: DiscoveryResponse) -> (String, Option<RpcStatus>) {
        tracing::debug!(
            version = %response.version_info,
            nonce = %response.nonce,
            resources = response.resources.len(),
            "DiscoveryResponse"
        );

        if response.type_url != R::TYPE_URL {
            tracing::warn!(type_url = %response.type_url, "unexpected type url on discovery stream");
            return (
                response.nonce,
                Some(nack_status(format!("unknown type url {:?}", response.type_url))),
            );
        }

        let resources = match decode_resources::<R>(&response.resources) {
            Ok(resources) => resources,
            Err(e) => {
                tracing::warn!(err = %e, "discovery update failed to decode");
                self.stats.update_failure.inc();
                self.callbacks.on_config_update_failed(&e);
                return (response.nonce, Some(nack_status(e.to_string())));
            }
        };

        match self.callbacks.on_config_update(resources) {
            Ok(()) => {
                self.stats.update_success.inc();
                self.version_info = response.version_info;
                (response.nonce, None)
            }
            Err(rejection) => {
                tracing::warn!(reason = %rejection, "discovery update rejected");
                self.stats.update_rejected.inc();
                let error = SubscriptionError::Rejected(rejection.to_string());
                self.callbacks.on_config_update_failed(&error);
                (response.nonce, Some(nack_status(rejection.to_string())))
            }
        }
    }
}

fn nack_status(message: String) -> RpcStatus {
    RpcStatus {
        code: tonic::Code::InvalidArgument.into(),
        message,
    }
}

fn decode_resources<R: Resource>(payloads: &[Vec<u8>]) -> Result<Vec<R>, SubscriptionError> {
    let mut resources = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let resource: R = serde_json::from_slice(payload)
            .map_err(|e| SubscriptionError::Decode(e.to_string()))?;
        resources.push(resource);
    }
    Ok(resources)
}

#[cfg(test)]
mod test {
    use super::super::test_util::RecordingCallbacks;
    use super::*;
    use crate::stats::Store;
    use trellis_api::ClusterSpec;

    fn task(callbacks: RecordingCallbacks) -> StreamTask<ClusterSpec> {
        let store = Store::new();
        let stats = SubscriptionStats::new(&store.scope("cluster_manager.cds."));
        let (_names_tx, names_rx) = mpsc::unbounded_channel();
        StreamTask {
            endpoint: Endpoint::from_static("http://127.0.0.1:1"),
            node: "test-node".to_string(),
            stats,
            names: Vec::new(),
            names_rx,
            callbacks: Box::new(callbacks),
            version_info: String::new(),
            _marker: PhantomData,
        }
    }

    fn cluster_payload(name: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "name": name, "type": "static", "hosts": [{"url": "tcp://127.0.0.1:80"}],
        }))
        .unwrap()
    }

    #[test]
    fn test_ack_advances_version() {
        let callbacks = RecordingCallbacks::default();
        let mut task = task(callbacks.clone());

        let (nonce, error) = task.handle_response(DiscoveryResponse {
            version_info: "7".to_string(),
            resources: vec![cluster_payload("cluster_1")],
            type_url: ClusterSpec::TYPE_URL.to_string(),
            nonce: "n1".to_string(),
        });

        assert_eq!(nonce, "n1");
        assert!(error.is_none());
        assert_eq!(task.version_info, "7");
        assert_eq!(task.stats.update_success.value(), 1);
        assert_eq!(callbacks.update_count(), 1);
    }

    #[test]
    fn test_nack_keeps_last_accepted_version() {
        let callbacks = RecordingCallbacks::default();
        let mut task = task(callbacks.clone());

        // accept version 7 first
        let _ = task.handle_response(DiscoveryResponse {
            version_info: "7".to_string(),
            resources: vec![cluster_payload("cluster_1")],
            type_url: ClusterSpec::TYPE_URL.to_string(),
            nonce: "n1".to_string(),
        });

        // a garbage resource NACKs, echoing version 7
        let (nonce, error) = task.handle_response(DiscoveryResponse {
            version_info: "8".to_string(),
            resources: vec![b"not json".to_vec()],
            type_url: ClusterSpec::TYPE_URL.to_string(),
            nonce: "n2".to_string(),
        });

        assert_eq!(nonce, "n2");
        let error = error.unwrap();
        assert_eq!(error.code, i32::from(tonic::Code::InvalidArgument));
        assert_eq!(task.version_info, "7");
        assert_eq!(task.stats.update_failure.value(), 1);
        assert_eq!(callbacks.failure_count(), 1);
    }

    #[test]
    fn test_rejection_counts_rejected_not_failed() {
        let callbacks = RecordingCallbacks::default();
        *callbacks.reject_with.lock().unwrap() = Some("duplicate cluster".to_string());
        let mut task = task(callbacks.clone());

        let (_, error) = task.handle_response(DiscoveryResponse {
            version_info: "7".to_string(),
            resources: vec![cluster_payload("cluster_1")],
            type_url: ClusterSpec::TYPE_URL.to_string(),
            nonce: "n1".to_string(),
        });

        assert!(error.is_some());
        assert_eq!(task.version_info, "");
        assert_eq!(task.stats.update_rejected.value(), 1);
        assert_eq!(task.stats.update_failure.value(), 0);
    }

    #[test]
    fn test_unknown_type_url_nacks() {
        let callbacks = RecordingCallbacks::default();
        let mut task = task(callbacks.clone());

        let (_, error) = task.handle_response(DiscoveryResponse {
            version_info: "7".to_string(),
            resources: vec![],
            type_url: "made.up.type_url/Potato".to_string(),
            nonce: "n1".to_string(),
        });

        assert!(error.is_some());
        assert_eq!(callbacks.update_count(), 0);
    }
}
