//! Discovery client: one long-lived stream to the control plane.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──stream open──▶ Streaming
//!      ▲                        │                           │
//!      └──────── Error ◀────────┴──── failure / close ──────┘
//!
//! any state ──shutdown──▶ Shutdown (terminal)
//! ```
//!
//! Every response is applied through a [`ResourceHandler`]. The acknowledged
//! version advances only once an apply succeeds, and the response is then
//! ACKed with its version and nonce. A failed apply is NACKed with the
//! previously acknowledged version, the received nonce and the error, and
//! the stream stays open for the next update.
//!
//! Connection failures are never fatal: the client hands itself to the
//! [`SyncScheduler`], which retries at a fixed delay until a stream is
//! healthy again.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use trustgate_authn::{CacheRegistry, TrustStore};

use crate::{
    config::SyncConfig,
    error::{Result, SyncError},
    handler::{JwtIssuerHandler, ResourceHandler},
    metrics::SyncMetrics,
    proto::{DiscoveryRequest, DiscoveryResponse, Node, RpcStatus},
    scheduler::SyncScheduler,
    transport::{DiscoveryTransport, GrpcTransport, ResponseStream},
};

/// Interval at which teardown checks whether the old stream task finished.
pub const TEARDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

const REQUEST_BUFFER: usize = 16;

/// Connection state of a [`DiscoveryClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No stream; a reconnect may be scheduled.
    Disconnected,
    /// Opening a stream.
    Connecting,
    /// Stream open and receiving updates.
    Streaming,
    /// The stream just failed; transient on the way to `Disconnected`.
    Error,
    /// Shut down; no further connects.
    Shutdown,
}

#[derive(Debug, Default)]
struct StreamState {
    /// Version and nonce of the last response received.
    latest_received: Option<(String, String)>,
    /// Version of the last response ACKed, empty before the first ACK.
    latest_acked_version: String,
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Streaming discovery client with ACK/NACK bookkeeping.
pub struct DiscoveryClient {
    name: String,
    node: Node,
    transport: Arc<dyn DiscoveryTransport>,
    handler: Arc<dyn ResourceHandler>,
    scheduler: Arc<SyncScheduler>,
    metrics: Arc<SyncMetrics>,
    teardown_timeout: Duration,
    state: RwLock<ClientState>,
    stream: Mutex<StreamState>,
    session: Mutex<Option<Session>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl DiscoveryClient {
    /// Client for the resources of `handler`, identified by the node in `config`.
    pub fn new(
        config: &SyncConfig,
        transport: Arc<dyn DiscoveryTransport>,
        handler: Arc<dyn ResourceHandler>,
        scheduler: Arc<SyncScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: format!("{}:{}", config.node_id, handler.type_url()),
            node: Node { id: config.node_id.clone(), cluster: config.cluster.clone() },
            transport,
            handler,
            scheduler,
            metrics: Arc::new(SyncMetrics::new()),
            teardown_timeout: config.teardown_timeout,
            state: RwLock::new(ClientState::Disconnected),
            stream: Mutex::new(StreamState::default()),
            session: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// JWT issuer client over gRPC, installing into `trust`.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] if `config` fails validation or
    /// its TLS material cannot be loaded.
    pub fn jwt_issuers(
        config: &SyncConfig,
        trust: Arc<TrustStore>,
        caches: Option<Arc<CacheRegistry>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let transport = GrpcTransport::from_config(config)?;
        let mut handler = JwtIssuerHandler::new(trust);
        if let Some(caches) = caches {
            handler = handler.with_cache_registry(caches);
        }
        let scheduler = Arc::new(SyncScheduler::from_config(config));
        Ok(Self::new(config, Arc::new(transport), Arc::new(handler), scheduler))
    }

    /// Name the scheduler tracks this client under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    /// Version of the last ACKed response, empty before the first ACK.
    pub fn latest_acked_version(&self) -> String {
        self.stream.lock().latest_acked_version.clone()
    }

    /// Version of the last response received, ACKed or not.
    pub fn latest_received_version(&self) -> Option<String> {
        self.stream.lock().latest_received.as_ref().map(|(version, _)| version.clone())
    }

    /// Stream counters.
    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Scheduler driving this client's reconnects.
    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    /// Connect now, falling back to scheduled retries on failure.
    pub async fn start(self: &Arc<Self>) {
        if let Err(e) = self.connect().await {
            tracing::warn!(client = %self.name, error = %e, "Initial discovery connect failed");
        }
    }

    /// Open a new stream, replacing any previous one.
    ///
    /// A client that is already streaming only cancels its pending retries.
    /// On failure the client returns to [`ClientState::Disconnected`] and
    /// reconnects are scheduled.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Shutdown`] after [`shutdown`](Self::shutdown)
    /// - [`SyncError::Connect`] or [`SyncError::Status`] if the stream cannot be opened
    #[tracing::instrument(skip(self), fields(client = %self.name))]
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _serialized = self.connect_lock.lock().await;

        match self.state() {
            ClientState::Shutdown => return Err(SyncError::Shutdown),
            ClientState::Streaming => {
                self.scheduler.stop_scheduling(&self.name);
                return Ok(());
            },
            _ => {},
        }

        self.transition(ClientState::Connecting);
        self.metrics.record_connect_attempt();
        self.teardown().await;

        let (requests, rx) = mpsc::channel(REQUEST_BUFFER);
        let initial = self.request(self.latest_acked_version(), String::new(), None);
        // The receiver is alive, so the first send into the empty buffer cannot fail.
        let _ = requests.try_send(initial);

        let stream = match self.transport.open(rx).await {
            Ok(stream) => stream,
            Err(e) => {
                self.metrics.record_connect_failure();
                if self.transition(ClientState::Error) {
                    self.transition(ClientState::Disconnected);
                    self.scheduler.start_scheduling(self);
                }
                return Err(e);
            },
        };

        if !self.transition(ClientState::Streaming) {
            return Err(SyncError::Shutdown);
        }
        self.scheduler.stop_scheduling(&self.name);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run_stream(stream, requests, cancel.clone()));
        *self.session.lock() = Some(Session { cancel, handle });

        tracing::info!(
            version = %self.latest_acked_version(),
            "Discovery stream established"
        );
        Ok(())
    }

    /// Stop streaming and cancel scheduled reconnects. Terminal.
    pub async fn shutdown(&self) {
        *self.state.write() = ClientState::Shutdown;
        self.scheduler.stop_scheduling(&self.name);
        self.teardown().await;
        tracing::info!(client = %self.name, "Discovery client shut down");
    }

    /// Move to `next` unless shut down. Returns whether the move happened.
    fn transition(&self, next: ClientState) -> bool {
        let mut state = self.state.write();
        if *state == ClientState::Shutdown {
            return false;
        }
        tracing::debug!(client = %self.name, from = ?*state, to = ?next, "Client state change");
        *state = next;
        true
    }

    /// Cancel the current stream task and wait, bounded, for it to finish.
    async fn teardown(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        session.cancel.cancel();

        let deadline = Instant::now() + self.teardown_timeout;
        while !session.handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    client = %self.name,
                    timeout = %humantime::format_duration(self.teardown_timeout),
                    "Previous discovery stream did not stop in time; aborting it"
                );
                session.handle.abort();
                return;
            }
            tokio::time::sleep(TEARDOWN_POLL_INTERVAL).await;
        }
    }

    fn request(
        &self,
        version_info: String,
        response_nonce: String,
        error_detail: Option<RpcStatus>,
    ) -> DiscoveryRequest {
        DiscoveryRequest {
            version_info,
            node: Some(self.node.clone()),
            resource_names: Vec::new(),
            type_url: self.handler.type_url().to_owned(),
            response_nonce,
            error_detail,
        }
    }

    async fn run_stream(
        self: Arc<Self>,
        mut stream: ResponseStream,
        requests: mpsc::Sender<DiscoveryRequest>,
        cancel: CancellationToken,
    ) {
        let failure = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(response)) => {
                    if let Err(e) = self.handle_response(response, &requests).await {
                        break e;
                    }
                },
                Some(Err(status)) => break SyncError::Status(status),
                None => break SyncError::StreamClosed,
            }
        };

        if cancel.is_cancelled() {
            return;
        }
        tracing::warn!(client = %self.name, error = %failure, "Discovery stream failed");
        self.metrics.record_stream_failure();
        if self.transition(ClientState::Error) {
            self.transition(ClientState::Disconnected);
            self.scheduler.start_scheduling(&self);
        }
    }

    /// Apply one response and answer it. Errors end the stream.
    async fn handle_response(
        &self,
        response: DiscoveryResponse,
        requests: &mpsc::Sender<DiscoveryRequest>,
    ) -> Result<()> {
        self.metrics.record_response();
        self.scheduler.stop_scheduling(&self.name);

        let DiscoveryResponse { version_info: version, resources, type_url, nonce } = response;
        tracing::debug!(
            client = %self.name,
            %version,
            %nonce,
            resources = resources.len(),
            "Received discovery response"
        );
        self.stream.lock().latest_received = Some((version.clone(), nonce.clone()));

        let applied = if type_url == self.handler.type_url() {
            self.handler.apply(&version, &resources)
        } else {
            Err(SyncError::invalid_resource(format!(
                "response type {type_url}, expected {}",
                self.handler.type_url()
            )))
        };

        match applied {
            Ok(installed) => {
                self.stream.lock().latest_acked_version = version.clone();
                self.metrics.record_ack(installed);
                tracing::info!(client = %self.name, %version, %nonce, installed, "ACKing update");
                let ack = self.request(version, nonce, None);
                requests.send(ack).await.map_err(|_| SyncError::StreamClosed)?;
            },
            Err(e) => {
                let previous = self.latest_acked_version();
                tracing::warn!(
                    client = %self.name,
                    %version,
                    %nonce,
                    acked = %previous,
                    error = %e,
                    "Rejecting update"
                );
                let detail = RpcStatus { code: e.nack_code(), message: e.to_string() };
                self.metrics.record_nack();
                let nack = self.request(previous, nonce, Some(detail));
                requests.send(nack).await.map_err(|_| SyncError::StreamClosed)?;
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use trustgate_authn::testutil::TEST_ISSUER;

    use super::*;
    use crate::testutil::{ChannelTransport, issuer_response, jwks_issuer};

    fn client_with(transport: Arc<ChannelTransport>) -> (Arc<DiscoveryClient>, Arc<TrustStore>) {
        let trust = Arc::new(TrustStore::new());
        let config = SyncConfig::builder().node_id("gw-1").cluster("edge").build();
        let scheduler = Arc::new(SyncScheduler::from_config(&config));
        let handler = Arc::new(JwtIssuerHandler::new(Arc::clone(&trust)));
        (DiscoveryClient::new(&config, transport, handler, scheduler), trust)
    }

    #[tokio::test]
    async fn test_initial_request_carries_node_and_empty_version() {
        let transport = Arc::new(ChannelTransport::new());
        let (client, _) = client_with(Arc::clone(&transport));

        client.connect().await.unwrap();
        let mut session = transport.accept().await;
        let initial = session.recv().await;

        assert_eq!(client.state(), ClientState::Streaming);
        assert_eq!(initial.version_info, "");
        assert_eq!(initial.response_nonce, "");
        assert_eq!(initial.node, Some(Node { id: "gw-1".into(), cluster: "edge".into() }));
        assert!(!initial.is_nack());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_ack_advances_version() {
        let transport = Arc::new(ChannelTransport::new());
        let (client, trust) = client_with(Arc::clone(&transport));
        client.connect().await.unwrap();
        let mut session = transport.accept().await;
        session.recv().await;

        session.respond(issuer_response("v1", "n1", &[jwks_issuer("acme", TEST_ISSUER)])).await;
        let ack = session.recv().await;

        assert_eq!(ack.version_info, "v1");
        assert_eq!(ack.response_nonce, "n1");
        assert!(!ack.is_nack());
        assert_eq!(client.latest_acked_version(), "v1");
        assert!(trust.resolve("acme", TEST_ISSUER).is_some());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_response_type_is_nacked() {
        let transport = Arc::new(ChannelTransport::new());
        let (client, _) = client_with(Arc::clone(&transport));
        client.connect().await.unwrap();
        let mut session = transport.accept().await;
        session.recv().await;

        let mut response = issuer_response("v1", "n1", &[]);
        response.type_url = "type.googleapis.com/Other".into();
        session.respond(response).await;
        let nack = session.recv().await;

        assert!(nack.is_nack());
        assert_eq!(nack.version_info, "");
        assert_eq!(nack.error_detail.unwrap().code, tonic::Code::InvalidArgument as i32);
        assert_eq!(client.latest_received_version().as_deref(), Some("v1"));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_after_shutdown_is_refused() {
        let transport = Arc::new(ChannelTransport::new());
        let (client, _) = client_with(Arc::clone(&transport));
        client.shutdown().await;

        assert!(matches!(client.connect().await, Err(SyncError::Shutdown)));
        assert_eq!(client.state(), ClientState::Shutdown);
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test]
    async fn test_connect_while_streaming_keeps_stream() {
        let transport = Arc::new(ChannelTransport::new());
        let (client, _) = client_with(Arc::clone(&transport));
        client.connect().await.unwrap();
        client.connect().await.unwrap();

        assert_eq!(transport.opens(), 1);
        assert_eq!(client.metrics().snapshot().connect_attempts, 1);
        client.shutdown().await;
    }
}
