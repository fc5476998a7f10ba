//! Shared test utilities for the discovery client.
//!
//! [`ChannelTransport`] is an in-memory [`DiscoveryTransport`]: every
//! [`open`](DiscoveryTransport::open) hands the test a [`ServerSession`]
//! playing the control plane. Feature-gated behind `testutil`.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    error::{Result, SyncError},
    proto::{
        DiscoveryRequest, DiscoveryResponse, IssuerCertificate, JWT_ISSUER_TYPE_URL, Jwks, JwtIssuer,
    },
    transport::{DiscoveryTransport, ResponseStream},
};

/// How long session helpers wait before panicking.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Issuer resource with a key-set URL under `iss`.
pub fn jwks_issuer(org: &str, iss: &str) -> JwtIssuer {
    JwtIssuer {
        organization: org.to_owned(),
        issuer: iss.to_owned(),
        name: format!("{org} idp"),
        certificate: Some(IssuerCertificate {
            certificate: String::new(),
            jwks: Some(Jwks { url: format!("{iss}/.well-known/jwks.json"), tls: String::new() }),
        }),
        ..Default::default()
    }
}

/// Issuer resource with an inline PEM certificate.
pub fn pem_issuer(org: &str, iss: &str, pem: &str) -> JwtIssuer {
    JwtIssuer {
        organization: org.to_owned(),
        issuer: iss.to_owned(),
        certificate: Some(IssuerCertificate { certificate: pem.to_owned(), jwks: None }),
        ..Default::default()
    }
}

/// Response carrying `issuers` as version `version` with `nonce`.
pub fn issuer_response(version: &str, nonce: &str, issuers: &[JwtIssuer]) -> DiscoveryResponse {
    DiscoveryResponse {
        version_info: version.to_owned(),
        resources: issuers.iter().map(JwtIssuer::to_any).collect(),
        type_url: JWT_ISSUER_TYPE_URL.to_owned(),
        nonce: nonce.to_owned(),
    }
}

/// Control-plane side of one in-memory stream.
pub struct ServerSession {
    requests: mpsc::Receiver<DiscoveryRequest>,
    responses: mpsc::Sender<std::result::Result<DiscoveryResponse, tonic::Status>>,
}

impl ServerSession {
    /// Next request from the client.
    ///
    /// # Panics
    ///
    /// Panics if none arrives within [`SESSION_TIMEOUT`] or the client hung up.
    pub async fn recv(&mut self) -> DiscoveryRequest {
        tokio::time::timeout(SESSION_TIMEOUT, self.requests.recv())
            .await
            .expect("timed out waiting for a discovery request")
            .expect("client closed the request stream")
    }

    /// Send a response to the client.
    ///
    /// # Panics
    ///
    /// Panics if the client dropped the stream.
    pub async fn respond(&self, response: DiscoveryResponse) {
        self.responses.send(Ok(response)).await.expect("client dropped the stream");
    }

    /// Fail the stream with `status`.
    pub async fn fail(&self, status: tonic::Status) {
        let _ = self.responses.send(Err(status)).await;
    }
}

/// In-memory [`DiscoveryTransport`].
pub struct ChannelTransport {
    sessions_tx: mpsc::UnboundedSender<ServerSession>,
    sessions_rx: Mutex<mpsc::UnboundedReceiver<ServerSession>>,
    refuse: AtomicUsize,
    opens: AtomicUsize,
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport {
    /// Transport accepting every open.
    pub fn new() -> Self {
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        Self {
            sessions_tx,
            sessions_rx: Mutex::new(sessions_rx),
            refuse: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        }
    }

    /// Refuse the next `count` opens with a connect error.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Number of open attempts, refused ones included.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Wait for the client to open the next stream.
    ///
    /// # Panics
    ///
    /// Panics if no stream is opened within [`SESSION_TIMEOUT`].
    pub async fn accept(&self) -> ServerSession {
        let mut sessions = self.sessions_rx.lock().await;
        tokio::time::timeout(SESSION_TIMEOUT, sessions.recv())
            .await
            .expect("timed out waiting for the client to connect")
            .expect("transport dropped")
    }
}

#[async_trait]
impl DiscoveryTransport for ChannelTransport {
    async fn open(&self, requests: mpsc::Receiver<DiscoveryRequest>) -> Result<ResponseStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncError::connect("memory://control-plane", "connection refused"));
        }

        let (responses, rx) = mpsc::channel(16);
        self.sessions_tx
            .send(ServerSession { requests, responses })
            .map_err(|_| SyncError::connect("memory://control-plane", "test harness gone"))?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
