//! Discovery stream transport.
//!
//! [`DiscoveryTransport`] opens one bidirectional stream: the client feeds
//! requests through an `mpsc` channel and reads responses from the returned
//! stream. [`GrpcTransport`] is the production implementation over a tonic
//! channel with optional mutual TLS.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    codec::ProstCodec,
    transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity},
};
use zeroize::Zeroizing;

use crate::{
    config::{SyncConfig, TlsConfig},
    error::{Result, SyncError},
    proto::{DiscoveryRequest, DiscoveryResponse, STREAM_JWT_ISSUERS_PATH},
};

/// Server-to-client half of a discovery stream.
pub type ResponseStream =
    Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, tonic::Status>> + Send>>;

/// Opens discovery streams to the control plane.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Open a stream fed by `requests`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Connect`] or [`SyncError::Status`] if the stream
    /// cannot be established.
    async fn open(&self, requests: mpsc::Receiver<DiscoveryRequest>) -> Result<ResponseStream>;
}

/// gRPC transport over a lazily connected tonic channel.
pub struct GrpcTransport {
    uri: String,
    channel: Channel,
    path: PathAndQuery,
}

impl GrpcTransport {
    /// Build the transport for `config`, loading TLS material from disk.
    ///
    /// No connection is made until the first [`open`](DiscoveryTransport::open).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] if the endpoint is malformed or a
    /// certificate file cannot be read.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let uri = config.endpoint_uri();
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| SyncError::InvalidConfig(format!("endpoint {uri}: {e}")))?
            .connect_timeout(config.connect_timeout);

        if let Some(tls) = &config.tls {
            let server_name = config.tls_server_name.as_deref().unwrap_or(&config.host);
            endpoint = endpoint
                .tls_config(client_tls(tls, server_name)?)
                .map_err(|e| SyncError::InvalidConfig(format!("TLS for {uri}: {e}")))?;
        }

        Ok(Self {
            channel: endpoint.connect_lazy(),
            uri,
            path: PathAndQuery::from_static(STREAM_JWT_ISSUERS_PATH),
        })
    }
}

fn read_pem(path: &std::path::Path) -> Result<Zeroizing<Vec<u8>>> {
    std::fs::read(path)
        .map(Zeroizing::new)
        .map_err(|e| SyncError::InvalidConfig(format!("reading {}: {e}", path.display())))
}

fn client_tls(tls: &TlsConfig, server_name: &str) -> Result<ClientTlsConfig> {
    let cert = read_pem(&tls.certificate_path)?;
    let key = read_pem(&tls.private_key_path)?;

    let mut config = ClientTlsConfig::new()
        .identity(Identity::from_pem(cert.as_slice(), key.as_slice()))
        .domain_name(server_name);
    if let Some(ca_path) = &tls.ca_certificate_path {
        let ca = read_pem(ca_path)?;
        config = config.ca_certificate(Certificate::from_pem(ca.as_slice()));
    }
    Ok(config)
}

#[async_trait]
impl DiscoveryTransport for GrpcTransport {
    #[tracing::instrument(skip(self, requests), fields(endpoint = %self.uri))]
    async fn open(&self, requests: mpsc::Receiver<DiscoveryRequest>) -> Result<ResponseStream> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| SyncError::connect(&self.uri, e))?;

        let codec = ProstCodec::<DiscoveryRequest, DiscoveryResponse>::default();
        let response = grpc
            .streaming(tonic::Request::new(ReceiverStream::new(requests)), self.path.clone(), codec)
            .await?;

        tracing::debug!("Discovery stream opened");
        Ok(Box::pin(response.into_inner()))
    }
}
