//! Remote key-set retrieval.
//!
//! [`KeySetFetcher`] is the seam between the key-set cache and the network.
//! [`HttpKeySetFetcher`] does a plain HTTPS GET; endpoints that carry their
//! own CA certificate get a dedicated client trusting that CA.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;

use crate::error::FetchError;

/// Default timeout for a single key-set fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A remote key-set endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JwksEndpoint {
    /// Key-set URL.
    pub url: String,
    /// PEM CA certificate to trust for this endpoint in addition to the system roots.
    pub ca_certificate: Option<String>,
}

impl JwksEndpoint {
    /// Endpoint trusting only the system roots.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ca_certificate: None }
    }

    /// Trust an extra CA certificate for this endpoint.
    #[must_use]
    pub fn with_ca_certificate(mut self, pem: impl Into<String>) -> Self {
        self.ca_certificate = Some(pem.into());
        self
    }
}

/// Fetches the raw JWKS document for an endpoint.
#[async_trait]
pub trait KeySetFetcher: Send + Sync {
    /// Fetch the document body.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] marked transient for failures worth one retry.
    async fn fetch(&self, endpoint: &JwksEndpoint) -> Result<String, FetchError>;
}

/// [`KeySetFetcher`] over HTTPS using `reqwest`.
pub struct HttpKeySetFetcher {
    client: reqwest::Client,
    timeout: Duration,
    ca_clients: DashMap<String, reqwest::Client>,
}

impl HttpKeySetFetcher {
    /// Create a fetcher with the given per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::permanent(format!("HTTP client: {e}")))?;
        Ok(Self { client, timeout, ca_clients: DashMap::new() })
    }

    fn client_for(&self, endpoint: &JwksEndpoint) -> Result<reqwest::Client, FetchError> {
        let Some(ca_pem) = endpoint.ca_certificate.as_deref() else {
            return Ok(self.client.clone());
        };
        if let Some(client) = self.ca_clients.get(ca_pem) {
            return Ok(client.clone());
        }

        let ca = reqwest::Certificate::from_pem(ca_pem.as_bytes())
            .map_err(|e| FetchError::permanent(format!("CA certificate: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .add_root_certificate(ca)
            .build()
            .map_err(|e| FetchError::permanent(format!("HTTP client: {e}")))?;
        self.ca_clients.insert(ca_pem.to_owned(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    #[tracing::instrument(skip(self, endpoint), fields(url = %endpoint.url))]
    async fn fetch(&self, endpoint: &JwksEndpoint) -> Result<String, FetchError> {
        let client = self.client_for(endpoint)?;

        let response = client.get(&endpoint.url).send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        response.text().await.map_err(classify_reqwest)
    }
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::transient(err.to_string())
    } else {
        FetchError::permanent(err.to_string())
    }
}

fn classify_status(status: StatusCode) -> FetchError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::transient(format!("HTTP {status}"))
    } else {
        FetchError::permanent(format!("HTTP {status}"))
    }
}
