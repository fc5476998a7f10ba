//! Discovery client configuration.
//!
//! # Environment
//!
//! [`SyncConfig::from_env`] reads:
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `TRUSTGATE_XDS_HOST` | `host` | `localhost` |
//! | `TRUSTGATE_XDS_PORT` | `port` | `18000` |
//! | `TRUSTGATE_XDS_HOST_NAME` | `tls_server_name` | unset |
//! | `TRUSTGATE_XDS_RETRY_PERIOD` | `retry_period` | `5s` |
//! | `TRUSTGATE_NODE_ID` | `node_id` | `trustgate-enforcer` |
//! | `TRUSTGATE_NODE_CLUSTER` | `cluster` | `trustgate` |
//! | `TRUSTGATE_PUBLIC_CERT_PATH` | `tls.certificate_path` | unset |
//! | `TRUSTGATE_PRIVATE_KEY_PATH` | `tls.private_key_path` | unset |
//! | `TRUSTGATE_TRUSTED_CA_CERTS_PATH` | `tls.ca_certificate_path` | unset |
//!
//! The retry period accepts a humantime string (`"10s"`) or plain seconds.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Default control-plane host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default control-plane xDS port.
pub const DEFAULT_PORT: u16 = 18000;

/// Delay before the first scheduled reconnect.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Delay between scheduled reconnects.
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);

/// Default timeout for establishing the channel.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for a torn-down stream to finish.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default node id.
pub const DEFAULT_NODE_ID: &str = "trustgate-enforcer";

/// Default node cluster.
pub const DEFAULT_CLUSTER: &str = "trustgate";

/// Mutual-TLS material for the control-plane channel.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Client certificate chain (PEM).
    #[builder(into)]
    pub certificate_path: PathBuf,

    /// Client private key (PEM).
    #[builder(into)]
    pub private_key_path: PathBuf,

    /// CA bundle trusted for the control plane (PEM). System roots when unset.
    #[serde(default)]
    #[builder(into)]
    pub ca_certificate_path: Option<PathBuf>,
}

/// Configuration for one discovery client and its retry schedule.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Control-plane host.
    #[serde(default = "default_host")]
    #[builder(into, default = DEFAULT_HOST.to_owned())]
    pub host: String,

    /// Control-plane port.
    #[serde(default = "default_port")]
    #[builder(default = DEFAULT_PORT)]
    pub port: u16,

    /// Server name verified against the control-plane certificate; `host` when unset.
    #[serde(default)]
    #[builder(into)]
    pub tls_server_name: Option<String>,

    /// Mutual TLS; plaintext when unset.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Node id reported in every request.
    #[serde(default = "default_node_id")]
    #[builder(into, default = DEFAULT_NODE_ID.to_owned())]
    pub node_id: String,

    /// Node cluster reported in every request.
    #[serde(default = "default_cluster")]
    #[builder(into, default = DEFAULT_CLUSTER.to_owned())]
    pub cluster: String,

    /// Delay before the first scheduled reconnect.
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    #[builder(default = DEFAULT_INITIAL_DELAY)]
    pub initial_delay: Duration,

    /// Fixed delay between scheduled reconnects.
    #[serde(with = "humantime_serde", default = "default_retry_period")]
    #[builder(default = DEFAULT_RETRY_PERIOD)]
    pub retry_period: Duration,

    /// Timeout for establishing the channel.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,

    /// Upper bound on waiting for a torn-down stream to finish.
    #[serde(with = "humantime_serde", default = "default_teardown_timeout")]
    #[builder(default = DEFAULT_TEARDOWN_TIMEOUT)]
    pub teardown_timeout: Duration,
}

fn default_host() -> String {
    DEFAULT_HOST.to_owned()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_node_id() -> String {
    DEFAULT_NODE_ID.to_owned()
}

fn default_cluster() -> String {
    DEFAULT_CLUSTER.to_owned()
}

fn default_initial_delay() -> Duration {
    DEFAULT_INITIAL_DELAY
}

fn default_retry_period() -> Duration {
    DEFAULT_RETRY_PERIOD
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_teardown_timeout() -> Duration {
    DEFAULT_TEARDOWN_TIMEOUT
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SyncConfig {
    /// Configuration from `TRUSTGATE_*` environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] for an unparseable port or retry
    /// period, or when only one of the certificate and key paths is set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(host) = var("TRUSTGATE_XDS_HOST") {
            config.host = host;
        }
        if let Some(port) = var("TRUSTGATE_XDS_PORT") {
            config.port = port.trim().parse().map_err(|e| {
                SyncError::InvalidConfig(format!("TRUSTGATE_XDS_PORT '{port}': {e}"))
            })?;
        }
        config.tls_server_name = var("TRUSTGATE_XDS_HOST_NAME");
        if let Some(period) = var("TRUSTGATE_XDS_RETRY_PERIOD") {
            config.retry_period = parse_period(&period)?;
        }
        if let Some(id) = var("TRUSTGATE_NODE_ID") {
            config.node_id = id;
        }
        if let Some(cluster) = var("TRUSTGATE_NODE_CLUSTER") {
            config.cluster = cluster;
        }

        config.tls = match (var("TRUSTGATE_PUBLIC_CERT_PATH"), var("TRUSTGATE_PRIVATE_KEY_PATH")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                certificate_path: cert.into(),
                private_key_path: key.into(),
                ca_certificate_path: var("TRUSTGATE_TRUSTED_CA_CERTS_PATH").map(PathBuf::from),
            }),
            (None, None) => None,
            _ => {
                return Err(SyncError::InvalidConfig(
                    "TRUSTGATE_PUBLIC_CERT_PATH and TRUSTGATE_PRIVATE_KEY_PATH must be set together"
                        .into(),
                ));
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check bounds.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(SyncError::InvalidConfig("host is empty".into()));
        }
        if self.port == 0 {
            return Err(SyncError::InvalidConfig("port must be positive".into()));
        }
        if self.retry_period.is_zero() {
            return Err(SyncError::InvalidConfig("retry_period must be positive".into()));
        }
        if self.teardown_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(SyncError::InvalidConfig("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Control-plane URI, `https` when TLS is configured.
    pub fn endpoint_uri(&self) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

fn parse_period(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(raw)
        .map_err(|e| SyncError::InvalidConfig(format!("TRUSTGATE_XDS_RETRY_PERIOD '{raw}': {e}")))
}
