//! # Trustgate Trust Sync
//!
//! Keeps the trusted JWT issuers of `trustgate-authn` in step with a control
//! plane over an xDS-style discovery stream.
//!
//! This crate provides:
//! - **Discovery client**: a streaming state machine that applies each update
//!   all-or-nothing and ACKs or NACKs it
//! - **Issuer handler**: decodes JWT issuer resources and replaces the
//!   [`TrustStore`](trustgate_authn::TrustStore) copy-on-write
//! - **Reconnect scheduling**: fixed-delay retries, at most one per client,
//!   cancelled as soon as a stream is healthy
//! - **Transport**: gRPC over a lazily connected tonic channel with mutual TLS
//!
//! Control-plane outages never affect request validation: the last installed
//! issuers keep serving until a newer version is ACKed.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use trustgate_authn::{AuthConfig, Authenticator};
//! use trustgate_trust_sync::{DiscoveryClient, SyncConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let auth = Authenticator::with_http(AuthConfig::default())?;
//! let client = DiscoveryClient::jwt_issuers(
//!     &SyncConfig::from_env()?,
//!     Arc::clone(auth.trust_store()),
//!     Some(Arc::clone(auth.caches())),
//! )?;
//! client.start().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Discovery stream state machine.
pub mod client;
/// Discovery client configuration.
pub mod config;
/// Trust synchronization error types.
pub mod error;
/// Resource handlers.
pub mod handler;
/// Discovery stream metrics.
pub mod metrics;
/// Discovery protocol messages.
pub mod proto;
/// Reconnect scheduling.
pub mod scheduler;
/// Discovery stream transport.
pub mod transport;

/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use client::{ClientState, DiscoveryClient};
pub use config::{SyncConfig, TlsConfig};
pub use error::{Result, SyncError};
pub use handler::{JwtIssuerHandler, ResourceHandler};
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use proto::{DiscoveryRequest, DiscoveryResponse, JWT_ISSUER_TYPE_URL, JwtIssuer};
pub use scheduler::SyncScheduler;
pub use transport::{DiscoveryTransport, GrpcTransport};
