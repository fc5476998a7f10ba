//! Discovery protocol messages.
//!
//! Field numbers follow the xDS `DiscoveryRequest` / `DiscoveryResponse`
//! layout so any xDS management server can speak to the client. Only the
//! fields the client reads or writes are declared; prost skips the rest.

use std::collections::HashMap;

use prost::Message;
use trustgate_authn::TrustIssuerConfig;

/// Type URL of the JWT issuer resource.
pub const JWT_ISSUER_TYPE_URL: &str = "type.googleapis.com/trustgate.discovery.JwtIssuer";

/// gRPC method streaming JWT issuers.
pub const STREAM_JWT_ISSUERS_PATH: &str =
    "/trustgate.discovery.TrustDiscoveryService/StreamJwtIssuers";

/// Identity of the requesting gateway.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Node {
    /// Unique node id.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Cluster (deployment label) the node belongs to.
    #[prost(string, tag = "2")]
    pub cluster: String,
}

/// Error detail carried by a NACK, shaped like `google.rpc.Status`.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct RpcStatus {
    /// gRPC status code.
    #[prost(int32, tag = "1")]
    pub code: i32,
    /// Human-readable message.
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Client → control plane.
#[derive(Clone, PartialEq, Message)]
pub struct DiscoveryRequest {
    /// Last successfully applied version, empty before the first ACK.
    #[prost(string, tag = "1")]
    pub version_info: String,
    /// Requesting node.
    #[prost(message, optional, tag = "2")]
    pub node: Option<Node>,
    /// Resources of interest; empty means all.
    #[prost(string, repeated, tag = "3")]
    pub resource_names: Vec<String>,
    /// Resource type.
    #[prost(string, tag = "4")]
    pub type_url: String,
    /// Nonce of the response being ACKed or NACKed, empty on the initial request.
    #[prost(string, tag = "5")]
    pub response_nonce: String,
    /// Present only on a NACK.
    #[prost(message, optional, tag = "6")]
    pub error_detail: Option<RpcStatus>,
}

impl DiscoveryRequest {
    /// Whether this request rejects the response it references.
    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }
}

/// Control plane → client.
#[derive(Clone, PartialEq, Message)]
pub struct DiscoveryResponse {
    /// Version of the resource set.
    #[prost(string, tag = "1")]
    pub version_info: String,
    /// The complete resource set.
    #[prost(message, repeated, tag = "2")]
    pub resources: Vec<prost_types::Any>,
    /// Resource type.
    #[prost(string, tag = "4")]
    pub type_url: String,
    /// Nonce to echo in the ACK or NACK.
    #[prost(string, tag = "5")]
    pub nonce: String,
}

/// Remote key-set reference.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct Jwks {
    /// Key-set URL.
    #[prost(string, tag = "1")]
    pub url: String,
    /// Extra CA certificate (PEM) for the key-set endpoint.
    #[prost(string, tag = "2")]
    pub tls: String,
}

/// Signing material of an issuer: an inline certificate, a key set, or both.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct IssuerCertificate {
    /// Inline certificate or public key (PEM).
    #[prost(string, tag = "1")]
    pub certificate: String,
    /// Remote key set.
    #[prost(message, optional, tag = "2")]
    pub jwks: Option<Jwks>,
}

/// One trusted JWT issuer.
#[derive(Clone, PartialEq, Message)]
pub struct JwtIssuer {
    /// Owning organization.
    #[prost(string, tag = "1")]
    pub organization: String,
    /// Expected `iss` value.
    #[prost(string, tag = "2")]
    pub issuer: String,
    /// Display name.
    #[prost(string, tag = "3")]
    pub name: String,
    /// Consumer key claim override.
    #[prost(string, tag = "4")]
    pub consumer_key_claim: String,
    /// Scopes claim override.
    #[prost(string, tag = "5")]
    pub scopes_claim: String,
    /// Signing material.
    #[prost(message, optional, tag = "6")]
    pub certificate: Option<IssuerCertificate>,
    /// Remote claim name → local claim name.
    #[prost(map = "string, string", tag = "7")]
    pub claim_mappings: HashMap<String, String>,
}

impl JwtIssuer {
    /// Pack into an `Any` with [`JWT_ISSUER_TYPE_URL`].
    pub fn to_any(&self) -> prost_types::Any {
        prost_types::Any { type_url: JWT_ISSUER_TYPE_URL.to_owned(), value: self.encode_to_vec() }
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

impl From<JwtIssuer> for TrustIssuerConfig {
    fn from(issuer: JwtIssuer) -> Self {
        let certificate = issuer.certificate.unwrap_or_default();
        let jwks = certificate.jwks.unwrap_or_default();
        TrustIssuerConfig {
            organization: issuer.organization,
            issuer: issuer.issuer,
            name: issuer.name,
            jwks_url: non_empty(jwks.url),
            jwks_ca_certificate: non_empty(jwks.tls),
            certificate: non_empty(certificate.certificate),
            consumer_key_claim: non_empty(issuer.consumer_key_claim),
            scopes_claim: non_empty(issuer.scopes_claim),
            claim_mappings: issuer.claim_mappings,
        }
    }
}
