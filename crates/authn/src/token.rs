//! Bearer token parsing.
//!
//! [`SignedTokenHandle::parse`] splits a compact JWS into its three segments
//! and decodes header and payload without verifying anything. Parsing is the
//! only step that reports [`AuthError::Parse`]; a token that parses but
//! declares a bogus algorithm or carries a bad signature is an invalid
//! credential, decided later by the validator.

use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{AuthError, Result};

/// Upper bound on the compact token length accepted by the parser.
pub const MAX_TOKEN_LENGTH: usize = 64 * 1024;

/// Decoded JOSE header.
///
/// `alg` is kept as the raw string so that unknown or forbidden values reach
/// the algorithm check instead of failing deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenHeader {
    /// Declared signature algorithm.
    pub alg: String,
    /// Key identifier.
    #[serde(default)]
    pub kid: Option<String>,
    /// Media type, usually `JWT`.
    #[serde(default)]
    pub typ: Option<String>,
}

/// A parsed, unverified bearer token.
#[derive(Clone)]
pub struct SignedTokenHandle {
    header: TokenHeader,
    claims: Map<String, Value>,
    signing_input: String,
    signature: String,
    signature_bytes: Vec<u8>,
}

impl SignedTokenHandle {
    /// Parse a compact `header.payload.signature` token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Parse`] when the token does not have exactly three
    /// segments, a segment is not base64url, the header or payload is not a
    /// JSON object, or a registered claim has the wrong JSON type.
    pub fn parse(token: &str) -> Result<Self> {
        if token.len() > MAX_TOKEN_LENGTH {
            return Err(AuthError::parse(format!(
                "token length {} exceeds maximum {}",
                token.len(),
                MAX_TOKEN_LENGTH
            )));
        }

        let mut segments = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature), None) =
            (segments.next(), segments.next(), segments.next(), segments.next())
        else {
            return Err(AuthError::parse("expected three dot-separated segments"));
        };

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|e| AuthError::parse(format!("header is not base64url: {e}")))?;
        let header: TokenHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| AuthError::parse(format!("header is not valid JSON: {e}")))?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| AuthError::parse(format!("payload is not base64url: {e}")))?;
        let claims: Map<String, Value> = serde_json::from_slice(&payload_bytes)
            .map_err(|e| AuthError::parse(format!("payload is not a JSON object: {e}")))?;

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| AuthError::parse(format!("signature is not base64url: {e}")))?;

        let handle = Self {
            header,
            claims,
            signing_input: format!("{header_b64}.{payload_b64}"),
            signature: signature.to_owned(),
            signature_bytes,
        };
        handle.check_registered_claims()?;
        Ok(handle)
    }

    fn check_registered_claims(&self) -> Result<()> {
        for name in ["iss", "sub", "jti"] {
            if let Some(value) = self.claims.get(name) {
                if !value.is_string() {
                    return Err(AuthError::parse(format!("claim '{name}' must be a string")));
                }
            }
        }
        if let Some(exp) = self.claims.get("exp") {
            if numeric_date(exp).is_none() {
                return Err(AuthError::parse("claim 'exp' must be a numeric date"));
            }
        }
        Ok(())
    }

    /// Decoded header.
    pub fn header(&self) -> &TokenHeader {
        &self.header
    }

    /// Header `kid`, if present.
    pub fn key_id(&self) -> Option<&str> {
        self.header.kid.as_deref()
    }

    /// Header `alg` as declared.
    pub fn algorithm(&self) -> &str {
        &self.header.alg
    }

    /// All payload claims, untransformed.
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// `iss` claim.
    pub fn issuer(&self) -> Option<&str> {
        self.claims.get("iss").and_then(Value::as_str)
    }

    /// `sub` claim.
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(Value::as_str)
    }

    /// `exp` claim in epoch seconds.
    pub fn expiry(&self) -> Option<i64> {
        self.claims.get("exp").and_then(numeric_date)
    }

    /// Identifier used for revocation: `jti` when present, otherwise the
    /// encoded signature.
    pub fn token_identifier(&self) -> &str {
        self.claims.get("jti").and_then(Value::as_str).unwrap_or(&self.signature)
    }

    /// `header.payload`, the bytes the signature covers.
    pub fn signing_input(&self) -> &str {
        &self.signing_input
    }

    /// Base64url-encoded signature segment.
    pub fn encoded_signature(&self) -> &str {
        &self.signature
    }

    /// Raw signature bytes.
    pub fn signature_bytes(&self) -> &[u8] {
        &self.signature_bytes
    }
}

impl fmt::Debug for SignedTokenHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedTokenHandle")
            .field("alg", &self.header.alg)
            .field("kid", &self.header.kid)
            .field("iss", &self.issuer())
            .field("token_id", &fingerprint(self.token_identifier()))
            .finish_non_exhaustive()
    }
}

/// Interpret a JSON value as an RFC 7519 NumericDate, truncating fractions.
pub(crate) fn numeric_date(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

/// Short, non-reversible identifier for log lines. Never log token material.
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..6])
}
