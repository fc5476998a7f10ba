//! Authentication error types.
//!
//! This module defines the errors that can occur while parsing bearer tokens,
//! resolving signing keys and fetching remote key sets.
//!
//! Only [`AuthError::Parse`] crosses the validation boundary as an `Err`. Every
//! other variant is folded into a negative [`ValidationResult`] by the
//! validator, using [`AuthError::validation_code`] to pick the result code.
//!
//! [`ValidationResult`]: crate::validator::ValidationResult

use thiserror::Error;

use crate::validator::ValidationCode;

/// A failed key-set fetch.
///
/// Cloneable so a single coalesced fetch failure can be handed to every
/// waiter of that fetch.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FetchError {
    message: String,
    transient: bool,
}

impl FetchError {
    /// A failure that is expected to clear up on retry (timeouts, refused
    /// connections, 5xx responses).
    pub fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), transient: true }
    }

    /// A failure that retrying will not fix (4xx responses, malformed documents).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), transient: false }
    }

    /// Whether a single bypass-cache retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Human-readable failure description.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Authentication errors.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`. New variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Malformed token structure. Not a security decision: the caller should
    /// answer with a client-request error rather than an authentication failure.
    #[error("Malformed token: {0}")]
    Parse(String),

    /// Signature verification failed or the credential is otherwise untrusted.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Token `exp` is in the past, clock skew included.
    #[error("Token expired")]
    TokenExpired,

    /// Header algorithm is forbidden or not in the accepted list.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// No key with this identifier in the issuer's key material.
    #[error("Signing key not found: {kid}")]
    KeyNotFound {
        /// Key ID that was not found.
        kid: String,
    },

    /// Key material exists but is of a type this engine does not verify with.
    #[error("Unsupported key type '{kty}' for key {kid}")]
    UnsupportedKeyType {
        /// Key ID of the offending key.
        kid: String,
        /// Key type as declared by the key set or certificate.
        kty: String,
    },

    /// Public key material could not be decoded.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Remote key set could not be fetched or parsed.
    #[error("Key set fetch from {endpoint} failed: {source}")]
    KeySetFetch {
        /// Key-set endpoint URL.
        endpoint: String,
        /// Underlying fetch failure.
        #[source]
        source: FetchError,
    },

    /// Configuration rejected by validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AuthError {
    /// Shorthand for [`AuthError::Parse`].
    pub fn parse(msg: impl Into<String>) -> Self {
        AuthError::Parse(msg.into())
    }

    /// Shorthand for [`AuthError::InvalidCredential`].
    pub fn invalid_credential(msg: impl Into<String>) -> Self {
        AuthError::InvalidCredential(msg.into())
    }

    /// Shorthand for [`AuthError::KeyNotFound`].
    pub fn key_not_found(kid: impl Into<String>) -> Self {
        AuthError::KeyNotFound { kid: kid.into() }
    }

    /// Shorthand for [`AuthError::KeySetFetch`].
    pub fn key_set_fetch(endpoint: impl Into<String>, source: FetchError) -> Self {
        AuthError::KeySetFetch { endpoint: endpoint.into(), source }
    }

    /// Whether this is a fetch failure worth one bypass-cache retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::KeySetFetch { source, .. } if source.is_transient())
    }

    /// Result code reported when this error ends a validation.
    ///
    /// Expiry has its own code so callers can give a more specific denial
    /// reason; everything else is an invalid credential.
    pub fn validation_code(&self) -> ValidationCode {
        match self {
            AuthError::TokenExpired => ValidationCode::TokenExpired,
            _ => ValidationCode::InvalidCredentials,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature => AuthError::invalid_credential("signature mismatch"),
            ErrorKind::InvalidAlgorithm => {
                AuthError::UnsupportedAlgorithm("algorithm does not match key".into())
            },
            ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::Base64(_) => AuthError::InvalidPublicKey(err.to_string()),
            _ => AuthError::invalid_credential(format!("JWT error: {}", err)),
        }
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;
