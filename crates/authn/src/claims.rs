//! Issuer-specific claim handling.
//!
//! Each trusted issuer may rename remote claims to the names the gateway
//! expects locally, and may keep its scopes and consumer key under
//! non-standard claim names. The transformer is resolved once when the issuer
//! is loaded, so the hot path is a match on a small enum.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Claim holding scopes when the issuer does not override it.
pub const DEFAULT_SCOPES_CLAIM: &str = "scope";

/// Claim holding the consumer key when the issuer does not override it.
pub const DEFAULT_CONSUMER_KEY_CLAIM: &str = "azp";

/// Claim consulted when the consumer key claim is absent.
const FALLBACK_CONSUMER_KEY_CLAIM: &str = "client_id";

/// Claim-name remapping strategy for one issuer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClaimTransformer {
    /// Claims pass through unchanged.
    #[default]
    Identity,
    /// Remote claim names are renamed to local ones; unmapped claims pass through.
    Mapped(HashMap<String, String>),
}

impl ClaimTransformer {
    /// Build a transformer from a remote-to-local mapping, collapsing an empty
    /// mapping to [`ClaimTransformer::Identity`].
    pub fn from_mappings(mappings: HashMap<String, String>) -> Self {
        if mappings.is_empty() {
            ClaimTransformer::Identity
        } else {
            ClaimTransformer::Mapped(mappings)
        }
    }

    /// Apply the transformation, producing the claim map stored in the result.
    ///
    /// A mapped claim replaces any claim already present under the local name.
    pub fn transform(&self, claims: &Map<String, Value>) -> Map<String, Value> {
        match self {
            ClaimTransformer::Identity => claims.clone(),
            ClaimTransformer::Mapped(mappings) => {
                let mut out = Map::with_capacity(claims.len());
                for (name, value) in claims {
                    if !mappings.contains_key(name) {
                        out.insert(name.clone(), value.clone());
                    }
                }
                for (remote, local) in mappings {
                    if let Some(value) = claims.get(remote) {
                        out.insert(local.clone(), value.clone());
                    }
                }
                out
            },
        }
    }
}

/// Where an issuer keeps scopes and the consumer key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimNames {
    /// Claim holding scopes.
    pub scopes: String,
    /// Claim holding the consumer key or client id.
    pub consumer_key: String,
}

impl Default for ClaimNames {
    fn default() -> Self {
        Self {
            scopes: DEFAULT_SCOPES_CLAIM.to_owned(),
            consumer_key: DEFAULT_CONSUMER_KEY_CLAIM.to_owned(),
        }
    }
}

impl ClaimNames {
    /// Scopes from the configured claim. Accepts a JSON array of strings or a
    /// single string delimited by whitespace or commas.
    pub fn scopes(&self, claims: &Map<String, Value>) -> Vec<String> {
        claims.get(&self.scopes).map(scopes_from_value).unwrap_or_default()
    }

    /// Consumer key from the configured claim, falling back to `client_id`.
    pub fn consumer_key(&self, claims: &Map<String, Value>) -> Option<String> {
        claims
            .get(&self.consumer_key)
            .or_else(|| claims.get(FALLBACK_CONSUMER_KEY_CLAIM))
            .and_then(Value::as_str)
            .map(str::to_owned)
    }
}

fn scopes_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => split_scopes(s),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .flat_map(split_scopes)
            .collect(),
        _ => Vec::new(),
    }
}

/// Split a delimited scope string on whitespace and commas, dropping empties.
pub fn split_scopes(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
