//! JWT algorithm validation.
//!
//! Guards against algorithm substitution: the algorithm a token declares in
//! its header is only honoured when it is on the configured allow-list, and
//! symmetric algorithms or `none` are refused regardless of configuration.

use std::str::FromStr;

use jsonwebtoken::Algorithm;

use crate::error::AuthError;

/// Algorithms that are never accepted, whatever the configuration says.
///
/// - `none`: no signature at all
/// - `HS256`, `HS384`, `HS512`: a public key used as an HMAC secret is the classic confusion attack
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Algorithms accepted when the configuration does not narrow the list.
///
/// RSA (PKCS#1 v1.5 and PSS) and ECDSA over P-256 / P-384.
pub const DEFAULT_ACCEPTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Validate a header algorithm against the forbidden list and an allow-list.
///
/// # Errors
///
/// Returns [`AuthError::UnsupportedAlgorithm`] if the algorithm is forbidden,
/// unknown to the verifier, or not in `accepted`.
///
/// # Examples
///
/// ```
/// use trustgate_authn::validation::{DEFAULT_ACCEPTED_ALGORITHMS, validate_algorithm};
///
/// assert!(validate_algorithm("RS256", DEFAULT_ACCEPTED_ALGORITHMS).is_ok());
/// assert!(validate_algorithm("HS256", DEFAULT_ACCEPTED_ALGORITHMS).is_err());
/// assert!(validate_algorithm("none", DEFAULT_ACCEPTED_ALGORITHMS).is_err());
/// ```
pub fn validate_algorithm(alg: &str, accepted: &[Algorithm]) -> Result<Algorithm, AuthError> {
    if FORBIDDEN_ALGORITHMS.iter().any(|f| f.eq_ignore_ascii_case(alg)) {
        return Err(AuthError::UnsupportedAlgorithm(format!(
            "Algorithm '{}' is not allowed for security reasons",
            alg
        )));
    }

    let parsed = Algorithm::from_str(alg)
        .map_err(|_| AuthError::UnsupportedAlgorithm(format!("Unknown algorithm '{}'", alg)))?;

    if !accepted.contains(&parsed) {
        return Err(AuthError::UnsupportedAlgorithm(format!(
            "Algorithm '{}' is not in accepted list",
            alg
        )));
    }

    Ok(parsed)
}

/// Parse a list of algorithm names, refusing forbidden ones.
///
/// Used when loading configuration so a misconfigured allow-list fails at
/// startup rather than on the first request.
pub fn parse_algorithms<S: AsRef<str>>(names: &[S]) -> Result<Vec<Algorithm>, AuthError> {
    names
        .iter()
        .map(|name| {
            let name = name.as_ref();
            if FORBIDDEN_ALGORITHMS.iter().any(|f| f.eq_ignore_ascii_case(name)) {
                return Err(AuthError::InvalidConfig(format!(
                    "algorithm '{}' cannot be accepted",
                    name
                )));
            }
            Algorithm::from_str(name)
                .map_err(|_| AuthError::InvalidConfig(format!("unknown algorithm '{}'", name)))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("RS256", Algorithm::RS256)]
    #[case("PS384", Algorithm::PS384)]
    #[case("ES256", Algorithm::ES256)]
    #[case("ES384", Algorithm::ES384)]
    fn test_default_list_accepts_asymmetric(#[case] name: &str, #[case] expected: Algorithm) {
        assert_eq!(validate_algorithm(name, DEFAULT_ACCEPTED_ALGORITHMS).unwrap(), expected);
    }

    #[rstest]
    #[case("none")]
    #[case("NONE")]
    #[case("HS256")]
    #[case("HS384")]
    #[case("HS512")]
    fn test_forbidden_always_rejected(#[case] name: &str) {
        let all = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512, Algorithm::RS256];
        let result = validate_algorithm(name, &all);
        assert!(matches!(
            result,
            Err(AuthError::UnsupportedAlgorithm(ref msg)) if msg.contains("security reasons")
        ));
    }

    #[test]
    fn test_narrowed_allow_list() {
        let only_es = [Algorithm::ES256];
        assert!(validate_algorithm("ES256", &only_es).is_ok());
        let result = validate_algorithm("RS256", &only_es);
        assert!(matches!(
            result,
            Err(AuthError::UnsupportedAlgorithm(ref msg)) if msg.contains("not in accepted list")
        ));
    }

    #[test]
    fn test_unknown_algorithm() {
        assert!(matches!(
            validate_algorithm("XY999", DEFAULT_ACCEPTED_ALGORITHMS),
            Err(AuthError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_parse_algorithms() {
        assert_eq!(
            parse_algorithms(&["RS256", "ES256"]).unwrap(),
            vec![Algorithm::RS256, Algorithm::ES256]
        );
        assert!(matches!(parse_algorithms(&["HS256"]), Err(AuthError::InvalidConfig(_))));
        assert!(matches!(parse_algorithms(&["bogus"]), Err(AuthError::InvalidConfig(_))));
    }
}
