//! Token verification seam.
//!
//! Authentication is owned by an external service; the delivery core only
//! needs "bearer token -> user id". The concrete verifier is injected at
//! construction so tests and deployments can swap implementations.

/// Maps a bearer token to an authenticated user id.
pub trait TokenVerifier: Send + Sync + 'static {
    /// Returns the user id the token authenticates, or `None` when the
    /// token is invalid or expired.
    fn verify(&self, token: &str) -> Option<i64>;
}

/// Development verifier: the token *is* the user id in decimal.
///
/// Stands in for the external auth service's opaque-token introspection;
/// production wires a real verifier through the same trait.
pub struct PlainIdVerifier;

impl TokenVerifier for PlainIdVerifier {
    fn verify(&self, token: &str) -> Option<i64> {
        token.parse::<i64>().ok().filter(|id| *id > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_verifier_accepts_positive_ids_only() {
        let v = PlainIdVerifier;
        assert_eq!(v.verify("42"), Some(42));
        assert_eq!(v.verify("0"), None);
        assert_eq!(v.verify("-3"), None);
        assert_eq!(v.verify("not-a-token"), None);
    }
}
