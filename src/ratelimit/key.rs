//! Bucket key generation and handling.

use serde::{Deserialize, Serialize};

/// Endpoint used when a key is built from a bare identifier.
pub const DEFAULT_ENDPOINT: &str = "default";

/// A key that uniquely identifies a token bucket.
///
/// The key is composed of the caller identity and the endpoint (or route)
/// the limit is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    /// Who is being limited (client id, API key, address)
    pub identifier: String,
    /// What is being limited
    pub endpoint: String,
}

impl BucketKey {
    /// Create a key scoped to a specific endpoint.
    pub fn new(identifier: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Convert the key to its `identifier:endpoint` string form.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.identifier, self.endpoint)
    }
}

impl From<&str> for BucketKey {
    fn from(identifier: &str) -> Self {
        Self::new(identifier, DEFAULT_ENDPOINT)
    }
}

impl From<String> for BucketKey {
    fn from(identifier: String) -> Self {
        Self::new(identifier, DEFAULT_ENDPOINT)
    }
}

impl From<&BucketKey> for BucketKey {
    fn from(key: &BucketKey) -> Self {
        key.clone()
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_from_identifier() {
        let key = BucketKey::from("client_a");

        assert_eq!(key.identifier, "client_a");
        assert_eq!(key.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_bucket_key_to_string() {
        let key = BucketKey::new("client_a", "search");
        assert_eq!(key.to_string_key(), "client_a:search");
        assert_eq!(key.to_string(), "client_a:search");
    }

    #[test]
    fn test_bucket_key_equality() {
        let key1 = BucketKey::new("client_a", "default");
        let key2 = BucketKey::from("client_a".to_string());
        let key3 = BucketKey::new("client_a", "upload");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }
}
