//! API key validation.
//!
//! Keys are never stored in plain text: [`StaticApiKeys`] keeps SHA-256 hex
//! digests and hashes the presented key before lookup.

use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Resolves an API key into the claims of the principal it belongs to.
///
/// Returning `None` rejects the request.
pub trait ApiKeyValidator<C>: Send + Sync {
    fn validate(&self, key: &str) -> Option<C>;
}

impl<C, F> ApiKeyValidator<C> for F
where
    F: Fn(&str) -> Option<C> + Send + Sync,
{
    fn validate(&self, key: &str) -> Option<C> {
        self(key)
    }
}

/// Hash an API key for storage and lookup.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Generate a new API key of the form `gk_<prefix>_<secret>`.
///
/// Returns the key and its hash.
pub fn generate_api_key() -> (String, String) {
    let prefix = &Uuid::new_v4().simple().to_string()[..8];
    let secret = Uuid::new_v4().simple().to_string();
    let key = format!("gk_{}_{}", prefix, secret);
    let hash = hash_api_key(&key);
    (key, hash)
}

/// Fixed set of API keys, each mapped to a claims value.
#[derive(Clone)]
pub struct StaticApiKeys<C> {
    by_hash: HashMap<String, C>,
}

impl<C> StaticApiKeys<C> {
    pub fn new() -> Self {
        Self {
            by_hash: HashMap::new(),
        }
    }

    /// Register a plain key. Only its hash is kept.
    pub fn with_key(self, key: &str, claims: C) -> Self {
        self.with_hashed_key(hash_api_key(key), claims)
    }

    /// Register a key by its [`hash_api_key`] digest.
    pub fn with_hashed_key(mut self, hash: impl Into<String>, claims: C) -> Self {
        self.by_hash.insert(hash.into(), claims);
        self
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

impl<C> Default for StaticApiKeys<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for StaticApiKeys<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticApiKeys")
            .field("keys", &self.by_hash.len())
            .finish()
    }
}

impl<C: Clone + Send + Sync> ApiKeyValidator<C> for StaticApiKeys<C> {
    fn validate(&self, key: &str) -> Option<C> {
        self.by_hash.get(&hash_api_key(key)).cloned()
    }
}
