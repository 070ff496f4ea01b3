//! Persistent certificate cache interface

use async_trait::async_trait;
use bytes::Bytes;

use super::CacheError;

/// Key/value store for ACME account credentials and certificate bundles.
///
/// Implemented by [`DirCache`](super::DirCache) in the supervisor and by
/// [`RemoteCache`](super::RemoteCache) in the jailed worker.
#[async_trait]
pub trait CertCache: Send + Sync {
    /// Fetch an entry. Absent names fail with [`CacheError::CacheMiss`].
    async fn get(&self, name: &str) -> Result<Bytes, CacheError>;

    /// Store an entry. Empty payloads are rejected.
    async fn put(&self, name: &str, data: Bytes) -> Result<(), CacheError>;

    /// Remove an entry; removing an absent name is not an error.
    async fn delete(&self, name: &str) -> Result<(), CacheError>;
}
