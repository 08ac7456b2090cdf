//! Object store interface.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderResult;

/// Blob storage for build artifacts, deployment packages, and schedule markers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> ProviderResult<()>;

    /// `None` when the key does not exist.
    async fn get(&self, key: &str) -> ProviderResult<Option<Vec<u8>>>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> ProviderResult<Vec<String>>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> ProviderResult<()>;

    /// A URL a builder can upload `key` to without credentials.
    async fn presign_put(&self, key: &str, ttl: Duration) -> ProviderResult<String>;

    async fn presign_get(&self, key: &str, ttl: Duration) -> ProviderResult<String>;
}
