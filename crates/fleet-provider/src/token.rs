//! Short-lived credentials handed to builders.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderResult;

/// What an issued token may access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenScope {
    pub account_id: String,
    pub subscription_id: String,
    pub ttl: Duration,
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Issue a registry read token for `scope`.
    async fn issue(&self, scope: &TokenScope) -> ProviderResult<String>;
}
