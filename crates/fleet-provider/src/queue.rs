//! Queue service interface.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderResult;

/// Providers accept at most this many entries per batch.
pub const MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Strict per-partition ordering, one message in flight at a time.
    Ordered,
    /// Supports per-message delivery delay and batched delivery.
    Delayed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub kind: QueueKind,
}

/// How a queue feeds the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSpec {
    pub queue: String,
    pub dispatcher: String,
    pub batch_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Unique within one batch.
    pub id: String,
    /// Messages with the same dedup id are accepted once.
    pub dedup_id: String,
    pub delay: Duration,
    pub body: serde_json::Value,
}

/// Per-entry outcome of a batch send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub accepted: Vec<String>,
    /// Entry ids the provider rejected, with its reason.
    pub failed: Vec<(String, String)>,
}

#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Create a queue and return its handle. Creating an existing queue
    /// returns the existing handle.
    async fn create_queue(&self, spec: &QueueSpec) -> ProviderResult<String>;

    async fn delete_queue(&self, handle: &str) -> ProviderResult<()>;

    /// Wire a queue to a dispatcher and return the binding handle.
    async fn create_dispatch(&self, spec: &DispatchSpec) -> ProviderResult<String>;

    async fn delete_dispatch(&self, handle: &str) -> ProviderResult<()>;

    async fn send_batch(&self, queue: &str, messages: &[QueueMessage])
    -> ProviderResult<BatchOutcome>;
}
