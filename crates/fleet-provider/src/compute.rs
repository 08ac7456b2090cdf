//! Compute provider interface.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderResult;

/// Unpublished head version name.
pub const LATEST_VERSION: &str = "$LATEST";

/// Network attachment required for a static egress IP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcConfig {
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
}

/// Mutable configuration of a compute function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeConfiguration {
    pub runtime: String,
    #[serde(default)]
    pub layers: Vec<String>,
    /// Memory in MB.
    pub memory_size: u32,
    /// Timeout in seconds.
    pub timeout: u32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<VpcConfig>,
}

/// Where a deployment package can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeArtifact {
    /// Object store key of the package.
    pub location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Pending,
    Active,
    Inactive,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    InProgress,
    Successful,
    Failed,
}

/// Observed state of a compute function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeFunction {
    pub name: String,
    pub configuration: ComputeConfiguration,
    pub state: ResourceState,
    pub last_update: UpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_reason: Option<String>,
}

impl ComputeFunction {
    /// Settled and accepting further updates.
    pub fn is_ready(&self) -> bool {
        self.state == ResourceState::Active && self.last_update == UpdateStatus::Successful
    }

    pub fn has_failed(&self) -> bool {
        self.state == ResourceState::Failed || self.last_update == UpdateStatus::Failed
    }

    pub fn describe_state(&self) -> String {
        format!("{:?}/{:?}", self.state, self.last_update)
    }
}

/// An immutable published version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedVersion {
    pub version: u64,
    pub state: ResourceState,
}

/// One entry of a version listing. `version` is a number or [`LATEST_VERSION`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub last_modified: DateTime<Utc>,
}

impl VersionInfo {
    pub fn number(&self) -> Option<u64> {
        self.version.parse().ok()
    }
}

/// Result of a synchronous invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeOutcome {
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Set when the function ran but reported an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_error: Option<String>,
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn get_function(&self, name: &str) -> ProviderResult<ComputeFunction>;

    async fn create_function(
        &self,
        name: &str,
        config: &ComputeConfiguration,
        code: &CodeArtifact,
    ) -> ProviderResult<ComputeFunction>;

    async fn update_configuration(
        &self,
        name: &str,
        config: &ComputeConfiguration,
    ) -> ProviderResult<()>;

    async fn update_code(&self, name: &str, code: &CodeArtifact) -> ProviderResult<()>;

    async fn publish_version(&self, name: &str) -> ProviderResult<PublishedVersion>;

    async fn get_version(&self, name: &str, version: u64) -> ProviderResult<PublishedVersion>;

    async fn list_versions(&self, name: &str) -> ProviderResult<Vec<VersionInfo>>;

    async fn delete_version(&self, name: &str, version: &str) -> ProviderResult<()>;

    async fn delete_function(&self, name: &str) -> ProviderResult<()>;

    async fn invoke(&self, name: &str, payload: &serde_json::Value)
    -> ProviderResult<InvokeOutcome>;
}
