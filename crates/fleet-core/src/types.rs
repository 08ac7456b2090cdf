//! Build plans, build status, dependency records, and queue bindings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::FunctionId;

/// Version of the persisted record layout.
pub const SCHEMA_VERSION: u32 = 1;

// ── Build plan ─────────────────────────────────────────────────────

/// How much rebuilding a specification change requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    /// Build missing dependencies, then the package, then the resource. Async.
    FullBuild,
    /// Rebuild the package from cached dependencies and update the resource.
    PartialBuild,
    /// Push configuration and publish a new version.
    ConfigurationUpdate,
    /// Only the persisted record changes.
    MetadataUpdate,
    None,
}

impl BuildKind {
    /// Only full builds run off the caller's request.
    pub fn is_async(self) -> bool {
        self == BuildKind::FullBuild
    }

    /// Whether a deployment package is compiled and pushed.
    pub fn rebuilds_package(self) -> bool {
        matches!(self, BuildKind::FullBuild | BuildKind::PartialBuild)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildKind::FullBuild => "full_build",
            BuildKind::PartialBuild => "partial_build",
            BuildKind::ConfigurationUpdate => "configuration_update",
            BuildKind::MetadataUpdate => "metadata_update",
            BuildKind::None => "none",
        }
    }
}

/// What happens to the function's recurring schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronPlan {
    Set,
    Update,
    Cancel,
    None,
}

/// Whether task queues must be reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPlan {
    Update,
    None,
}

/// The decision computed once per run from new vs. persisted hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildPlan {
    pub build: BuildKind,
    pub cron: CronPlan,
    pub task: TaskPlan,
    pub is_new_function: bool,
}

impl BuildPlan {
    /// Nothing to do at all.
    pub fn is_noop(&self) -> bool {
        self.build == BuildKind::None && self.cron == CronPlan::None && self.task == TaskPlan::None
    }
}

// ── Runtime & versions ─────────────────────────────────────────────

/// Runtime selected for the compute resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRuntime {
    /// Provider runtime identifier.
    pub name: String,
    /// Engine version the runtime was chosen for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    /// Layers attached on top of the provider runtime.
    #[serde(default)]
    pub layers: Vec<String>,
}

impl ResolvedRuntime {
    pub fn uses_custom_layer(&self) -> bool {
        !self.layers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versions {
    /// Last published compute version.
    pub function: Option<u64>,
    pub schema: u32,
}

impl Default for Versions {
    fn default() -> Self {
        Self {
            function: None,
            schema: SCHEMA_VERSION,
        }
    }
}

// ── Dependencies ───────────────────────────────────────────────────

/// Where a dependency version was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistrySource {
    Private { scope: String },
    Public { mirror: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    pub requested_range: String,
    pub resolved_version: String,
    pub registry_source: RegistrySource,
}

/// Dependency name → resolved dependency.
pub type ResolvedDependencySet = BTreeMap<String, Dependency>;

/// A resolved dependency with no usable build artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingDependency {
    pub dependency: Dependency,
    /// Metadata from the previous failed attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<ArtifactMetadata>,
}

pub type MissingDependencySet = BTreeMap<String, MissingDependency>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Success,
    Failed,
}

/// Who was at fault for a failed artifact build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// The builder ran and reported a build error.
    Function,
    /// The builder could not be run.
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactError {
    pub message: String,
    pub source: ErrorSource,
}

/// Build record for one `(runtime, name, version)` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub runtime: String,
    pub name: String,
    pub version: String,
    pub status: ArtifactStatus,
    #[serde(default)]
    pub failure_count: u32,
    /// Quarantine length applied after the next failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_step_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ArtifactError>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ArtifactMetadata {
    /// Composite key `{runtime}/{name}/{version}`.
    pub fn table_key(&self) -> String {
        artifact_key(&self.runtime, &self.name, &self.version)
    }

    /// Still quarantined at `now`.
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.status == ArtifactStatus::Failed && self.backoff_until.is_some_and(|until| until > now)
    }
}

pub fn artifact_key(runtime: &str, name: &str, version: &str) -> String {
    format!("{runtime}/{name}/{version}")
}

// ── Build status ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    Building,
    Success,
    Failed,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildState::Success | BuildState::Failed)
    }
}

/// Normalized error recorded on a failed build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub status_code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Pollable progress of one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    pub build_id: String,
    pub function: FunctionId,
    pub build: BuildKind,
    pub status: BuildState,
    pub transitions: BTreeMap<BuildState, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl BuildStatus {
    /// A fresh `pending` status with a random build id.
    pub fn pending(function: FunctionId, build: BuildKind, now: DateTime<Utc>) -> Self {
        let mut transitions = BTreeMap::new();
        transitions.insert(BuildState::Pending, now);
        Self {
            build_id: uuid::Uuid::new_v4().simple().to_string(),
            function,
            build,
            status: BuildState::Pending,
            transitions,
            error: None,
            location: None,
            version: None,
        }
    }

    pub fn transition(&mut self, state: BuildState, now: DateTime<Utc>) {
        self.status = state;
        self.transitions.insert(state, now);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ── Task queues ────────────────────────────────────────────────────

/// Queues and dispatch wiring for one task route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueueBinding {
    pub route_path: String,
    pub ordered_queue: String,
    pub delayed_queue: String,
    pub ordered_dispatch: String,
    pub delayed_dispatch: String,
}
