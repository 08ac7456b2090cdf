//! Per-run values passed between pipeline steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_core::{
    BuildPlan, BuildState, BuildStatus, FunctionSpecification, Hashes, MissingDependencySet,
    Permission, ResolvedDependencySet, ResolvedRuntime, TaskQueueBinding, Versions,
};
use fleet_provider::CodeArtifact;
use fleet_state::{BuildRequest, FunctionRecord};

/// A specification submitted for deployment by an authorized caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub spec: FunctionSpecification,
    /// Permissions held by the caller; the function may not ask for more.
    #[serde(default)]
    pub caller_permissions: Vec<Permission>,
    /// Treat every dependency as missing.
    #[serde(default)]
    pub force_rebuild: bool,
}

/// Answer to a submission.
///
/// Full builds answer `{synchronous: false, buildId, status}` right away.
/// Every other plan answers `{synchronous: true, result}` once done, with
/// no result when nothing changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub synchronous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BuildState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BuildStatus>,
}

impl SubmitResponse {
    pub(crate) fn started(status: &BuildStatus) -> Self {
        Self {
            synchronous: false,
            build_id: Some(status.build_id.clone()),
            status: Some(status.status),
            result: None,
        }
    }

    pub(crate) fn completed(status: BuildStatus) -> Self {
        Self {
            synchronous: true,
            build_id: None,
            status: None,
            result: Some(status),
        }
    }

    pub(crate) fn unchanged() -> Self {
        Self {
            synchronous: true,
            build_id: None,
            status: None,
            result: None,
        }
    }
}

/// Everything computed before a build is persisted.
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub spec: FunctionSpecification,
    pub runtime: ResolvedRuntime,
    pub hashes: Hashes,
    pub resolved: ResolvedDependencySet,
    pub missing: MissingDependencySet,
    pub plan: BuildPlan,
}

impl Prepared {
    pub fn into_request(self, build_id: &str, now: DateTime<Utc>) -> BuildRequest {
        BuildRequest {
            build_id: build_id.to_string(),
            spec: self.spec,
            hashes: self.hashes,
            plan: self.plan,
            runtime: self.runtime,
            resolved_dependencies: self.resolved,
            missing_dependencies: self.missing,
            created_at: now,
        }
    }
}

/// Results accumulated while executing one build request.
pub(crate) struct RunContext<'a> {
    pub request: &'a BuildRequest,
    pub existing: Option<&'a FunctionRecord>,
    /// Package pushed in this run.
    pub package: Option<CodeArtifact>,
    pub version: Option<u64>,
    pub task_bindings: Vec<TaskQueueBinding>,
    pub enqueued: usize,
}

impl<'a> RunContext<'a> {
    pub fn new(request: &'a BuildRequest, existing: Option<&'a FunctionRecord>) -> Self {
        Self {
            request,
            existing,
            package: None,
            version: existing.and_then(|r| r.versions.function),
            task_bindings: existing.map(|r| r.task_bindings.clone()).unwrap_or_default(),
            enqueued: 0,
        }
    }

    /// Package of the last successful deployment.
    pub fn previous_package(&self) -> Option<CodeArtifact> {
        self.existing
            .and_then(|r| r.location.clone())
            .map(|location| CodeArtifact { location })
    }

    /// The record that replaces the persisted one on success.
    pub fn into_record(self, now: DateTime<Utc>) -> FunctionRecord {
        let location = self
            .package
            .map(|p| p.location)
            .or_else(|| self.existing.and_then(|r| r.location.clone()));
        FunctionRecord {
            spec: self.request.spec.clone(),
            hashes: self.request.hashes.clone(),
            versions: Versions {
                function: self.version,
                ..Versions::default()
            },
            runtime: self.request.runtime.clone(),
            resolved_dependencies: self.request.resolved_dependencies.clone(),
            task_bindings: self.task_bindings,
            location,
            updated_at: now,
        }
    }
}
