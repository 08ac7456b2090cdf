//! Persisted record types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_core::{
    BuildPlan, FunctionId, FunctionSpecification, Hashes, MissingDependencySet,
    ResolvedDependencySet, ResolvedRuntime, TaskQueueBinding, Versions,
};

/// Last successfully deployed state of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRecord {
    /// The resolved specification, defaults applied.
    pub spec: FunctionSpecification,
    pub hashes: Hashes,
    pub versions: Versions,
    pub runtime: ResolvedRuntime,
    #[serde(default)]
    pub resolved_dependencies: ResolvedDependencySet,
    #[serde(default)]
    pub task_bindings: Vec<TaskQueueBinding>,
    /// Object store key of the deployed package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl FunctionRecord {
    pub fn table_key(&self) -> String {
        self.spec.id.table_key()
    }

    pub fn binding(&self, route_path: &str) -> Option<&TaskQueueBinding> {
        self.task_bindings.iter().find(|b| b.route_path == route_path)
    }
}

/// Everything needed to execute a build, persisted before execution so
/// an interrupted run can be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub build_id: String,
    pub spec: FunctionSpecification,
    pub hashes: Hashes,
    pub plan: BuildPlan,
    pub runtime: ResolvedRuntime,
    #[serde(default)]
    pub resolved_dependencies: ResolvedDependencySet,
    #[serde(default)]
    pub missing_dependencies: MissingDependencySet,
    pub created_at: DateTime<Utc>,
}

impl BuildRequest {
    pub fn function(&self) -> &FunctionId {
        &self.spec.id
    }
}

/// Search tags of a function: user tags plus derived system tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionTags {
    pub function: FunctionId,
    pub tags: BTreeMap<String, String>,
}

impl FunctionTags {
    /// Derive the tag set from a freshly persisted record.
    pub fn from_record(record: &FunctionRecord) -> Self {
        let mut tags = record.spec.metadata.tags.clone();
        tags.insert("runtime".into(), record.runtime.name.clone());
        tags.insert("cron".into(), record.spec.schedule.is_some().to_string());
        tags.insert("static-ip".into(), record.spec.compute.static_ip.to_string());
        tags.insert("task-routes".into(), record.task_bindings.len().to_string());
        Self {
            function: record.spec.id.clone(),
            tags,
        }
    }

    pub fn matches(&self, key: &str, value: Option<&str>) -> bool {
        match (self.tags.get(key), value) {
            (Some(v), Some(wanted)) => v == wanted,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}
