//! Deployment package assembly.

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use fleet_core::{ErrorSource, FunctionSpecification, ResolvedDependencySet, ResolvedRuntime};
use fleet_provider::{CodeArtifact, ErrorKind};

use crate::driver::{Builder, BuilderDriver};
use crate::error::{BuilderError, BuilderResult};
use crate::names::{module_artifact_key, package_key};

/// Module downloads a package build may run in parallel.
const MAX_CONCURRENT_MODULE_DOWNLOAD: usize = 5;

impl BuilderDriver {
    /// Assemble the deployment package for `spec` from its source files and
    /// the prebuilt module artifacts of `dependencies`.
    pub async fn build_package(
        &self,
        spec: &FunctionSpecification,
        runtime: &ResolvedRuntime,
        dependencies: &ResolvedDependencySet,
        build_id: &str,
    ) -> BuilderResult<CodeArtifact> {
        let ttl = self.config.timeout();
        let key = package_key(&spec.id.resource_name(), build_id);
        let put = self.objects.presign_put(&key, ttl).await?;

        let mut modules = Map::new();
        let mut versions = Map::new();
        for dependency in dependencies.values() {
            let artifact =
                module_artifact_key(&runtime.name, &dependency.name, &dependency.resolved_version);
            let url = self.objects.presign_get(&artifact, ttl).await?;
            modules.insert(dependency.name.clone(), Value::String(url));
            versions.insert(
                dependency.name.clone(),
                Value::String(dependency.resolved_version.clone()),
            );
        }

        let payload = json!({
            "files": spec.code.files,
            "encoding": spec.code.encoding,
            "put": put,
            "dependencies": versions,
            "modules": modules,
            "registryToken": self.issue_token(&spec.id).await?,
            "maxConcurrentModuleDownload": MAX_CONCURRENT_MODULE_DOWNLOAD,
        });

        let builder = Builder::function(runtime, &self.config.version);
        let outcome = self
            .invoke_builder(&builder, &payload)
            .await
            .map_err(|e| match e {
                BuilderError::Provider(err) if !keeps_status(err.kind) => {
                    BuilderError::PackageBuildFailed {
                        message: err.to_string(),
                        source_kind: ErrorSource::Infrastructure,
                    }
                }
                other => other,
            })?;
        if let Some(message) = outcome.function_error {
            warn!(function = %spec.id.table_key(), %message, "package build failed");
            return Err(BuilderError::PackageBuildFailed {
                message,
                source_kind: ErrorSource::Function,
            });
        }

        info!(
            function = %spec.id.table_key(),
            location = %key,
            modules = modules_len(&payload),
            "package built"
        );
        Ok(CodeArtifact { location: key })
    }
}

/// Provider failures that already carry a retryable status of their own.
fn keeps_status(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Timeout | ErrorKind::Throttled | ErrorKind::Conflict)
}

fn modules_len(payload: &Value) -> usize {
    payload["modules"].as_object().map_or(0, Map::len)
}
