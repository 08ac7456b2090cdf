//! Module builds with per-artifact quarantine bookkeeping.

use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use fleet_core::config::BuilderConfig;
use fleet_core::{
    ArtifactError, ArtifactMetadata, ArtifactStatus, ErrorSource, FunctionId, MissingDependency,
    MissingDependencySet, ResolvedRuntime,
};

use crate::driver::{Builder, BuilderDriver};
use crate::error::{BuilderError, BuilderResult};
use crate::names::module_artifact_key;

impl BuilderDriver {
    /// Build every missing module artifact for `runtime`.
    ///
    /// Builds run concurrently up to the configured limit. Each outcome is
    /// recorded before returning; the first failure is reported.
    pub async fn build_modules(
        &self,
        function: &FunctionId,
        runtime: &ResolvedRuntime,
        missing: &MissingDependencySet,
    ) -> BuilderResult<()> {
        if missing.is_empty() {
            return Ok(());
        }
        let token = self.issue_token(function).await?;
        let limit = Semaphore::new(self.config.concurrency.max(1));
        info!(
            function = %function.table_key(),
            runtime = %runtime.name,
            modules = missing.len(),
            "building modules"
        );

        let builds = missing.values().map(|module| async {
            let _permit = limit.acquire().await;
            self.build_module(runtime, module, &token).await
        });
        let mut first_error = None;
        for result in join_all(builds).await {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn build_module(
        &self,
        runtime: &ResolvedRuntime,
        module: &MissingDependency,
        token: &str,
    ) -> BuilderResult<()> {
        let dependency = &module.dependency;
        let started = Instant::now();
        let builder = Builder::module(runtime, &dependency.name, &self.config.version);
        let key = module_artifact_key(
            &runtime.name,
            &dependency.name,
            &dependency.resolved_version,
        );
        let put = self.objects.presign_put(&key, self.config.timeout()).await?;
        let payload = json!({
            "name": dependency.name,
            "version": dependency.resolved_version,
            "put": put,
            "registryToken": token,
        });

        let failure = match self.invoke_builder(&builder, &payload).await {
            Ok(outcome) => outcome.function_error.map(|message| ArtifactError {
                message,
                source: ErrorSource::Function,
            }),
            Err(e) => Some(ArtifactError {
                message: e.to_string(),
                source: ErrorSource::Infrastructure,
            }),
        };

        let metadata = record_outcome(
            module,
            &runtime.name,
            failure,
            &self.config,
            Utc::now(),
            started.elapsed().as_millis() as u64,
        );
        self.state.put_artifact(&metadata)?;

        let failed = metadata.status == ArtifactStatus::Failed;
        match metadata.last_error.clone().filter(|_| failed) {
            None => {
                info!(
                    module = %metadata.table_key(),
                    duration_ms = metadata.duration_ms,
                    "module built"
                );
                Ok(())
            }
            Some(error) => {
                warn!(
                    module = %artifact_label(&metadata),
                    failures = metadata.failure_count,
                    retry_at = ?metadata.backoff_until,
                    error = %error.message,
                    "module build failed"
                );
                Err(BuilderError::ModuleBuildFailed {
                    name: dependency.name.clone(),
                    version: dependency.resolved_version.clone(),
                    message: error.message,
                    source_kind: error.source,
                })
            }
        }
    }
}

fn artifact_label(metadata: &ArtifactMetadata) -> String {
    format!("{}@{} ({})", metadata.name, metadata.version, metadata.runtime)
}

/// Next artifact record after a build attempt.
///
/// A failure quarantines the artifact for the current backoff step (the
/// initial step when there is no history) and grows the step by the
/// configured ratio.
pub fn record_outcome(
    module: &MissingDependency,
    runtime: &str,
    failure: Option<ArtifactError>,
    config: &BuilderConfig,
    completed_at: DateTime<Utc>,
    duration_ms: u64,
) -> ArtifactMetadata {
    let previous = module.previous.as_ref();
    let mut metadata = ArtifactMetadata {
        runtime: runtime.to_string(),
        name: module.dependency.name.clone(),
        version: module.dependency.resolved_version.clone(),
        status: ArtifactStatus::Success,
        failure_count: previous.map_or(0, |p| p.failure_count),
        backoff_step_ms: previous.and_then(|p| p.backoff_step_ms),
        backoff_until: None,
        last_error: previous.and_then(|p| p.last_error.clone()),
        completed_at,
        duration_ms,
    };
    if let Some(error) = failure {
        let step = metadata
            .backoff_step_ms
            .unwrap_or(config.backoff_initial().as_millis() as u64);
        metadata.status = ArtifactStatus::Failed;
        metadata.failure_count += 1;
        metadata.backoff_until = Some(completed_at + chrono::Duration::milliseconds(step as i64));
        metadata.backoff_step_ms = Some((step as f64 * config.backoff_ratio).floor() as u64);
        metadata.last_error = Some(error);
    }
    metadata
}
