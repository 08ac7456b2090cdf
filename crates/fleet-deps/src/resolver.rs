//! Dependency resolver — ranges to versions, versions to missing artifacts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, FuturesUnordered, StreamExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use fleet_core::config::RegistryConfig;
use fleet_core::{
    ArtifactStatus, Dependency, MissingDependency, MissingDependencySet, RegistrySource,
    ResolvedDependencySet,
};
use fleet_state::StateStore;

use crate::error::{DepsError, DepsResult};
use crate::mirror::PublicMirror;
use crate::range::NpmRange;
use crate::registry::RegistryClient;

pub struct DependencyResolver {
    registry: Arc<dyn RegistryClient>,
    mirrors: Vec<Arc<dyn PublicMirror>>,
    state: StateStore,
    deadline: Duration,
    concurrency: usize,
}

impl DependencyResolver {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        mirrors: Vec<Arc<dyn PublicMirror>>,
        state: StateStore,
        config: &RegistryConfig,
    ) -> Self {
        Self {
            registry,
            mirrors,
            state,
            deadline: config.deadline(),
            concurrency: config.concurrency.max(1),
        }
    }

    // ── Resolution ─────────────────────────────────────────────────

    /// Resolve every requested range to a concrete version.
    ///
    /// Fails on the first dependency that cannot be resolved.
    pub async fn resolve(
        &self,
        requested: &BTreeMap<String, String>,
    ) -> DepsResult<ResolvedDependencySet> {
        if requested.is_empty() {
            return Ok(ResolvedDependencySet::new());
        }
        let scopes = self.registry.scopes().await?;
        let results: Vec<DepsResult<Dependency>> = stream::iter(requested.iter())
            .map(|(name, range)| self.resolve_one(name, range, &scopes))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut resolved = ResolvedDependencySet::new();
        for result in results {
            let dependency = result?;
            resolved.insert(dependency.name.clone(), dependency);
        }
        info!(count = resolved.len(), "dependencies resolved");
        Ok(resolved)
    }

    async fn resolve_one(
        &self,
        name: &str,
        range: &str,
        scopes: &[String],
    ) -> DepsResult<Dependency> {
        let parsed = NpmRange::parse(range).map_err(|reason| DepsError::InvalidRange {
            name: name.to_string(),
            range: range.to_string(),
            reason,
        })?;

        let scope = scopes.iter().find(|scope| {
            name.strip_prefix(scope.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
        });
        if let Some(scope) = scope {
            return self.resolve_private(name, range, scope).await;
        }

        let (version, mirror) = self.race_mirrors(name, range, &parsed).await?;
        debug!(%name, %range, %version, %mirror, "resolved from public mirror");
        Ok(Dependency {
            name: name.to_string(),
            requested_range: range.to_string(),
            resolved_version: version,
            registry_source: RegistrySource::Public { mirror },
        })
    }

    async fn resolve_private(
        &self,
        name: &str,
        range: &str,
        scope: &str,
    ) -> DepsResult<Dependency> {
        let unresolvable = |reasons: String| DepsError::Unresolvable {
            name: name.to_string(),
            range: range.to_string(),
            reasons,
        };
        let version = timeout(self.deadline, self.registry.max_satisfying(name, range))
            .await
            .map_err(|_| {
                unresolvable(format!(
                    "private registry did not answer within {:?}",
                    self.deadline
                ))
            })??
            .ok_or_else(|| DepsError::NoMatchingVersion {
                name: name.to_string(),
                range: range.to_string(),
                source_name: format!("private registry scope {scope}"),
            })?;
        debug!(%name, %range, %version, %scope, "resolved from private registry");
        Ok(Dependency {
            name: name.to_string(),
            requested_range: range.to_string(),
            resolved_version: version,
            registry_source: RegistrySource::Private {
                scope: scope.to_string(),
            },
        })
    }

    /// Query every mirror at once; the first usable answer wins.
    async fn race_mirrors(
        &self,
        name: &str,
        range: &str,
        parsed: &NpmRange,
    ) -> DepsResult<(String, String)> {
        let unresolvable = |reasons: String| DepsError::Unresolvable {
            name: name.to_string(),
            range: range.to_string(),
            reasons,
        };
        if self.mirrors.is_empty() {
            return Err(unresolvable("no public mirrors configured".into()));
        }

        let mut attempts: FuturesUnordered<_> = self
            .mirrors
            .iter()
            .map(|mirror| query_mirror(mirror.as_ref(), name, range, parsed))
            .collect();
        let race = async {
            let mut errors = Vec::new();
            while let Some(result) = attempts.next().await {
                match result {
                    Ok(found) => return Ok(found),
                    Err(e) => errors.push(e),
                }
            }
            Err(errors)
        };

        match timeout(self.deadline, race).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(errors)) => {
                warn!(%name, %range, "every mirror failed");
                Err(unresolvable(errors.join("; ")))
            }
            Err(_) => {
                warn!(%name, %range, deadline = ?self.deadline, "mirror race timed out");
                Err(unresolvable(format!("no mirror answered within {:?}", self.deadline)))
            }
        }
    }

    // ── Artifact check ─────────────────────────────────────────────

    /// Resolved dependencies that still need a build for `runtime`.
    ///
    /// A dependency whose last build failed and whose quarantine has not
    /// expired fails the whole check. `force_rebuild` marks everything missing.
    pub fn find_missing(
        &self,
        runtime: &str,
        resolved: &ResolvedDependencySet,
        force_rebuild: bool,
        now: DateTime<Utc>,
    ) -> DepsResult<MissingDependencySet> {
        let mut missing = MissingDependencySet::new();
        for (name, dependency) in resolved {
            let previous = self
                .state
                .get_artifact(runtime, name, &dependency.resolved_version)?;
            let needs_build = match &previous {
                _ if force_rebuild => true,
                None => true,
                Some(meta) if meta.status == ArtifactStatus::Success => false,
                Some(meta) if meta.in_backoff(now) => {
                    return Err(DepsError::Quarantined {
                        name: name.clone(),
                        version: dependency.resolved_version.clone(),
                        runtime: runtime.to_string(),
                        retry_at: meta.backoff_until.unwrap_or(now),
                        last_error: meta.last_error.as_ref().map(|e| e.message.clone()),
                    });
                }
                Some(_) => true,
            };
            if needs_build {
                missing.insert(
                    name.clone(),
                    MissingDependency {
                        dependency: dependency.clone(),
                        previous,
                    },
                );
            }
        }
        if !missing.is_empty() {
            info!(%runtime, missing = missing.len(), force_rebuild, "dependencies need building");
        }
        Ok(missing)
    }
}

async fn query_mirror(
    mirror: &dyn PublicMirror,
    name: &str,
    range: &str,
    parsed: &NpmRange,
) -> Result<(String, String), String> {
    let versions = mirror
        .versions(name)
        .await
        .map_err(|e| format!("{}: {e}", mirror.name()))?;
    versions
        .max_satisfying(parsed)
        .map(|version| (version, mirror.name().to_string()))
        .ok_or_else(|| format!("{}: no version satisfies {range}", mirror.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use fleet_core::{ArtifactError, ArtifactMetadata, ErrorSource};

    use crate::registry::{MemoryRegistry, PackageVersions};

    /// Mirror that never answers.
    struct StalledMirror;

    #[async_trait]
    impl PublicMirror for StalledMirror {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn versions(&self, _package: &str) -> DepsResult<PackageVersions> {
            std::future::pending().await
        }
    }

    fn resolver(mirrors: Vec<Arc<dyn PublicMirror>>, state: StateStore) -> DependencyResolver {
        let private = MemoryRegistry::new("private", &["@acme"]);
        private.publish("@acme/utils", &["1.0.0", "1.1.0"]);
        DependencyResolver::new(Arc::new(private), mirrors, state, &RegistryConfig::default())
    }

    fn public_mirror(label: &str) -> Arc<dyn PublicMirror> {
        let mirror = MemoryRegistry::new(label, &[]);
        mirror.publish("left-pad", &["1.0.0", "1.3.0"]);
        Arc::new(mirror)
    }

    fn stalled_mirror() -> Arc<dyn PublicMirror> {
        Arc::new(StalledMirror)
    }

    fn requested(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(n, r)| (n.to_string(), r.to_string())).collect()
    }

    fn dependency(name: &str, version: &str) -> Dependency {
        Dependency {
            name: name.into(),
            requested_range: version.into(),
            resolved_version: version.into(),
            registry_source: RegistrySource::Public {
                mirror: "m".into(),
            },
        }
    }

    fn failed_artifact(name: &str, version: &str, until: DateTime<Utc>) -> ArtifactMetadata {
        ArtifactMetadata {
            runtime: "nodejs18.x".into(),
            name: name.into(),
            version: version.into(),
            status: ArtifactStatus::Failed,
            failure_count: 1,
            backoff_step_ms: Some(144_000),
            backoff_until: Some(until),
            last_error: Some(ArtifactError {
                message: "gyp ERR!".into(),
                source: ErrorSource::Function,
            }),
            completed_at: until,
            duration_ms: 10,
        }
    }

    #[tokio::test]
    async fn scoped_packages_use_private_registry() {
        let state = StateStore::open_in_memory().unwrap();
        let r = resolver(vec![public_mirror("a")], state);
        let resolved = r
            .resolve(&requested(&[("@acme/utils", "^1.0.0"), ("left-pad", "^1.0.0")]))
            .await
            .unwrap();
        assert_eq!(resolved["@acme/utils"].resolved_version, "1.1.0");
        assert_eq!(
            resolved["@acme/utils"].registry_source,
            RegistrySource::Private { scope: "@acme".into() }
        );
        assert_eq!(resolved["left-pad"].resolved_version, "1.3.0");
    }

    #[tokio::test]
    async fn missing_private_version_is_an_error() {
        let state = StateStore::open_in_memory().unwrap();
        let r = resolver(vec![], state);
        let err = r.resolve(&requested(&[("@acme/utils", "^2.0.0")])).await.unwrap_err();
        assert!(matches!(err, DepsError::NoMatchingVersion { .. }));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn mirror_race_fails_over() {
        let state = StateStore::open_in_memory().unwrap();
        let empty: Arc<dyn PublicMirror> = Arc::new(MemoryRegistry::new("empty", &[]));
        let r = resolver(vec![empty, public_mirror("full")], state);
        let resolved = r.resolve(&requested(&[("left-pad", "1.0.0")])).await.unwrap();
        assert_eq!(resolved["left-pad"].resolved_version, "1.0.0");
        assert_eq!(
            resolved["left-pad"].registry_source,
            RegistrySource::Public { mirror: "full".into() }
        );
    }

    #[tokio::test]
    async fn all_mirrors_failing_reports_every_reason() {
        let state = StateStore::open_in_memory().unwrap();
        let r = resolver(vec![public_mirror("a"), public_mirror("b")], state);
        let err = r.resolve(&requested(&[("left-pad", "^9.0.0")])).await.unwrap_err();
        match err {
            DepsError::Unresolvable { reasons, .. } => {
                assert!(reasons.contains("a: no version satisfies"));
                assert!(reasons.contains("b: no version satisfies"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_mirrors_hit_the_deadline() {
        let state = StateStore::open_in_memory().unwrap();
        let r = resolver(vec![stalled_mirror()], state);
        let err = r.resolve(&requested(&[("left-pad", "*")])).await.unwrap_err();
        assert!(matches!(
            err,
            DepsError::Unresolvable { reasons, .. } if reasons.contains("within")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_mirror_wins_over_stalled_one() {
        let state = StateStore::open_in_memory().unwrap();
        let r = resolver(vec![stalled_mirror(), public_mirror("fast")], state);
        let resolved = r.resolve(&requested(&[("left-pad", "*")])).await.unwrap();
        assert_eq!(resolved["left-pad"].resolved_version, "1.3.0");
    }

    #[test]
    fn artifact_states_classify_dependencies() {
        let state = StateStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut ok = failed_artifact("built", "1.0.0", now);
        ok.status = ArtifactStatus::Success;
        state.put_artifact(&ok).unwrap();
        state
            .put_artifact(&failed_artifact("expired", "1.0.0", now - ChronoDuration::minutes(1)))
            .unwrap();

        let resolved: ResolvedDependencySet = ["built", "expired", "fresh"]
            .iter()
            .map(|n| (n.to_string(), dependency(n, "1.0.0")))
            .collect();
        let r = resolver(vec![], state);
        let missing = r.find_missing("nodejs18.x", &resolved, false, now).unwrap();
        let names: Vec<&str> = missing.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["expired", "fresh"]);
        assert!(missing["expired"].previous.is_some());
        assert!(missing["fresh"].previous.is_none());

        let forced = r.find_missing("nodejs18.x", &resolved, true, now).unwrap();
        assert_eq!(forced.len(), 3);
    }

    #[test]
    fn quarantined_dependency_fails_the_check() {
        let state = StateStore::open_in_memory().unwrap();
        let now = Utc::now();
        let until = now + ChronoDuration::minutes(2);
        state.put_artifact(&failed_artifact("native", "2.0.0", until)).unwrap();

        let resolved: ResolvedDependencySet =
            [("native".to_string(), dependency("native", "2.0.0"))].into();
        let r = resolver(vec![], state);
        let err = r.find_missing("nodejs18.x", &resolved, false, now).unwrap_err();
        assert_eq!(err.status_code(), 429);
        match err {
            DepsError::Quarantined { retry_at, last_error, .. } => {
                assert_eq!(retry_at, until);
                assert_eq!(last_error.as_deref(), Some("gyp ERR!"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Another runtime has its own record.
        assert_eq!(r.find_missing("nodejs16.x", &resolved, false, now).unwrap().len(), 1);
    }
}
