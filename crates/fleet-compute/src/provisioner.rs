//! Compute resource provisioner.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use fleet_core::config::{ComputeConfig, ConvergenceConfig};
use fleet_core::{FunctionSpecification, ResolvedRuntime};
use fleet_provider::{
    CodeArtifact, ComputeConfiguration, ComputeProvider, ErrorKind, Poll, PollPolicy,
    ProviderError, ProviderResult, ResourceState, RetryPolicy, VpcConfig, retry_throttled,
    wait_until,
};

use crate::error::{ComputeError, ComputeResult};

/// Conflicting updates tolerated per operation before giving up.
const CONFLICT_RETRIES: u32 = 5;

/// The function being provisioned and the runtime it was resolved to.
#[derive(Debug, Clone, Copy)]
pub struct Deployment<'a> {
    pub spec: &'a FunctionSpecification,
    pub runtime: &'a ResolvedRuntime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Create,
    Update,
}

pub struct ComputeProvisioner {
    compute: Arc<dyn ComputeProvider>,
    config: ComputeConfig,
    poll: PollPolicy,
    retry: RetryPolicy,
}

impl ComputeProvisioner {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        config: ComputeConfig,
        convergence: &ConvergenceConfig,
    ) -> Self {
        Self {
            compute,
            config,
            poll: PollPolicy::from_config(convergence),
            retry: RetryPolicy::provisioning(convergence),
        }
    }

    /// Provider configuration derived from the specification.
    pub fn configuration_for(&self, deployment: &Deployment<'_>) -> ComputeConfiguration {
        let compute = &deployment.spec.compute;
        ComputeConfiguration {
            runtime: deployment.runtime.name.clone(),
            layers: deployment.runtime.layers.clone(),
            memory_size: compute.memory_size.unwrap_or(self.config.memory_size),
            timeout: compute.timeout.unwrap_or(self.config.timeout),
            environment: deployment.spec.configuration.clone(),
            vpc: compute.static_ip.then(|| VpcConfig {
                subnet_ids: self.config.subnet_ids.clone(),
                security_group_ids: self.config.security_group_ids.clone(),
            }),
        }
    }

    /// Create or update the resource with a new package and publish a version.
    pub async fn deploy(
        &self,
        deployment: &Deployment<'_>,
        code: &CodeArtifact,
    ) -> ComputeResult<u64> {
        let name = deployment.spec.id.resource_name();
        let config = self.configuration_for(deployment);
        let path = if self.exists(&name).await? {
            Path::Update
        } else {
            Path::Create
        };
        info!(
            function = %deployment.spec.id.table_key(),
            resource = %name,
            ?path,
            "provisioning compute resource"
        );
        self.converge(&name, &config, Some(code), None, path).await?;
        self.publish(&name).await
    }

    /// Push configuration only and publish a version.
    ///
    /// If the resource has disappeared it is recreated from `previous_code`.
    pub async fn reconfigure(
        &self,
        deployment: &Deployment<'_>,
        previous_code: Option<&CodeArtifact>,
    ) -> ComputeResult<u64> {
        let name = deployment.spec.id.resource_name();
        let config = self.configuration_for(deployment);
        info!(
            function = %deployment.spec.id.table_key(),
            resource = %name,
            "updating compute configuration"
        );
        self.converge(&name, &config, None, previous_code, Path::Update)
            .await?;
        self.publish(&name).await
    }

    async fn exists(&self, name: &str) -> ComputeResult<bool> {
        let compute = self.compute.as_ref();
        match retry_throttled(&self.retry, "get function", || compute.get_function(name)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is(ErrorKind::NotFound) => Ok(false),
            Err(e) => Err(ComputeError::provider("get function", name, e)),
        }
    }

    /// Run the create or update path, switching to the other path once
    /// when the provider disagrees about whether the resource exists.
    async fn converge(
        &self,
        name: &str,
        config: &ComputeConfiguration,
        code: Option<&CodeArtifact>,
        previous_code: Option<&CodeArtifact>,
        mut path: Path,
    ) -> ComputeResult<()> {
        let mut switched = false;
        loop {
            let result = match path {
                Path::Create => match code.or(previous_code) {
                    Some(package) => self.create(name, config, package).await,
                    None => {
                        return Err(ComputeError::NoPackage {
                            resource: name.to_string(),
                        });
                    }
                },
                Path::Update => self.update(name, config, code).await,
            };
            let Err(e) = result else {
                return Ok(());
            };
            match (path, provider_kind(&e)) {
                (Path::Create, Some(ErrorKind::AlreadyExists)) if !switched => {
                    info!(resource = %name, "function already exists, updating instead");
                    path = Path::Update;
                }
                (Path::Update, Some(ErrorKind::NotFound)) if !switched => {
                    info!(resource = %name, "function not found, creating instead");
                    path = Path::Create;
                }
                _ => return Err(e),
            }
            switched = true;
        }
    }

    async fn create(
        &self,
        name: &str,
        config: &ComputeConfiguration,
        code: &CodeArtifact,
    ) -> ComputeResult<()> {
        let compute = self.compute.as_ref();
        retry_throttled(&self.retry, "create function", || {
            compute.create_function(name, config, code)
        })
        .await
        .map_err(|e| ComputeError::provider("create function", name, e))?;
        debug!(resource = %name, runtime = %config.runtime, "function created");
        self.wait_ready(name).await
    }

    async fn update(
        &self,
        name: &str,
        config: &ComputeConfiguration,
        code: Option<&CodeArtifact>,
    ) -> ComputeResult<()> {
        let compute = self.compute.as_ref();
        // A previous run may have left the resource mid-update.
        self.wait_ready(name).await?;

        self.with_conflict_retry(name, "update configuration", || {
            compute.update_configuration(name, config)
        })
        .await?;
        self.wait_ready(name).await?;
        debug!(
            resource = %name,
            memory = config.memory_size,
            vpc = config.vpc.is_some(),
            "configuration updated"
        );

        if let Some(code) = code {
            self.with_conflict_retry(name, "update code", || compute.update_code(name, code))
                .await?;
            self.wait_ready(name).await?;
            debug!(resource = %name, location = %code.location, "code updated");
        }
        Ok(())
    }

    async fn publish(&self, name: &str) -> ComputeResult<u64> {
        let compute = self.compute.as_ref();
        let published = self
            .with_conflict_retry(name, "publish version", || compute.publish_version(name))
            .await?;
        let version = published.version;
        if published.state != ResourceState::Active {
            let resource = format!("{name}:{version}");
            wait_until(&self.poll, &resource, move || async move {
                let observed = compute.get_version(name, version).await?;
                match observed.state {
                    ResourceState::Active => Ok(Poll::Ready(())),
                    ResourceState::Failed => Err(ProviderError::new(
                        ErrorKind::Other,
                        "VersionFailed",
                        format!("version {version} of {name} failed to activate"),
                    )),
                    other => Ok(Poll::Pending(format!("{other:?}"))),
                }
            })
            .await
            .map_err(|e| ComputeError::provider("activate version", name, e))?;
        }
        info!(resource = %name, version, "version published");
        Ok(version)
    }

    async fn with_conflict_retry<T, F, Fut>(
        &self,
        name: &str,
        operation: &'static str,
        mut op: F,
    ) -> ComputeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut conflicts = 0u32;
        loop {
            match retry_throttled(&self.retry, operation, &mut op).await {
                Err(e) if e.is(ErrorKind::Conflict) && conflicts < CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(resource = %name, %operation, conflicts, "update in progress, waiting");
                    self.wait_ready(name).await?;
                }
                other => return other.map_err(|e| ComputeError::provider(operation, name, e)),
            }
        }
    }

    async fn wait_ready(&self, name: &str) -> ComputeResult<()> {
        let compute = self.compute.as_ref();
        wait_until(&self.poll, name, move || async move {
            let function = compute.get_function(name).await?;
            if function.has_failed() {
                warn!(
                    resource = %name,
                    state = %function.describe_state(),
                    "function failed to converge"
                );
                return Err(ProviderError::new(
                    ErrorKind::Other,
                    "FunctionFailed",
                    function
                        .state_reason
                        .unwrap_or_else(|| format!("function {name} entered a failed state")),
                ));
            }
            Ok(if function.is_ready() {
                Poll::Ready(())
            } else {
                Poll::Pending(function.describe_state())
            })
        })
        .await
        .map_err(|e| ComputeError::provider("wait for function", name, e))
    }
}

fn provider_kind(error: &ComputeError) -> Option<ErrorKind> {
    match error {
        ComputeError::Provider { source, .. } => Some(source.kind),
        ComputeError::NoPackage { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_provider::memory::MemoryCompute;
    use serde_json::json;

    fn spec(static_ip: bool) -> FunctionSpecification {
        serde_json::from_value(json!({
            "accountId": "acc", "subscriptionId": "sub", "boundaryId": "bnd", "functionId": "hello",
            "code": { "files": { "index.js": "module.exports = () => 1;" } },
            "compute": { "memorySize": 256, "staticIp": static_ip },
            "configuration": { "GREETING": "hi" }
        }))
        .unwrap()
    }

    fn runtime() -> ResolvedRuntime {
        ResolvedRuntime {
            name: "nodejs18.x".into(),
            engine: Some("18.18.2".into()),
            layers: vec![],
        }
    }

    fn code(build: &str) -> CodeArtifact {
        CodeArtifact {
            location: format!("packages/fn/{build}.zip"),
        }
    }

    fn provisioner(compute: Arc<MemoryCompute>) -> ComputeProvisioner {
        let config = ComputeConfig {
            subnet_ids: vec!["subnet-1".into()],
            security_group_ids: vec!["sg-1".into()],
            ..Default::default()
        };
        ComputeProvisioner::new(compute, config, &ConvergenceConfig::default())
    }

    #[tokio::test]
    async fn new_function_is_created_and_published() {
        let compute = Arc::new(MemoryCompute::new());
        let p = provisioner(compute.clone());
        let (spec, rt) = (spec(false), runtime());
        let d = Deployment { spec: &spec, runtime: &rt };

        let version = p.deploy(&d, &code("b1")).await.unwrap();
        assert_eq!(version, 1);

        let name = spec.id.resource_name();
        assert_eq!(
            compute.calls(),
            vec![format!("create_function {name}"), format!("publish_version {name}")]
        );
        let created = compute.function(&name).unwrap();
        assert_eq!(created.configuration.memory_size, 256);
        assert_eq!(created.configuration.timeout, 30);
        assert_eq!(created.configuration.environment["GREETING"], "hi");
        assert!(created.configuration.vpc.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn existing_function_is_updated_in_order() {
        let compute = Arc::new(MemoryCompute::new().with_settle_polls(2));
        let p = provisioner(compute.clone());
        let (spec, rt) = (spec(true), runtime());
        let d = Deployment { spec: &spec, runtime: &rt };
        p.deploy(&d, &code("b1")).await.unwrap();

        let version = p.deploy(&d, &code("b2")).await.unwrap();
        assert_eq!(version, 2);

        let name = spec.id.resource_name();
        let calls = compute.calls();
        assert_eq!(
            &calls[2..],
            &[
                format!("update_configuration {name}"),
                format!("update_code {name}"),
                format!("publish_version {name}"),
            ]
        );
        assert_eq!(compute.code(&name).unwrap(), code("b2"));
        let vpc = compute.function(&name).unwrap().configuration.vpc.unwrap();
        assert_eq!(vpc.subnet_ids, vec!["subnet-1".to_string()]);
    }

    #[tokio::test]
    async fn create_conflict_falls_back_to_update() {
        let compute = Arc::new(MemoryCompute::new());
        let p = provisioner(compute.clone());
        let (spec, rt) = (spec(false), runtime());
        let d = Deployment { spec: &spec, runtime: &rt };
        p.deploy(&d, &code("b1")).await.unwrap();

        // Lookup misses, but the create races an existing resource.
        compute.fail_next("get_function", ProviderError::not_found("stale read"));
        let version = p.deploy(&d, &code("b2")).await.unwrap();

        assert_eq!(version, 2);
        assert_eq!(compute.code(&spec.id.resource_name()).unwrap(), code("b2"));
    }

    #[tokio::test]
    async fn vanished_function_is_recreated_from_previous_package() {
        let compute = Arc::new(MemoryCompute::new());
        let p = provisioner(compute.clone());
        let (spec, rt) = (spec(false), runtime());
        let d = Deployment { spec: &spec, runtime: &rt };

        let version = p.reconfigure(&d, Some(&code("b0"))).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(compute.code(&spec.id.resource_name()).unwrap(), code("b0"));
    }

    #[tokio::test]
    async fn vanished_function_without_package_is_an_error() {
        let compute = Arc::new(MemoryCompute::new());
        let p = provisioner(compute);
        let (spec, rt) = (spec(false), runtime());
        let d = Deployment { spec: &spec, runtime: &rt };

        let err = p.reconfigure(&d, None).await.unwrap_err();
        assert!(matches!(err, ComputeError::NoPackage { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn convergence_timeout_names_the_resource() {
        let compute = Arc::new(MemoryCompute::new().with_settle_polls(u32::MAX));
        let p = provisioner(compute);
        let (spec, rt) = (spec(false), runtime());
        let d = Deployment { spec: &spec, runtime: &rt };

        let err = p.deploy(&d, &code("b1")).await.unwrap_err();
        assert_eq!(err.status_code(), 504);
        assert!(err.to_string().contains(&spec.id.resource_name()));
    }

    #[tokio::test]
    async fn terminal_errors_keep_the_provider_code() {
        let compute = Arc::new(MemoryCompute::new());
        let p = provisioner(compute.clone());
        let (spec, rt) = (spec(false), runtime());
        let d = Deployment { spec: &spec, runtime: &rt };
        compute.fail_next(
            "create_function",
            ProviderError::new(ErrorKind::Invalid, "InvalidParameterValue", "bad runtime"),
        );

        let err = p.deploy(&d, &code("b1")).await.unwrap_err();
        assert_eq!(err.provider_code(), Some("InvalidParameterValue"));
        assert_eq!(err.status_code(), 400);
    }
}
