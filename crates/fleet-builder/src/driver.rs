//! Builder invocation with lazy provisioning.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use fleet_core::config::{BuilderConfig, ConvergenceConfig};
use fleet_core::{FunctionId, ResolvedRuntime};
use fleet_provider::{
    CodeArtifact, ComputeConfiguration, ComputeProvider, ErrorKind, InvokeOutcome, ObjectStore,
    Poll, PollPolicy, ProviderError, RetryPolicy, TokenIssuer, TokenScope, retry_throttled,
    wait_until,
};
use fleet_state::StateStore;

use crate::error::{BuilderError, BuilderResult};
use crate::names;

/// Drives module and package builds.
pub struct BuilderDriver {
    pub(crate) compute: Arc<dyn ComputeProvider>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) tokens: Arc<dyn TokenIssuer>,
    pub(crate) state: StateStore,
    pub(crate) config: BuilderConfig,
    pub(crate) poll: PollPolicy,
    pub(crate) retry: RetryPolicy,
}

/// One builder function and the runtime it runs on.
pub(crate) struct Builder<'a> {
    pub name: String,
    pub description: String,
    pub runtime: &'a ResolvedRuntime,
}

impl<'a> Builder<'a> {
    pub fn module(runtime: &'a ResolvedRuntime, package: &str, builder_version: &str) -> Self {
        Self {
            name: names::module_builder_name(&runtime.name, package, builder_version),
            description: names::module_builder_description(&runtime.name, package, builder_version),
            runtime,
        }
    }

    pub fn function(runtime: &'a ResolvedRuntime, builder_version: &str) -> Self {
        Self {
            name: names::function_builder_name(&runtime.name, builder_version),
            description: names::function_builder_description(&runtime.name, builder_version),
            runtime,
        }
    }
}

impl BuilderDriver {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        objects: Arc<dyn ObjectStore>,
        tokens: Arc<dyn TokenIssuer>,
        state: StateStore,
        config: BuilderConfig,
        convergence: &ConvergenceConfig,
    ) -> Self {
        Self {
            compute,
            objects,
            tokens,
            state,
            config,
            poll: PollPolicy::from_config(convergence),
            retry: RetryPolicy::provisioning(convergence),
        }
    }

    /// Registry token scoped to the function's account and subscription.
    pub(crate) async fn issue_token(&self, function: &FunctionId) -> BuilderResult<String> {
        let scope = TokenScope {
            account_id: function.account_id.clone(),
            subscription_id: function.subscription_id.clone(),
            ttl: self.config.timeout(),
        };
        Ok(self.tokens.issue(&scope).await?)
    }

    /// Invoke `builder`, creating it on first use.
    ///
    /// A missing builder is created once and the call retried. A busy
    /// builder is waited on until ready, up to the configured number of
    /// conflicts. Throttled calls back off with jitter.
    pub(crate) async fn invoke_builder(
        &self,
        builder: &Builder<'_>,
        payload: &Value,
    ) -> BuilderResult<InvokeOutcome> {
        let compute = self.compute.as_ref();
        let name = builder.name.as_str();
        let mut created = false;
        let mut conflicts = 0u32;
        loop {
            let result = retry_throttled(&self.retry, "invoke builder", || {
                compute.invoke(name, payload)
            })
            .await;
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is(ErrorKind::NotFound) && !created => {
                    info!(
                        builder = %name,
                        description = %builder.description,
                        "builder not found, creating"
                    );
                    self.create_builder(builder).await?;
                    created = true;
                }
                Err(e) if e.is(ErrorKind::Conflict) => {
                    conflicts += 1;
                    if conflicts > self.config.conflict_retries {
                        return Err(BuilderError::BuilderBusy {
                            builder: name.to_string(),
                            attempts: conflicts,
                        });
                    }
                    debug!(builder = %name, conflicts, "builder busy, waiting");
                    self.wait_ready(name).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn create_builder(&self, builder: &Builder<'_>) -> BuilderResult<()> {
        let config = ComputeConfiguration {
            runtime: builder.runtime.name.clone(),
            layers: builder.runtime.layers.clone(),
            memory_size: self.config.memory_size,
            timeout: u32::try_from(self.config.timeout().as_secs()).unwrap_or(u32::MAX),
            environment: BTreeMap::from([(
                "FLEET_BUILDER".to_string(),
                builder.description.clone(),
            )]),
            vpc: None,
        };
        let code = CodeArtifact {
            location: format!("builders/{}.zip", self.config.version),
        };
        let compute = self.compute.as_ref();
        let name = builder.name.as_str();
        let created = retry_throttled(&self.retry, "create builder", || {
            compute.create_function(name, &config, &code)
        })
        .await;
        match created {
            Ok(_) => {}
            Err(e) if e.is(ErrorKind::AlreadyExists) => {
                debug!(builder = %name, "builder created concurrently");
            }
            Err(e) => return Err(e.into()),
        }
        self.wait_ready(name).await
    }

    async fn wait_ready(&self, name: &str) -> BuilderResult<()> {
        let compute = self.compute.as_ref();
        wait_until(&self.poll, name, move || async move {
            let function = compute.get_function(name).await?;
            if function.has_failed() {
                warn!(
                    builder = %name,
                    state = %function.describe_state(),
                    "builder failed to provision"
                );
                return Err(ProviderError::new(
                    ErrorKind::Other,
                    "BuilderFailed",
                    format!(
                        "builder {name} failed: {}",
                        function.state_reason.as_deref().unwrap_or("unknown reason")
                    ),
                ));
            }
            Ok(if function.is_ready() {
                Poll::Ready(())
            } else {
                Poll::Pending(function.describe_state())
            })
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use fleet_provider::memory::{MemoryCompute, MemoryObjectStore, StaticTokenIssuer};

    pub(crate) struct Harness {
        pub compute: Arc<MemoryCompute>,
        pub objects: Arc<MemoryObjectStore>,
        pub tokens: Arc<StaticTokenIssuer>,
        pub state: StateStore,
        pub driver: BuilderDriver,
    }

    pub(crate) fn harness(compute: MemoryCompute) -> Harness {
        let compute = Arc::new(compute);
        let objects = Arc::new(MemoryObjectStore::new());
        let tokens = Arc::new(StaticTokenIssuer::new());
        let state = StateStore::open_in_memory().unwrap();
        let driver = BuilderDriver::new(
            compute.clone(),
            objects.clone(),
            tokens.clone(),
            state.clone(),
            BuilderConfig::default(),
            &ConvergenceConfig::default(),
        );
        Harness {
            compute,
            objects,
            tokens,
            state,
            driver,
        }
    }

    pub(crate) fn runtime() -> ResolvedRuntime {
        ResolvedRuntime {
            name: "nodejs18.x".into(),
            engine: Some("18.18.2".into()),
            layers: vec![],
        }
    }

    #[tokio::test]
    async fn missing_builder_is_created_once() {
        let h = harness(MemoryCompute::new());
        let rt = runtime();
        let builder = Builder::function(&rt, "1");

        h.driver.invoke_builder(&builder, &serde_json::json!({})).await.unwrap();
        h.driver.invoke_builder(&builder, &serde_json::json!({})).await.unwrap();

        let creates: Vec<String> = h
            .compute
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("create_function"))
            .collect();
        assert_eq!(creates, vec![format!("create_function {}", builder.name)]);
        let created = h.compute.function(&builder.name).unwrap();
        assert_eq!(created.configuration.memory_size, 1024);
        assert_eq!(h.compute.invocations().len(), 2);
    }

    #[tokio::test]
    async fn second_not_found_is_fatal() {
        let h = harness(MemoryCompute::new());
        let rt = runtime();
        let builder = Builder::module(&rt, "sharp", "1");
        h.compute.fail_next("invoke", ProviderError::not_found("gone"));
        h.compute.fail_next("invoke", ProviderError::not_found("gone again"));

        let err = h
            .driver
            .invoke_builder(&builder, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BuilderError::Provider(ref e) if e.kind == ErrorKind::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_builder_is_waited_on() {
        let h = harness(MemoryCompute::new().with_settle_polls(3));
        let rt = runtime();
        let builder = Builder::module(&rt, "sharp", "1");

        h.driver.invoke_builder(&builder, &serde_json::json!({})).await.unwrap();
        assert_eq!(h.compute.invocations().len(), 1);
    }

    #[tokio::test]
    async fn persistent_conflicts_give_up() {
        let h = harness(MemoryCompute::new());
        let rt = runtime();
        let builder = Builder::module(&rt, "sharp", "1");
        h.driver.invoke_builder(&builder, &serde_json::json!({})).await.unwrap();
        for _ in 0..=BuilderConfig::default().conflict_retries {
            h.compute.fail_next("invoke", ProviderError::conflict("busy"));
        }
        let err = h
            .driver
            .invoke_builder(&builder, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BuilderError::BuilderBusy { attempts: 4, .. }));
        assert_eq!(err.status_code(), 409);
    }
}
