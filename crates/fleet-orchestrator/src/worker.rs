//! Submission, execution and polling of builds.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use fleet_builder::BuilderDriver;
use fleet_compute::{ComputeProvisioner, Deployment, VersionCollector};
use fleet_core::{
    BuildKind, BuildPlan, BuildState, BuildStatus, Facet, FleetConfig, MissingDependencySet,
    TaskPlan, compute_hashes,
};
use fleet_deps::{DependencyResolver, PublicMirror, RegistryClient};
use fleet_provider::{ComputeProvider, ObjectStore, QueueProvider, TokenIssuer};
use fleet_schedule::{ScheduleManager, TaskQueueProvisioner};
use fleet_state::{BuildRequest, FunctionRecord, FunctionTags, StateStore};

use crate::context::{DeployRequest, Prepared, RunContext, SubmitResponse};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::plan::{PlanInput, Previous, resolve_plan};
use crate::settings::{ResolvedSettings, SettingsResolver};

const WAIT_INTERVAL: Duration = Duration::from_millis(250);

/// External services the orchestrator talks to.
pub struct Providers {
    pub compute: Arc<dyn ComputeProvider>,
    pub objects: Arc<dyn ObjectStore>,
    pub queues: Arc<dyn QueueProvider>,
    pub tokens: Arc<dyn TokenIssuer>,
    pub registry: Arc<dyn RegistryClient>,
    pub mirrors: Vec<Arc<dyn PublicMirror>>,
}

/// Entry point for deployments. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    state: StateStore,
    settings: SettingsResolver,
    resolver: DependencyResolver,
    builder: BuilderDriver,
    provisioner: ComputeProvisioner,
    schedules: ScheduleManager,
    tasks: TaskQueueProvisioner,
    collector: VersionCollector,
}

impl Orchestrator {
    pub fn new(providers: Providers, state: StateStore, config: &FleetConfig) -> Self {
        let convergence = &config.convergence;
        let inner = Inner {
            settings: SettingsResolver::new(config.compute.clone()),
            resolver: DependencyResolver::new(
                providers.registry,
                providers.mirrors,
                state.clone(),
                &config.registry,
            ),
            builder: BuilderDriver::new(
                providers.compute.clone(),
                providers.objects.clone(),
                providers.tokens,
                state.clone(),
                config.builder.clone(),
                convergence,
            ),
            provisioner: ComputeProvisioner::new(
                providers.compute.clone(),
                config.compute.clone(),
                convergence,
            ),
            schedules: ScheduleManager::new(
                providers.objects,
                providers.queues.clone(),
                config.cron.clone(),
                convergence,
            ),
            tasks: TaskQueueProvisioner::new(providers.queues, config.tasks.clone(), convergence),
            collector: VersionCollector::new(providers.compute, &config.gc, convergence),
            state,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    // ── Submission ─────────────────────────────────────────────────

    /// Compute the plan a submission would run, without persisting anything.
    pub async fn plan(&self, request: &DeployRequest) -> OrchestratorResult<BuildPlan> {
        let existing = self.inner.state.get_function(&request.spec.id)?;
        let prepared = self.prepare(request, existing.as_ref(), Utc::now()).await?;
        Ok(prepared.plan)
    }

    /// Submit a specification for deployment.
    ///
    /// Full builds are started in the background and answered right away.
    /// Other plans run to completion first; their failure is returned as
    /// the error after the failed status has been recorded.
    pub async fn submit(&self, request: DeployRequest) -> OrchestratorResult<SubmitResponse> {
        let now = Utc::now();
        let function = request.spec.id.clone();
        let existing = self.inner.state.get_function(&function)?;
        let prepared = self.prepare(&request, existing.as_ref(), now).await?;
        let plan = prepared.plan;

        info!(
            function = %function.table_key(),
            build = plan.build.as_str(),
            cron = ?plan.cron,
            task = ?plan.task,
            new = plan.is_new_function,
            "build plan computed"
        );
        if plan.is_noop() {
            return Ok(SubmitResponse::unchanged());
        }

        let status = BuildStatus::pending(function, plan.build, now);
        let build_request = prepared.into_request(&status.build_id, now);
        self.inner.state.put_build(&status)?;
        self.inner.state.put_build_request(&build_request)?;

        if plan.build.is_async() {
            let this = self.clone();
            tokio::spawn(async move {
                let build_id = build_request.build_id.clone();
                if let Err(e) = this.execute(build_request).await {
                    debug!(build_id = %build_id, error = %e, "background build failed");
                }
            });
            return Ok(SubmitResponse::started(&status));
        }

        let status = self.execute(build_request).await?;
        Ok(SubmitResponse::completed(status))
    }

    async fn prepare(
        &self,
        request: &DeployRequest,
        existing: Option<&FunctionRecord>,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<Prepared> {
        let ResolvedSettings {
            spec,
            runtime,
            manifest,
        } = self
            .inner
            .settings
            .resolve(request.spec.clone(), &request.caller_permissions)?;
        let hashes = compute_hashes(&spec)?;

        let (resolved, missing) = match existing {
            Some(record)
                if !request.force_rebuild
                    && !hashes.changed(&record.hashes, Facet::Runtime)
                    && !hashes.changed(&record.hashes, Facet::Dependencies) =>
            {
                debug!(
                    function = %spec.id.table_key(),
                    "dependencies unchanged, reusing resolution"
                );
                (record.resolved_dependencies.clone(), MissingDependencySet::new())
            }
            _ => {
                let resolver = &self.inner.resolver;
                let resolved = resolver.resolve(&manifest.dependencies).await?;
                let missing =
                    resolver.find_missing(&runtime.name, &resolved, request.force_rebuild, now)?;
                (resolved, missing)
            }
        };

        let plan = resolve_plan(&PlanInput {
            hashes: &hashes,
            runtime: &runtime,
            static_ip: spec.compute.static_ip,
            missing: &missing,
            previous: existing.map(|record| Previous {
                hashes: &record.hashes,
                runtime: &record.runtime,
                static_ip: record.spec.compute.static_ip,
            }),
        });

        Ok(Prepared {
            spec,
            runtime,
            hashes,
            resolved,
            missing,
            plan,
        })
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Run a persisted build request to a terminal status.
    ///
    /// The request is deleted whatever the outcome.
    pub async fn execute(&self, request: BuildRequest) -> OrchestratorResult<BuildStatus> {
        let state = &self.inner.state;
        let function = request.function().clone();
        let mut status = match state.get_build(&request.build_id)? {
            Some(status) => status,
            None => {
                let mut status =
                    BuildStatus::pending(function.clone(), request.plan.build, request.created_at);
                status.build_id = request.build_id.clone();
                status
            }
        };
        status.transition(BuildState::Building, Utc::now());
        state.put_build(&status)?;
        info!(
            build_id = %request.build_id,
            function = %function.table_key(),
            build = request.plan.build.as_str(),
            "build started"
        );

        let existing = state.get_function(&function)?;
        let result = match self.run(&request, existing.as_ref()).await {
            Ok(record) => self.commit(&record).map(|()| record),
            Err(e) => Err(e),
        };

        let now = Utc::now();
        match &result {
            Ok(record) => {
                status.version = record.versions.function;
                status.location = Some(function.location());
                status.transition(BuildState::Success, now);
                info!(build_id = %request.build_id, version = ?status.version, "build succeeded");
            }
            Err(e) => {
                status.error = Some(e.to_error_info());
                status.transition(BuildState::Failed, now);
                warn!(build_id = %request.build_id, error = %e, "build failed");
            }
        }

        if let Err(e) = state.delete_build_request(&request.build_id) {
            warn!(build_id = %request.build_id, error = %e, "failed to delete build request");
        }
        state.put_build(&status)?;
        result.map(|_| status)
    }

    async fn run(
        &self,
        request: &BuildRequest,
        existing: Option<&FunctionRecord>,
    ) -> OrchestratorResult<FunctionRecord> {
        let mut ctx = RunContext::new(request, existing);
        self.build(&mut ctx).await?;
        self.provision(&mut ctx).await?;
        self.schedule(&mut ctx).await?;
        self.reconcile_tasks(&mut ctx).await?;
        Ok(ctx.into_record(Utc::now()))
    }

    async fn build(&self, ctx: &mut RunContext<'_>) -> OrchestratorResult<()> {
        let request = ctx.request;
        let kind = request.plan.build;
        if kind == BuildKind::FullBuild {
            self.inner
                .builder
                .build_modules(
                    request.function(),
                    &request.runtime,
                    &request.missing_dependencies,
                )
                .await?;
        }
        if kind.rebuilds_package() {
            let package = self
                .inner
                .builder
                .build_package(
                    &request.spec,
                    &request.runtime,
                    &request.resolved_dependencies,
                    &request.build_id,
                )
                .await?;
            ctx.package = Some(package);
        }
        Ok(())
    }

    async fn provision(&self, ctx: &mut RunContext<'_>) -> OrchestratorResult<()> {
        let request = ctx.request;
        let deployment = Deployment {
            spec: &request.spec,
            runtime: &request.runtime,
        };
        if let Some(package) = ctx.package.clone() {
            let version = self.inner.provisioner.deploy(&deployment, &package).await?;
            ctx.version = Some(version);
            self.inner
                .collector
                .schedule(&request.spec.id.resource_name())
                .await;
        } else if request.plan.build == BuildKind::ConfigurationUpdate {
            let previous = ctx.previous_package();
            let version = self
                .inner
                .provisioner
                .reconfigure(&deployment, previous.as_ref())
                .await?;
            ctx.version = Some(version);
        }
        Ok(())
    }

    async fn schedule(&self, ctx: &mut RunContext<'_>) -> OrchestratorResult<()> {
        let request = ctx.request;
        ctx.enqueued = self
            .inner
            .schedules
            .apply(request.plan.cron, &request.spec, Utc::now())
            .await?;
        Ok(())
    }

    async fn reconcile_tasks(&self, ctx: &mut RunContext<'_>) -> OrchestratorResult<()> {
        let request = ctx.request;
        if request.plan.task != TaskPlan::Update {
            return Ok(());
        }
        let existing = ctx
            .existing
            .map(|record| record.task_bindings.as_slice())
            .unwrap_or_default();
        ctx.task_bindings = self
            .inner
            .tasks
            .reconcile(&request.spec.id, &request.spec.task_routes(), existing)
            .await?;
        Ok(())
    }

    fn commit(&self, record: &FunctionRecord) -> OrchestratorResult<()> {
        self.inner.state.put_function(record)?;
        self.inner.state.put_tags(&FunctionTags::from_record(record))?;
        Ok(())
    }

    // ── Polling ────────────────────────────────────────────────────

    pub fn poll(&self, build_id: &str) -> OrchestratorResult<BuildStatus> {
        self.inner
            .state
            .get_build(build_id)?
            .ok_or_else(|| OrchestratorError::BuildNotFound(build_id.to_string()))
    }

    /// Poll until the build reaches a terminal status or `timeout` passes.
    pub async fn wait_for(
        &self,
        build_id: &str,
        timeout: Duration,
    ) -> OrchestratorResult<BuildStatus> {
        let started = Instant::now();
        loop {
            let status = self.poll(build_id)?;
            if status.is_terminal() {
                return Ok(status);
            }
            if started.elapsed() >= timeout {
                return Err(OrchestratorError::WaitTimeout {
                    build_id: build_id.to_string(),
                    waited: started.elapsed(),
                });
            }
            sleep(WAIT_INTERVAL).await;
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Re-run build requests left behind by an interrupted process.
    ///
    /// Requests whose status is already terminal are dropped. Returns the
    /// number of builds re-run.
    pub async fn resume_pending(&self) -> OrchestratorResult<usize> {
        let state = &self.inner.state;
        let mut resumed = 0;
        for request in state.list_build_requests()? {
            match state.get_build(&request.build_id)? {
                Some(status) if status.is_terminal() => {
                    debug!(build_id = %request.build_id, "dropping finished build request");
                    state.delete_build_request(&request.build_id)?;
                }
                _ => {
                    info!(
                        build_id = %request.build_id,
                        function = %request.function().table_key(),
                        "resuming interrupted build"
                    );
                    resumed += 1;
                    let build_id = request.build_id.clone();
                    if let Err(e) = self.execute(request).await {
                        warn!(build_id = %build_id, error = %e, "resumed build failed");
                    }
                }
            }
        }
        Ok(resumed)
    }

    pub fn collector(&self) -> &VersionCollector {
        &self.inner.collector
    }

    /// Cancel pending version sweeps.
    pub async fn shutdown(&self) {
        self.inner.collector.stop_all().await;
    }
}
