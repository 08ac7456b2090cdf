//! Task queue provisioner.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::{join, join_all};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use fleet_core::config::{ConvergenceConfig, TasksConfig};
use fleet_core::{FunctionId, TaskQueueBinding};
use fleet_provider::{
    DispatchSpec, ErrorKind, MAX_BATCH_SIZE, ProviderResult, QueueKind, QueueProvider, QueueSpec,
    RetryPolicy, retry_throttled,
};

use crate::error::{ScheduleError, ScheduleResult};

pub struct TaskQueueProvisioner {
    queues: Arc<dyn QueueProvider>,
    config: TasksConfig,
    provisioning: RetryPolicy,
    cleanup: RetryPolicy,
}

impl TaskQueueProvisioner {
    pub fn new(
        queues: Arc<dyn QueueProvider>,
        config: TasksConfig,
        convergence: &ConvergenceConfig,
    ) -> Self {
        Self {
            queues,
            config,
            provisioning: RetryPolicy::provisioning(convergence),
            cleanup: RetryPolicy::cleanup(convergence),
        }
    }

    /// Bring the queues of `function` in line with `routes`.
    ///
    /// Routes already bound keep their handles. New routes get an ordered
    /// and a delayed queue, both wired to the dispatcher. Routes no longer
    /// listed lose theirs. Returns the bindings sorted by route path.
    pub async fn reconcile(
        &self,
        function: &FunctionId,
        routes: &[String],
        existing: &[TaskQueueBinding],
    ) -> ScheduleResult<Vec<TaskQueueBinding>> {
        let desired: BTreeSet<&str> = routes.iter().map(String::as_str).collect();
        let bound: BTreeSet<&str> = existing.iter().map(|b| b.route_path.as_str()).collect();

        let mut bindings: Vec<TaskQueueBinding> = existing
            .iter()
            .filter(|b| desired.contains(b.route_path.as_str()))
            .cloned()
            .collect();
        let removed: Vec<&TaskQueueBinding> = existing
            .iter()
            .filter(|b| !desired.contains(b.route_path.as_str()))
            .collect();
        let added: Vec<&str> = desired.difference(&bound).copied().collect();

        let mut created = Vec::with_capacity(added.len());
        let mut failure = None;
        let attempts = join_all(added.iter().map(|route| self.create_binding(function, route)));
        for result in attempts.await {
            match result {
                Ok(binding) => created.push(binding),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            warn!(
                function = %function.table_key(),
                created = created.len(),
                error = %e,
                "task queue creation failed, rolling back"
            );
            for binding in &created {
                if let Err(cleanup) = self.delete_binding(binding).await {
                    warn!(
                        route = %binding.route_path,
                        error = %cleanup,
                        "task queue rollback failed"
                    );
                }
            }
            return Err(e);
        }
        bindings.extend(created);

        for result in join_all(removed.iter().map(|b| self.delete_binding(b))).await {
            result?;
        }

        info!(
            function = %function.table_key(),
            added = added.len(),
            removed = removed.len(),
            kept = bindings.len() - added.len(),
            "task queues reconciled"
        );
        if !added.is_empty() {
            // New ordered queues are not immediately usable.
            let delay = self.config.propagation_delay();
            debug!(?delay, "waiting for queue propagation");
            tokio::time::sleep(delay).await;
        }

        bindings.sort_by(|a, b| a.route_path.cmp(&b.route_path));
        Ok(bindings)
    }

    async fn create_binding(
        &self,
        function: &FunctionId,
        route: &str,
    ) -> ScheduleResult<TaskQueueBinding> {
        let base = queue_base_name(function, route);
        let ordered = QueueSpec {
            name: format!("{base}-ordered"),
            kind: QueueKind::Ordered,
        };
        let delayed = QueueSpec {
            name: format!("{base}-delayed"),
            kind: QueueKind::Delayed,
        };
        let (ordered_queue, delayed_queue) =
            match join(self.create_queue(&ordered), self.create_queue(&delayed)).await {
                (Ok(ordered), Ok(delayed)) => (ordered, delayed),
                (Ok(made), Err(e)) | (Err(e), Ok(made)) => {
                    self.discard(&[], &[made]).await;
                    return Err(e);
                }
                (Err(e), Err(_)) => return Err(e),
            };

        let dispatches = join(
            self.create_dispatch(&ordered_queue, 1),
            self.create_dispatch(&delayed_queue, MAX_BATCH_SIZE as u32),
        )
        .await;
        let (ordered_dispatch, delayed_dispatch) = match dispatches {
            (Ok(ordered), Ok(delayed)) => (ordered, delayed),
            (Ok(made), Err(e)) | (Err(e), Ok(made)) => {
                self.discard(&[made], &[ordered_queue, delayed_queue]).await;
                return Err(e);
            }
            (Err(e), Err(_)) => {
                self.discard(&[], &[ordered_queue, delayed_queue]).await;
                return Err(e);
            }
        };

        debug!(%route, %ordered_queue, %delayed_queue, "task queues created");
        Ok(TaskQueueBinding {
            route_path: route.to_string(),
            ordered_queue,
            delayed_queue,
            ordered_dispatch,
            delayed_dispatch,
        })
    }

    async fn create_queue(&self, spec: &QueueSpec) -> ScheduleResult<String> {
        let queues = self.queues.as_ref();
        retry_throttled(&self.provisioning, "create queue", || queues.create_queue(spec))
            .await
            .map_err(|e| ScheduleError::provider("create queue", e))
    }

    async fn create_dispatch(&self, queue: &str, batch_size: u32) -> ScheduleResult<String> {
        let spec = DispatchSpec {
            queue: queue.to_string(),
            dispatcher: self.config.dispatcher.clone(),
            batch_size,
        };
        let queues = self.queues.as_ref();
        retry_throttled(&self.provisioning, "create dispatch", || queues.create_dispatch(&spec))
            .await
            .map_err(|e| ScheduleError::provider("create dispatch", e))
    }

    /// Best-effort removal of a half-created binding.
    async fn discard(&self, dispatches: &[String], queues: &[String]) {
        for dispatch in dispatches {
            if let Err(e) = self.queues.delete_dispatch(dispatch).await {
                warn!(%dispatch, error = %e, "failed to discard dispatch");
            }
        }
        for queue in queues {
            if let Err(e) = self.queues.delete_queue(queue).await {
                warn!(%queue, error = %e, "failed to discard queue");
            }
        }
    }

    /// Dispatch bindings go first so nothing reads from a queue being deleted.
    async fn delete_binding(&self, binding: &TaskQueueBinding) -> ScheduleResult<()> {
        let queues = self.queues.as_ref();
        for dispatch in [&binding.ordered_dispatch, &binding.delayed_dispatch] {
            let result = retry_throttled(&self.cleanup, "delete dispatch", || {
                queues.delete_dispatch(dispatch)
            })
            .await;
            tolerate_missing(result, "delete dispatch", dispatch)?;
        }
        for queue in [&binding.ordered_queue, &binding.delayed_queue] {
            let result =
                retry_throttled(&self.cleanup, "delete queue", || queues.delete_queue(queue)).await;
            tolerate_missing(result, "delete queue", queue)?;
        }
        debug!(route = %binding.route_path, "task queues deleted");
        Ok(())
    }
}

fn tolerate_missing(
    result: ProviderResult<()>,
    operation: &'static str,
    handle: &str,
) -> ScheduleResult<()> {
    match result {
        Err(e) if e.is(ErrorKind::NotFound) => {
            warn!(%handle, "{operation}: already gone");
            Ok(())
        }
        other => other.map_err(|e| ScheduleError::provider(operation, e)),
    }
}

/// `task-{function digest}-{route digest}`, stable per function and route.
fn queue_base_name(function: &FunctionId, route: &str) -> String {
    let route_digest = hex::encode(Sha256::digest(route.as_bytes()));
    format!("task-{}-{}", function.short_digest(), &route_digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_provider::ProviderError;
    use fleet_provider::memory::MemoryQueues;
    use std::time::Duration;
    use tokio::time::Instant;

    fn function() -> FunctionId {
        FunctionId::new("acc", "sub", "bnd", "worker")
    }

    fn routes(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    fn provisioner(queues: Arc<MemoryQueues>) -> TaskQueueProvisioner {
        TaskQueueProvisioner::new(queues, TasksConfig::default(), &ConvergenceConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn new_routes_get_a_queue_pair() {
        let queues = Arc::new(MemoryQueues::new());
        let p = provisioner(queues.clone());

        let bindings = p.reconcile(&function(), &routes(&["/a"]), &[]).await.unwrap();
        assert_eq!(bindings.len(), 1);
        let a = &bindings[0];
        assert_eq!(queues.queue_kind(&a.ordered_queue), Some(QueueKind::Ordered));
        assert_eq!(queues.queue_kind(&a.delayed_queue), Some(QueueKind::Delayed));
        assert!(a.ordered_dispatch.ends_with("->task-dispatcher"));
        assert_eq!(queues.dispatch_handles().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn diff_touches_only_changed_routes() {
        let queues = Arc::new(MemoryQueues::new());
        let p = provisioner(queues.clone());
        let f = function();
        let before = p.reconcile(&f, &routes(&["/a", "/b"]), &[]).await.unwrap();
        let calls_before = queues.calls().len();

        let after = p.reconcile(&f, &routes(&["/b", "/c"]), &before).await.unwrap();

        let paths: Vec<&str> = after.iter().map(|b| b.route_path.as_str()).collect();
        assert_eq!(paths, vec!["/b", "/c"]);
        assert_eq!(after[0], before[1]);

        let new_calls = &queues.calls()[calls_before..];
        let a = &before[0];
        assert!(new_calls.contains(&format!("delete_queue {}", a.ordered_queue)));
        assert!(new_calls.contains(&format!("delete_dispatch {}", a.delayed_dispatch)));
        let b = &before[1];
        assert!(!new_calls.iter().any(|c| c.contains(&b.ordered_queue)));
        let creates = new_calls.iter().filter(|c| c.starts_with("create_queue")).count();
        assert_eq!(creates, 2);
        assert_eq!(queues.queue_handles().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_propagation_only_when_adding() {
        let queues = Arc::new(MemoryQueues::new());
        let p = provisioner(queues.clone());
        let f = function();

        let started = Instant::now();
        let bound = p.reconcile(&f, &routes(&["/a"]), &[]).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));

        let started = Instant::now();
        p.reconcile(&f, &routes(&[]), &bound).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(queues.queue_handles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_queues_do_not_block_teardown() {
        let queues = Arc::new(MemoryQueues::new());
        let p = provisioner(queues.clone());
        let f = function();
        let bound = p.reconcile(&f, &routes(&["/a"]), &[]).await.unwrap();
        queues.fail_next(
            "delete_queue",
            fleet_provider::ProviderError::not_found("already deleted"),
        );

        let after = p.reconcile(&f, &routes(&[]), &bound).await.unwrap();
        assert!(after.is_empty());
    }

    #[test]
    fn queue_names_are_stable() {
        let f = function();
        assert_eq!(queue_base_name(&f, "/a"), queue_base_name(&f, "/a"));
        assert_ne!(queue_base_name(&f, "/a"), queue_base_name(&f, "/b"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_queue_creation_leaves_nothing_behind() {
        let queues = Arc::new(MemoryQueues::new());
        let p = provisioner(queues.clone());
        queues.fail_next(
            "create_queue",
            ProviderError::new(ErrorKind::Unavailable, "ServiceUnavailable", "down"),
        );

        let err = p.reconcile(&function(), &routes(&["/a", "/b"]), &[]).await.unwrap_err();
        assert!(matches!(err, ScheduleError::Provider { .. }));
        assert!(queues.queue_handles().is_empty());
        assert!(queues.dispatch_handles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dispatch_creation_leaves_nothing_behind() {
        let queues = Arc::new(MemoryQueues::new());
        let p = provisioner(queues.clone());
        queues.fail_next(
            "create_dispatch",
            ProviderError::new(ErrorKind::Unavailable, "ServiceUnavailable", "down"),
        );

        p.reconcile(&function(), &routes(&["/a", "/b"]), &[]).await.unwrap_err();
        assert!(queues.queue_handles().is_empty());
        assert!(queues.dispatch_handles().is_empty());
    }
}
