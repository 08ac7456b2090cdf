//! Schedule markers and imminent cron invocations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use fleet_core::config::{ConvergenceConfig, CronConfig};
use fleet_core::{CronPlan, FunctionId, FunctionSpecification, ScheduleSpec};
use fleet_provider::{
    ErrorKind, MAX_BATCH_SIZE, ObjectStore, QueueMessage, QueueProvider, RetryPolicy,
    retry_throttled,
};

use crate::error::{ScheduleError, ScheduleResult};
use crate::expression::CronSchedule;

/// Marker deletions in flight at once.
const DELETE_CONCURRENCY: usize = 5;

/// Marker body read by the periodic scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronMarker {
    #[serde(flatten)]
    pub function: FunctionId,
    pub cron: String,
    pub timezone: String,
}

pub struct ScheduleManager {
    objects: Arc<dyn ObjectStore>,
    queues: Arc<dyn QueueProvider>,
    config: CronConfig,
    provisioning: RetryPolicy,
    cleanup: RetryPolicy,
}

impl ScheduleManager {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        queues: Arc<dyn QueueProvider>,
        config: CronConfig,
        convergence: &ConvergenceConfig,
    ) -> Self {
        Self {
            objects,
            queues,
            config,
            provisioning: RetryPolicy::provisioning(convergence),
            cleanup: RetryPolicy::cleanup(convergence),
        }
    }

    /// Apply `plan` to the schedule of `spec`. Returns the number of
    /// invocations enqueued.
    pub async fn apply(
        &self,
        plan: CronPlan,
        spec: &FunctionSpecification,
        now: DateTime<Utc>,
    ) -> ScheduleResult<usize> {
        let function = &spec.id;
        match plan {
            CronPlan::None => return Ok(0),
            CronPlan::Cancel => {
                self.delete_markers(function).await?;
                info!(function = %function.table_key(), "schedule cancelled");
                return Ok(0);
            }
            CronPlan::Update => self.delete_markers(function).await?,
            CronPlan::Set => {}
        }
        let schedule = spec
            .schedule
            .as_ref()
            .ok_or_else(|| ScheduleError::MissingSchedule(function.table_key()))?;
        self.register(function, schedule).await?;
        let enqueued = self.enqueue_imminent(function, schedule, now).await?;
        info!(
            function = %function.table_key(),
            cron = %schedule.cron,
            ?plan,
            enqueued,
            "schedule registered"
        );
        Ok(enqueued)
    }

    async fn register(&self, function: &FunctionId, schedule: &ScheduleSpec) -> ScheduleResult<()> {
        let marker = CronMarker {
            function: function.clone(),
            cron: schedule.cron.clone(),
            timezone: schedule.timezone_or_utc().to_string(),
        };
        let key = marker_key(function, schedule);
        let body = serde_json::to_vec(&marker).map_err(|e| ScheduleError::EnqueueFailed {
            failed: 0,
            reason: e.to_string(),
        })?;
        let objects = self.objects.as_ref();
        retry_throttled(&self.provisioning, "put cron marker", || {
            objects.put(&key, body.clone())
        })
        .await
        .map_err(|e| ScheduleError::provider("put cron marker", e))?;
        debug!(%key, "cron marker written");
        Ok(())
    }

    async fn delete_markers(&self, function: &FunctionId) -> ScheduleResult<()> {
        let objects = self.objects.as_ref();
        let prefix = marker_prefix(function);
        let keys = retry_throttled(&self.cleanup, "list cron markers", || objects.list(&prefix))
            .await
            .map_err(|e| ScheduleError::provider("list cron markers", e))?;
        let removed = keys.len();

        stream::iter(keys.iter().map(Ok::<_, ScheduleError>))
            .try_for_each_concurrent(DELETE_CONCURRENCY, move |key: &String| async move {
                let deleted =
                    retry_throttled(&self.cleanup, "delete cron marker", || objects.delete(key))
                        .await;
                match deleted {
                    Err(e) if !e.is(ErrorKind::NotFound) => {
                        Err(ScheduleError::provider("delete cron marker", e))
                    }
                    _ => Ok(()),
                }
            })
            .await?;
        debug!(function = %function.table_key(), removed, "cron markers deleted");
        Ok(())
    }

    /// Enqueue the executions the periodic scheduler would otherwise miss.
    async fn enqueue_imminent(
        &self,
        function: &FunctionId,
        schedule: &ScheduleSpec,
        now: DateTime<Utc>,
    ) -> ScheduleResult<usize> {
        let parsed = CronSchedule::parse(&schedule.cron, schedule.timezone_or_utc())?;
        let fire_times = parsed.imminent(now, &self.config);
        if fire_times.is_empty() {
            return Ok(0);
        }

        let body = json!({
            "key": marker_key(function, schedule),
            "accountId": function.account_id,
            "subscriptionId": function.subscription_id,
            "boundaryId": function.boundary_id,
            "functionId": function.function_id,
            "cron": schedule.cron,
            "timezone": schedule.timezone,
        });
        let table_key = function.table_key();
        let entries: Vec<QueueMessage> = fire_times
            .iter()
            .map(|at| {
                let fire_ms = at.timestamp_millis();
                let delay_ms = (fire_ms - now.timestamp_millis()).max(0) as u64;
                QueueMessage {
                    id: fire_ms.to_string(),
                    dedup_id: format!("{table_key}:{fire_ms}"),
                    delay: Duration::from_secs(delay_ms / 1000),
                    body: body.clone(),
                }
            })
            .collect();

        let batch_size = self.config.batch_size.clamp(1, MAX_BATCH_SIZE);
        let queues = self.queues.as_ref();
        let queue = self.config.queue.as_str();
        for batch in entries.chunks(batch_size) {
            let outcome = retry_throttled(&self.provisioning, "enqueue cron executions", || {
                queues.send_batch(queue, batch)
            })
            .await
            .map_err(|e| ScheduleError::provider("enqueue cron executions", e))?;
            if !outcome.failed.is_empty() {
                warn!(
                    function = %table_key,
                    failed = outcome.failed.len(),
                    "cron executions rejected"
                );
                let reason = outcome
                    .failed
                    .iter()
                    .map(|(id, reason)| format!("{id}: {reason}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ScheduleError::EnqueueFailed {
                    failed: outcome.failed.len(),
                    reason,
                });
            }
        }
        Ok(entries.len())
    }
}

fn marker_prefix(function: &FunctionId) -> String {
    format!("cron/{}/", function.table_key())
}

fn marker_key(function: &FunctionId, schedule: &ScheduleSpec) -> String {
    let digest = Sha256::digest(format!("{}\n{}", schedule.cron, schedule.timezone_or_utc()));
    format!("{}{}", marker_prefix(function), &hex::encode(digest)[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleet_provider::QueueKind;
    use fleet_provider::memory::{MemoryObjectStore, MemoryQueues};

    struct Harness {
        objects: Arc<MemoryObjectStore>,
        queues: Arc<MemoryQueues>,
        queue: String,
        manager: ScheduleManager,
    }

    fn harness() -> Harness {
        let objects = Arc::new(MemoryObjectStore::new());
        let queues = Arc::new(MemoryQueues::new());
        let queue = queues.ensure_queue("cron-executor", QueueKind::Delayed);
        let config = CronConfig {
            queue: queue.clone(),
            ..Default::default()
        };
        let manager = ScheduleManager::new(
            objects.clone(),
            queues.clone(),
            config,
            &ConvergenceConfig::default(),
        );
        Harness {
            objects,
            queues,
            queue,
            manager,
        }
    }

    fn spec(cron: &str) -> FunctionSpecification {
        serde_json::from_value(json!({
            "accountId": "acc", "subscriptionId": "sub", "boundaryId": "bnd", "functionId": "tick",
            "schedule": { "cron": cron, "timezone": "UTC" }
        }))
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 3, 30).unwrap()
    }

    #[tokio::test]
    async fn set_registers_marker_and_enqueues() {
        let h = harness();
        let spec = spec("* * * * *");

        let enqueued = h.manager.apply(CronPlan::Set, &spec, now()).await.unwrap();
        assert_eq!(enqueued, 6);

        let markers = h.objects.keys();
        assert_eq!(markers.len(), 1);
        assert!(markers[0].starts_with("cron/acc/sub/bnd/tick/"));

        let messages = h.queues.messages(&h.queue);
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[0].delay, Duration::from_secs(30));
        assert_eq!(messages[0].body["functionId"], "tick");
    }

    #[tokio::test]
    async fn registering_twice_does_not_double_schedule() {
        let h = harness();
        let spec = spec("* * * * *");

        h.manager.apply(CronPlan::Set, &spec, now()).await.unwrap();
        h.manager.apply(CronPlan::Update, &spec, now()).await.unwrap();

        let messages = h.queues.messages(&h.queue);
        assert_eq!(messages.len(), 6);
        let mut dedup: Vec<_> = messages.iter().map(|m| m.dedup_id.clone()).collect();
        dedup.dedup();
        assert_eq!(dedup.len(), 6);
    }

    #[tokio::test]
    async fn update_replaces_markers() {
        let h = harness();
        h.manager.apply(CronPlan::Set, &spec("* * * * *"), now()).await.unwrap();
        h.manager
            .apply(CronPlan::Update, &spec("*/5 * * * *"), now())
            .await
            .unwrap();

        let markers = h.objects.keys();
        assert_eq!(markers.len(), 1);
        let spec = spec("*/5 * * * *");
        assert_eq!(markers[0], marker_key(&spec.id, spec.schedule.as_ref().unwrap()));
    }

    #[tokio::test]
    async fn cancel_removes_markers_and_enqueues_nothing() {
        let h = harness();
        let spec = spec("* * * * *");
        h.manager.apply(CronPlan::Set, &spec, now()).await.unwrap();
        let before = h.queues.messages(&h.queue).len();

        let enqueued = h.manager.apply(CronPlan::Cancel, &spec, now()).await.unwrap();
        assert_eq!(enqueued, 0);
        assert!(h.objects.keys().is_empty());
        assert_eq!(h.queues.messages(&h.queue).len(), before);
    }

    #[tokio::test]
    async fn entries_are_sent_in_batches() {
        let h = harness();
        // Every 20 seconds: 19 executions before 12:10.
        let spec = spec("*/20 * * * * *");

        let enqueued = h.manager.apply(CronPlan::Set, &spec, now()).await.unwrap();
        assert_eq!(enqueued, 19);
        let sends = h
            .queues
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("send_batch"))
            .count();
        assert_eq!(sends, 2);
    }

    #[tokio::test]
    async fn none_is_a_noop() {
        let h = harness();
        let enqueued = h.manager.apply(CronPlan::None, &spec("* * * * *"), now()).await.unwrap();
        assert_eq!(enqueued, 0);
        assert_eq!(h.objects.mutation_count(), 0);
        assert_eq!(h.queues.mutation_count(), 0);
    }
}
