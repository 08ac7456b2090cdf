//! Version garbage collector — delayed sweeps of superseded versions.
//!
//! Every successful code or runtime update schedules one sweep per
//! function. Scheduling again replaces the pending sweep rather than
//! adding a second timer. All pending sweeps are cancelled on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleet_core::config::{ConvergenceConfig, GcConfig};
use fleet_provider::{ComputeProvider, ErrorKind, LATEST_VERSION, RetryPolicy, retry_throttled};

use crate::error::{ComputeError, ComputeResult};

/// Per-function sweep state.
struct SweepSlot {
    generation: u64,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
struct Sweeper {
    compute: Arc<dyn ComputeProvider>,
    retention: Duration,
    retry: RetryPolicy,
}

/// Schedules and runs version sweeps.
pub struct VersionCollector {
    sweeper: Sweeper,
    latency: Duration,
    /// Pending sweeps: resource name → slot.
    sweeps: Arc<RwLock<HashMap<String, SweepSlot>>>,
    generation: AtomicU64,
}

impl VersionCollector {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        config: &GcConfig,
        convergence: &ConvergenceConfig,
    ) -> Self {
        Self {
            sweeper: Sweeper {
                compute,
                retention: config.retention(),
                retry: RetryPolicy::cleanup(convergence),
            },
            latency: config.latency(),
            sweeps: Arc::new(RwLock::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Sweep `resource` once the configured latency has passed.
    pub async fn schedule(&self, resource: &str) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let sweeper = self.sweeper.clone();
        let sweeps = self.sweeps.clone();
        let latency = self.latency;
        let resource_owned = resource.to_string();

        // Held across the spawn so the task cannot finish before its slot exists.
        let mut slots = self.sweeps.write().await;
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(latency) => {
                    if let Err(e) = sweeper.sweep(&resource_owned, Utc::now()).await {
                        warn!(resource = %resource_owned, error = %e, "version sweep failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!(resource = %resource_owned, "version sweep cancelled");
                }
            }
            let mut sweeps = sweeps.write().await;
            if sweeps
                .get(&resource_owned)
                .is_some_and(|slot| slot.generation == generation)
            {
                sweeps.remove(&resource_owned);
            }
        });

        if let Some(old) = slots.insert(
            resource.to_string(),
            SweepSlot {
                generation,
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        debug!(%resource, ?latency, "version sweep scheduled");
    }

    /// Cancel the pending sweep of `resource`, if any.
    pub async fn cancel(&self, resource: &str) {
        let mut sweeps = self.sweeps.write().await;
        if let Some(slot) = sweeps.remove(resource) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
    }

    /// Cancel every pending sweep (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut sweeps = self.sweeps.write().await;
        let pending = sweeps.len();
        for (_, slot) in sweeps.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
        info!(pending, "version sweeps cancelled");
    }

    pub async fn pending(&self) -> Vec<String> {
        let sweeps = self.sweeps.read().await;
        sweeps.keys().cloned().collect()
    }

    /// Sweep `resource` now. Returns the deleted version numbers.
    pub async fn sweep(&self, resource: &str, now: DateTime<Utc>) -> ComputeResult<Vec<u64>> {
        self.sweeper.sweep(resource, now).await
    }
}

impl Sweeper {
    /// Keep `$LATEST` and the highest version; delete every other version
    /// last modified before the retention window.
    async fn sweep(&self, resource: &str, now: DateTime<Utc>) -> ComputeResult<Vec<u64>> {
        let compute = self.compute.as_ref();
        let versions = match retry_throttled(&self.retry, "list versions", || {
            compute.list_versions(resource)
        })
        .await
        {
            Ok(versions) => versions,
            Err(e) if e.is(ErrorKind::NotFound) => {
                debug!(%resource, "function gone, nothing to sweep");
                return Ok(Vec::new());
            }
            Err(e) => return Err(ComputeError::provider("list versions", resource, e)),
        };

        let highest = versions.iter().filter_map(|v| v.number()).max();
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut deleted = Vec::new();

        for info in &versions {
            if info.version == LATEST_VERSION {
                continue;
            }
            let Some(number) = info.number() else {
                warn!(%resource, version = %info.version, "skipping unrecognised version");
                continue;
            };
            if Some(number) == highest || info.last_modified >= cutoff {
                continue;
            }
            let version = info.version.as_str();
            match retry_throttled(&self.retry, "delete version", || {
                compute.delete_version(resource, version)
            })
            .await
            {
                Ok(()) => deleted.push(number),
                Err(e) if e.is(ErrorKind::NotFound) => deleted.push(number),
                Err(e) => return Err(ComputeError::provider("delete version", resource, e)),
            }
        }

        info!(
            %resource,
            kept = versions.len() - deleted.len(),
            deleted = deleted.len(),
            "version sweep complete"
        );
        Ok(deleted)
    }
}
