//! Local mode: the orchestrator over a redb store and in-process providers.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use fleet_core::FleetConfig;
use fleet_deps::{HttpMirror, MemoryRegistry, PublicMirror};
use fleet_orchestrator::{Orchestrator, Providers};
use fleet_provider::QueueKind;
use fleet_provider::memory::{MemoryCompute, MemoryObjectStore, MemoryQueues, StaticTokenIssuer};
use fleet_state::StateStore;

const STATE_FILE: &str = "fleet.redb";

pub fn assemble(data_dir: &Path, config: &FleetConfig) -> anyhow::Result<Orchestrator> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(STATE_FILE);
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // The in-process queue service hands out its own handles.
    let queues = Arc::new(MemoryQueues::new());
    let mut config = config.clone();
    config.cron.queue = queues.ensure_queue(&config.cron.queue, QueueKind::Delayed);

    let mirrors: Vec<Arc<dyn PublicMirror>> = config
        .registry
        .mirrors
        .iter()
        .map(|url| {
            Arc::new(HttpMirror::new(url.as_str(), config.registry.deadline()))
                as Arc<dyn PublicMirror>
        })
        .collect();
    info!(mirrors = mirrors.len(), "public mirrors configured");

    let providers = Providers {
        compute: Arc::new(MemoryCompute::new()),
        objects: Arc::new(MemoryObjectStore::new()),
        queues,
        tokens: Arc::new(StaticTokenIssuer::new()),
        registry: Arc::new(MemoryRegistry::new("private", &[])),
        mirrors,
    };
    Ok(Orchestrator::new(providers, state, &config))
}
