//! In-process provider implementations.
//!
//! Used by the daemon's local mode and by tests. Every mutating call is
//! appended to a call log, failures can be injected per operation, and the
//! compute fake can be told to stay mid-update for a number of polls.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use crate::compute::*;
use crate::error::{ErrorKind, ProviderError, ProviderResult};
use crate::queue::*;
use crate::storage::ObjectStore;
use crate::token::{TokenIssuer, TokenScope};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Fault injection ────────────────────────────────────────────────

/// Queued failures keyed by operation name, consumed one per call.
#[derive(Default)]
struct Faults(Mutex<HashMap<String, VecDeque<ProviderError>>>);

impl Faults {
    fn push(&self, operation: &str, error: ProviderError) {
        lock(&self.0)
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    fn take(&self, operation: &str) -> ProviderResult<()> {
        match lock(&self.0).get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Append-only log of mutating calls, `"{operation} {target}"`.
#[derive(Default)]
struct CallLog(Mutex<Vec<String>>);

impl CallLog {
    fn record(&self, operation: &str, target: &str) {
        lock(&self.0).push(format!("{operation} {target}"));
    }

    fn snapshot(&self) -> Vec<String> {
        lock(&self.0).clone()
    }
}

// ── Compute ────────────────────────────────────────────────────────

pub type InvokeHandler =
    Arc<dyn Fn(&str, &serde_json::Value) -> ProviderResult<InvokeOutcome> + Send + Sync>;

struct FunctionSlot {
    configuration: ComputeConfiguration,
    code: CodeArtifact,
    /// Polls left before the last mutation settles.
    settling: u32,
    versions: BTreeMap<u64, DateTime<Utc>>,
    next_version: u64,
    modified: DateTime<Utc>,
}

impl FunctionSlot {
    fn observe(&self, name: &str) -> ComputeFunction {
        let (state, last_update) = if self.settling > 0 {
            (ResourceState::Pending, UpdateStatus::InProgress)
        } else {
            (ResourceState::Active, UpdateStatus::Successful)
        };
        ComputeFunction {
            name: name.to_string(),
            configuration: self.configuration.clone(),
            state,
            last_update,
            state_reason: None,
        }
    }
}

/// Compute provider holding functions in memory.
pub struct MemoryCompute {
    functions: Mutex<BTreeMap<String, FunctionSlot>>,
    settle_polls: u32,
    invoke_latency: Duration,
    invoke_handler: RwLock<Option<InvokeHandler>>,
    invocations: Mutex<Vec<(String, serde_json::Value)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    faults: Faults,
    calls: CallLog,
}

impl MemoryCompute {
    pub fn new() -> Self {
        Self {
            functions: Mutex::new(BTreeMap::new()),
            settle_polls: 0,
            invoke_latency: Duration::ZERO,
            invoke_handler: RwLock::new(None),
            invocations: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            faults: Faults::default(),
            calls: CallLog::default(),
        }
    }

    /// Keep every mutated function mid-update for `polls` observations.
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Make every successful invocation take `latency`.
    pub fn with_invoke_latency(mut self, latency: Duration) -> Self {
        self.invoke_latency = latency;
        self
    }

    /// Most invocations observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_invoke_handler(&self, handler: InvokeHandler) {
        if let Ok(mut slot) = self.invoke_handler.write() {
            *slot = Some(handler);
        }
    }

    /// Fail the next call of `operation` with `error`.
    pub fn fail_next(&self, operation: &str, error: ProviderError) {
        self.faults.push(operation, error);
    }

    /// Mutating calls made so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.snapshot()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls.snapshot().len()
    }

    /// Invocations made so far, `(function, payload)`.
    pub fn invocations(&self) -> Vec<(String, serde_json::Value)> {
        lock(&self.invocations).clone()
    }

    pub fn function(&self, name: &str) -> Option<ComputeFunction> {
        lock(&self.functions).get(name).map(|slot| slot.observe(name))
    }

    pub fn code(&self, name: &str) -> Option<CodeArtifact> {
        lock(&self.functions).get(name).map(|slot| slot.code.clone())
    }

    /// Seed a published version with an explicit timestamp.
    pub fn insert_version(&self, name: &str, version: u64, modified: DateTime<Utc>) {
        if let Some(slot) = lock(&self.functions).get_mut(name) {
            slot.versions.insert(version, modified);
            slot.next_version = slot.next_version.max(version + 1);
        }
    }

    pub fn version_numbers(&self, name: &str) -> Vec<u64> {
        lock(&self.functions)
            .get(name)
            .map(|slot| slot.versions.keys().copied().collect())
            .unwrap_or_default()
    }

    fn with_slot<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FunctionSlot) -> ProviderResult<T>,
    ) -> ProviderResult<T> {
        let mut functions = lock(&self.functions);
        let slot = functions
            .get_mut(name)
            .ok_or_else(|| ProviderError::not_found(format!("function {name} not found")))?;
        f(slot)
    }

    /// Apply a mutation to a settled function.
    fn mutate<T>(
        &self,
        operation: &str,
        name: &str,
        f: impl FnOnce(&mut FunctionSlot) -> T,
    ) -> ProviderResult<T> {
        self.faults.take(operation)?;
        self.calls.record(operation, name);
        let settle = self.settle_polls;
        self.with_slot(name, |slot| {
            if slot.settling > 0 {
                return Err(ProviderError::conflict(format!(
                    "an update is in progress for function {name}"
                )));
            }
            let out = f(slot);
            slot.settling = settle;
            slot.modified = Utc::now();
            Ok(out)
        })
    }
}

impl Default for MemoryCompute {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeProvider for MemoryCompute {
    async fn get_function(&self, name: &str) -> ProviderResult<ComputeFunction> {
        self.faults.take("get_function")?;
        self.with_slot(name, |slot| {
            let observed = slot.observe(name);
            slot.settling = slot.settling.saturating_sub(1);
            Ok(observed)
        })
    }

    async fn create_function(
        &self,
        name: &str,
        config: &ComputeConfiguration,
        code: &CodeArtifact,
    ) -> ProviderResult<ComputeFunction> {
        self.faults.take("create_function")?;
        self.calls.record("create_function", name);
        let mut functions = lock(&self.functions);
        if functions.contains_key(name) {
            return Err(ProviderError::already_exists(format!("function {name} already exists")));
        }
        let slot = FunctionSlot {
            configuration: config.clone(),
            code: code.clone(),
            settling: self.settle_polls,
            versions: BTreeMap::new(),
            next_version: 1,
            modified: Utc::now(),
        };
        let observed = slot.observe(name);
        functions.insert(name.to_string(), slot);
        debug!(%name, "memory compute function created");
        Ok(observed)
    }

    async fn update_configuration(
        &self,
        name: &str,
        config: &ComputeConfiguration,
    ) -> ProviderResult<()> {
        self.mutate("update_configuration", name, |slot| {
            slot.configuration = config.clone();
        })
    }

    async fn update_code(&self, name: &str, code: &CodeArtifact) -> ProviderResult<()> {
        self.mutate("update_code", name, |slot| {
            slot.code = code.clone();
        })
    }

    async fn publish_version(&self, name: &str) -> ProviderResult<PublishedVersion> {
        let version = self.mutate("publish_version", name, |slot| {
            let version = slot.next_version;
            slot.next_version += 1;
            slot.versions.insert(version, Utc::now());
            version
        })?;
        // Publishing does not leave $LATEST mid-update.
        self.with_slot(name, |slot| {
            slot.settling = 0;
            Ok(())
        })?;
        Ok(PublishedVersion {
            version,
            state: ResourceState::Active,
        })
    }

    async fn get_version(&self, name: &str, version: u64) -> ProviderResult<PublishedVersion> {
        self.faults.take("get_version")?;
        self.with_slot(name, |slot| {
            if slot.versions.contains_key(&version) {
                Ok(PublishedVersion {
                    version,
                    state: ResourceState::Active,
                })
            } else {
                Err(ProviderError::not_found(format!("version {version} of {name} not found")))
            }
        })
    }

    async fn list_versions(&self, name: &str) -> ProviderResult<Vec<VersionInfo>> {
        self.faults.take("list_versions")?;
        self.with_slot(name, |slot| {
            let mut versions = vec![VersionInfo {
                version: LATEST_VERSION.to_string(),
                last_modified: slot.modified,
            }];
            versions.extend(slot.versions.iter().map(|(v, modified)| VersionInfo {
                version: v.to_string(),
                last_modified: *modified,
            }));
            Ok(versions)
        })
    }

    async fn delete_version(&self, name: &str, version: &str) -> ProviderResult<()> {
        self.faults.take("delete_version")?;
        self.calls.record("delete_version", &format!("{name}:{version}"));
        let number: u64 = version.parse().map_err(|_| {
            ProviderError::new(
                ErrorKind::Invalid,
                "InvalidParameter",
                format!("cannot delete version {version}"),
            )
        })?;
        self.with_slot(name, |slot| match slot.versions.remove(&number) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found(format!("version {version} of {name} not found"))),
        })
    }

    async fn delete_function(&self, name: &str) -> ProviderResult<()> {
        self.faults.take("delete_function")?;
        self.calls.record("delete_function", name);
        match lock(&self.functions).remove(name) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found(format!("function {name} not found"))),
        }
    }

    async fn invoke(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> ProviderResult<InvokeOutcome> {
        self.faults.take("invoke")?;
        self.with_slot(name, |slot| {
            if slot.settling > 0 {
                Err(ProviderError::conflict(format!("function {name} is not ready")))
            } else {
                Ok(())
            }
        })?;
        lock(&self.invocations).push((name.to_string(), payload.clone()));
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.invoke_latency.is_zero() {
            tokio::time::sleep(self.invoke_latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let handler = self.invoke_handler.read().ok().and_then(|h| h.clone());
        match handler {
            Some(handler) => handler(name, payload),
            None => Ok(InvokeOutcome {
                payload: json!({}),
                function_error: None,
            }),
        }
    }
}

// ── Object store ───────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    faults: Faults,
    calls: CallLog,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, operation: &str, error: ProviderError) {
        self.faults.push(operation, error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.snapshot()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls.snapshot().len()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> ProviderResult<()> {
        self.faults.take("put")?;
        self.calls.record("put", key);
        lock(&self.objects).insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, key: &str) -> ProviderResult<Option<Vec<u8>>> {
        self.faults.take("get")?;
        Ok(lock(&self.objects).get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> ProviderResult<Vec<String>> {
        self.faults.take("list")?;
        Ok(lock(&self.objects)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> ProviderResult<()> {
        self.faults.take("delete")?;
        self.calls.record("delete", key);
        lock(&self.objects).remove(key);
        Ok(())
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> ProviderResult<String> {
        Ok(format!("memory://{key}?method=PUT&expires={}", ttl.as_secs()))
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> ProviderResult<String> {
        Ok(format!("memory://{key}?method=GET&expires={}", ttl.as_secs()))
    }
}

// ── Queues ─────────────────────────────────────────────────────────

struct QueueSlot {
    spec: QueueSpec,
    messages: Vec<QueueMessage>,
    seen: HashSet<String>,
}

#[derive(Default)]
struct QueueState {
    queues: BTreeMap<String, QueueSlot>,
    dispatches: BTreeMap<String, DispatchSpec>,
}

/// Queue service holding queues, messages, and dispatch bindings in memory.
#[derive(Default)]
pub struct MemoryQueues {
    state: Mutex<QueueState>,
    faults: Faults,
    calls: CallLog,
}

impl MemoryQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, operation: &str, error: ProviderError) {
        self.faults.push(operation, error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.snapshot()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls.snapshot().len()
    }

    /// Messages accepted into `queue`, deduplicated.
    pub fn messages(&self, queue: &str) -> Vec<QueueMessage> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.messages.clone())
            .unwrap_or_default()
    }

    pub fn queue_handles(&self) -> Vec<String> {
        lock(&self.state).queues.keys().cloned().collect()
    }

    pub fn queue_kind(&self, handle: &str) -> Option<QueueKind> {
        lock(&self.state).queues.get(handle).map(|q| q.spec.kind)
    }

    pub fn dispatch_handles(&self) -> Vec<String> {
        lock(&self.state).dispatches.keys().cloned().collect()
    }

    /// Make sure `name` exists, outside the call log.
    pub fn ensure_queue(&self, name: &str, kind: QueueKind) -> String {
        let handle = queue_handle(name);
        lock(&self.state)
            .queues
            .entry(handle.clone())
            .or_insert_with(|| QueueSlot {
                spec: QueueSpec {
                    name: name.to_string(),
                    kind,
                },
                messages: Vec::new(),
                seen: HashSet::new(),
            });
        handle
    }
}

fn queue_handle(name: &str) -> String {
    format!("queue:{name}")
}

#[async_trait]
impl QueueProvider for MemoryQueues {
    async fn create_queue(&self, spec: &QueueSpec) -> ProviderResult<String> {
        self.faults.take("create_queue")?;
        self.calls.record("create_queue", &spec.name);
        Ok(self.ensure_queue(&spec.name, spec.kind))
    }

    async fn delete_queue(&self, handle: &str) -> ProviderResult<()> {
        self.faults.take("delete_queue")?;
        self.calls.record("delete_queue", handle);
        match lock(&self.state).queues.remove(handle) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found(format!("queue {handle} not found"))),
        }
    }

    async fn create_dispatch(&self, spec: &DispatchSpec) -> ProviderResult<String> {
        self.faults.take("create_dispatch")?;
        self.calls.record("create_dispatch", &spec.queue);
        let mut state = lock(&self.state);
        if !state.queues.contains_key(&spec.queue) {
            return Err(ProviderError::not_found(format!("queue {} not found", spec.queue)));
        }
        let handle = format!("dispatch:{}->{}", spec.queue, spec.dispatcher);
        state.dispatches.insert(handle.clone(), spec.clone());
        Ok(handle)
    }

    async fn delete_dispatch(&self, handle: &str) -> ProviderResult<()> {
        self.faults.take("delete_dispatch")?;
        self.calls.record("delete_dispatch", handle);
        match lock(&self.state).dispatches.remove(handle) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found(format!("dispatch {handle} not found"))),
        }
    }

    async fn send_batch(
        &self,
        queue: &str,
        messages: &[QueueMessage],
    ) -> ProviderResult<BatchOutcome> {
        self.faults.take("send_batch")?;
        if messages.len() > MAX_BATCH_SIZE {
            return Err(ProviderError::new(
                ErrorKind::Invalid,
                "TooManyEntriesInBatchRequest",
                format!("{} entries exceed the batch limit", messages.len()),
            ));
        }
        self.calls.record("send_batch", queue);
        let mut state = lock(&self.state);
        let slot = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| ProviderError::not_found(format!("queue {queue} not found")))?;
        let mut outcome = BatchOutcome::default();
        for message in messages {
            if slot.seen.insert(message.dedup_id.clone()) {
                slot.messages.push(message.clone());
            }
            outcome.accepted.push(message.id.clone());
        }
        Ok(outcome)
    }
}

// ── Tokens ─────────────────────────────────────────────────────────

/// Issues deterministic opaque tokens.
#[derive(Default)]
pub struct StaticTokenIssuer {
    issued: Mutex<Vec<TokenScope>>,
}

impl StaticTokenIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued(&self) -> usize {
        lock(&self.issued).len()
    }
}

#[async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn issue(&self, scope: &TokenScope) -> ProviderResult<String> {
        lock(&self.issued).push(scope.clone());
        Ok(format!(
            "tok-{}-{}-{}",
            scope.account_id,
            scope.subscription_id,
            scope.ttl.as_secs()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ComputeConfiguration {
        ComputeConfiguration {
            runtime: "nodejs18.x".into(),
            layers: vec![],
            memory_size: 128,
            timeout: 30,
            environment: BTreeMap::new(),
            vpc: None,
        }
    }

    fn code() -> CodeArtifact {
        CodeArtifact {
            location: "packages/fn-a.zip".into(),
        }
    }

    #[tokio::test]
    async fn compute_lifecycle_and_call_log() {
        let compute = MemoryCompute::new();
        compute.create_function("fn-a", &config(), &code()).await.unwrap();
        assert!(matches!(
            compute.create_function("fn-a", &config(), &code()).await,
            Err(e) if e.kind == ErrorKind::AlreadyExists
        ));

        let v1 = compute.publish_version("fn-a").await.unwrap();
        let v2 = compute.publish_version("fn-a").await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        let versions = compute.list_versions("fn-a").await.unwrap();
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[0].version, LATEST_VERSION);

        compute.delete_version("fn-a", "1").await.unwrap();
        assert_eq!(compute.version_numbers("fn-a"), vec![2]);
        assert_eq!(
            compute.delete_version("fn-a", "1").await.unwrap_err().kind,
            ErrorKind::NotFound
        );
        assert!(compute.mutation_count() >= 5);
    }

    #[tokio::test]
    async fn settling_functions_reject_updates_until_observed_ready() {
        let compute = MemoryCompute::new().with_settle_polls(2);
        let created = compute.create_function("fn-a", &config(), &code()).await.unwrap();
        assert!(!created.is_ready());

        let err = compute.update_code("fn-a", &code()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        assert!(!compute.get_function("fn-a").await.unwrap().is_ready());
        assert!(!compute.get_function("fn-a").await.unwrap().is_ready());
        assert!(compute.get_function("fn-a").await.unwrap().is_ready());
        compute.update_code("fn-a", &code()).await.unwrap();
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let compute = MemoryCompute::new();
        compute.fail_next("create_function", ProviderError::throttled("slow down"));
        assert!(compute.create_function("fn-a", &config(), &code()).await.is_err());
        assert!(compute.create_function("fn-a", &config(), &code()).await.is_ok());
    }

    #[tokio::test]
    async fn invoke_requires_function_and_uses_handler() {
        let compute = MemoryCompute::new();
        let err = compute.invoke("builder", &json!({})).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        compute.create_function("builder", &config(), &code()).await.unwrap();
        compute.set_invoke_handler(Arc::new(|_: &str, payload: &serde_json::Value| {
            Ok(InvokeOutcome {
                payload: payload.clone(),
                function_error: None,
            })
        }));
        let out = compute.invoke("builder", &json!({"name": "x"})).await.unwrap();
        assert_eq!(out.payload["name"], "x");
        assert_eq!(compute.invocations().len(), 1);
    }

    #[tokio::test]
    async fn queue_dedup_and_batch_limit() {
        let queues = MemoryQueues::new();
        let handle = queues
            .create_queue(&QueueSpec {
                name: "cron".into(),
                kind: QueueKind::Delayed,
            })
            .await
            .unwrap();
        let msg = |id: &str| QueueMessage {
            id: id.into(),
            dedup_id: format!("fn:{id}"),
            delay: Duration::from_secs(5),
            body: json!({}),
        };
        queues.send_batch(&handle, &[msg("1"), msg("2")]).await.unwrap();
        queues.send_batch(&handle, &[msg("2"), msg("3")]).await.unwrap();
        assert_eq!(queues.messages(&handle).len(), 3);

        let too_many: Vec<QueueMessage> = (0..11).map(|i| msg(&i.to_string())).collect();
        let err = queues.send_batch(&handle, &too_many).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn object_store_prefix_listing() {
        let store = MemoryObjectStore::new();
        store.put("cron/a/1", vec![]).await.unwrap();
        store.put("cron/a/2", vec![]).await.unwrap();
        store.put("cron/b/1", vec![]).await.unwrap();
        assert_eq!(store.list("cron/a/").await.unwrap().len(), 2);
        store.delete("cron/a/1").await.unwrap();
        store.delete("cron/a/1").await.unwrap();
        assert_eq!(store.list("cron/").await.unwrap().len(), 2);
        assert!(store.get("cron/a/1").await.unwrap().is_none());
    }
}
