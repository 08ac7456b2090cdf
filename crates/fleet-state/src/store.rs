//! StateStore — redb-backed persistence for the control plane.
//!
//! Typed accessors over functions, builds, build requests, artifact
//! metadata, and tags. Every write is a single-key upsert or delete in its
//! own transaction, so repeated or concurrent runs converge on the last
//! write instead of corrupting each other.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use fleet_core::{ArtifactMetadata, BuildStatus, FunctionId, artifact_key};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [FUNCTIONS, BUILDS, BUILD_REQUESTS, ARTIFACTS, TAGS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic access ─────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => decode(key, guard.value()).map(Some),
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix` (empty prefix lists everything).
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(key.value(), value.value())?);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Functions ──────────────────────────────────────────────────

    /// Insert or replace the record of a function.
    pub fn put_function(&self, record: &FunctionRecord) -> StateResult<()> {
        let key = record.table_key();
        self.put(FUNCTIONS, &key, record)?;
        debug!(%key, version = ?record.versions.function, "function record stored");
        Ok(())
    }

    pub fn get_function(&self, id: &FunctionId) -> StateResult<Option<FunctionRecord>> {
        self.get(FUNCTIONS, &id.table_key())
    }

    /// Functions of one boundary.
    pub fn list_functions(
        &self,
        account: &str,
        subscription: &str,
        boundary: &str,
    ) -> StateResult<Vec<FunctionRecord>> {
        self.scan(FUNCTIONS, &format!("{account}/{subscription}/{boundary}/"))
    }

    pub fn delete_function(&self, id: &FunctionId) -> StateResult<bool> {
        let key = id.table_key();
        let existed = self.remove(FUNCTIONS, &key)?;
        self.remove(TAGS, &key)?;
        debug!(%key, existed, "function record deleted");
        Ok(existed)
    }

    // ── Builds ─────────────────────────────────────────────────────

    pub fn put_build(&self, status: &BuildStatus) -> StateResult<()> {
        self.put(BUILDS, &status.build_id, status)?;
        debug!(build_id = %status.build_id, status = ?status.status, "build status stored");
        Ok(())
    }

    pub fn get_build(&self, build_id: &str) -> StateResult<Option<BuildStatus>> {
        self.get(BUILDS, build_id)
    }

    pub fn delete_build(&self, build_id: &str) -> StateResult<bool> {
        self.remove(BUILDS, build_id)
    }

    // ── Build requests ─────────────────────────────────────────────

    pub fn put_build_request(&self, request: &BuildRequest) -> StateResult<()> {
        self.put(BUILD_REQUESTS, &request.build_id, request)
    }

    pub fn get_build_request(&self, build_id: &str) -> StateResult<Option<BuildRequest>> {
        self.get(BUILD_REQUESTS, build_id)
    }

    pub fn list_build_requests(&self) -> StateResult<Vec<BuildRequest>> {
        self.scan(BUILD_REQUESTS, "")
    }

    pub fn delete_build_request(&self, build_id: &str) -> StateResult<bool> {
        let existed = self.remove(BUILD_REQUESTS, build_id)?;
        debug!(%build_id, existed, "build request deleted");
        Ok(existed)
    }

    // ── Artifacts ──────────────────────────────────────────────────

    pub fn put_artifact(&self, meta: &ArtifactMetadata) -> StateResult<()> {
        let key = meta.table_key();
        self.put(ARTIFACTS, &key, meta)?;
        debug!(
            %key,
            status = ?meta.status,
            failures = meta.failure_count,
            "artifact metadata stored"
        );
        Ok(())
    }

    pub fn get_artifact(
        &self,
        runtime: &str,
        name: &str,
        version: &str,
    ) -> StateResult<Option<ArtifactMetadata>> {
        self.get(ARTIFACTS, &artifact_key(runtime, name, version))
    }

    pub fn list_artifacts(&self, runtime: &str) -> StateResult<Vec<ArtifactMetadata>> {
        self.scan(ARTIFACTS, &format!("{runtime}/"))
    }

    // ── Tags ───────────────────────────────────────────────────────

    /// Replace the tag set of a function.
    pub fn put_tags(&self, tags: &FunctionTags) -> StateResult<()> {
        self.put(TAGS, &tags.function.table_key(), tags)
    }

    pub fn get_tags(&self, id: &FunctionId) -> StateResult<Option<FunctionTags>> {
        self.get(TAGS, &id.table_key())
    }

    /// Functions carrying tag `key`, optionally with a specific value.
    pub fn search_tags(&self, key: &str, value: Option<&str>) -> StateResult<Vec<FunctionId>> {
        let all: Vec<FunctionTags> = self.scan(TAGS, "")?;
        Ok(all
            .into_iter()
            .filter(|t| t.matches(key, value))
            .map(|t| t.function)
            .collect())
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Deserialize {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
