//! Facet hashing — stable content digests per specification facet.
//!
//! Each facet is projected to JSON, canonicalized (object keys sorted,
//! set-like arrays sorted by the projection), and digested with SHA-256.
//! Two specifications that mean the same thing for a facet therefore hash
//! identically regardless of the order their fields or routes arrived in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::error::CoreResult;
use crate::manifest::PackageManifest;
use crate::spec::{FunctionSpecification, Permission};

/// One independently diffed aspect of a specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Code,
    Compute,
    Runtime,
    Dependencies,
    Configuration,
    Schedule,
    Security,
    Routes,
    Metadata,
    Editor,
    Serialized,
    Tasks,
}

impl Facet {
    pub const ALL: [Facet; 12] = [
        Facet::Code,
        Facet::Compute,
        Facet::Runtime,
        Facet::Dependencies,
        Facet::Configuration,
        Facet::Schedule,
        Facet::Security,
        Facet::Routes,
        Facet::Metadata,
        Facet::Editor,
        Facet::Serialized,
        Facet::Tasks,
    ];
}

/// Facet → content digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes(BTreeMap<Facet, String>);

impl Hashes {
    pub fn get(&self, facet: Facet) -> Option<&str> {
        self.0.get(&facet).map(String::as_str)
    }

    pub fn insert(&mut self, facet: Facet, digest: String) {
        self.0.insert(facet, digest);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `facet` differs from `previous`. A facet missing from
    /// `previous` compares as the empty digest.
    pub fn changed(&self, previous: &Hashes, facet: Facet) -> bool {
        let empty = empty_digest();
        let new = self.get(facet).unwrap_or(&empty);
        let old = previous.get(facet).unwrap_or(&empty);
        new != old
    }

    /// Whether `facet` holds the empty digest (or is missing).
    pub fn is_empty_facet(&self, facet: Facet) -> bool {
        self.get(facet).is_none_or(|d| d == empty_digest())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Facet, &str)> {
        self.0.iter().map(|(f, d)| (*f, d.as_str()))
    }
}

/// Digest of an absent facet.
pub fn empty_digest() -> String {
    digest(&Value::Null)
}

/// SHA-256 hex digest of the canonical JSON form of `value`.
pub fn digest(value: &Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Rebuild `value` with object keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn sorted_permissions(perms: &[Permission]) -> Vec<&Permission> {
    let mut sorted: Vec<&Permission> = perms.iter().collect();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// Compute every facet digest of a (resolved) specification.
///
/// Pure and deterministic. Fails only when the package manifest embedded
/// in the code is malformed.
pub fn compute_hashes(spec: &FunctionSpecification) -> CoreResult<Hashes> {
    let manifest = PackageManifest::from_code(&spec.code)?;
    let mut hashes = Hashes::default();

    hashes.insert(
        Facet::Code,
        digest(&json!({ "files": spec.code.files, "encoding": spec.code.encoding })),
    );
    hashes.insert(
        Facet::Compute,
        digest(&json!({
            "memorySize": spec.compute.memory_size,
            "timeout": spec.compute.timeout,
            "staticIp": spec.compute.static_ip,
        })),
    );
    hashes.insert(Facet::Runtime, digest(&json!({ "runtime": spec.compute.runtime })));
    hashes.insert(Facet::Dependencies, digest(&json!(manifest.dependencies)));
    hashes.insert(Facet::Configuration, digest(&json!(spec.configuration)));
    hashes.insert(
        Facet::Schedule,
        match &spec.schedule {
            Some(s) => digest(&json!({ "cron": s.cron.trim(), "timezone": s.timezone_or_utc() })),
            None => empty_digest(),
        },
    );
    hashes.insert(
        Facet::Security,
        digest(&json!({
            "authentication": spec.security.authentication,
            "authorization": sorted_permissions(&spec.security.authorization),
            "functionPermissions": sorted_permissions(&spec.security.function_permissions),
        })),
    );

    let mut routes: Vec<Value> = spec
        .routes
        .iter()
        .map(|r| {
            json!({
                "path": r.path,
                "task": r.task,
                "permissions": r.permissions.as_deref().map(sorted_permissions),
            })
        })
        .collect();
    routes.sort_by(|a, b| a["path"].as_str().cmp(&b["path"].as_str()));
    hashes.insert(Facet::Routes, digest(&Value::Array(routes)));

    hashes.insert(Facet::Metadata, digest(&json!(spec.metadata.tags)));
    hashes.insert(
        Facet::Editor,
        match &spec.metadata.editor {
            Some(editor) => digest(editor),
            None => empty_digest(),
        },
    );
    hashes.insert(Facet::Serialized, digest(&json!(spec.serialized)));

    let tasks = spec.task_routes();
    hashes.insert(
        Facet::Tasks,
        if tasks.is_empty() {
            empty_digest()
        } else {
            digest(&json!(tasks))
        },
    );

    Ok(hashes)
}
