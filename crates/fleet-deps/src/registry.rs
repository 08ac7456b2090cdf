//! Private registry interface and package version listings.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{DepsError, DepsResult};
use crate::mirror::PublicMirror;
use crate::range::NpmRange;

/// Published versions and dist-tags of one package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageVersions {
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
}

impl PackageVersions {
    pub fn max_satisfying(&self, range: &NpmRange) -> Option<String> {
        range.max_satisfying(self.versions.iter().map(String::as_str), &self.dist_tags)
    }
}

/// The private scoped registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Scopes (`@acme`) served by this registry.
    async fn scopes(&self) -> DepsResult<Vec<String>>;

    /// Best version of `name` satisfying `range`, if any.
    async fn max_satisfying(&self, name: &str, range: &str) -> DepsResult<Option<String>>;
}

/// Registry backed by an in-memory package table.
///
/// Serves as the private registry in local mode and as a public mirror in tests.
#[derive(Default)]
pub struct MemoryRegistry {
    label: String,
    scopes: Vec<String>,
    packages: RwLock<BTreeMap<String, PackageVersions>>,
}

impl MemoryRegistry {
    pub fn new(label: &str, scopes: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            packages: RwLock::new(BTreeMap::new()),
        }
    }

    /// Publish `versions` of `name`; the highest becomes `latest`.
    pub fn publish(&self, name: &str, versions: &[&str]) {
        let mut entry = PackageVersions {
            versions: versions.iter().map(|v| v.to_string()).collect(),
            dist_tags: BTreeMap::new(),
        };
        if let Some(latest) = NpmRange::parse(">=0.0.0")
            .ok()
            .and_then(|r| entry.max_satisfying(&r))
        {
            entry.dist_tags.insert("latest".to_string(), latest);
        }
        if let Ok(mut packages) = self.packages.write() {
            packages.insert(name.to_string(), entry);
        }
    }

    fn lookup(&self, name: &str) -> Option<PackageVersions> {
        self.packages.read().ok()?.get(name).cloned()
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn scopes(&self) -> DepsResult<Vec<String>> {
        Ok(self.scopes.clone())
    }

    async fn max_satisfying(&self, name: &str, range: &str) -> DepsResult<Option<String>> {
        let parsed = NpmRange::parse(range).map_err(|reason| DepsError::InvalidRange {
            name: name.to_string(),
            range: range.to_string(),
            reason,
        })?;
        Ok(self.lookup(name).and_then(|p| p.max_satisfying(&parsed)))
    }
}

#[async_trait]
impl PublicMirror for MemoryRegistry {
    fn name(&self) -> &str {
        &self.label
    }

    async fn versions(&self, package: &str) -> DepsResult<PackageVersions> {
        self.lookup(package)
            .ok_or_else(|| DepsError::Mirror(format!("{package} not found")))
    }
}
