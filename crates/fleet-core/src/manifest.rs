//! `package.json` parsing.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::spec::CodeSpec;

pub const MANIFEST_FILE: &str = "package.json";

/// The parts of a function's package manifest the control plane reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageManifest {
    /// Dependency name → requested range.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub engines: Engines,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Engines {
    /// Engine version constraint, e.g. `>=18`.
    #[serde(default)]
    pub node: Option<String>,
}

impl PackageManifest {
    /// Read the manifest from the function's code. A function without a
    /// `package.json` has no dependencies.
    pub fn from_code(code: &CodeSpec) -> CoreResult<Self> {
        match code.read(MANIFEST_FILE)? {
            Some(bytes) => Self::parse(&bytes),
            None => Ok(Self::default()),
        }
    }

    pub fn parse(bytes: &[u8]) -> CoreResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::InvalidManifest(e.to_string()))?;
        if !value.is_object() {
            return Err(CoreError::InvalidManifest("expected an object".into()));
        }
        serde_json::from_value(value).map_err(|e| CoreError::InvalidManifest(e.to_string()))
    }

    pub fn engine_constraint(&self) -> Option<&str> {
        self.engines.node.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_manifest_means_no_dependencies() {
        let manifest = PackageManifest::from_code(&CodeSpec::default()).unwrap();
        assert!(manifest.dependencies.is_empty());
        assert!(manifest.engine_constraint().is_none());
    }

    #[test]
    fn dependencies_and_engine() {
        let manifest = PackageManifest::parse(
            br#"{"name":"x","dependencies":{"superagent":"^6.1.0"},"engines":{"node":" >=16 "}}"#,
        )
        .unwrap();
        assert_eq!(manifest.dependencies["superagent"], "^6.1.0");
        assert_eq!(manifest.engine_constraint(), Some(">=16"));
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(
            PackageManifest::parse(b"\"text\""),
            Err(CoreError::InvalidManifest(_))
        ));
        assert!(PackageManifest::parse(b"{not json").is_err());
        assert!(PackageManifest::parse(br#"{"dependencies":[1]}"#).is_err());
    }
}
