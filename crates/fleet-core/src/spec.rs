//! Function specification — the desired state submitted for deployment.
//!
//! A `FunctionSpecification` arrives already validated and authorized by
//! the caller. The orchestrator resolves defaults into it (runtime, memory,
//! timeout, timezone, serialized settings) before hashing, so the resolved
//! form is what gets persisted.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

// ── Identity ───────────────────────────────────────────────────────

/// Fully-qualified identity of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionId {
    pub account_id: String,
    pub subscription_id: String,
    pub boundary_id: String,
    pub function_id: String,
}

impl FunctionId {
    pub fn new(account: &str, subscription: &str, boundary: &str, function: &str) -> Self {
        Self {
            account_id: account.to_string(),
            subscription_id: subscription.to_string(),
            boundary_id: boundary.to_string(),
            function_id: function.to_string(),
        }
    }

    /// Composite key `{account}/{subscription}/{boundary}/{function}`.
    pub fn table_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.account_id, self.subscription_id, self.boundary_id, self.function_id
        )
    }

    /// Name of the compute resource backing this function.
    ///
    /// Provider names are length-limited, so the key is digested.
    pub fn resource_name(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.table_key().as_bytes()));
        format!("fn-{}", &digest[..40])
    }

    /// Stable short digest used to derive queue and marker names.
    pub fn short_digest(&self) -> String {
        let digest = hex::encode(Sha256::digest(self.table_key().as_bytes()));
        digest[..16].to_string()
    }

    /// Public location of the function's endpoint.
    pub fn location(&self) -> String {
        format!(
            "/v1/account/{}/subscription/{}/boundary/{}/function/{}",
            self.account_id, self.subscription_id, self.boundary_id, self.function_id
        )
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table_key())
    }
}

// ── Specification ──────────────────────────────────────────────────

/// Desired state of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpecification {
    #[serde(flatten)]
    pub id: FunctionId,
    #[serde(default)]
    pub code: CodeSpec,
    #[serde(default)]
    pub compute: ComputeSpec,
    /// Environment variables exposed to the function.
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub security: SecuritySpec,
    #[serde(default)]
    pub metadata: SpecMetadata,
    #[serde(default)]
    pub serialized: SerializedSettings,
}

impl FunctionSpecification {
    /// Paths of routes flagged for task dispatch, sorted.
    pub fn task_routes(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .routes
            .iter()
            .filter(|r| r.task.is_some())
            .map(|r| r.path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Every permission the function asks for: its own plus per-route grants.
    pub fn requested_permissions(&self) -> Vec<&Permission> {
        self.security
            .function_permissions
            .iter()
            .chain(self.routes.iter().flat_map(|r| r.permissions.iter().flatten()))
            .collect()
    }
}

/// Source files of the function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSpec {
    /// File name → content.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub encoding: CodeEncoding,
}

/// How file contents in a `CodeSpec` are encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeEncoding {
    #[default]
    Utf8,
    Base64,
}

impl CodeSpec {
    /// Decoded contents of a file, if present.
    pub fn read(&self, name: &str) -> CoreResult<Option<Vec<u8>>> {
        let Some(content) = self.files.get(name) else {
            return Ok(None);
        };
        match self.encoding {
            CodeEncoding::Utf8 => Ok(Some(content.as_bytes().to_vec())),
            CodeEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(content)
                .map(Some)
                .map_err(|e| CoreError::InvalidEncoding {
                    file: name.to_string(),
                    encoding: "base64",
                    reason: e.to_string(),
                }),
        }
    }
}

/// Compute resource settings. `None` fields take configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// Memory in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_size: Option<u32>,
    /// Timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub static_ip: bool,
}

/// Recurring invocation schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ScheduleSpec {
    pub fn timezone_or_utc(&self) -> &str {
        self.timezone.as_deref().unwrap_or("UTC")
    }
}

/// A sub-path exposed by the function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub path: String,
    /// Present when the route dispatches through a task queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<Permission>>,
}

/// Limits applied to a task-dispatching route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_running: Option<u32>,
}

/// Security requested for the function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    #[serde(default)]
    pub authentication: AuthenticationMode,
    /// Permissions a caller needs to invoke the function.
    #[serde(default)]
    pub authorization: Vec<Permission>,
    /// Permissions granted to the function itself.
    #[serde(default)]
    pub function_permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationMode {
    #[default]
    None,
    Optional,
    Required,
}

/// An `action` allowed on a `resource` prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub action: String,
    pub resource: String,
}

impl Permission {
    pub fn new(action: &str, resource: &str) -> Self {
        Self {
            action: action.to_string(),
            resource: resource.to_string(),
        }
    }

    /// Whether holding `self` is enough to hand out `requested`.
    ///
    /// Actions match exactly or through a trailing `*` wildcard
    /// (`function:*` covers `function:get`). Resources match by path
    /// prefix on segment boundaries.
    pub fn grants(&self, requested: &Permission) -> bool {
        let action_ok = match self.action.strip_suffix('*') {
            Some(prefix) => requested.action.starts_with(prefix),
            None => self.action == requested.action,
        };
        if !action_ok {
            return false;
        }
        let held = normalize_resource(&self.resource);
        let wanted = normalize_resource(&requested.resource);
        wanted.starts_with(&held)
    }
}

fn normalize_resource(resource: &str) -> String {
    if resource.ends_with('/') {
        resource.to_string()
    } else {
        format!("{resource}/")
    }
}

/// Free-form metadata. Never affects the compute resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecMetadata {
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Opaque editor state kept alongside the function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<serde_json::Value>,
}

/// Dotenv-style text forms of configuration, compute, and schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// Parse dotenv-style `KEY=VALUE` text. Blank lines and `#` comments are skipped.
pub fn parse_serialized(text: &str) -> Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    for (n, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| format!("line {} is not a KEY=VALUE pair", n + 1))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("line {} has an empty key", n + 1));
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    Ok(out)
}

/// Render a map as dotenv-style text with sorted keys.
pub fn render_serialized(values: &BTreeMap<String, String>) -> String {
    values
        .iter()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_key_and_resource_name() {
        let id = FunctionId::new("acc-1", "sub-1", "bnd", "hello");
        assert_eq!(id.table_key(), "acc-1/sub-1/bnd/hello");
        let name = id.resource_name();
        assert!(name.starts_with("fn-"));
        assert_eq!(name.len(), 43);
        assert_eq!(name, FunctionId::new("acc-1", "sub-1", "bnd", "hello").resource_name());
    }

    #[test]
    fn permission_wildcard_and_prefix() {
        let held = Permission::new("function:*", "/account/acc-1/subscription/sub-1/");
        assert!(held.grants(&Permission::new(
            "function:get",
            "/account/acc-1/subscription/sub-1/boundary/b/"
        )));
        assert!(!held.grants(&Permission::new(
            "storage:get",
            "/account/acc-1/subscription/sub-1/"
        )));
        // Segment boundaries matter: sub-10 is not under sub-1.
        assert!(!held.grants(&Permission::new(
            "function:get",
            "/account/acc-1/subscription/sub-10"
        )));
    }

    #[test]
    fn base64_code_is_decoded() {
        let mut code = CodeSpec {
            encoding: CodeEncoding::Base64,
            ..Default::default()
        };
        code.files.insert("index.js".into(), "aGVsbG8=".into());
        assert_eq!(code.read("index.js").unwrap().unwrap(), b"hello");
        code.files.insert("bad.js".into(), "!!!".into());
        assert!(matches!(
            code.read("bad.js"),
            Err(CoreError::InvalidEncoding { .. })
        ));
        assert!(code.read("missing.js").unwrap().is_none());
    }

    #[test]
    fn serialized_settings_roundtrip_and_errors() {
        let parsed = parse_serialized("# comment\nB=2\n\nA = 1\n").unwrap();
        assert_eq!(parsed.get("A").map(String::as_str), Some("1"));
        assert_eq!(render_serialized(&parsed), "A=1\nB=2\n");
        assert!(parse_serialized("NOEQUALS").is_err());
        assert!(parse_serialized("=value").is_err());
    }

    #[test]
    fn task_routes_are_sorted_and_deduplicated() {
        let route = |path: &str, task: bool| RouteSpec {
            path: path.into(),
            task: task.then(TaskSettings::default),
            permissions: None,
        };
        let spec: FunctionSpecification = serde_json::from_value(serde_json::json!({
            "accountId": "a", "subscriptionId": "s", "boundaryId": "b", "functionId": "f"
        }))
        .unwrap();
        let spec = FunctionSpecification {
            routes: vec![
                route("/z", true),
                route("/a", true),
                route("/m", false),
                route("/a", true),
            ],
            ..spec
        };
        assert_eq!(spec.task_routes(), vec!["/a".to_string(), "/z".to_string()]);
    }
}
