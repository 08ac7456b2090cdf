//! Settings resolution.
//!
//! Turns the submitted specification into the form that is hashed and
//! persisted: serialized and structured settings merged, defaults applied,
//! identifiers, schedule and permissions validated, and the compute
//! runtime chosen from the package manifest.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use semver::Version;
use tracing::debug;

use fleet_core::config::ComputeConfig;
use fleet_core::{
    FunctionSpecification, PackageManifest, Permission, ResolvedRuntime, ScheduleSpec,
    parse_serialized, render_serialized,
};
use fleet_deps::NpmRange;
use fleet_schedule::CronSchedule;

use crate::error::{OrchestratorError, OrchestratorResult};

static BOUNDARY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9\-]{0,62}$").expect("valid regex"));
static FUNCTION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9\-_]{0,62}$").expect("valid regex"));

const MEMORY_SIZE: &str = "memorySize";
const TIMEOUT: &str = "timeout";
const STATIC_IP: &str = "staticIp";
const CRON: &str = "cron";
const TIMEZONE: &str = "timezone";

/// A specification ready for hashing.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub spec: FunctionSpecification,
    pub runtime: ResolvedRuntime,
    pub manifest: PackageManifest,
}

pub struct SettingsResolver {
    config: ComputeConfig,
}

impl SettingsResolver {
    pub fn new(config: ComputeConfig) -> Self {
        Self { config }
    }

    /// Resolve `spec` on behalf of a caller holding `caller_permissions`.
    pub fn resolve(
        &self,
        mut spec: FunctionSpecification,
        caller_permissions: &[Permission],
    ) -> OrchestratorResult<ResolvedSettings> {
        validate_ids(&spec)?;
        merge_configuration(&mut spec)?;
        self.merge_compute(&mut spec)?;
        merge_schedule(&mut spec)?;
        if let Some(schedule) = &spec.schedule {
            CronSchedule::parse(&schedule.cron, schedule.timezone_or_utc())?;
        }
        check_permissions(&spec, caller_permissions)?;

        let manifest = PackageManifest::from_code(&spec.code)?;
        let runtime = self.select_runtime(&spec, &manifest)?;
        spec.compute.runtime = Some(runtime.name.clone());
        debug!(function = %spec.id, runtime = %runtime.name, "settings resolved");
        Ok(ResolvedSettings {
            spec,
            runtime,
            manifest,
        })
    }

    fn merge_compute(&self, spec: &mut FunctionSpecification) -> OrchestratorResult<()> {
        let compute = &mut spec.compute;
        let structured_given =
            compute.memory_size.is_some() || compute.timeout.is_some() || compute.static_ip;
        let structured = (
            compute.memory_size.unwrap_or(self.config.memory_size),
            compute.timeout.unwrap_or(self.config.timeout),
            compute.static_ip,
        );

        let resolved = match &spec.serialized.compute {
            Some(text) => {
                let values = parse_text("compute", text)?;
                let serialized = (
                    parse_number(&values, MEMORY_SIZE)?.unwrap_or(self.config.memory_size),
                    parse_number(&values, TIMEOUT)?.unwrap_or(self.config.timeout),
                    parse_flag(&values, STATIC_IP)?,
                );
                if structured_given && serialized != structured {
                    return Err(disagree("compute"));
                }
                serialized
            }
            None => structured,
        };

        let (memory_size, timeout, static_ip) = resolved;
        compute.memory_size = Some(memory_size);
        compute.timeout = Some(timeout);
        compute.static_ip = static_ip;
        let mut values = BTreeMap::new();
        values.insert(MEMORY_SIZE.to_string(), memory_size.to_string());
        values.insert(TIMEOUT.to_string(), timeout.to_string());
        values.insert(STATIC_IP.to_string(), static_ip.to_string());
        spec.serialized.compute = Some(render_serialized(&values));
        Ok(())
    }

    /// The runtime whose engine best satisfies the manifest constraint;
    /// otherwise the requested runtime, otherwise the default.
    fn select_runtime(
        &self,
        spec: &FunctionSpecification,
        manifest: &PackageManifest,
    ) -> OrchestratorResult<ResolvedRuntime> {
        if let Some(constraint) = manifest.engine_constraint() {
            let range = NpmRange::parse(constraint).map_err(|reason| {
                OrchestratorError::Validation(format!(
                    "engines.node {constraint:?} is not a valid range: {reason}"
                ))
            })?;
            let best = self
                .config
                .runtimes
                .iter()
                .filter_map(|option| Version::parse(&option.engine).ok().map(|v| (v, option)))
                .filter(|(version, _)| range.matches(version))
                .max_by(|(a, _), (b, _)| a.cmp(b));
            return match best {
                Some((_, option)) => Ok(ResolvedRuntime {
                    name: option.name.clone(),
                    engine: Some(option.engine.clone()),
                    layers: option.layers.clone(),
                }),
                None => {
                    let supported: Vec<&str> =
                        self.config.runtimes.iter().map(|r| r.engine.as_str()).collect();
                    Err(OrchestratorError::Validation(format!(
                        "no supported runtime satisfies engines.node {constraint:?}; supported versions are {}",
                        supported.join(", ")
                    )))
                }
            };
        }

        let name = spec
            .compute
            .runtime
            .as_deref()
            .unwrap_or(&self.config.default_runtime);
        match self.config.runtime(name) {
            Some(option) => Ok(ResolvedRuntime {
                name: option.name.clone(),
                engine: Some(option.engine.clone()),
                layers: option.layers.clone(),
            }),
            None if name == self.config.default_runtime => Ok(ResolvedRuntime {
                name: name.to_string(),
                engine: None,
                layers: Vec::new(),
            }),
            None => Err(OrchestratorError::Validation(format!(
                "runtime {name} is not supported"
            ))),
        }
    }
}

fn validate_ids(spec: &FunctionSpecification) -> OrchestratorResult<()> {
    if !BOUNDARY_ID.is_match(&spec.id.boundary_id) {
        return Err(OrchestratorError::Validation(format!(
            "boundary id {:?} must match {}",
            spec.id.boundary_id,
            BOUNDARY_ID.as_str()
        )));
    }
    if !FUNCTION_ID.is_match(&spec.id.function_id) {
        return Err(OrchestratorError::Validation(format!(
            "function id {:?} must match {}",
            spec.id.function_id,
            FUNCTION_ID.as_str()
        )));
    }
    Ok(())
}

fn merge_configuration(spec: &mut FunctionSpecification) -> OrchestratorResult<()> {
    if let Some(text) = &spec.serialized.configuration {
        let parsed = parse_text("configuration", text)?;
        if !spec.configuration.is_empty() && parsed != spec.configuration {
            return Err(disagree("configuration"));
        }
        spec.configuration = parsed;
    }
    spec.serialized.configuration = Some(render_serialized(&spec.configuration));
    Ok(())
}

fn merge_schedule(spec: &mut FunctionSpecification) -> OrchestratorResult<()> {
    if let Some(text) = &spec.serialized.schedule {
        let values = parse_text("schedule", text)?;
        let serialized = match values.get(CRON) {
            Some(cron) => Some(ScheduleSpec {
                cron: cron.clone(),
                timezone: values.get(TIMEZONE).cloned(),
            }),
            None if values.is_empty() => None,
            None => {
                return Err(OrchestratorError::Validation(
                    "serialized schedule has no cron entry".into(),
                ));
            }
        };
        let normalize = |s: &Option<ScheduleSpec>| {
            s.as_ref()
                .map(|s| (s.cron.trim().to_string(), s.timezone_or_utc().to_string()))
        };
        if spec.schedule.is_some() && normalize(&spec.schedule) != normalize(&serialized) {
            return Err(disagree("schedule"));
        }
        spec.schedule = serialized;
    }

    match &mut spec.schedule {
        Some(schedule) => {
            schedule.cron = schedule.cron.trim().to_string();
            if schedule.timezone.is_none() {
                schedule.timezone = Some("UTC".to_string());
            }
            let mut values = BTreeMap::new();
            values.insert(CRON.to_string(), schedule.cron.clone());
            values.insert(TIMEZONE.to_string(), schedule.timezone_or_utc().to_string());
            spec.serialized.schedule = Some(render_serialized(&values));
        }
        None => spec.serialized.schedule = None,
    }
    Ok(())
}

/// Every permission the function asks for must be held by the caller.
fn check_permissions(
    spec: &FunctionSpecification,
    caller_permissions: &[Permission],
) -> OrchestratorResult<()> {
    for requested in spec.requested_permissions() {
        if !caller_permissions.iter().any(|held| held.grants(requested)) {
            return Err(OrchestratorError::PermissionDenied {
                action: requested.action.clone(),
                resource: requested.resource.clone(),
            });
        }
    }
    Ok(())
}

fn parse_text(section: &str, text: &str) -> OrchestratorResult<BTreeMap<String, String>> {
    parse_serialized(text)
        .map_err(|e| OrchestratorError::Validation(format!("serialized {section}: {e}")))
}

fn parse_number(values: &BTreeMap<String, String>, key: &str) -> OrchestratorResult<Option<u32>> {
    values
        .get(key)
        .map(|v| {
            v.parse::<u32>().map_err(|_| {
                OrchestratorError::Validation(format!("serialized compute: {key} must be a number"))
            })
        })
        .transpose()
}

fn parse_flag(values: &BTreeMap<String, String>, key: &str) -> OrchestratorResult<bool> {
    match values.get(key).map(String::as_str) {
        None | Some("false") => Ok(false),
        Some("true") => Ok(true),
        Some(other) => Err(OrchestratorError::Validation(format!(
            "serialized compute: {key} must be true or false, not {other:?}"
        ))),
    }
}

fn disagree(section: &str) -> OrchestratorError {
    OrchestratorError::Validation(format!(
        "{section} and serialized {section} were both given and do not match"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> SettingsResolver {
        SettingsResolver::new(ComputeConfig::default())
    }

    fn spec(extra: serde_json::Value) -> FunctionSpecification {
        let mut base = json!({
            "accountId": "acc", "subscriptionId": "sub", "boundaryId": "bnd", "functionId": "hello",
            "code": { "files": { "index.js": "module.exports = () => 1;" } }
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).unwrap()
    }

    fn caller() -> Vec<Permission> {
        vec![Permission::new("storage:*", "/account/acc/subscription/sub/")]
    }

    #[test]
    fn defaults_are_applied() {
        let resolved = resolver().resolve(spec(json!({})), &caller()).unwrap();
        let compute = &resolved.spec.compute;
        assert_eq!(compute.memory_size, Some(128));
        assert_eq!(compute.timeout, Some(30));
        assert_eq!(compute.runtime.as_deref(), Some("nodejs18.x"));
        assert_eq!(resolved.runtime.name, "nodejs18.x");
        assert_eq!(
            resolved.spec.serialized.compute.as_deref(),
            Some("memorySize=128\nstaticIp=false\ntimeout=30\n")
        );
    }

    #[test]
    fn serialized_configuration_fills_structured() {
        let resolved = resolver()
            .resolve(
                spec(json!({ "serialized": { "configuration": "# env\nB=2\nA=1\n" } })),
                &caller(),
            )
            .unwrap();
        assert_eq!(resolved.spec.configuration.get("A").map(String::as_str), Some("1"));
        assert_eq!(resolved.spec.serialized.configuration.as_deref(), Some("A=1\nB=2\n"));
    }

    #[test]
    fn structured_and_serialized_must_agree() {
        let err = resolver()
            .resolve(
                spec(json!({
                    "configuration": { "A": "1" },
                    "serialized": { "configuration": "A=2\n" }
                })),
                &caller(),
            )
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = resolver()
            .resolve(
                spec(json!({
                    "compute": { "memorySize": 256 },
                    "serialized": { "compute": "memorySize=512\n" }
                })),
                &caller(),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn schedule_is_validated_and_defaulted() {
        let resolved = resolver()
            .resolve(spec(json!({ "schedule": { "cron": " */5 * * * * " } })), &caller())
            .unwrap();
        let schedule = resolved.spec.schedule.unwrap();
        assert_eq!(schedule.cron, "*/5 * * * *");
        assert_eq!(schedule.timezone.as_deref(), Some("UTC"));

        let bad_cron =
            resolver().resolve(spec(json!({ "schedule": { "cron": "never" } })), &caller());
        assert_eq!(bad_cron.unwrap_err().status_code(), 400);

        let bad_tz = resolver().resolve(
            spec(json!({ "schedule": { "cron": "* * * * *", "timezone": "Nowhere/Land" } })),
            &caller(),
        );
        assert_eq!(bad_tz.unwrap_err().status_code(), 400);
    }

    #[test]
    fn serialized_schedule_is_parsed() {
        let resolved = resolver()
            .resolve(
                spec(json!({
                    "serialized": { "schedule": "cron=0 9 * * 1-5\ntimezone=Europe/Berlin\n" }
                })),
                &caller(),
            )
            .unwrap();
        let schedule = resolved.spec.schedule.unwrap();
        assert_eq!(schedule.cron, "0 9 * * 1-5");
        assert_eq!(schedule.timezone.as_deref(), Some("Europe/Berlin"));
    }

    #[test]
    fn permissions_must_be_held_by_the_caller() {
        let asks = spec(json!({
            "security": { "functionPermissions": [
                { "action": "storage:get", "resource": "/account/acc/subscription/sub/storage/x" }
            ]}
        }));
        assert!(resolver().resolve(asks, &caller()).is_ok());

        let escalates = spec(json!({
            "routes": [{ "path": "/admin", "permissions": [
                { "action": "function:delete", "resource": "/account/acc/" }
            ]}]
        }));
        let err = resolver().resolve(escalates, &caller()).unwrap_err();
        assert!(matches!(err, OrchestratorError::PermissionDenied { .. }));
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn identifiers_are_checked() {
        let mut bad = spec(json!({}));
        bad.id.boundary_id = "Bad_Boundary".into();
        assert!(resolver().resolve(bad, &caller()).is_err());

        let mut ok = spec(json!({}));
        ok.id.function_id = "my_function-2".into();
        assert!(resolver().resolve(ok, &caller()).is_ok());
    }

    #[test]
    fn engine_constraint_picks_the_highest_runtime() {
        let with_engine = |range: &str| {
            spec(json!({ "code": { "files": {
                "index.js": "",
                "package.json": format!("{{\"engines\":{{\"node\":\"{range}\"}}}}")
            }}}))
        };
        let resolved = resolver().resolve(with_engine("^16"), &caller()).unwrap();
        assert_eq!(resolved.runtime.name, "nodejs16.x");

        let resolved = resolver().resolve(with_engine(">=18"), &caller()).unwrap();
        assert_eq!(resolved.runtime.name, "provided.al2");
        assert!(resolved.runtime.uses_custom_layer());

        let err = resolver().resolve(with_engine("^22"), &caller()).unwrap_err();
        assert!(err.to_string().contains("18.18.2"));
    }

    #[test]
    fn malformed_manifest_is_a_validation_error() {
        let bad = spec(json!({ "code": { "files": { "index.js": "", "package.json": "{nope" } } }));
        assert_eq!(resolver().resolve(bad, &caller()).unwrap_err().status_code(), 400);

        let encoded = spec(json!({ "code": { "encoding": "base64", "files": {
            "index.js": "", "package.json": "!!"
        }}}));
        assert_eq!(resolver().resolve(encoded, &caller()).unwrap_err().status_code(), 400);
    }
}
