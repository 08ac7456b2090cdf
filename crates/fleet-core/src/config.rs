//! fleet.toml configuration parser.
//!
//! Every section is optional; an empty file yields the defaults below.
//! Durations are written as strings like `"500ms"`, `"5s"`, `"10m"` or `"1h"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub compute: ComputeConfig,
    pub builder: BuilderConfig,
    pub registry: RegistryConfig,
    pub convergence: ConvergenceConfig,
    pub cron: CronConfig,
    pub tasks: TasksConfig,
    pub gc: GcConfig,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> CoreResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the accessors would otherwise silently replace.
    pub fn validate(&self) -> CoreResult<()> {
        let durations = [
            ("builder.timeout", &self.builder.timeout),
            ("builder.backoff_initial", &self.builder.backoff_initial),
            ("registry.deadline", &self.registry.deadline),
            ("convergence.fast_interval", &self.convergence.fast_interval),
            ("convergence.fast_window", &self.convergence.fast_window),
            ("convergence.slow_interval", &self.convergence.slow_interval),
            ("convergence.deadline", &self.convergence.deadline),
            ("convergence.throttle_base_delay", &self.convergence.throttle_base_delay),
            ("cron.window", &self.cron.window),
            ("cron.threshold", &self.cron.threshold),
            ("tasks.propagation_delay", &self.tasks.propagation_delay),
            ("gc.latency", &self.gc.latency),
            ("gc.retention", &self.gc.retention),
        ];
        for (field, value) in durations {
            if parse_duration(value).is_none() {
                return Err(CoreError::InvalidConfig(format!(
                    "{field} = {value:?} is not a duration"
                )));
            }
        }
        if self.builder.backoff_ratio < 1.0 {
            return Err(CoreError::InvalidConfig(
                "builder.backoff_ratio must be at least 1.0".into(),
            ));
        }
        if self.builder.concurrency == 0 || self.registry.concurrency == 0 {
            return Err(CoreError::InvalidConfig("concurrency limits must be positive".into()));
        }
        if self.cron.batch_size == 0 || self.cron.batch_size > 10 {
            return Err(CoreError::InvalidConfig("cron.batch_size must be within 1..=10".into()));
        }
        if self.compute.runtime(&self.compute.default_runtime).is_none() {
            return Err(CoreError::InvalidConfig(format!(
                "compute.default_runtime {} is not among compute.runtimes",
                self.compute.default_runtime
            )));
        }
        Ok(())
    }
}

// ── Compute ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Provider runtime used when the manifest has no engine constraint.
    pub default_runtime: String,
    /// Default memory in MB.
    pub memory_size: u32,
    /// Default timeout in seconds.
    pub timeout: u32,
    pub runtimes: Vec<RuntimeOption>,
    /// Network attachment used when a function asks for a static IP.
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
}

/// One supported engine version and how it maps onto the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOption {
    pub engine: String,
    pub name: String,
    #[serde(default)]
    pub layers: Vec<String>,
}

impl ComputeConfig {
    pub fn runtime(&self, name: &str) -> Option<&RuntimeOption> {
        self.runtimes.iter().find(|r| r.name == name)
    }
}

impl Default for ComputeConfig {
    fn default() -> Self {
        let runtime = |engine: &str, name: &str, layers: &[&str]| RuntimeOption {
            engine: engine.to_string(),
            name: name.to_string(),
            layers: layers.iter().map(|l| l.to_string()).collect(),
        };
        Self {
            default_runtime: "nodejs18.x".to_string(),
            memory_size: 128,
            timeout: 30,
            runtimes: vec![
                runtime("14.21.3", "nodejs14.x", &[]),
                runtime("16.20.2", "nodejs16.x", &[]),
                runtime("18.18.2", "nodejs18.x", &[]),
                runtime("20.9.0", "provided.al2", &["node-20"]),
            ],
            subnet_ids: Vec::new(),
            security_group_ids: Vec::new(),
        }
    }
}

// ── Builder ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Module builds running at once.
    pub concurrency: usize,
    pub backoff_initial: String,
    pub backoff_ratio: f64,
    pub memory_size: u32,
    pub timeout: String,
    /// Bumping this provisions fresh builders.
    pub version: String,
    /// Conflict waits tolerated before a builder invocation fails.
    pub conflict_retries: u32,
}

impl BuilderConfig {
    pub fn backoff_initial(&self) -> Duration {
        parse_duration(&self.backoff_initial).unwrap_or(Duration::from_secs(120))
    }

    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(300))
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            backoff_initial: "120s".to_string(),
            backoff_ratio: 1.2,
            memory_size: 1024,
            timeout: "300s".to_string(),
            version: "1".to_string(),
            conflict_retries: 3,
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Public mirror base URLs, raced against each other.
    pub mirrors: Vec<String>,
    /// Budget shared by every source queried for one dependency.
    pub deadline: String,
    pub concurrency: usize,
}

impl RegistryConfig {
    pub fn deadline(&self) -> Duration {
        parse_duration(&self.deadline).unwrap_or(Duration::from_secs(10))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mirrors: vec![
                "https://registry.npmjs.org".to_string(),
                "https://registry.npmmirror.com".to_string(),
            ],
            deadline: "10s".to_string(),
            concurrency: 5,
        }
    }
}

// ── Convergence ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    pub fast_interval: String,
    /// How long the fast interval applies before switching to the slow one.
    pub fast_window: String,
    pub slow_interval: String,
    pub deadline: String,
    pub throttle_base_delay: String,
    /// Throttled attempts tolerated on provisioning paths.
    pub throttle_max_attempts: u32,
}

impl ConvergenceConfig {
    pub fn fast_interval(&self) -> Duration {
        parse_duration(&self.fast_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn fast_window(&self) -> Duration {
        parse_duration(&self.fast_window).unwrap_or(Duration::from_secs(30))
    }

    pub fn slow_interval(&self) -> Duration {
        parse_duration(&self.slow_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn deadline(&self) -> Duration {
        parse_duration(&self.deadline).unwrap_or(Duration::from_secs(600))
    }

    pub fn throttle_base_delay(&self) -> Duration {
        parse_duration(&self.throttle_base_delay).unwrap_or(Duration::from_millis(500))
    }
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            fast_interval: "1s".to_string(),
            fast_window: "30s".to_string(),
            slow_interval: "5s".to_string(),
            deadline: "10m".to_string(),
            throttle_base_delay: "500ms".to_string(),
            throttle_max_attempts: 8,
        }
    }
}

// ── Cron ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// Delay queue the scheduled invocations are enqueued into.
    pub queue: String,
    pub window: String,
    /// Distance to the next window boundary under which that window is
    /// enqueued as well.
    pub threshold: String,
    pub max_per_window: usize,
    pub batch_size: usize,
}

impl CronConfig {
    pub fn window(&self) -> Duration {
        parse_duration(&self.window).unwrap_or(Duration::from_secs(600))
    }

    pub fn threshold(&self) -> Duration {
        parse_duration(&self.threshold).unwrap_or(Duration::from_secs(60))
    }
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            queue: "cron-executor".to_string(),
            window: "10m".to_string(),
            threshold: "1m".to_string(),
            max_per_window: 120,
            batch_size: 10,
        }
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Shared dispatcher every task queue is wired to.
    pub dispatcher: String,
    pub propagation_delay: String,
}

impl TasksConfig {
    pub fn propagation_delay(&self) -> Duration {
        parse_duration(&self.propagation_delay).unwrap_or(Duration::from_secs(5))
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            dispatcher: "task-dispatcher".to_string(),
            propagation_delay: "5s".to_string(),
        }
    }
}

// ── Garbage collection ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub latency: String,
    pub retention: String,
}

impl GcConfig {
    pub fn latency(&self) -> Duration {
        parse_duration(&self.latency).unwrap_or(Duration::from_secs(30))
    }

    pub fn retention(&self) -> Duration {
        parse_duration(&self.retention).unwrap_or(Duration::from_secs(3600))
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            latency: "30s".to_string(),
            retention: "1h".to_string(),
        }
    }
}

/// Parse a duration string like "500ms", "5s", "1m", "1h". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = FleetConfig::from_toml("").unwrap();
        assert_eq!(config.compute.default_runtime, "nodejs18.x");
        assert_eq!(config.compute.memory_size, 128);
        assert_eq!(config.builder.concurrency, 5);
        assert_eq!(config.builder.backoff_initial(), Duration::from_secs(120));
        assert_eq!(config.registry.mirrors.len(), 2);
        assert_eq!(config.convergence.deadline(), Duration::from_secs(600));
        assert_eq!(config.cron.max_per_window, 120);
        assert_eq!(config.gc.retention(), Duration::from_secs(3600));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = FleetConfig::from_toml(
            r#"
[builder]
concurrency = 2

[gc]
retention = "2h"
"#,
        )
        .unwrap();
        assert_eq!(config.builder.concurrency, 2);
        assert_eq!(config.builder.backoff_ratio, 1.2);
        assert_eq!(config.gc.retention(), Duration::from_secs(7200));
        assert_eq!(config.gc.latency(), Duration::from_secs(30));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            FleetConfig::from_toml("[gc]\nlatency = \"soon\"\n"),
            Err(CoreError::InvalidConfig(_))
        ));
        assert!(FleetConfig::from_toml("[builder]\nbackoff_ratio = 0.5\n").is_err());
        assert!(FleetConfig::from_toml("[compute]\ndefault_runtime = \"cobol\"\n").is_err());
        assert!(matches!(
            FleetConfig::from_toml("[cron\n"),
            Err(CoreError::ConfigParse(_))
        ));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("x"), None);
    }
}
