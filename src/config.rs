//! Configuration for the fleet agent
//!
//! Settings are read once at startup from `agent.yml`, `agent.json` or
//! `agent.toml` in the configuration directory. The process-wide paths and
//! overrides derived from them are captured in an immutable [`Environment`]
//! that is passed explicitly to every component that needs it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Override for the home, data and logs directories
    #[serde(default)]
    pub paths: PathSettings,
    /// Local policy discovery
    #[serde(default)]
    pub policy: LocalPolicySettings,
    /// Control plane connection
    #[serde(default)]
    pub fleet: FleetSettings,
    /// Ordered allow/deny rules for input and output types
    #[serde(default)]
    pub capabilities: Vec<CapabilityRule>,
    /// Values merged on top of every policy before it is compiled
    #[serde(default)]
    pub overrides: Mapping,
    /// Timeout applied to application actions, in seconds
    #[serde(default = "default_app_action_timeout_secs")]
    pub app_action_timeout_secs: u64,
    /// Prometheus endpoint
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            paths: PathSettings::default(),
            policy: LocalPolicySettings::default(),
            fleet: FleetSettings::default(),
            capabilities: Vec::new(),
            overrides: Mapping::new(),
            app_action_timeout_secs: default_app_action_timeout_secs(),
            metrics: MetricsSettings::default(),
        }
    }
}

impl AgentSettings {
    pub fn app_action_timeout(&self) -> Duration {
        Duration::from_secs(self.app_action_timeout_secs)
    }
}

fn default_app_action_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathSettings {
    pub home: Option<PathBuf>,
    pub data: Option<PathBuf>,
    pub logs: Option<PathBuf>,
}

/// Where local policy documents are found
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalPolicySettings {
    /// File patterns relative to the configuration directory, merged in order
    #[serde(default = "default_policy_patterns")]
    pub patterns: Vec<String>,
    /// Watch the configuration directory and re-apply on change
    #[serde(default = "default_true")]
    pub reload: bool,
}

impl Default for LocalPolicySettings {
    fn default() -> Self {
        Self {
            patterns: default_policy_patterns(),
            reload: true,
        }
    }
}

fn default_policy_patterns() -> Vec<String> {
    vec!["fleet-agent.yml".to_string(), "inputs.d/*.yml".to_string()]
}

fn default_true() -> bool {
    true
}

/// Control plane connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSettings {
    /// Run in managed mode
    #[serde(default)]
    pub enabled: bool,
    /// Control plane base URLs, tried in order
    #[serde(default)]
    pub hosts: Vec<String>,
    /// API key sent with every request
    #[serde(default)]
    pub access_api_key: String,
    /// Per-request timeout, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Checkin scheduling
    #[serde(default)]
    pub checkin: GatewaySettings,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            hosts: Vec::new(),
            access_api_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            checkin: GatewaySettings::default(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Checkin scheduling: fixed period plus jitter, exponential backoff on failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default)]
    pub backoff: BackoffSettings,
}

impl GatewaySettings {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            jitter_ms: default_jitter_ms(),
            backoff: BackoffSettings::default(),
        }
    }
}

fn default_period_ms() -> u64 {
    1_000
}

fn default_jitter_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_backoff_init_ms")]
    pub init_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

impl BackoffSettings {
    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            init_ms: default_backoff_init_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_backoff_init_ms() -> u64 {
    5_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

/// Allow or deny decision of a capability rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityDecision {
    Allow,
    Deny,
}

/// One capability rule; the first matching rule decides, default is allow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRule {
    pub rule: CapabilityDecision,
    /// Input type pattern, `*` suffix allowed
    #[serde(default)]
    pub input: Option<String>,
    /// Output type pattern, `*` suffix allowed
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    8000
}

/// Load agent settings from `config_dir`.
///
/// Tries `agent.yml`, `agent.json` and `agent.toml` in that order; defaults
/// are returned when none exists.
pub fn load_settings(config_dir: &Path) -> Result<AgentSettings> {
    let yaml_path = config_dir.join("agent.yml");
    let json_path = config_dir.join("agent.json");
    let toml_path = config_dir.join("agent.toml");

    if yaml_path.exists() {
        let contents = std::fs::read_to_string(&yaml_path)
            .with_context(|| format!("Failed to read {}", yaml_path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", yaml_path.display()))
    } else if json_path.exists() {
        let contents = std::fs::read_to_string(&json_path)
            .with_context(|| format!("Failed to read {}", json_path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", json_path.display()))
    } else if toml_path.exists() {
        let contents = std::fs::read_to_string(&toml_path)
            .with_context(|| format!("Failed to read {}", toml_path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", toml_path.display()))
    } else {
        Ok(AgentSettings::default())
    }
}

/// Default configuration directory: the system-wide one when it exists,
/// otherwise the per-user one.
pub fn default_config_dir() -> PathBuf {
    let system_config = PathBuf::from("/etc/fleet-agent");
    if system_config.exists() {
        return system_config;
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleet-agent")
}

/// Process-wide paths and policy overrides.
///
/// Built once at startup and shared by reference; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Environment {
    home: PathBuf,
    data: PathBuf,
    config: PathBuf,
    logs: PathBuf,
    overrides: Mapping,
}

impl Environment {
    pub fn new(config_dir: PathBuf, settings: &AgentSettings) -> Self {
        let home = settings.paths.home.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fleet-agent")
        });
        let data = settings
            .paths
            .data
            .clone()
            .unwrap_or_else(|| home.join("data"));
        let logs = settings
            .paths
            .logs
            .clone()
            .unwrap_or_else(|| home.join("logs"));
        Self {
            home,
            data,
            config: config_dir,
            logs,
            overrides: settings.overrides.clone(),
        }
    }

    /// Environment rooted entirely under `home`, with no overrides.
    pub fn rooted_at(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            data: home.join("data"),
            config: home.join("config"),
            logs: home.join("logs"),
            overrides: Mapping::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: Mapping) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn data(&self) -> &Path {
        &self.data
    }

    pub fn config(&self) -> &Path {
        &self.config
    }

    pub fn logs(&self) -> &Path {
        &self.logs
    }

    /// Persisted agent state (last action and ack token)
    pub fn state_path(&self) -> PathBuf {
        self.data.join("state.yml")
    }

    /// Action store written by older agents, migrated on startup
    pub fn legacy_action_store_path(&self) -> PathBuf {
        self.data.join("action_store.yml")
    }

    pub fn agent_info_path(&self) -> PathBuf {
        self.data.join("agent.yml")
    }

    /// Rendered program configurations handed to the supervisor
    pub fn programs_dir(&self) -> PathBuf {
        self.data.join("programs")
    }

    /// Inject `path.*` and the configured overrides into a raw policy.
    pub fn inject(&self, raw: &mut Value) -> Result<()> {
        if raw.is_null() {
            *raw = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(root) = raw else {
            anyhow::bail!("policy must be a mapping");
        };

        let mut paths = Mapping::new();
        for (key, path) in [
            ("home", &self.home),
            ("data", &self.data),
            ("config", &self.config),
            ("logs", &self.logs),
        ] {
            paths.insert(
                Value::from(key),
                Value::from(path.to_string_lossy().into_owned()),
            );
        }
        let mut injected = Mapping::new();
        injected.insert(Value::from("path"), Value::Mapping(paths));
        merge_values(root, injected, ListMerge::Replace);
        merge_values(root, self.overrides.clone(), ListMerge::Replace);
        Ok(())
    }
}

/// How lists are combined by [`merge_values`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMerge {
    Replace,
    Concat,
}

/// Deep-merge `overlay` into `base`: mappings merge recursively, scalars from
/// `overlay` win, lists are replaced or concatenated.
pub fn merge_values(base: &mut Mapping, overlay: Mapping, lists: ListMerge) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                merge_values(existing, incoming, lists);
            }
            (Some(Value::Sequence(existing)), Value::Sequence(incoming))
                if lists == ListMerge::Concat =>
            {
                existing.extend(incoming);
            }
            (Some(existing), value) => *existing = value,
            (None, value) => {
                base.insert(key, value);
            }
        }
    }
}
