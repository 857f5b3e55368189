//! Sandbox configuration
//!
//! A configuration is immutable for the duration of a run. It is usually
//! built from a mode preset and adjusted with the `with_*` setters, or loaded
//! from TOML where any key left out falls back to the preset of the selected
//! `mode`.

use crate::limits::ResourceLimits;
use crate::policy::{
    default_allowed_builtins, default_forbidden_builtins, default_forbidden_imports,
    strict_allowed_imports, ExecutionStrategy, PermissionFailurePolicy, SandboxMode,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the isolated-process strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolatedProcessSettings {
    /// Interpreter binary, resolved through `PATH`
    pub interpreter: String,

    /// Extra interpreter arguments placed before the runner script
    #[serde(default)]
    pub args: Vec<String>,

    /// Best-effort private network namespace when network access is off
    pub unshare_network: bool,
}

impl Default for IsolatedProcessSettings {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            args: Vec::new(),
            unshare_network: true,
        }
    }
}

/// Settings for the container strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSettings {
    /// Docker-compatible CLI binary
    pub runtime: String,

    pub image: String,

    /// Memory ceiling in bytes; `max_memory` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<u64>,

    /// CPU quota in cores
    pub cpu_limit: f64,

    pub pids_limit: u64,

    /// Interpreter inside the image
    pub interpreter: String,

    /// Extra `--security-opt` values
    #[serde(default)]
    pub security_opts: Vec<String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "python:3.12-slim".to_string(),
            memory_limit: None,
            cpu_limit: 1.0,
            pids_limit: 64,
            interpreter: "python3".to_string(),
            security_opts: Vec::new(),
        }
    }
}

/// Complete per-run sandbox configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfiguration {
    pub mode: SandboxMode,

    pub execution_strategy: ExecutionStrategy,

    #[serde(flatten)]
    pub limits: ResourceLimits,

    pub allow_network: bool,

    /// Hosts reachable when network access is allowed; empty means any
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Root modules that may be imported; empty means any not forbidden
    #[serde(default)]
    pub allowed_imports: BTreeSet<String>,

    #[serde(default)]
    pub forbidden_imports: BTreeSet<String>,

    /// Primitive names exposed by the in-process environment
    #[serde(default)]
    pub allowed_builtins: BTreeSet<String>,

    /// Callee names the analyzer rejects
    #[serde(default)]
    pub forbidden_builtins: BTreeSet<String>,

    /// Attribute names rejected in addition to the dunder rule
    #[serde(default)]
    pub forbidden_attributes: BTreeSet<String>,

    /// Dunder attribute names exempted from the dunder rule
    #[serde(default)]
    pub allowed_attributes: BTreeSet<String>,

    pub enable_static_analysis: bool,

    pub enable_runtime_monitoring: bool,

    pub enable_audit_logging: bool,

    /// Resource monitor polling period
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Bound on each permission check and audit emission
    #[serde(with = "humantime_serde")]
    pub collaborator_timeout: Duration,

    /// Per-stream capture cap for stdout and stderr
    pub max_output_bytes: usize,

    /// Overrides the mode's unreachable-permission policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_failure_policy: Option<PermissionFailurePolicy>,

    #[serde(default)]
    pub isolated_process: IsolatedProcessSettings,

    #[serde(default)]
    pub container: ContainerSettings,
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        Self::for_mode(SandboxMode::Restricted)
    }
}

impl SandboxConfiguration {
    /// Preset for a mode
    pub fn for_mode(mode: SandboxMode) -> Self {
        let limits = match mode {
            SandboxMode::Strict => ResourceLimits::strict(),
            SandboxMode::Restricted => ResourceLimits::restricted(),
            SandboxMode::Permissive => ResourceLimits::permissive(),
            SandboxMode::Development => ResourceLimits::development(),
        };
        let allowed_imports = match mode {
            SandboxMode::Strict => strict_allowed_imports(),
            _ => BTreeSet::new(),
        };

        Self {
            mode,
            execution_strategy: mode.default_strategy(),
            limits,
            allow_network: false,
            allowed_hosts: Vec::new(),
            allowed_imports,
            forbidden_imports: default_forbidden_imports(),
            allowed_builtins: default_allowed_builtins(),
            forbidden_builtins: default_forbidden_builtins(),
            forbidden_attributes: BTreeSet::new(),
            allowed_attributes: BTreeSet::new(),
            enable_static_analysis: true,
            enable_runtime_monitoring: mode != SandboxMode::Development,
            enable_audit_logging: true,
            monitor_interval: Duration::from_millis(100),
            collaborator_timeout: Duration::from_secs(5),
            max_output_bytes: 1024 * 1024,
            permission_failure_policy: None,
            isolated_process: IsolatedProcessSettings::default(),
            container: ContainerSettings::default(),
        }
    }

    pub fn strict() -> Self {
        Self::for_mode(SandboxMode::Strict)
    }

    pub fn restricted() -> Self {
        Self::for_mode(SandboxMode::Restricted)
    }

    pub fn permissive() -> Self {
        Self::for_mode(SandboxMode::Permissive)
    }

    pub fn development() -> Self {
        Self::for_mode(SandboxMode::Development)
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.execution_strategy = strategy;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_execution_time(mut self, duration: Duration) -> Self {
        self.limits.max_execution_time = duration;
        self
    }

    pub fn with_max_cpu_time(mut self, duration: Duration) -> Self {
        self.limits.max_cpu_time = duration;
        self
    }

    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.limits.max_memory = bytes;
        self
    }

    pub fn with_max_open_files(mut self, count: u64) -> Self {
        self.limits.max_open_files = count;
        self
    }

    pub fn with_network(mut self, allowed: bool) -> Self {
        self.allow_network = allowed;
        self
    }

    /// Add a module to the forbidden set
    pub fn forbid_import(mut self, module: impl Into<String>) -> Self {
        self.forbidden_imports.insert(module.into());
        self
    }

    pub fn with_allowed_imports<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_imports = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_forbidden_imports<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden_imports = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allowed_builtins<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_builtins = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_static_analysis(mut self, enabled: bool) -> Self {
        self.enable_static_analysis = enabled;
        self
    }

    pub fn with_runtime_monitoring(mut self, enabled: bool) -> Self {
        self.enable_runtime_monitoring = enabled;
        self
    }

    pub fn with_audit_logging(mut self, enabled: bool) -> Self {
        self.enable_audit_logging = enabled;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_collaborator_timeout(mut self, timeout: Duration) -> Self {
        self.collaborator_timeout = timeout;
        self
    }

    pub fn with_permission_failure_policy(mut self, policy: PermissionFailurePolicy) -> Self {
        self.permission_failure_policy = Some(policy);
        self
    }

    pub fn with_isolated_process(mut self, settings: IsolatedProcessSettings) -> Self {
        self.isolated_process = settings;
        self
    }

    pub fn with_container(mut self, settings: ContainerSettings) -> Self {
        self.container = settings;
        self
    }

    /// Unreachable-permission policy after applying the override
    pub fn effective_permission_failure_policy(&self) -> PermissionFailurePolicy {
        self.permission_failure_policy
            .unwrap_or_else(|| self.mode.permission_failure_policy())
    }

    /// Memory ceiling handed to the container runtime
    pub fn container_memory_limit(&self) -> u64 {
        self.container.memory_limit.unwrap_or(self.limits.max_memory)
    }

    /// Reject configurations no strategy can honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));

        if self.limits.max_execution_time.is_zero() {
            return invalid("max_execution_time must be greater than zero");
        }
        if self.limits.max_cpu_time.is_zero() {
            return invalid("max_cpu_time must be greater than zero");
        }
        if self.limits.max_memory == 0 {
            return invalid("max_memory must be greater than zero");
        }
        if self.limits.max_open_files == 0 {
            return invalid("max_open_files must be greater than zero");
        }
        if self.limits.max_processes == Some(0) {
            return invalid("max_processes must be greater than zero when set");
        }
        if self.monitor_interval.is_zero() {
            return invalid("monitor_interval must be greater than zero");
        }
        if self.collaborator_timeout.is_zero() {
            return invalid("collaborator_timeout must be greater than zero");
        }
        if self.max_output_bytes == 0 {
            return invalid("max_output_bytes must be greater than zero");
        }

        match self.execution_strategy {
            ExecutionStrategy::IsolatedProcess => {
                if self.isolated_process.interpreter.trim().is_empty() {
                    return invalid("isolated_process.interpreter must not be empty");
                }
            }
            ExecutionStrategy::Container => {
                if self.container.runtime.trim().is_empty() {
                    return invalid("container.runtime must not be empty");
                }
                if self.container.image.trim().is_empty() {
                    return invalid("container.image must not be empty");
                }
                if self.container.interpreter.trim().is_empty() {
                    return invalid("container.interpreter must not be empty");
                }
                if !(self.container.cpu_limit.is_finite() && self.container.cpu_limit > 0.0) {
                    return invalid("container.cpu_limit must be a positive number");
                }
                if self.container.pids_limit == 0 {
                    return invalid("container.pids_limit must be greater than zero");
                }
                if self.container.memory_limit == Some(0) {
                    return invalid("container.memory_limit must be greater than zero when set");
                }
            }
            ExecutionStrategy::InProcess => {}
        }

        Ok(())
    }

    /// Parse a TOML document; omitted keys come from the preset of its `mode`
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let overrides: toml::Table = content.parse()?;
        let mode = match overrides.get("mode") {
            Some(value) => SandboxMode::deserialize(value.clone())?,
            None => SandboxMode::Restricted,
        };

        let mut merged = match toml::Value::try_from(Self::for_mode(mode))? {
            toml::Value::Table(table) => table,
            _ => return Err(ConfigError::Invalid("preset is not a table".to_string())),
        };
        merge_tables(&mut merged, overrides);

        let config: Self = toml::Value::Table(merged).try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            mode = %config.mode,
            strategy = %config.execution_strategy,
            "Loaded sandbox configuration"
        );
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Overlay `overrides` onto `base`, recursing into nested tables
fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_presets() {
        let strict = SandboxConfiguration::strict();
        assert_eq!(strict.execution_strategy, ExecutionStrategy::IsolatedProcess);
        assert_eq!(strict.limits.max_execution_time, Duration::from_secs(10));
        assert!(strict.allowed_imports.contains("math"));
        assert!(strict.enable_runtime_monitoring);

        let permissive = SandboxConfiguration::permissive();
        assert_eq!(permissive.execution_strategy, ExecutionStrategy::InProcess);
        assert!(permissive.allowed_imports.is_empty());
        assert!(permissive.forbidden_imports.contains("socket"));

        let development = SandboxConfiguration::development();
        assert!(!development.enable_runtime_monitoring);
        assert_eq!(
            development.effective_permission_failure_policy(),
            PermissionFailurePolicy::AllowWithWarning
        );
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        assert!(SandboxConfiguration::default().validate().is_ok());

        let zero_time = SandboxConfiguration::default().with_max_execution_time(Duration::ZERO);
        assert!(matches!(zero_time.validate(), Err(ConfigError::Invalid(_))));

        let zero_memory = SandboxConfiguration::default().with_max_memory(0);
        assert!(zero_memory.validate().is_err());

        let mut container = SandboxConfiguration::default().with_strategy(ExecutionStrategy::Container);
        container.container.image = String::new();
        let err = container.validate().unwrap_err();
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn test_toml_overrides_mode_preset() {
        let config = SandboxConfiguration::from_toml_str(
            r#"
            mode = "strict"
            max_execution_time = "2s"
            forbidden_imports = ["socket"]

            [container]
            image = "python:3.11-alpine"
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, SandboxMode::Strict);
        assert_eq!(config.limits.max_execution_time, Duration::from_secs(2));
        // untouched keys keep the strict preset
        assert_eq!(config.limits.max_cpu_time, Duration::from_secs(5));
        assert_eq!(config.limits.max_memory, 128 * 1024 * 1024);
        assert_eq!(config.forbidden_imports.len(), 1);
        assert_eq!(config.container.image, "python:3.11-alpine");
        assert_eq!(config.container.runtime, "docker");
        assert_eq!(config.monitor_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_toml_round_trip() {
        let original = SandboxConfiguration::permissive()
            .with_monitor_interval(Duration::from_millis(250))
            .with_permission_failure_policy(PermissionFailurePolicy::Deny);
        let text = original.to_toml_string().unwrap();
        let parsed = SandboxConfiguration::from_toml_str(&text).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_toml_invalid_values_are_rejected() {
        assert!(matches!(
            SandboxConfiguration::from_toml_str("mode = \"nonsense\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            SandboxConfiguration::from_toml_str("max_memory = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.toml");
        std::fs::write(&path, "mode = \"development\"\n").unwrap();
        let config = SandboxConfiguration::load(&path).unwrap();
        assert_eq!(config.mode, SandboxMode::Development);

        let missing = SandboxConfiguration::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
