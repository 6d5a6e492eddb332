//! Declarative configuration for the supervisor: YAML schema, environment-variable
//! expansion, and the custom size/cron parsers the schema depends on.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use crate::error::ProcessManagerError;

/// Top-level configuration document: one supervisor, many named services.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Map of service name to its declarative spec.
    pub services: HashMap<String, ServiceSpec>,
    /// Directory the config file was loaded from; relative paths resolve against it.
    /// Not part of the YAML schema — populated by `load_config`.
    #[serde(skip)]
    pub project_dir: PathBuf,
}

/// How a service's instance count should be resolved at `start()` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InstanceCount {
    Fixed(u32),
    /// `"max"` or `"-1"`: one instance per host logical CPU.
    Max,
}

impl Default for InstanceCount {
    fn default() -> Self {
        InstanceCount::Fixed(1)
    }
}

impl<'de> Deserialize<'de> for InstanceCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = InstanceCount;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a positive integer, \"max\", or \"-1\"")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(InstanceCount::Fixed(value as u32))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value == -1 {
                    return Ok(InstanceCount::Max);
                }
                if value < 0 {
                    return Err(E::invalid_value(
                        serde::de::Unexpected::Signed(value),
                        &self,
                    ));
                }
                Ok(InstanceCount::Fixed(value as u32))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let trimmed = value.trim();
                if trimmed.eq_ignore_ascii_case("max") || trimmed == "-1" {
                    return Ok(InstanceCount::Max);
                }
                trimmed
                    .parse::<u32>()
                    .map(InstanceCount::Fixed)
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

impl InstanceCount {
    /// Resolves to a concrete count, using `nproc` logical CPUs for `Max`.
    pub fn resolve(self) -> u32 {
        match self {
            InstanceCount::Fixed(n) => n.max(1),
            InstanceCount::Max => std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        }
    }
}

/// Whether a service runs as a single process or a declarative worker cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    #[default]
    Fork,
    Cluster,
}

/// Size in bytes, accepting plain integers or suffixed strings like `512M`, `1.5G`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteSize(pub u64);

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a byte count, optionally suffixed with K, M, G, or T")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ByteSize(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                parse_byte_size(value)
                    .map(ByteSize)
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Parses a size string (`"512M"`, `"1.5G"`, `"2048"`) into a byte count.
/// Units are binary (1K = 1024) and case-insensitive. Malformed input is an error,
/// never a silent zero.
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty size string".to_string());
    }

    let normalized = trimmed.replace('_', "");
    let without_bytes = normalized.trim_end_matches(['B', 'b']);

    let (number_part, factor) = match without_bytes.chars().last() {
        Some(suffix) if suffix.is_ascii_alphabetic() => {
            let len = without_bytes.len() - suffix.len_utf8();
            let number_part = &without_bytes[..len];
            let multiplier = match suffix.to_ascii_uppercase() {
                'K' => 1u64 << 10,
                'M' => 1u64 << 20,
                'G' => 1u64 << 30,
                'T' => 1u64 << 40,
                _ => return Err(format!("unknown size suffix in '{trimmed}'")),
            };
            (number_part.trim(), multiplier)
        }
        _ => (without_bytes.trim(), 1u64),
    };

    if number_part.is_empty() {
        return Err(format!("missing numeric value in '{trimmed}'"));
    }

    let value: f64 = number_part
        .parse()
        .map_err(|_| format!("invalid numeric value in '{trimmed}'"))?;
    if value < 0.0 || !value.is_finite() {
        return Err(format!("invalid numeric value in '{trimmed}'"));
    }

    Ok((value * factor as f64).round() as u64)
}

/// Inline environment variables applied to a service's child process.
pub type EnvMap = HashMap<String, String>;

/// Recursive filesystem watch configuration.
#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct WatchConfig {
    /// Enables the file watcher for this service.
    #[serde(default)]
    pub enabled: bool,
    /// Roots to watch recursively; defaults to the service's `cwd` when empty.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Additional ignore prefixes, appended to the built-in defaults.
    #[serde(default)]
    pub ignore: Vec<String>,
}

/// HTTP health-check configuration.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct HealthConfig {
    /// URL polled with a GET request.
    pub url: String,
    /// Polling interval in milliseconds.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before the service is marked unhealthy.
    #[serde(default = "default_health_max_fails")]
    pub max_fails: u32,
}

fn default_health_interval_ms() -> u64 {
    crate::constants::DEFAULT_HEALTH_INTERVAL.as_millis() as u64
}

fn default_health_timeout_ms() -> u64 {
    crate::constants::DEFAULT_HEALTH_TIMEOUT.as_millis() as u64
}

fn default_health_max_fails() -> u32 {
    crate::constants::DEFAULT_HEALTH_MAX_FAILS
}

/// Log rotation policy for a service's stdout/stderr files.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LogRotationConfig {
    /// Rotate once the active file reaches this size.
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: ByteSize,
    /// Number of rotated segments to retain.
    #[serde(default = "default_log_retain")]
    pub retain: usize,
    /// Gzip rotated segments.
    #[serde(default)]
    pub compress: bool,
}

impl Default for LogRotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: ByteSize(default_log_max_bytes().0),
            retain: default_log_retain(),
            compress: false,
        }
    }
}

fn default_log_max_bytes() -> ByteSize {
    ByteSize(10 * 1024 * 1024)
}

fn default_log_retain() -> usize {
    5
}

/// Five-field cron schedule for a recycled service.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct CronSpec {
    /// Cron expression: `minute hour day-of-month month day-of-week`.
    pub expression: String,
    /// IANA timezone name, `"utc"`, or `"local"`. Defaults to local time.
    pub timezone: Option<String>,
}

/// Declarative, immutable-per-entry specification for a supervised service.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ServiceSpec {
    /// Command line to execute, split on whitespace unless quoted.
    pub command: String,
    /// Overrides the interpreter the command line would otherwise resolve to.
    pub interpreter: Option<String>,
    /// Working directory; defaults to the config file's directory.
    pub cwd: Option<String>,
    /// Inline environment variables merged over the inherited process environment.
    #[serde(default)]
    pub env: EnvMap,
    /// Optional grouping label for bulk targeting.
    pub namespace: Option<String>,
    /// Number of instances to spawn (only meaningful with `exec_mode: cluster`).
    #[serde(default)]
    pub instances: InstanceCount,
    /// `fork` (single process) or `cluster` (declarative worker pool).
    #[serde(default)]
    pub exec_mode: ExecMode,
    /// Whether the supervisor restarts this service automatically on exit.
    #[serde(default = "default_true")]
    pub autorestart: bool,
    /// Restart attempts allowed before the entry is driven to `errored`.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Milliseconds a child must stay up before a subsequent exit is "stable".
    #[serde(default = "default_min_uptime_ms")]
    pub min_uptime_ms: u64,
    /// Delay, in milliseconds, before a `waiting-restart` entry relaunches.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Milliseconds granted to a child before SIGKILL follows SIGTERM.
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    /// RSS ceiling; breaching it triggers a restart.
    pub memory_cap: Option<ByteSize>,
    /// File watch configuration; restarts the service on matching changes.
    pub watch: Option<WatchConfig>,
    /// Cron schedule that recycles the service.
    pub cron: Option<CronSpec>,
    /// HTTP health probe configuration.
    pub health: Option<HealthConfig>,
    /// Log rotation policy; defaults are applied when omitted.
    #[serde(default)]
    pub log: LogRotationConfig,
    /// When set, a rolling reload waits for `state == online` instead of a fixed delay.
    #[serde(default)]
    pub wait_ready: bool,
    /// Bound, in milliseconds, on the `wait_ready` readiness poll.
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,
    /// Terminate the full process tree rather than just the direct child.
    #[serde(default = "default_true")]
    pub treekill: bool,
    /// Base TCP port injected as `PORT`; cluster workers get `base + worker_id`.
    pub port: Option<u16>,
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    crate::constants::DEFAULT_MAX_RESTARTS
}

fn default_min_uptime_ms() -> u64 {
    crate::constants::DEFAULT_MIN_UPTIME.as_millis() as u64
}

fn default_restart_delay_ms() -> u64 {
    crate::constants::DEFAULT_RESTART_DELAY.as_millis() as u64
}

fn default_kill_timeout_ms() -> u64 {
    crate::constants::DEFAULT_KILL_TIMEOUT.as_millis() as u64
}

fn default_listen_timeout_ms() -> u64 {
    5000
}

/// Expands `${VAR}` and `${VAR:-default}` references against the process environment.
/// A reference with neither a default nor a bound variable is an error rather than
/// silently expanding to an empty string.
fn expand_env_vars(input: &str) -> Result<String, ProcessManagerError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .expect("static regex is valid");

    let mut err: Option<String> = None;
    let expanded = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default_value = caps.get(3).map(|m| m.as_str());
        match (env::var(var_name), default_value) {
            (Ok(value), _) => value,
            (Err(_), Some(default_value)) => default_value.to_string(),
            (Err(_), None) => {
                err = Some(var_name.to_string());
                String::new()
            }
        }
    });

    if let Some(var_name) = err {
        return Err(ProcessManagerError::InvalidSpec(format!(
            "missing environment variable '{var_name}' referenced in configuration"
        )));
    }

    Ok(expanded.to_string())
}

/// Loads and parses a YAML configuration file, expanding `${VAR}` references first.
pub fn load_config(config_path: &Path) -> Result<Config, ProcessManagerError> {
    let content = fs::read_to_string(config_path).map_err(ProcessManagerError::IoError)?;
    let expanded = expand_env_vars(&content)?;

    let mut config: Config =
        serde_yaml::from_str(&expanded).map_err(ProcessManagerError::ConfigParseError)?;

    config.project_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    for (name, spec) in &config.services {
        if spec.command.trim().is_empty() {
            return Err(ProcessManagerError::InvalidSpec(format!(
                "service '{name}' has an empty command"
            )));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_byte_size_accepts_suffixes() {
        assert_eq!(parse_byte_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_byte_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("4K").unwrap(), 4 * 1024);
        assert_eq!(parse_byte_size("2048").unwrap(), 2048);
    }

    #[test]
    fn parse_byte_size_accepts_fractional_values() {
        let expected = (1.5 * (1u64 << 30) as f64).round() as u64;
        assert_eq!(parse_byte_size("1.5G").unwrap(), expected);
    }

    #[test]
    fn parse_byte_size_is_case_insensitive() {
        assert_eq!(parse_byte_size("512m").unwrap(), parse_byte_size("512M").unwrap());
    }

    #[test]
    fn parse_byte_size_rejects_malformed_input() {
        assert!(parse_byte_size("not-a-size").is_err());
        assert!(parse_byte_size("").is_err());
    }

    #[test]
    fn instance_count_parses_literal_max_and_negative_one() {
        let yaml = "5";
        let fixed: InstanceCount = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(fixed, InstanceCount::Fixed(5));

        let max: InstanceCount = serde_yaml::from_str("\"max\"").unwrap();
        assert_eq!(max, InstanceCount::Max);

        let neg_one: InstanceCount = serde_yaml::from_str("\"-1\"").unwrap();
        assert_eq!(neg_one, InstanceCount::Max);
    }

    #[test]
    fn expand_env_vars_uses_default_when_unset() {
        let _guard = crate::test_utils::env_lock();
        unsafe {
            env::remove_var("SYSG_TEST_UNSET_VAR");
        }
        let result = expand_env_vars("value=${SYSG_TEST_UNSET_VAR:-fallback}").unwrap();
        assert_eq!(result, "value=fallback");
    }

    #[test]
    fn expand_env_vars_errors_on_missing_without_default() {
        let _guard = crate::test_utils::env_lock();
        unsafe {
            env::remove_var("SYSG_TEST_MISSING_VAR");
        }
        let result = expand_env_vars("value=${SYSG_TEST_MISSING_VAR}");
        assert!(result.is_err());
    }

    #[test]
    fn load_config_rejects_empty_command() {
        let dir = tempdir().unwrap();
        let yaml_path = dir.path().join("bm2.yaml");
        let mut yaml_file = File::create(&yaml_path).unwrap();
        writeln!(
            yaml_file,
            r#"
services:
  broken:
    command: ""
"#
        )
        .unwrap();

        let result = load_config(&yaml_path);
        assert!(result.is_err());
    }

    #[test]
    fn load_config_parses_full_spec() {
        let dir = tempdir().unwrap();
        let yaml_path = dir.path().join("bm2.yaml");
        let mut yaml_file = File::create(&yaml_path).unwrap();
        writeln!(
            yaml_file,
            r#"
services:
  api:
    command: "node server.js"
    instances: 3
    exec_mode: cluster
    port: 8000
    memory_cap: "256M"
    cron:
      expression: "0 * * * *"
    health:
      url: "http://localhost:8000/health"
"#
        )
        .unwrap();

        let config = load_config(&yaml_path).unwrap();
        let api = &config.services["api"];
        assert_eq!(api.instances, InstanceCount::Fixed(3));
        assert_eq!(api.exec_mode, ExecMode::Cluster);
        assert_eq!(api.memory_cap, Some(ByteSize(256 * 1024 * 1024)));
        assert_eq!(api.port, Some(8000));
    }
}
