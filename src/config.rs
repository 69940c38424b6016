use anyhow::{anyhow, bail, Context, Result};
use dirs::config_dir;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::restic::RetentionPolicy;
use crate::scheduler::Schedule;

/// System-wide configuration location
pub const SYSTEM_CONFIG_PATH: &str = "/etc/restic-monitor/config.yaml";

/// Default address of the metrics endpoint
pub const DEFAULT_LISTEN: &str = "0.0.0.0:9090";

/// Set to any non-empty value to run forget with --dry-run
pub const DRY_RUN_ENV: &str = "DRY_RUN";

/// Whether dry-run was requested through the environment
pub fn dry_run_from_env() -> bool {
    std::env::var_os(DRY_RUN_ENV).is_some_and(|v| !v.is_empty())
}

/// Main configuration structure for restic-monitor
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Monitored repositories keyed by name
    #[serde(default)]
    pub repos: BTreeMap<String, RepoConfig>,

    /// restic invocation settings
    #[serde(default)]
    pub restic: ResticConfig,

    /// Metrics output settings
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per repository configuration as written in the config file
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RepoConfig {
    /// Repository locator passed as RESTIC_REPOSITORY
    pub repository: String,

    /// JSON object of extra environment variables, overridden by `environment`
    #[serde(default)]
    pub environment_file: Option<String>,

    /// Inline environment variables
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Retention policy for maintenance runs
    #[serde(default)]
    pub retention: RetentionPolicy,

    /// How often to poll the repository
    #[serde(default = "default_polling_interval")]
    pub polling_interval: String, // "1h"

    /// Cron expression for maintenance runs
    #[serde(default = "default_maintenance_schedule")]
    pub maintenance_schedule: String,
}

/// restic invocation settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResticConfig {
    /// Path or name of the restic binary
    #[serde(default = "default_binary")]
    pub binary: String,
}

/// Metrics output settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MetricsConfig {
    /// Address of the HTTP `/metrics` endpoint, null or empty disables it
    #[serde(default = "default_listen")]
    pub listen: Option<String>,

    /// Prometheus textfile to rewrite periodically
    #[serde(default)]
    pub textfile: Option<String>,

    /// How often the textfile is rewritten
    #[serde(default = "default_write_interval")]
    pub write_interval: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "json"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

/// Validated repository settings ready to build a client from
#[derive(Debug, Clone, PartialEq)]
pub struct RepoSettings {
    pub name: String,
    pub repository: String,
    pub environment: BTreeMap<String, String>,
    pub retention: RetentionPolicy,
    pub polling_interval: Duration,
    pub maintenance_schedule: String,
}

// Default value functions
fn default_polling_interval() -> String {
    "1h".to_string()
}
fn default_maintenance_schedule() -> String {
    "@daily".to_string()
}
fn default_binary() -> String {
    "restic".to_string()
}
fn default_listen() -> Option<String> {
    Some(DEFAULT_LISTEN.to_string())
}
fn default_write_interval() -> String {
    "30s".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ResticConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            textfile: None,
            write_interval: default_write_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// The system path wins when it exists, otherwise the XDG user config
    /// location is used.
    pub fn default_config_path() -> Result<PathBuf> {
        let system = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system.exists() {
            return Ok(system);
        }

        let config_dir = config_dir().context("Failed to get user config directory")?;
        Ok(config_dir.join("restic-monitor").join("config.yaml"))
    }

    /// Interval between metrics textfile writes
    pub fn metrics_write_interval(&self) -> Result<Duration> {
        let interval = parse_duration(&self.metrics.write_interval)
            .context("Invalid metrics write_interval")?;
        if interval.is_zero() {
            bail!("metrics write_interval must be greater than zero");
        }
        Ok(interval)
    }

    /// Address of the metrics endpoint, if enabled
    ///
    /// A bare `:port` listens on every interface.
    pub fn metrics_listen(&self) -> Result<Option<SocketAddr>> {
        let Some(listen) = self.metrics.listen.as_deref().map(str::trim).filter(|l| !l.is_empty())
        else {
            return Ok(None);
        };

        let addr = match listen.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => listen.to_string(),
        };
        addr.parse::<SocketAddr>()
            .map(Some)
            .with_context(|| format!("Invalid metrics listen address: {:?}", listen))
    }

    /// Expanded metrics textfile path, if configured
    pub fn metrics_textfile(&self) -> Result<Option<PathBuf>> {
        self.metrics
            .textfile
            .as_deref()
            .map(|path| {
                shellexpand::full(path)
                    .map(|p| PathBuf::from(p.as_ref()))
                    .context("Failed to expand metrics textfile path")
            })
            .transpose()
    }
}

impl RepoConfig {
    /// Validate this repository's configuration and merge its environment
    pub fn resolve(&self, name: &str) -> Result<RepoSettings> {
        if self.repository.trim().is_empty() {
            bail!("repository locator is empty");
        }

        let polling_interval = parse_duration(&self.polling_interval)
            .with_context(|| format!("Invalid polling_interval: {:?}", self.polling_interval))?;
        if polling_interval.is_zero() {
            bail!("polling_interval must be greater than zero");
        }

        Schedule::parse(&self.maintenance_schedule).with_context(|| {
            format!("Invalid maintenance_schedule: {:?}", self.maintenance_schedule)
        })?;

        Ok(RepoSettings {
            name: name.to_string(),
            repository: self.repository.clone(),
            environment: self.merged_environment()?,
            retention: self.retention.clone(),
            polling_interval,
            maintenance_schedule: self.maintenance_schedule.clone(),
        })
    }

    /// File values first, inline values override by key
    pub fn merged_environment(&self) -> Result<BTreeMap<String, String>> {
        let mut environment = BTreeMap::new();

        if let Some(file) = self.environment_file.as_deref().filter(|f| !f.is_empty()) {
            let path = shellexpand::full(file).context("Failed to expand environment_file path")?;
            environment.extend(load_environment_file(Path::new(path.as_ref()))?);
        }

        environment.extend(
            self.environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        Ok(environment)
    }
}

fn load_environment_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read environment file: {:?}", path))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse environment file: {:?}", path))
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|s|m|h|d)").expect("valid duration regex"))
}

/// Parse duration strings like "30s", "15m", "1h30m", "2d" or "500ms"
///
/// A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim().to_lowercase();
    if input.is_empty() {
        bail!("empty duration");
    }

    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in duration_regex().captures_iter(&input) {
        let whole = caps.get(0).ok_or_else(|| anyhow!("invalid duration: {:?}", input))?;
        if whole.start() != consumed {
            bail!("invalid duration: {:?}", input);
        }
        consumed = whole.end();

        let value: f64 = caps[1]
            .parse()
            .with_context(|| format!("invalid number in duration: {:?}", input))?;
        let unit_secs = match &caps[2] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86400.0,
            _ => unreachable!("unit constrained by regex"),
        };
        total += Duration::from_secs_f64(value * unit_secs);
    }

    if consumed != input.len() {
        bail!("invalid duration: {:?}. Use format like '30s', '15m', '1h30m'", input);
    }

    Ok(total)
}
