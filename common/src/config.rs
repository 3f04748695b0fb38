// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Main settings structure containing all configuration options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub observability: ObservabilitySettings,
    #[serde(default)]
    pub tasks: Vec<TaskSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_tick_interval_seconds(),
        }
    }
}

fn default_tick_interval_seconds() -> u64 {
    60
}

/// Which shared store coordinates the fleet. Memory coordinates only within
/// one process; file needs a directory every host can reach; redis is the
/// usual multi-host choice.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreSettings {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    "cronlock:".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus listener port; metrics are off when unset.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One recurring task declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Unique task name; also the identity its mutex key derives from.
    pub name: String,
    /// Shell command line the task runs.
    pub command: String,
    #[serde(default = "default_cron")]
    pub cron: String,
    /// IANA timezone the cron expression is evaluated in. Defaults to the
    /// host's local timezone.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub without_overlapping: bool,
    /// Overlap mutex TTL. Only consulted when `without_overlapping` is set.
    #[serde(default = "default_expires_after_minutes")]
    pub expires_after_minutes: u64,
    #[serde(default)]
    pub on_one_server: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_cron() -> String {
    crate::schedule::DEFAULT_EXPRESSION.to_string()
}

fn default_expires_after_minutes() -> u64 {
    crate::task::DEFAULT_MUTEX_EXPIRY_MINUTES
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory.
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides, not committed to git
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("CRONLOCK")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Structural validation. Cron expressions and timezones are validated
    /// later, when the registry builds its tasks.
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.tick_interval_seconds == 0 {
            return Err("Scheduler tick_interval_seconds must be greater than 0".to_string());
        }

        match &self.store {
            StoreSettings::Memory => {}
            StoreSettings::File { path } => {
                if path.as_os_str().is_empty() {
                    return Err("File store path cannot be empty".to_string());
                }
            }
            StoreSettings::Redis { url, .. } => {
                if url.is_empty() {
                    return Err("Redis URL cannot be empty".to_string());
                }
            }
        }

        if self.observability.log_level.is_empty() {
            return Err("Log level cannot be empty".to_string());
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err("Task name cannot be empty".to_string());
            }
            if task.command.is_empty() {
                return Err(format!("Task '{}' has an empty command", task.name));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(format!("Duplicate task name '{}'", task.name));
            }
            if task.without_overlapping && task.expires_after_minutes == 0 {
                return Err(format!(
                    "Task '{}' requires expires_after_minutes greater than 0",
                    task.name
                ));
            }
        }

        Ok(())
    }
}
