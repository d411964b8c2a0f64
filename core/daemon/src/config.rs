//! Runtime configuration for the daemon, read from `config.toml`.
//!
//! A missing file means defaults. Every section and key is optional.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_ENV: &str = "PROCTRACK_CONFIG";

pub const DEFAULT_TIMEOUT_SECS: i64 = 15;
const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 5;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 50;
const DEFAULT_SNAPSHOT_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ReconcileConfig {
    /// An ACTIVE process not seen for longer than this is ENDED.
    pub timeout_secs: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_WATCHDOG_INTERVAL_SECS,
        }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct HistoryConfig {
    pub snapshot_retention_hours: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            snapshot_retention_hours: DEFAULT_SNAPSHOT_RETENTION_HOURS,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.reconcile.timeout_secs <= 0 {
            return Err("reconcile.timeout_secs must be positive".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.history.snapshot_retention_hours <= 0 {
            return Err("history.snapshot_retention_hours must be positive".to_string());
        }
        Ok(())
    }
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read config {}: {}",
            config_path.display(),
            err
        )
    })?;
    let config = toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse config {}: {}",
            config_path.display(),
            err
        )
    })?;
    config
        .validate()
        .map_err(|err| format!("Invalid config {}: {}", config_path.display(), err))?;
    Ok(config)
}

fn default_config_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".proctrack").join("daemon").join("config.toml"))
}
