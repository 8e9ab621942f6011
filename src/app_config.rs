//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use light_fs::fs::FsOptions;
use light_fs::lock::{LockStrategy, LockTiming};

fn light_fs_data_dir() -> Option<PathBuf> {
    if let Some(path) = dirs::data_dir() {
        return Some(path.join("light-fs"));
    }

    if let Some(path) = dirs::home_dir() {
        return Some(path.join(".local").join("share").join("light-fs"));
    }

    None
}

fn default_data_dir() -> PathBuf {
    light_fs_data_dir().unwrap_or_else(|| PathBuf::from("/tmp/light-fs"))
}

fn default_name() -> String {
    String::from("fs")
}

fn default_save_delay_ms() -> u64 {
    500
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

/// Lock timing, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LockConfig {
    /// Lifetime of a cooperative lock record between renewals.
    pub ttl_ms: u64,
    /// Renew a record when it is this close to expiry.
    pub margin_ms: u64,
    /// Delay between acquisition attempts.
    pub interval_ms: u64,
    /// Give up waiting for the lock after this long.
    pub timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        let timing = LockTiming::default();
        let ms = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            ttl_ms: ms(timing.ttl),
            margin_ms: ms(timing.margin),
            interval_ms: ms(timing.interval),
            timeout_ms: ms(timing.timeout),
        }
    }
}

impl From<&LockConfig> for LockTiming {
    fn from(c: &LockConfig) -> Self {
        Self {
            ttl: Duration::from_millis(c.ttl_ms),
            margin: Duration::from_millis(c.margin_ms),
            interval: Duration::from_millis(c.interval_ms),
            timeout: Duration::from_millis(c.timeout_ms),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Root directory of every store and lock file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Name of the filesystem to open.
    #[serde(default = "default_name")]
    pub name: String,

    /// Base URL of an HTTP remote to populate the filesystem from.
    #[serde(default)]
    pub url: Option<String>,

    /// Fetch paths unknown to the tree from the remote.
    #[serde(default)]
    pub url_auto: bool,

    /// Lock implementation.
    #[serde(default)]
    pub lock_strategy: LockStrategy,

    /// Lock timing.
    #[serde(default)]
    pub lock: LockConfig,

    /// Quiet period before metadata changes are saved.
    #[serde(default = "default_save_delay_ms")]
    pub save_delay_ms: u64,

    /// Timeout of remote requests.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            name: default_name(),
            url: None,
            url_auto: false,
            lock_strategy: LockStrategy::default(),
            lock: LockConfig::default(),
            save_delay_ms: default_save_delay_ms(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push(String::from("Filesystem name must not be empty."));
        }

        if self.data_dir.as_os_str().is_empty() {
            errors.push(String::from("Data directory must not be empty."));
        }

        if self.url_auto && self.url.is_none() {
            errors.push(String::from("url-auto is set but no url is configured."));
        }

        if let Some(url) = &self.url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            errors.push(format!("Remote url '{url}' is not an http(s) URL."));
        }

        if self.lock.interval_ms == 0 {
            errors.push(String::from("lock.interval-ms must be greater than zero."));
        }

        if self.lock.margin_ms >= self.lock.ttl_ms {
            errors.push(format!(
                "lock.margin-ms ({}) must be smaller than lock.ttl-ms ({}).",
                self.lock.margin_ms, self.lock.ttl_ms
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Options for opening the configured filesystem.
    pub fn fs_options(&self) -> FsOptions {
        FsOptions {
            url: self.url.clone(),
            url_auto: self.url_auto,
            lock_strategy: self.lock_strategy,
            lock_timing: LockTiming::from(&self.lock),
            save_delay: Duration::from_millis(self.save_delay_ms),
            http_timeout: Duration::from_millis(self.http_timeout_ms),
            ..FsOptions::default()
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("light-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("light-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/light-fs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the external path if given, otherwise from the first config
    /// file found, otherwise the defaults.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let found = external_config_path
            .map(Path::to_path_buf)
            .or_else(Self::find_config_file);

        let Some(path) = found else {
            debug!("No configuration file found, using defaults.");
            return Ok(Self::default());
        };

        let config = Self::load_from_file(&path)?;
        if let Err(validation_errors) = config.validate() {
            return Err(ConfigError::ValidationErrors(validation_errors));
        }
        debug!("Loaded configuration successfully.");
        Ok(config)
    }
}
