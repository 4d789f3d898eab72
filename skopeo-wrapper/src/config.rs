//! Wrapper configuration.
//!
//! Settings come from, in increasing precedence: built-in defaults, an ini
//! file, and whatever the caller applies through the `with_*` setters (the
//! CLI maps its flags onto those).
//!
//! ```ini
//! [skopeo]
//! path = /usr/bin/skopeo
//! timeout_secs = 600
//!
//! [metrics]
//! enabled = true
//! heartbeat_interval_secs = 10
//!
//! [logging]
//! level = info
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::tracker::{TrackerConfig, DEFAULT_HEARTBEAT_INTERVAL};

/// Default skopeo executable, resolved through `PATH`.
pub const DEFAULT_SKOPEO_PATH: &str = "skopeo";

/// Default log level directive.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const CONFIG_DIR_NAME: &str = "skopeo-wrapper";
const CONFIG_FILE_NAME: &str = "config.ini";

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("Invalid value for [{section}] {key}: {value:?} ({reason})")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for [`SkopeoWrapper`](crate::skopeo::SkopeoWrapper).
#[derive(Debug, Clone, PartialEq)]
pub struct WrapperConfig {
    pub skopeo_path: PathBuf,
    pub metrics_enabled: bool,
    pub heartbeat_interval: Duration,
    /// Applied when a call does not pass its own timeout.
    pub default_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            skopeo_path: PathBuf::from(DEFAULT_SKOPEO_PATH),
            metrics_enabled: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            default_timeout: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl WrapperConfig {
    /// `<config dir>/skopeo-wrapper/config.ini`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ini(&ini)
    }

    /// Load from the default location, or defaults when there is none.
    pub fn load_default() -> ConfigResult<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Parse ini text.
    pub fn from_ini_str(text: &str) -> ConfigResult<Self> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Read {
            path: PathBuf::from("<string>"),
            source: ini::Error::Parse(e),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("skopeo")) {
            if let Some(path) = section.get("path").map(str::trim).filter(|v| !v.is_empty()) {
                config.skopeo_path = PathBuf::from(path);
            }
            if let Some(value) = section.get("timeout_secs") {
                let secs = parse_secs("skopeo", "timeout_secs", value)?;
                // 0 disables the timeout
                config.default_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }

        if let Some(section) = ini.section(Some("metrics")) {
            if let Some(value) = section.get("enabled") {
                config.metrics_enabled = parse_bool("metrics", "enabled", value)?;
            }
            if let Some(value) = section.get("heartbeat_interval_secs") {
                let secs = parse_secs("metrics", "heartbeat_interval_secs", value)?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        section: "metrics",
                        key: "heartbeat_interval_secs",
                        value: value.to_string(),
                        reason: "must be at least 1".to_string(),
                    });
                }
                config.heartbeat_interval = Duration::from_secs(secs);
            }
        }

        if let Some(section) = ini.section(Some("logging")) {
            if let Some(level) = section.get("level").map(str::trim).filter(|v| !v.is_empty()) {
                config.log_level = level.to_string();
            }
        }

        Ok(config)
    }

    pub fn with_skopeo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.skopeo_path = path.into();
        self
    }

    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Settings handed to each operation tracker.
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig::default()
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_metrics_enabled(self.metrics_enabled)
    }
}

fn parse_secs(section: &'static str, key: &'static str, value: &str) -> ConfigResult<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidValue {
            section,
            key,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(section: &'static str, key: &'static str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            section,
            key,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}
