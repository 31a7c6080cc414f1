//! Engine configuration using Figment
//!
//! Configuration is layered, highest precedence last:
//! 1. Built-in defaults
//! 2. A TOML file (`beamline.toml` unless a path is given)
//! 3. Environment variables prefixed with `BEAMLINE_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! BEAMLINE_APPLICATION__LOG_LEVEL=debug
//! BEAMLINE_TIMEOUTS__MOVE_TIMEOUT=45s
//! BEAMLINE_STATUS__HISTORY_DEPTH=32
//! ```
//!
//! # Example
//!
//! ```no_run
//! use beamline_devices::config::EngineConfig;
//!
//! let config = EngineConfig::load()?;
//! println!("Move timeout: {:?}", config.timeouts.move_timeout);
//! # Ok::<(), beamline_devices::config::ConfigError>(())
//! ```

use crate::device::TransitionKind;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name, resolved relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "beamline.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "BEAMLINE_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Sources failed to merge or deserialize
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values merged but are inconsistent
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Per-transition-kind timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Status tracking settings
    #[serde(default)]
    pub status: StatusConfig,
    /// Simulated device definitions
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Wall-clock timeouts, one per transition kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Limit for moves
    #[serde(with = "humantime_serde", default = "default_move_timeout")]
    pub move_timeout: Duration,
    /// Limit for configure requests
    #[serde(with = "humantime_serde", default = "default_configure_timeout")]
    pub configure_timeout: Duration,
    /// Limit for shutter-style actuation
    #[serde(with = "humantime_serde", default = "default_actuate_timeout")]
    pub actuate_timeout: Duration,
    /// How long a cancelled transition waits for the stop to be confirmed
    /// before resolving as cancelled anyway.
    #[serde(with = "humantime_serde", default = "default_cancel_grace")]
    pub cancel_grace: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            move_timeout: default_move_timeout(),
            configure_timeout: default_configure_timeout(),
            actuate_timeout: default_actuate_timeout(),
            cancel_grace: default_cancel_grace(),
        }
    }
}

impl TimeoutConfig {
    /// Timeout armed for a transition of the given kind.
    pub fn for_kind(&self, kind: TransitionKind) -> Duration {
        match kind {
            TransitionKind::Move => self.move_timeout,
            TransitionKind::Configure => self.configure_timeout,
            TransitionKind::Actuate => self.actuate_timeout,
        }
    }
}

/// Status tracking configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Number of recent Status objects retained per device for introspection
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            history_depth: default_history_depth(),
        }
    }
}

/// Kind of simulated device built from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Motor axis with soft limits
    Positioner,
    /// Open/close shutter
    Shutter,
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device name
    pub name: String,
    /// Control-system address prefix (e.g., "XPP:SB2:MMS:01")
    pub prefix: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Lower travel limit (positioners only)
    #[serde(default)]
    pub low_limit: Option<f64>,
    /// Upper travel limit (positioners only)
    #[serde(default)]
    pub high_limit: Option<f64>,
    /// In-position tolerance (positioners only)
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Whether the device accepts a stop command
    #[serde(default = "default_supports_cancel")]
    pub supports_cancel: bool,
    /// Simulated travel speed in units per second (positioners only)
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Container node this device is attached to, created on first use
    #[serde(default)]
    pub group: Option<String>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "beamline-devices".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_move_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_configure_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_actuate_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_cancel_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_history_depth() -> usize {
    16
}

fn default_tolerance() -> f64 {
    0.01
}

fn default_supports_cancel() -> bool {
    true
}

fn default_speed() -> f64 {
    5.0
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl EngineConfig {
    /// Load configuration from `beamline.toml` and environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack, exposed so callers can merge additional layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level and log format are recognised
    /// - No timeout is zero
    /// - History depth is non-zero
    /// - Device names are unique and limits are ordered
    /// - Group names do not shadow device names
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        let timeouts = [
            ("move_timeout", self.timeouts.move_timeout),
            ("configure_timeout", self.timeouts.configure_timeout),
            ("actuate_timeout", self.timeouts.actuate_timeout),
            ("cancel_grace", self.timeouts.cancel_grace),
        ];
        for (key, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "Timeout '{}' must be greater than zero",
                    key
                )));
            }
        }

        if self.status.history_depth == 0 {
            return Err(ConfigError::ValidationError(
                "status.history_depth must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(&device.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device name: '{}'",
                    device.name
                )));
            }
            if let (Some(low), Some(high)) = (device.low_limit, device.high_limit) {
                if low > high {
                    return Err(ConfigError::ValidationError(format!(
                        "Device '{}' has low_limit {} above high_limit {}",
                        device.name, low, high
                    )));
                }
            }
            if device.tolerance < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "Device '{}' has negative tolerance",
                    device.name
                )));
            }
            if device.speed <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "Device '{}' must have a positive speed",
                    device.name
                )));
            }
        }

        for group in self.devices.iter().filter_map(|d| d.group.as_ref()) {
            if names.contains(group) {
                return Err(ConfigError::ValidationError(format!(
                    "Group '{}' clashes with a device of the same name",
                    group
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeouts.move_timeout, Duration::from_secs(30));
        assert_eq!(config.status.history_depth, 16);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[timeouts]
move_timeout = "45s"
cancel_grace = "500ms"

[[devices]]
name = "sample_x"
prefix = "XPP:SB2:MMS:01"
kind = "positioner"
low_limit = -10.0
high_limit = 10.0
"#
        )
        .unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.timeouts.move_timeout, Duration::from_secs(45));
        assert_eq!(config.timeouts.cancel_grace, Duration::from_millis(500));
        // Untouched keys keep their defaults
        assert_eq!(config.timeouts.configure_timeout, Duration::from_secs(5));
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].kind, DeviceKind::Positioner);
        assert!(config.devices[0].supports_cancel);
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "beamline.toml",
                r#"
[status]
history_depth = 4
"#,
            )?;
            jail.set_env("BEAMLINE_STATUS__HISTORY_DEPTH", "32");
            jail.set_env("BEAMLINE_TIMEOUTS__ACTUATE_TIMEOUT", "3s");

            let config = EngineConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.status.history_depth, 32);
            assert_eq!(config.timeouts.actuate_timeout, Duration::from_secs(3));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = EngineConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.application.log_level, "info");
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_zero_history() {
        let mut config = EngineConfig::default();
        config.status.history_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validation_rejects_duplicate_devices() {
        let device = DeviceDefinition {
            name: "shutter".into(),
            prefix: "XPP:SH:01".into(),
            kind: DeviceKind::Shutter,
            low_limit: None,
            high_limit: None,
            tolerance: 0.0,
            supports_cancel: false,
            speed: 1.0,
            group: None,
        };
        let config = EngineConfig {
            devices: vec![device.clone(), device.clone()],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate device name"));

        let grouped = DeviceDefinition {
            name: "blade".into(),
            group: Some("shutter".into()),
            ..device.clone()
        };
        let config = EngineConfig {
            devices: vec![device, grouped],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("clashes"));
    }

    #[test]
    fn test_timeout_for_kind() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.for_kind(TransitionKind::Move), timeouts.move_timeout);
        assert_eq!(
            timeouts.for_kind(TransitionKind::Actuate),
            timeouts.actuate_timeout
        );
    }
}
