//! Focuser configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/focus.toml` (or any path given to [`FocusDaqConfig::load_from`])
//! 2. Environment variables prefixed with `FOCUSDAQ_`
//!
//! Nested keys are separated by a double underscore, so field names keep their own
//! underscores:
//!
//! ```text
//! FOCUSDAQ_APPLICATION__LOG_LEVEL=debug
//! FOCUSDAQ_BUS__SIMULATE=true
//! FOCUSDAQ_FOCUS__UPDATE_RATE_HZ=100
//! ```
//!
//! Every field has a default, so a missing file still yields a usable configuration.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed into the schema
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// The values parsed but are not usable
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level focuser configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusDaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Shared SPI bus
    pub bus: BusConfig,
    /// AMT22 encoder
    pub encoder: EncoderConfig,
    /// L6470 driver
    pub driver: DriverConfig,
    /// Closed-loop focus axis
    pub focus: FocusConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "focus_daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Shared bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// spidev device node
    pub device: String,
    /// Use the simulated focuser instead of real hardware
    pub simulate: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: "/dev/spidev0.0".to_string(),
            simulate: false,
        }
    }
}

/// Encoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Chip-select GPIO (BCM numbering)
    pub chip_select: u8,
    /// Clock rate in Hz
    pub bit_rate_hz: u32,
    /// 12 or 14
    pub resolution_bits: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            chip_select: 17,
            bit_rate_hz: 1_000_000,
            resolution_bits: 14,
        }
    }
}

/// Stepper driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Chip-select GPIO (BCM numbering)
    pub chip_select: u8,
    /// Clock rate in Hz
    pub bit_rate_hz: u32,
    /// Degrees per full step of the motor
    pub step_angle_deg: f64,
    /// Motor current rating in amps
    pub max_current_a: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            chip_select: 18,
            bit_rate_hz: 4_000_000,
            step_angle_deg: 0.9,
            max_current_a: 1.7,
        }
    }
}

/// Focus axis configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    /// Encoder tick at normalized position 0
    pub lower_bound: u16,
    /// Encoder tick at normalized position 1
    pub upper_bound: u16,
    /// Ticks kept clear of each bound
    pub safety_threshold: u16,
    /// Control loop iterations per second
    pub update_rate_hz: u32,
    /// How long disposal waits for a running move, in milliseconds
    pub dispose_timeout_ms: u64,
    /// Speed used when a move does not name one
    pub default_max_rpm: f64,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            lower_bound: 0,
            upper_bound: 0x3FFF,
            safety_threshold: 500,
            update_rate_hz: 50,
            dispose_timeout_ms: 500,
            default_max_rpm: 60.0,
        }
    }
}

impl FocusDaqConfig {
    /// Load `config/focus.toml` plus environment overrides, then validate.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if:
    /// - The file or environment values do not match the schema
    /// - Validation fails
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/focus.toml")
    }

    /// Load a specific file plus environment overrides, then validate.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file (a missing file means all defaults)
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FOCUSDAQ_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Encoder resolution is 12 or 14 bits
    /// - Encoder and driver use different chip selects
    /// - Step angle and max current are positive
    /// - The travel range is not empty and the loop rate is not zero
    ///
    /// `focus.safety_threshold` is not checked against the travel range; a margin
    /// wider than half the range makes every move stop immediately.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if ![12, 14].contains(&self.encoder.resolution_bits) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid encoder resolution_bits {}. Must be 12 or 14",
                self.encoder.resolution_bits
            )));
        }

        if self.encoder.chip_select == self.driver.chip_select {
            return Err(ConfigError::ValidationError(format!(
                "Encoder and driver both use chip select {}",
                self.encoder.chip_select
            )));
        }

        if !(self.driver.step_angle_deg.is_finite() && self.driver.step_angle_deg > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid step_angle_deg {}. Must be positive",
                self.driver.step_angle_deg
            )));
        }

        if !(self.driver.max_current_a.is_finite() && self.driver.max_current_a > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid max_current_a {}. Must be positive",
                self.driver.max_current_a
            )));
        }

        if self.focus.lower_bound >= self.focus.upper_bound {
            return Err(ConfigError::ValidationError(format!(
                "lower_bound ({}) must be below upper_bound ({})",
                self.focus.lower_bound, self.focus.upper_bound
            )));
        }

        if self.focus.update_rate_hz == 0 {
            return Err(ConfigError::ValidationError(
                "update_rate_hz must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation_valid() {
        let config = FocusDaqConfig {
            application: ApplicationConfig {
                name: "Test focuser".to_string(),
                log_level: "debug".to_string(),
            },
            bus: BusConfig {
                device: "/dev/spidev0.0".to_string(),
                simulate: true,
            },
            encoder: EncoderConfig {
                chip_select: 17,
                bit_rate_hz: 1_000_000,
                resolution_bits: 12,
            },
            driver: DriverConfig {
                chip_select: 18,
                bit_rate_hz: 4_000_000,
                step_angle_deg: 1.8,
                max_current_a: 1.5,
            },
            focus: FocusConfig {
                lower_bound: 100,
                upper_bound: 4000,
                safety_threshold: 50,
                update_rate_hz: 100,
                dispose_timeout_ms: 500,
                default_max_rpm: 30.0,
            },
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(FocusDaqConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = FocusDaqConfig::default();
        config.application.log_level = "verbose".to_string();

        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_shared_chip_select_rejected() {
        let mut config = FocusDaqConfig::default();
        config.driver.chip_select = config.encoder.chip_select;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("both use chip select"));
    }

    #[test]
    fn test_invalid_resolution() {
        let mut config = FocusDaqConfig::default();
        config.encoder.resolution_bits = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_motor_parameters() {
        let mut config = FocusDaqConfig::default();
        config.driver.step_angle_deg = 0.0;
        assert!(config.validate().is_err());

        let mut config = FocusDaqConfig::default();
        config.driver.max_current_a = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_travel_range() {
        let mut config = FocusDaqConfig::default();
        config.focus.lower_bound = 2000;
        config.focus.upper_bound = 2000;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("lower_bound"));
    }

    #[test]
    fn test_zero_update_rate() {
        let mut config = FocusDaqConfig::default();
        config.focus.update_rate_hz = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_safety_threshold_not_checked() {
        let mut config = FocusDaqConfig::default();
        config.focus.lower_bound = 0;
        config.focus.upper_bound = 100;
        config.focus.safety_threshold = 400;
        assert!(config.validate().is_ok());
    }
}
