//! Configuration System
//!
//! This module provides configuration management for the focuser using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `FOCUSDAQ_`
//! 2. TOML configuration file (default: `config/focus.toml`)
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```no_run
//! use focus_daq::config::FocusDaqConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FocusDaqConfig::load_from("config/focus.toml")?;
//!
//!     println!("App name: {}", config.application.name);
//!     println!("Travel: {}..{}", config.focus.lower_bound, config.focus.upper_bound);
//!     Ok(())
//! }
//! ```

pub mod focus_config;

pub use focus_config::{
    ApplicationConfig, BusConfig, ConfigError, DriverConfig, EncoderConfig, FocusConfig,
    FocusDaqConfig,
};
