//! Loading `FocusDaqConfig` from TOML files and the environment.

use focus_daq::config::{ConfigError, FocusDaqConfig};
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
#[serial]
fn test_missing_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = FocusDaqConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, FocusDaqConfig::default());
    assert_eq!(config.encoder.chip_select, 17);
    assert_eq!(config.driver.chip_select, 18);
}

#[test]
#[serial]
fn test_partial_file_keeps_other_defaults() {
    let file = write_config(
        r#"
[driver]
step_angle_deg = 1.8
max_current_a = 1.2

[focus]
lower_bound = 1200
upper_bound = 15000
"#,
    );

    let config = FocusDaqConfig::load_from(file.path()).unwrap();
    assert_eq!(config.driver.step_angle_deg, 1.8);
    assert_eq!(config.driver.max_current_a, 1.2);
    assert_eq!(config.driver.bit_rate_hz, 4_000_000);
    assert_eq!(config.focus.lower_bound, 1200);
    assert_eq!(config.focus.upper_bound, 15000);
    assert_eq!(config.focus.safety_threshold, 500);
    assert_eq!(config.focus.update_rate_hz, 50);
}

#[test]
#[serial]
fn test_shipped_config_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/focus.toml");
    let config = FocusDaqConfig::load_from(path).unwrap();
    assert_eq!(config, FocusDaqConfig::default());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(
        r#"
[focus]
update_rate_hz = 20
"#,
    );

    std::env::set_var("FOCUSDAQ_FOCUS__UPDATE_RATE_HZ", "100");
    std::env::set_var("FOCUSDAQ_BUS__SIMULATE", "true");
    let result = FocusDaqConfig::load_from(file.path());
    std::env::remove_var("FOCUSDAQ_FOCUS__UPDATE_RATE_HZ");
    std::env::remove_var("FOCUSDAQ_BUS__SIMULATE");

    let config = result.unwrap();
    assert_eq!(config.focus.update_rate_hz, 100);
    assert!(config.bus.simulate);
}

#[test]
#[serial]
fn test_invalid_values_fail_validation() {
    let file = write_config(
        r#"
[encoder]
chip_select = 8

[driver]
chip_select = 8
"#,
    );

    let err = FocusDaqConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
#[serial]
fn test_malformed_file_is_a_load_error() {
    let file = write_config(
        r#"
[focus]
update_rate_hz = "fast"
"#,
    );

    let err = FocusDaqConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::LoadError(_)));
}
