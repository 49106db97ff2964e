//! Integration tests for configuration loading
//!
//! Env overrides are process-wide, so everything touching the environment
//! lives in one test.

use cpl_daq::config::{SpectrometerConfig, DEFAULT_CONFIG_PATH};
use cpl_daq::correction::{BlankErrorModel, GabsFormula};
use cpl_daq::hardware::Topology;
use std::io::Write;

#[test]
fn test_shipped_config_and_env_overrides() {
    let shipped = SpectrometerConfig::load_from(DEFAULT_CONFIG_PATH).unwrap();
    assert_eq!(shipped, SpectrometerConfig::default());
    assert!(shipped.validate().is_ok());

    std::env::set_var("CPL_DAQ_TIMING__MOVE_DELAY_S", "0.5");
    std::env::set_var("CPL_DAQ_ACQUISITION__TOPOLOGY", "single");
    let overridden = SpectrometerConfig::load_from(DEFAULT_CONFIG_PATH);
    std::env::remove_var("CPL_DAQ_TIMING__MOVE_DELAY_S");
    std::env::remove_var("CPL_DAQ_ACQUISITION__TOPOLOGY");

    let overridden = overridden.unwrap();
    assert_eq!(overridden.timing.move_delay_s, 0.5);
    assert_eq!(overridden.acquisition.topology, Topology::Single);
    assert_eq!(overridden.safety, shipped.safety);
}

#[test]
fn test_user_file_selects_formulas() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[correction]
gabs_formula = "historical_difference"
blank_error_model = "quadrature"

[safety]
shutdown_threshold_v = 2.5
"#
    )
    .unwrap();

    let config = SpectrometerConfig::load_from(file.path()).unwrap();
    assert_eq!(config.correction.gabs_formula, GabsFormula::HistoricalDifference);
    assert_eq!(config.correction.blank_error_model, BlankErrorModel::Quadrature);
    assert_eq!(config.safety.shutdown_threshold_v, 2.5);
    assert_eq!(config.safety.range_window, 5);
    assert_eq!(config.derived_formulas().gabs, GabsFormula::HistoricalDifference);
}

#[test]
fn test_invalid_values_fail_validation() {
    let config = SpectrometerConfig::from_toml_str(
        r#"
[acquisition]
max_read_attempts = 0
"#,
    )
    .unwrap();
    assert!(config.validate().is_err());
}
