//! Spectrometer configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/cpl.toml` (or an explicit path)
//! 2. Environment variables prefixed with `CPL_DAQ_`, sections separated by
//!    a double underscore, e.g. `CPL_DAQ_APPLICATION__LOG_LEVEL=debug`
//!
//! Every field has a default, so an empty or missing file yields the stock
//! instrument setup.
//!
//! # Example
//! ```no_run
//! use cpl_daq::config::SpectrometerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SpectrometerConfig::load()?;
//! config.validate()?;
//! println!("Data directory: {}", config.storage.data_dir.display());
//! # Ok(())
//! # }
//! ```

use crate::acquisition::SweepTiming;
use crate::correction::{BlankErrorModel, DerivedFormulas, GabsFormula, CD_CONSTANT};
use crate::error::{AppResult, CplError};
use crate::hardware::{bessel_corrections, PmtCalibration, Topology};
use crate::safety::SafetyLimits;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/cpl.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CPL_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrometerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Delays and polling intervals
    #[serde(default)]
    pub timing: TimingConfig,
    /// Sweep behaviour
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Oscilloscope safety thresholds
    #[serde(default)]
    pub safety: SafetyLimits,
    /// Derived channel and blank correction settings
    #[serde(default)]
    pub correction: CorrectionConfig,
    /// PMT gain curve
    #[serde(default)]
    pub pmt: PmtCalibration,
    /// Photoelastic modulator
    #[serde(default)]
    pub modulator: ModulatorConfig,
    /// Output locations
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Delays and polling intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Lock-in low-pass filter settling time before each read
    #[serde(default = "default_lowpass_risetime")]
    pub lowpass_filter_risetime_s: f64,
    /// Wait after each optical move
    #[serde(default = "default_move_delay")]
    pub move_delay_s: f64,
    /// Oscilloscope poll period of the safety monitor
    #[serde(default = "default_osc_refresh")]
    pub osc_refresh_interval_ms: u64,
}

/// Sweep behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Lock-in reads per wavelength before the sweep fails
    #[serde(default = "default_max_read_attempts")]
    pub max_read_attempts: u32,
    /// Single or dual monochromator
    #[serde(default)]
    pub topology: Topology,
    /// Linear polarization warning threshold for `lp_theta_std`
    #[serde(default = "default_lp_threshold")]
    pub lp_theta_std_warning_threshold: f64,
    /// Wavelength the optical path parks at after initialization
    #[serde(default = "default_home_wavelength")]
    pub home_wavelength_nm: f64,
}

/// Derived channel and blank correction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionConfig {
    /// CD instrument constant
    #[serde(default = "default_cd_constant")]
    pub cd_constant: f64,
    /// Dissymmetry formula (`sum` or `historical_difference`)
    #[serde(default)]
    pub gabs_formula: GabsFormula,
    /// Blank subtraction error model (`halved` or `quadrature`)
    #[serde(default)]
    pub blank_error_model: BlankErrorModel,
}

/// Photoelastic modulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModulatorConfig {
    /// Peak retardation in waves
    #[serde(default = "default_retardation")]
    pub retardation: f64,
}

/// Output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for spectra and their parameter records
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Last-used settings record
    #[serde(default = "default_last_params")]
    pub last_params_file: PathBuf,
}

// Default value functions
fn default_app_name() -> String {
    "CPL DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_lowpass_risetime() -> f64 {
    0.6
}

fn default_move_delay() -> f64 {
    0.2
}

fn default_osc_refresh() -> u64 {
    100
}

fn default_max_read_attempts() -> u32 {
    5
}

fn default_lp_threshold() -> f64 {
    1.0
}

fn default_home_wavelength() -> f64 {
    1000.0
}

fn default_cd_constant() -> f64 {
    CD_CONSTANT
}

fn default_retardation() -> f64 {
    0.25
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_last_params() -> PathBuf {
    PathBuf::from("last_params.txt")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            lowpass_filter_risetime_s: default_lowpass_risetime(),
            move_delay_s: default_move_delay(),
            osc_refresh_interval_ms: default_osc_refresh(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            max_read_attempts: default_max_read_attempts(),
            topology: Topology::default(),
            lp_theta_std_warning_threshold: default_lp_threshold(),
            home_wavelength_nm: default_home_wavelength(),
        }
    }
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            cd_constant: default_cd_constant(),
            gabs_formula: GabsFormula::default(),
            blank_error_model: BlankErrorModel::default(),
        }
    }
}

impl Default for ModulatorConfig {
    fn default() -> Self {
        Self {
            retardation: default_retardation(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            last_params_file: default_last_params(),
        }
    }
}

impl SpectrometerConfig {
    /// Load from `config/cpl.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file is
    /// not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse a TOML string without consulting the environment.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(CplError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        for (field, value) in [
            ("timing.lowpass_filter_risetime_s", self.timing.lowpass_filter_risetime_s),
            ("timing.move_delay_s", self.timing.move_delay_s),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{} must be a non-negative number, got {}", field, value));
            }
        }
        if self.timing.osc_refresh_interval_ms == 0 {
            return invalid("timing.osc_refresh_interval_ms must be at least 1".to_string());
        }

        if self.acquisition.max_read_attempts == 0 {
            return invalid("acquisition.max_read_attempts must be at least 1".to_string());
        }
        if !(self.acquisition.home_wavelength_nm.is_finite() && self.acquisition.home_wavelength_nm > 0.0) {
            return invalid(format!(
                "acquisition.home_wavelength_nm must be positive, got {}",
                self.acquisition.home_wavelength_nm
            ));
        }

        let safety = &self.safety;
        if safety.range_window == 0 || safety.pmt_window == 0 {
            return invalid("safety windows must hold at least one sample".to_string());
        }
        if safety.range_window.max(safety.pmt_window) > safety.history_length {
            return invalid(format!(
                "safety.history_length {} is shorter than the check windows",
                safety.history_length
            ));
        }
        if !(safety.range_limit_fraction > 0.0 && safety.range_limit_fraction <= 1.0) {
            return invalid(format!(
                "safety.range_limit_fraction must be in (0, 1], got {}",
                safety.range_limit_fraction
            ));
        }
        if !(safety.shutdown_threshold_v > 0.0) || !(safety.range_tolerance_v >= 0.0) {
            return invalid("safety thresholds must be positive".to_string());
        }

        if !(self.correction.cd_constant.is_finite() && self.correction.cd_constant > 0.0) {
            return invalid(format!(
                "correction.cd_constant must be positive, got {}",
                self.correction.cd_constant
            ));
        }

        let pmt = &self.pmt;
        if !(pmt.slope > 0.0 && pmt.gain_norm > 0.0 && pmt.max_voltage > 0.0 && pmt.max_gain >= 1.0) {
            return invalid("pmt calibration constants must be positive".to_string());
        }

        if !(self.modulator.retardation > 0.0 && self.modulator.retardation < 1.0) {
            return invalid(format!(
                "modulator.retardation must be in (0, 1) waves, got {}",
                self.modulator.retardation
            ));
        }

        if self.storage.data_dir.as_os_str().is_empty() {
            return invalid("storage.data_dir must not be empty".to_string());
        }

        Ok(())
    }

    /// Per-point timing for the scheduler.
    pub fn sweep_timing(&self) -> SweepTiming {
        SweepTiming {
            lowpass_risetime: Duration::from_secs_f64(self.timing.lowpass_filter_risetime_s),
            max_read_attempts: self.acquisition.max_read_attempts,
            lp_theta_std_warning_threshold: self.acquisition.lp_theta_std_warning_threshold,
        }
    }

    /// Derived channel formulas without sample parameters.
    pub fn derived_formulas(&self) -> DerivedFormulas {
        DerivedFormulas {
            cd_constant: self.correction.cd_constant,
            gabs: self.correction.gabs_formula,
            sample: None,
        }
    }

    /// Wait after each optical move.
    pub fn move_delay(&self) -> Duration {
        Duration::from_secs_f64(self.timing.move_delay_s)
    }

    /// Safety monitor poll period.
    pub fn osc_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.timing.osc_refresh_interval_ms)
    }

    /// `(bessel_corr, bessel_corr_lp)` for the configured retardation.
    pub fn bessel_corrections(&self) -> (f64, f64) {
        bessel_corrections(self.modulator.retardation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SpectrometerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.max_read_attempts, 5);
        assert_eq!(config.acquisition.topology, Topology::Dual);
        assert_eq!(config.safety.history_length, 75);
        assert_eq!(config.sweep_timing().lowpass_risetime, Duration::from_millis(600));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SpectrometerConfig::from_toml_str(
            r#"
            [acquisition]
            topology = "single"

            [correction]
            blank_error_model = "quadrature"

            [safety]
            shutdown_threshold_v = 2.5
            "#,
        )
        .unwrap();

        assert_eq!(config.acquisition.topology, Topology::Single);
        assert_eq!(config.acquisition.max_read_attempts, 5);
        assert_eq!(config.correction.blank_error_model, BlankErrorModel::Quadrature);
        assert_eq!(config.safety.shutdown_threshold_v, 2.5);
        assert_eq!(config.safety.range_window, 5);
        assert_eq!(config.timing.move_delay_s, 0.2);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[application]\nlog_level = \"debug\"\n[storage]\ndata_dir = \"spectra\"").unwrap();

        let config = SpectrometerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.storage.data_dir, PathBuf::from("spectra"));
        assert_eq!(config.storage.last_params_file, PathBuf::from("last_params.txt"));
    }

    #[test]
    fn test_bad_enum_value_is_config_error() {
        let err = SpectrometerConfig::from_toml_str("[acquisition]\ntopology = \"triple\"").unwrap_err();
        assert!(matches!(err, CplError::Config(_)));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = SpectrometerConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(CplError::Configuration(_))));
    }

    #[test]
    fn test_window_longer_than_history() {
        let mut config = SpectrometerConfig::default();
        config.safety.history_length = 4;
        assert!(config.validate().is_err());

        let mut config = SpectrometerConfig::default();
        config.acquisition.max_read_attempts = 0;
        assert!(config.validate().is_err());
    }
}
