//! Custom error types for the spectrometer engine.
//!
//! `CplError` is the crate-wide error. It is built with `thiserror` so every
//! layer can use `?` and still surface a precise cause to the operator.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment extraction failures and
//!   semantic validation failures of the loaded configuration.
//! - **`Validation`**: an [`AcquisitionRequest`](crate::acquisition::AcquisitionRequest)
//!   was rejected before any hardware motion.
//! - **`HardAcquisitionFailure`**: the lock-in delivered no data after the
//!   configured number of attempts. Fatal to the running sweep.
//! - **`Device`**: a device driver faulted. Never retried by the engine.
//! - **`Busy`**: a sweep or calibration is already in progress.
//! - **`Io`** / **`Csv`** / **`ParameterFormat`**: persistence failures.
//!
//! Transient read failures are not errors at all: they come back as
//! `ReadOutcome { success: false, .. }` and are retried by the scheduler.

use crate::busy::Activity;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, CplError>;

/// Error returned by a wavelength sweep.
pub type SweepError = CplError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Category of a driver fault.
pub enum DriverErrorKind {
    /// Device did not come up.
    Initialization,
    /// Bus or protocol failure while talking to the device.
    Communication,
    /// Device did not answer in time.
    Timeout,
    /// Device rejected a parameter.
    InvalidParameter,
    /// Failure while closing the device.
    Shutdown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Shutdown => "shutdown",
        };
        write!(f, "{}", label)
    }
}

/// Structured fault raised by a device driver.
///
/// Drivers return it through `anyhow::Error` at the capability boundary; the
/// engine wraps that into [`CplError::Device`].
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver name, e.g. `"mock_lockin"`.
    pub driver_type: String,
    /// Fault category.
    pub kind: DriverErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl DriverError {
    /// Build a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Reasons an acquisition request is refused before the sweep starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The output name is empty.
    #[error("Output name must not be empty")]
    EmptyName,

    /// The output name contains a character that is not allowed in file names.
    #[error("Output name '{name}' contains illegal character '{character}'")]
    IllegalCharacter {
        /// Offending name.
        name: String,
        /// First illegal character found.
        character: char,
    },

    /// A spectrum with this name already exists in the data directory.
    #[error("Output '{0}' already exists")]
    OutputExists(String),

    /// A referenced blank or correction file does not exist.
    #[error("{role} file '{name}' does not exist")]
    MissingFile {
        /// Which correction input referenced the file.
        role: &'static str,
        /// Referenced name.
        name: String,
    },

    /// Start and end wavelength coincide.
    #[error("Start and end wavelength are identical ({0} nm)")]
    DegenerateRange(f64),

    /// A quantity that must be strictly positive is not.
    #[error("{field} must be positive, got {value}")]
    NonPositive {
        /// Field name.
        field: &'static str,
        /// Rejected value.
        value: f64,
    },

    /// A numeric field is NaN or infinite.
    #[error("{field} is not a finite number")]
    NotFinite {
        /// Field name.
        field: &'static str,
    },

    /// Zero repetitions were requested.
    #[error("At least one repetition is required")]
    NoRepetitions,
}

/// Primary error type for the spectrometer engine.
#[derive(Error, Debug)]
pub enum CplError {
    /// Configuration could not be extracted from file or environment.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but holds an invalid value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Acquisition request rejected before any hardware motion.
    #[error("Invalid acquisition request: {0}")]
    Validation(#[from] ValidationError),

    /// No successful lock-in read after the retry budget was spent.
    ///
    /// **Recovery Strategy**: the sweep has already been aborted, the PMT
    /// zeroed and the optical path returned to the start wavelength. Check
    /// the lock-in connection before starting another sweep.
    #[error("No data received at {wavelength_nm} nm after {attempts} tries")]
    HardAcquisitionFailure {
        /// Wavelength at which the reads failed.
        wavelength_nm: f64,
        /// Number of reads attempted.
        attempts: u32,
    },

    /// A device driver faulted. Not retried by the engine.
    #[error("Device communication error: {0:#}")]
    Device(#[from] anyhow::Error),

    /// Another long-running activity holds the busy gate.
    #[error("Instrument busy: {active} in progress")]
    Busy {
        /// The activity currently running.
        active: Activity,
    },

    /// A calibration action is not allowed in the current step.
    #[error("Cannot {action} during calibration step '{step}'")]
    InvalidTransition {
        /// Requested action.
        action: &'static str,
        /// Step the session was in.
        step: String,
    },

    /// An operation needed initialized instruments.
    #[error("Instruments are not initialized")]
    NotInitialized,

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Spectrum file could not be read or written.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Parameter record could not be parsed or encoded.
    #[error("Parameter record error: {0}")]
    ParameterFormat(String),

    /// Numerical post-processing failed.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// A background worker ended abnormally.
    #[error("Worker '{name}' failed: {message}")]
    Worker {
        /// Worker name.
        name: String,
        /// Join failure detail.
        message: String,
    },
}

impl From<figment::Error> for CplError {
    fn from(err: figment::Error) -> Self {
        CplError::Config(Box::new(err))
    }
}

impl From<DriverError> for CplError {
    fn from(err: DriverError) -> Self {
        CplError::Device(anyhow::Error::new(err))
    }
}

impl CplError {
    /// Whether the error came from a device driver.
    pub fn is_device_fault(&self) -> bool {
        matches!(self, CplError::Device(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = CplError::from(DriverError::new(
            "mock_lockin",
            DriverErrorKind::Communication,
            "bus timeout",
        ));
        assert!(err.is_device_fault());
        let text = err.to_string();
        assert!(text.contains("mock_lockin"));
        assert!(text.contains("communication"));
        assert!(text.contains("bus timeout"));
    }

    #[test]
    fn test_hard_failure_message_names_wavelength() {
        let err = CplError::HardAcquisitionFailure {
            wavelength_nm: 512.5,
            attempts: 5,
        };
        assert_eq!(err.to_string(), "No data received at 512.5 nm after 5 tries");
    }

    #[test]
    fn test_validation_error_converts() {
        let err: CplError = ValidationError::DegenerateRange(400.0).into();
        assert!(matches!(
            err,
            CplError::Validation(ValidationError::DegenerateRange(_))
        ));
    }

    #[test]
    fn test_busy_display() {
        let err = CplError::Busy {
            active: Activity::Calibration,
        };
        assert_eq!(err.to_string(), "Instrument busy: calibration in progress");
    }
}
