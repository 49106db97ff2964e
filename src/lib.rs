//! # CPL DAQ Core Library
//!
//! Acquisition, safety-monitoring and calibration engine for a circular
//! dichroism / circularly polarized luminescence spectrometer. The library
//! drives a photoelastic modulator, one or two monochromators and a lock-in
//! amplifier through capability traits, so the same engine runs against the
//! real instruments or the mocks in [`hardware::mock`].
//!
//! ## Crate Structure
//!
//! - **`spectrometer`**: the [`Spectrometer`] facade that owns the devices and
//!   coordinates sweeps, the safety monitor and calibration.
//! - **`acquisition`**: sweep requests, wavelength grids, the per-point retry
//!   client, repetition averaging and the sweep scheduler.
//! - **`safety`**: oscilloscope polling with range-limit and PMT overvoltage
//!   protection.
//! - **`calibration`**: the step-wise phase-offset calibration session.
//! - **`correction`**: derived channels (CD, glum, ellipticity) and baseline
//!   correction against blank and detector spectra.
//! - **`hardware`**: capability traits, per-device locks, optical path
//!   positioning, PMT gain curve and mock devices.
//! - **`storage`**: CSV spectra and text parameter records.
//! - **`config`**: figment-based configuration from TOML and environment.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`abort`**, **`busy`**, **`worker`**: cancellation tokens, the sweep /
//!   calibration exclusion gate and background task handles.
//! - **`error`**: the crate-wide [`CplError`].

pub mod abort;
pub mod acquisition;
pub mod busy;
pub mod calibration;
pub mod config;
pub mod correction;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod safety;
pub mod spectrometer;
pub mod spectrum;
pub mod storage;
pub mod worker;

pub use acquisition::{AcquisitionRequest, SweepEvent, SweepReport, SweepState};
pub use calibration::{CalibrationSession, CalibrationStep};
pub use config::SpectrometerConfig;
pub use error::{AppResult, CplError};
pub use safety::{SafetyEvent, SafetyLimits};
pub use spectrometer::Spectrometer;
pub use spectrum::{Measurement, Spectrum, SpectrumPoint};
