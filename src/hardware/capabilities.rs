//! Instrument Capabilities
//!
//! The engine never talks to a VISA/SCPI session directly. Each physical
//! instrument is reached through one of the traits below, and drivers (or
//! the mocks in [`crate::hardware::mock`]) implement them.
//!
//! - [`Modulator`]: photoelastic modulator
//! - [`Monochromator`]: one per monochromator stage
//! - [`AcquisitionLockIn`]: lock-in amplifier used for data points
//! - [`ScopeLockIn`]: lock-in amplifier oscilloscope used for safety monitoring
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Takes `&self`; drivers keep their state behind interior mutability
//!
//! An `Err` from any method is a device fault and is never retried by the
//! engine. A transient read failure is reported in-band instead, through
//! [`ReadOutcome::success`].
//!
//! Every call is made while holding that device's lock from
//! [`DeviceLockRegistry`](crate::hardware::DeviceLockRegistry).

use crate::abort::AbortFlag;
use crate::spectrum::Measurement;
use anyhow::Result;
use async_trait::async_trait;

/// Capability: Polarization Modulation
///
/// # Contract
/// - `initialize` returns `Ok(false)` if the device answered incorrectly
/// - `set_nm` blocks until the retardation for `nm` is settled
/// - `set_active(false)` stops modulation and cuts the reference signal
#[async_trait]
pub trait Modulator: Send + Sync {
    /// Open and self-test the device.
    async fn initialize(&self) -> Result<bool>;

    /// Tune the modulator for wavelength `nm`.
    async fn set_nm(&self, nm: f64) -> Result<()>;

    /// Enable or disable modulation.
    async fn set_active(&self, active: bool) -> Result<()>;

    /// Release the device.
    async fn close(&self) -> Result<()>;
}

/// Capability: Wavelength Selection
#[async_trait]
pub trait Monochromator: Send + Sync {
    /// Open and self-test the device.
    async fn initialize(&self) -> Result<bool>;

    /// Move to wavelength `nm`, blocking until settled.
    async fn set_nm(&self, nm: f64) -> Result<()>;

    /// Release the device.
    async fn close(&self) -> Result<()>;
}

/// DC/AC reading of one data point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockInReading {
    /// Total intensity.
    pub dc: Measurement,
    /// Modulation-synchronous intensity.
    pub ac: Measurement,
    /// Linear polarization diagnostic, if the lock-in is set up to produce
    /// it. Small values hint at linearly polarized emission.
    pub lp_theta_std: Option<f64>,
}

impl Default for LockInReading {
    fn default() -> Self {
        Self {
            dc: Measurement::nan(),
            ac: Measurement::nan(),
            lp_theta_std: None,
        }
    }
}

/// Result of one `read_data` call.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReadOutcome {
    /// False on a transient failure; `data` is then meaningless.
    pub success: bool,
    /// Reading, valid when `success` is true.
    pub data: LockInReading,
}

impl ReadOutcome {
    /// Successful read.
    pub fn ok(data: LockInReading) -> Self {
        Self {
            success: true,
            data,
        }
    }

    /// Transient failure.
    pub fn failed() -> Self {
        Self::default()
    }
}

/// Capability: Phase-Sensitive Acquisition
///
/// # Contract
/// - `read_data` integrates for the configured dwell time and must poll
///   `abort` while it waits
/// - `read_ac_theta` returns one phase sample in degrees, or NaN when no
///   sample was available
/// - `signal_range` returns the current input range ceiling in volts,
///   updated by `set_input_range` (including auto-ranging)
#[async_trait]
pub trait AcquisitionLockIn: Send + Sync {
    /// Open the session.
    async fn connect(&self) -> Result<bool>;

    /// Configure demodulators for data acquisition with the modulator's
    /// Bessel correction factors.
    async fn setup_for_daq(&self, bessel_corr: f64, bessel_corr_lp: f64) -> Result<bool>;

    /// Integration time per point.
    async fn set_dwell_time(&self, seconds: f64) -> Result<()>;

    /// PMT control voltage. `autorange` re-ranges the input afterwards.
    async fn set_pmt_voltage(&self, volt: f64, autorange: bool) -> Result<()>;

    /// Input range in volts, or auto-range when `auto` is set.
    async fn set_input_range(&self, value: f64, auto: bool) -> Result<()>;

    /// Current input range ceiling in volts.
    async fn signal_range(&self) -> Result<f64>;

    /// Reference phase offset in degrees.
    async fn phase_offset(&self) -> Result<f64>;

    /// Set the reference phase offset in degrees.
    async fn set_phaseoffset(&self, degrees: f64) -> Result<()>;

    /// Lock the reference of oscillator `osc_index` to the external input.
    async fn set_extref_active(&self, osc_index: u32, active: bool) -> Result<()>;

    /// Read one data point.
    async fn read_data(&self, abort: &AbortFlag) -> Result<ReadOutcome>;

    /// Read one AC phase sample in degrees.
    async fn read_ac_theta(&self, abort: &AbortFlag) -> Result<f64>;

    /// Close the session.
    async fn disconnect(&self) -> Result<()>;
}

/// One oscilloscope frame summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopeSample {
    /// Maximum voltage in the frame, NaN if no frame was available.
    pub max_volt: f64,
    /// Average voltage in the frame, NaN if no frame was available.
    pub avg_volt: f64,
}

impl ScopeSample {
    /// Sample returned when the oscilloscope had no data.
    pub fn empty() -> Self {
        Self {
            max_volt: f64::NAN,
            avg_volt: f64::NAN,
        }
    }
}

/// Capability: Signal Oscilloscope
#[async_trait]
pub trait ScopeLockIn: Send + Sync {
    /// Open the session.
    async fn connect(&self) -> Result<bool>;

    /// Configure the oscilloscope module.
    async fn setup_for_scope(&self) -> Result<bool>;

    /// Begin continuous capture.
    async fn start_scope(&self) -> Result<()>;

    /// Latest frame summary.
    async fn read_scope(&self) -> Result<ScopeSample>;

    /// End continuous capture.
    async fn stop_scope(&self) -> Result<()>;

    /// Close the session.
    async fn disconnect(&self) -> Result<()>;
}
