//! Mock Instruments
//!
//! Simulated devices for running the engine without hardware. Every mock is
//! cheap to clone and clones share state, so a test can hand one clone to
//! the [`DeviceLockRegistry`] and keep another to script and inspect it.
//!
//! # Available Mocks
//!
//! - `MockModulator` - records tuned wavelengths and the active state
//! - `MockMonochromator` - records every position it was moved to
//! - `MockLockIn` - acquisition session with scripted readings, transient
//!   read failures, phase samples and fault injection
//! - `MockScope` - oscilloscope session fed from a scripted sample queue
//!
//! All waits use `tokio::time::sleep`, never `std::thread::sleep`.

use crate::abort::AbortFlag;
use crate::error::{DriverError, DriverErrorKind};
use crate::hardware::capabilities::{
    AcquisitionLockIn, LockInReading, Modulator, Monochromator, ReadOutcome, ScopeLockIn,
    ScopeSample,
};
use crate::hardware::locks::{DeviceLockRegistry, Instruments};
use crate::spectrum::Measurement;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn driver_fault(driver: &str, kind: DriverErrorKind, message: &str) -> anyhow::Error {
    anyhow::Error::new(DriverError::new(driver, kind, message))
}

// =============================================================================
// MockModulator
// =============================================================================

#[derive(Debug, Default)]
struct ModulatorState {
    initialized: bool,
    fail_init: bool,
    position: Option<f64>,
    active: Option<bool>,
    active_history: Vec<bool>,
    closed: bool,
}

/// Simulated photoelastic modulator.
#[derive(Debug, Clone, Default)]
pub struct MockModulator {
    state: Arc<Mutex<ModulatorState>>,
}

impl MockModulator {
    /// Modulator that initializes successfully.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `initialize` report failure.
    pub fn fail_initialization(&self) {
        self.state.lock().fail_init = true;
    }

    /// Last tuned wavelength.
    pub fn position(&self) -> Option<f64> {
        self.state.lock().position
    }

    /// Last requested active state.
    pub fn is_active(&self) -> Option<bool> {
        self.state.lock().active
    }

    /// Every `set_active` call in order.
    pub fn active_history(&self) -> Vec<bool> {
        self.state.lock().active_history.clone()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl Modulator for MockModulator {
    async fn initialize(&self) -> Result<bool> {
        let mut state = self.state.lock();
        state.initialized = !state.fail_init;
        Ok(state.initialized)
    }

    async fn set_nm(&self, nm: f64) -> Result<()> {
        if !nm.is_finite() {
            return Err(driver_fault(
                "mock_modulator",
                DriverErrorKind::InvalidParameter,
                "wavelength must be finite",
            ));
        }
        self.state.lock().position = Some(nm);
        Ok(())
    }

    async fn set_active(&self, active: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.active = Some(active);
        state.active_history.push(active);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

// =============================================================================
// MockMonochromator
// =============================================================================

#[derive(Debug, Default)]
struct MonochromatorState {
    fail_init: bool,
    visited: Vec<f64>,
    closed: bool,
}

/// Simulated monochromator with a configurable settling time.
#[derive(Debug, Clone, Default)]
pub struct MockMonochromator {
    state: Arc<Mutex<MonochromatorState>>,
    move_time: Duration,
}

impl MockMonochromator {
    /// Monochromator that settles instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Monochromator that takes `move_time` per move.
    pub fn with_move_time(move_time: Duration) -> Self {
        Self {
            move_time,
            ..Self::default()
        }
    }

    /// Make `initialize` report failure.
    pub fn fail_initialization(&self) {
        self.state.lock().fail_init = true;
    }

    /// Current position.
    pub fn position(&self) -> Option<f64> {
        self.state.lock().visited.last().copied()
    }

    /// Every position moved to, in order.
    pub fn visited(&self) -> Vec<f64> {
        self.state.lock().visited.clone()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl Monochromator for MockMonochromator {
    async fn initialize(&self) -> Result<bool> {
        Ok(!self.state.lock().fail_init)
    }

    async fn set_nm(&self, nm: f64) -> Result<()> {
        if !nm.is_finite() || nm < 0.0 {
            return Err(driver_fault(
                "mock_monochromator",
                DriverErrorKind::InvalidParameter,
                "wavelength out of range",
            ));
        }
        if !self.move_time.is_zero() {
            tokio::time::sleep(self.move_time).await;
        }
        self.state.lock().visited.push(nm);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

// =============================================================================
// MockLockIn
// =============================================================================

/// How `read_data` misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadFailure {
    /// Every read succeeds.
    #[default]
    None,
    /// Every read reports `success = false`.
    Always,
    /// The next `n` reads report `success = false`.
    Next(u32),
    /// Reads after the next `n` successful ones return a driver fault.
    FaultAfter(u32),
}

#[derive(Debug)]
struct LockInState {
    connected: bool,
    fail_connect: bool,
    bessel: Option<(f64, f64)>,
    dwell_time: f64,
    pmt_voltage: f64,
    pmt_history: Vec<f64>,
    signal_range: f64,
    auto_range_value: f64,
    auto_range_count: u32,
    phase_offset: f64,
    extref_active: Option<bool>,
    read_count: u32,
    failure: ReadFailure,
    readings: VecDeque<LockInReading>,
    base_reading: LockInReading,
    noise: f64,
    rng: StdRng,
    theta_samples: VecDeque<f64>,
    theta_default: Option<f64>,
    theta_reads: u32,
    read_delay: Duration,
    disconnected: bool,
}

impl Default for LockInState {
    fn default() -> Self {
        Self {
            connected: false,
            fail_connect: false,
            bessel: None,
            dwell_time: 0.0,
            pmt_voltage: 0.0,
            pmt_history: Vec::new(),
            signal_range: 1.0,
            auto_range_value: 3.0,
            auto_range_count: 0,
            phase_offset: 0.0,
            extref_active: None,
            read_count: 0,
            failure: ReadFailure::None,
            readings: VecDeque::new(),
            base_reading: LockInReading {
                dc: Measurement::new(1.0, 0.01),
                ac: Measurement::new(0.001, 0.0001),
                lp_theta_std: None,
            },
            noise: 0.0,
            rng: StdRng::seed_from_u64(42),
            theta_samples: VecDeque::new(),
            theta_default: None,
            theta_reads: 0,
            read_delay: Duration::ZERO,
            disconnected: false,
        }
    }
}

/// Simulated lock-in amplifier, acquisition session.
#[derive(Debug, Clone, Default)]
pub struct MockLockIn {
    state: Arc<Mutex<LockInState>>,
}

impl MockLockIn {
    /// Lock-in returning a constant reading.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connect` report failure.
    pub fn fail_connect(&self) {
        self.state.lock().fail_connect = true;
    }

    /// Set the read failure mode.
    pub fn set_read_failure(&self, failure: ReadFailure) {
        self.state.lock().failure = failure;
    }

    /// Reading returned once the scripted queue is empty.
    pub fn set_base_reading(&self, reading: LockInReading) {
        self.state.lock().base_reading = reading;
    }

    /// Queue readings returned by the next successful reads.
    pub fn push_readings(&self, readings: impl IntoIterator<Item = LockInReading>) {
        self.state.lock().readings.extend(readings);
    }

    /// Add uniform noise of relative amplitude `noise` to the base reading.
    pub fn set_noise(&self, noise: f64, seed: u64) {
        let mut state = self.state.lock();
        state.noise = noise;
        state.rng = StdRng::seed_from_u64(seed);
    }

    /// Time each `read_data` takes.
    pub fn set_read_delay(&self, delay: Duration) {
        self.state.lock().read_delay = delay;
    }

    /// Queue phase samples returned by `read_ac_theta`.
    pub fn push_theta_samples(&self, samples: impl IntoIterator<Item = f64>) {
        self.state.lock().theta_samples.extend(samples);
    }

    /// Phase returned once the sample queue is empty. `None` yields NaN.
    pub fn set_theta_default(&self, theta: Option<f64>) {
        self.state.lock().theta_default = theta;
    }

    /// Range set by auto-ranging.
    pub fn set_auto_range_value(&self, value: f64) {
        self.state.lock().auto_range_value = value;
    }

    /// Number of `read_data` calls.
    pub fn read_count(&self) -> u32 {
        self.state.lock().read_count
    }

    /// Number of `read_ac_theta` calls.
    pub fn theta_reads(&self) -> u32 {
        self.state.lock().theta_reads
    }

    /// Current PMT voltage.
    pub fn pmt_voltage(&self) -> f64 {
        self.state.lock().pmt_voltage
    }

    /// Every PMT voltage set, in order.
    pub fn pmt_history(&self) -> Vec<f64> {
        self.state.lock().pmt_history.clone()
    }

    /// Current signal range.
    pub fn current_signal_range(&self) -> f64 {
        self.state.lock().signal_range
    }

    /// Number of auto-range requests.
    pub fn auto_range_count(&self) -> u32 {
        self.state.lock().auto_range_count
    }

    /// Current phase offset.
    pub fn current_phase_offset(&self) -> f64 {
        self.state.lock().phase_offset
    }

    /// Last configured dwell time.
    pub fn dwell_time(&self) -> f64 {
        self.state.lock().dwell_time
    }

    /// Bessel factors passed to `setup_for_daq`.
    pub fn bessel_factors(&self) -> Option<(f64, f64)> {
        self.state.lock().bessel
    }

    /// Last external reference state.
    pub fn extref_active(&self) -> Option<bool> {
        self.state.lock().extref_active
    }

    /// Whether `disconnect` was called.
    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }

    fn next_reading(state: &mut LockInState) -> LockInReading {
        if let Some(reading) = state.readings.pop_front() {
            return reading;
        }
        let mut reading = state.base_reading;
        if state.noise > 0.0 {
            let n = state.noise;
            reading.dc.value *= 1.0 + state.rng.gen_range(-n..n);
            reading.ac.value *= 1.0 + state.rng.gen_range(-n..n);
        }
        reading
    }
}

#[async_trait]
impl AcquisitionLockIn for MockLockIn {
    async fn connect(&self) -> Result<bool> {
        let mut state = self.state.lock();
        state.connected = !state.fail_connect;
        Ok(state.connected)
    }

    async fn setup_for_daq(&self, bessel_corr: f64, bessel_corr_lp: f64) -> Result<bool> {
        let mut state = self.state.lock();
        state.bessel = Some((bessel_corr, bessel_corr_lp));
        Ok(state.connected)
    }

    async fn set_dwell_time(&self, seconds: f64) -> Result<()> {
        self.state.lock().dwell_time = seconds;
        Ok(())
    }

    async fn set_pmt_voltage(&self, volt: f64, autorange: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.pmt_voltage = volt;
        state.pmt_history.push(volt);
        if autorange {
            state.signal_range = state.auto_range_value;
            state.auto_range_count += 1;
        }
        Ok(())
    }

    async fn set_input_range(&self, value: f64, auto: bool) -> Result<()> {
        let mut state = self.state.lock();
        if auto {
            state.signal_range = state.auto_range_value;
            state.auto_range_count += 1;
        } else {
            state.signal_range = value;
        }
        debug!(range = state.signal_range, auto, "MockLockIn: input range set");
        Ok(())
    }

    async fn signal_range(&self) -> Result<f64> {
        Ok(self.state.lock().signal_range)
    }

    async fn phase_offset(&self) -> Result<f64> {
        Ok(self.state.lock().phase_offset)
    }

    async fn set_phaseoffset(&self, degrees: f64) -> Result<()> {
        if !degrees.is_finite() {
            return Err(driver_fault(
                "mock_lockin",
                DriverErrorKind::InvalidParameter,
                "phase offset must be finite",
            ));
        }
        self.state.lock().phase_offset = degrees;
        Ok(())
    }

    async fn set_extref_active(&self, _osc_index: u32, active: bool) -> Result<()> {
        self.state.lock().extref_active = Some(active);
        Ok(())
    }

    async fn read_data(&self, abort: &AbortFlag) -> Result<ReadOutcome> {
        let delay = {
            let mut state = self.state.lock();
            state.read_count += 1;
            state.read_delay
        };
        if !delay.is_zero() && !abort.sleep(delay).await {
            return Ok(ReadOutcome::failed());
        }

        let mut state = self.state.lock();
        let failure = state.failure;
        match failure {
            ReadFailure::None => {}
            ReadFailure::Always => return Ok(ReadOutcome::failed()),
            ReadFailure::Next(n) => {
                if n > 0 {
                    state.failure = ReadFailure::Next(n - 1);
                    return Ok(ReadOutcome::failed());
                }
            }
            ReadFailure::FaultAfter(n) => {
                if n == 0 {
                    return Err(driver_fault(
                        "mock_lockin",
                        DriverErrorKind::Communication,
                        "lost connection to lock-in",
                    ));
                }
                state.failure = ReadFailure::FaultAfter(n - 1);
            }
        }
        Ok(ReadOutcome::ok(Self::next_reading(&mut state)))
    }

    async fn read_ac_theta(&self, _abort: &AbortFlag) -> Result<f64> {
        let mut state = self.state.lock();
        state.theta_reads += 1;
        Ok(state
            .theta_samples
            .pop_front()
            .or(state.theta_default)
            .unwrap_or(f64::NAN))
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.connected = false;
        state.disconnected = true;
        Ok(())
    }
}

// =============================================================================
// MockScope
// =============================================================================

#[derive(Debug, Default)]
struct ScopeState {
    connected: bool,
    running: bool,
    start_count: u32,
    stop_count: u32,
    reads: u32,
    samples: VecDeque<ScopeSample>,
    default_sample: Option<ScopeSample>,
    fault_after: Option<u32>,
    disconnected: bool,
}

/// Simulated lock-in oscilloscope session.
#[derive(Debug, Clone, Default)]
pub struct MockScope {
    state: Arc<Mutex<ScopeState>>,
}

impl MockScope {
    /// Scope that returns NaN samples until scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue max-voltage samples (average = half the max).
    pub fn push_max_volts(&self, volts: impl IntoIterator<Item = f64>) {
        let mut state = self.state.lock();
        state.samples.extend(volts.into_iter().map(|v| ScopeSample {
            max_volt: v,
            avg_volt: v / 2.0,
        }));
    }

    /// Sample returned once the queue is empty. `None` yields NaN.
    pub fn set_default_max_volt(&self, volt: Option<f64>) {
        self.state.lock().default_sample = volt.map(|v| ScopeSample {
            max_volt: v,
            avg_volt: v / 2.0,
        });
    }

    /// Number of queued samples not yet read.
    pub fn pending(&self) -> usize {
        self.state.lock().samples.len()
    }

    /// Fail every `read_scope` after `n` successful reads.
    pub fn set_fault_after(&self, n: Option<u32>) {
        self.state.lock().fault_after = n;
    }

    /// Number of `read_scope` calls.
    pub fn reads(&self) -> u32 {
        self.state.lock().reads
    }

    /// Whether capture is running.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Number of `start_scope` calls.
    pub fn start_count(&self) -> u32 {
        self.state.lock().start_count
    }

    /// Number of `stop_scope` calls.
    pub fn stop_count(&self) -> u32 {
        self.state.lock().stop_count
    }

    /// Whether `disconnect` was called.
    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }
}

#[async_trait]
impl ScopeLockIn for MockScope {
    async fn connect(&self) -> Result<bool> {
        self.state.lock().connected = true;
        Ok(true)
    }

    async fn setup_for_scope(&self) -> Result<bool> {
        Ok(self.state.lock().connected)
    }

    async fn start_scope(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.running = true;
        state.start_count += 1;
        Ok(())
    }

    async fn read_scope(&self) -> Result<ScopeSample> {
        let mut state = self.state.lock();
        state.reads += 1;
        match state.fault_after {
            Some(0) => {
                return Err(driver_fault(
                    "mock_scope",
                    DriverErrorKind::Communication,
                    "oscilloscope stream lost",
                ))
            }
            Some(n) => state.fault_after = Some(n - 1),
            None => {}
        }
        Ok(state
            .samples
            .pop_front()
            .or(state.default_sample)
            .unwrap_or_else(ScopeSample::empty))
    }

    async fn stop_scope(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.running = false;
        state.stop_count += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.connected = false;
        state.disconnected = true;
        Ok(())
    }
}

// =============================================================================
// MockRig
// =============================================================================

/// A full set of mock instruments sharing state with the registry built
/// from it.
#[derive(Debug, Clone, Default)]
pub struct MockRig {
    /// Modulator.
    pub modulator: MockModulator,
    /// First monochromator.
    pub mono1: MockMonochromator,
    /// Second monochromator. Left out of the registry on single setups.
    pub mono2: MockMonochromator,
    /// Lock-in acquisition session.
    pub lockin: MockLockIn,
    /// Lock-in oscilloscope session.
    pub scope: MockScope,
    single: bool,
}

impl MockRig {
    /// Rig with two monochromators.
    pub fn dual() -> Self {
        Self::default()
    }

    /// Rig with one monochromator.
    pub fn single() -> Self {
        Self {
            single: true,
            ..Self::default()
        }
    }

    /// Device handles sharing state with this rig.
    pub fn instruments(&self) -> Instruments {
        Instruments {
            modulator: Box::new(self.modulator.clone()),
            mono1: Box::new(self.mono1.clone()),
            mono2: if self.single {
                None
            } else {
                Some(Box::new(self.mono2.clone()) as Box<dyn Monochromator>)
            },
            lockin_daq: Box::new(self.lockin.clone()),
            lockin_scope: Box::new(self.scope.clone()),
        }
    }

    /// Lock registry over this rig's devices.
    pub fn registry(&self) -> DeviceLockRegistry {
        DeviceLockRegistry::new(self.instruments())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lockin_scripted_failures() {
        let lockin = MockLockIn::new();
        let abort = AbortFlag::new();
        lockin.set_read_failure(ReadFailure::Next(2));

        assert!(!lockin.read_data(&abort).await.unwrap().success);
        assert!(!lockin.read_data(&abort).await.unwrap().success);
        assert!(lockin.read_data(&abort).await.unwrap().success);
        assert_eq!(lockin.read_count(), 3);
    }

    #[tokio::test]
    async fn test_lockin_fault_after() {
        let lockin = MockLockIn::new();
        let abort = AbortFlag::new();
        lockin.set_read_failure(ReadFailure::FaultAfter(1));

        assert!(lockin.read_data(&abort).await.is_ok());
        let err = lockin.read_data(&abort).await.unwrap_err();
        let driver = err.downcast_ref::<DriverError>().unwrap();
        assert_eq!(driver.kind, DriverErrorKind::Communication);
    }

    #[tokio::test]
    async fn test_lockin_auto_range() {
        let lockin = MockLockIn::new();
        lockin.set_auto_range_value(0.3);
        lockin.set_input_range(0.0, true).await.unwrap();
        assert_eq!(lockin.signal_range().await.unwrap(), 0.3);
        assert_eq!(lockin.auto_range_count(), 1);

        lockin.set_input_range(1.0, false).await.unwrap();
        assert_eq!(lockin.current_signal_range(), 1.0);
    }

    #[tokio::test]
    async fn test_scope_returns_nan_when_exhausted() {
        let scope = MockScope::new();
        scope.push_max_volts([0.5]);
        assert_eq!(scope.read_scope().await.unwrap().max_volt, 0.5);
        assert!(scope.read_scope().await.unwrap().max_volt.is_nan());
    }

    #[tokio::test]
    async fn test_rig_shares_state_with_registry() {
        let rig = MockRig::dual();
        let registry = rig.registry();
        registry.lockin_daq().await.set_pmt_voltage(0.7, false).await.unwrap();
        assert_eq!(rig.lockin.pmt_voltage(), 0.7);
    }
}
