//! Spectrometer - the coordinating context
//!
//! Owns the device registry and the three background activities (sweep,
//! oscilloscope monitor, calibration recording) and exposes the operator
//! commands: initialization, manual instrument controls, sweeps,
//! calibration and parameter persistence.
//!
//! # Usage
//!
//! ```rust,ignore
//! let rig = MockRig::dual();
//! let mut spectrometer = Spectrometer::new(rig.instruments(), SpectrometerConfig::default())?;
//! spectrometer.initialize().await?;
//!
//! let mut events = spectrometer.subscribe_sweep();
//! spectrometer.start_sweep(AcquisitionRequest::new(400.0, 500.0, 1.0, 1.0, 3, "sample"))?;
//! let report = spectrometer.wait_sweep().await;
//! ```

use crate::acquisition::{
    AcquisitionRequest, AcquisitionScheduler, SweepEvent, SweepHandle, SweepOutputs, SweepReport,
    SweepState,
};
use crate::busy::{Activity, BusyGate};
use crate::calibration::CalibrationSession;
use crate::config::SpectrometerConfig;
use crate::error::{AppResult, CplError, DriverError, DriverErrorKind, SweepError};
use crate::hardware::{DeviceLockRegistry, Instruments, OpticalPath};
use crate::safety::{SafetyEvent, SafetyMonitor};
use crate::storage::{InstrumentSettings, ParameterRecord, SpectrumStore};
use crate::worker::Worker;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

fn init_failure(device: &str) -> CplError {
    DriverError::new(
        device,
        DriverErrorKind::Initialization,
        "device did not report ready",
    )
    .into()
}

/// The whole instrument.
#[derive(Debug)]
pub struct Spectrometer {
    config: SpectrometerConfig,
    devices: Arc<DeviceLockRegistry>,
    path: OpticalPath,
    scheduler: AcquisitionScheduler,
    monitor: SafetyMonitor,
    monitor_worker: Option<Worker<AppResult<()>>>,
    sweep: Option<SweepHandle>,
    gate: BusyGate,
    store: SpectrumStore,
    settings: Arc<RwLock<InstrumentSettings>>,
    initialized: bool,
}

impl Spectrometer {
    /// Assemble the engine around `instruments`. No device is touched.
    pub fn new(instruments: Instruments, config: SpectrometerConfig) -> AppResult<Self> {
        config.validate()?;
        let devices = Arc::new(DeviceLockRegistry::new(instruments));
        let path = OpticalPath::new(
            Arc::clone(&devices),
            config.acquisition.topology,
            config.move_delay(),
        )?;
        let scheduler = AcquisitionScheduler::new(
            Arc::clone(&devices),
            path.clone(),
            config.sweep_timing(),
            config.derived_formulas(),
        );
        let monitor = SafetyMonitor::new(
            Arc::clone(&devices),
            config.safety,
            config.osc_refresh_interval(),
            scheduler.active_sweep(),
        );
        let store = SpectrumStore::new(config.storage.data_dir.clone());

        Ok(Self {
            config,
            devices,
            path,
            scheduler,
            monitor,
            monitor_worker: None,
            sweep: None,
            gate: BusyGate::new(),
            store,
            settings: Arc::new(RwLock::new(InstrumentSettings::default())),
            initialized: false,
        })
    }

    /// Loaded configuration.
    pub fn config(&self) -> &SpectrometerConfig {
        &self.config
    }

    /// Shared device locks.
    pub fn devices(&self) -> &Arc<DeviceLockRegistry> {
        &self.devices
    }

    /// Spectrum directory.
    pub fn store(&self) -> &SpectrumStore {
        &self.store
    }

    /// Whether `initialize` succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Activity holding the busy gate.
    pub fn busy(&self) -> Option<Activity> {
        self.gate.current()
    }

    /// Last known instrument settings.
    pub fn settings(&self) -> InstrumentSettings {
        *self.settings.read()
    }

    /// Sweep events.
    pub fn subscribe_sweep(&self) -> broadcast::Receiver<SweepEvent> {
        self.scheduler.subscribe()
    }

    /// Safety monitor events.
    pub fn subscribe_safety(&self) -> broadcast::Receiver<SafetyEvent> {
        self.monitor.subscribe()
    }

    /// Scheduler state.
    pub fn sweep_state(&self) -> SweepState {
        self.scheduler.state()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bring up every instrument, start the safety monitor and park the
    /// optical path at the home wavelength.
    pub async fn initialize(&mut self) -> AppResult<()> {
        info!("Initializing instruments");
        if !self.devices.modulator().await.initialize().await? {
            return Err(init_failure("modulator"));
        }
        if !self.devices.mono1().await.initialize().await? {
            return Err(init_failure("monochromator 1"));
        }
        if let Some(mono2) = self.devices.mono2().await {
            if !mono2.initialize().await? {
                return Err(init_failure("monochromator 2"));
            }
        }

        let (bessel_corr, bessel_corr_lp) = self.config.bessel_corrections();
        {
            let lockin = self.devices.lockin_daq().await;
            if !lockin.connect().await? {
                return Err(init_failure("lock-in"));
            }
            if !lockin.setup_for_daq(bessel_corr, bessel_corr_lp).await? {
                return Err(init_failure("lock-in"));
            }
        }
        {
            let scope = self.devices.lockin_scope().await;
            if !scope.connect().await? || !scope.setup_for_scope().await? {
                return Err(init_failure("lock-in oscilloscope"));
            }
        }

        self.initialized = true;
        self.refresh_settings().await?;
        self.start_monitor();
        self.path
            .move_to(self.config.acquisition.home_wavelength_nm, true, None)
            .await?;
        info!(
            bessel_corr,
            bessel_corr_lp,
            home_nm = self.config.acquisition.home_wavelength_nm,
            "Initialization complete"
        );
        Ok(())
    }

    /// Stop every activity, set the PMT to 0 V and release the devices.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        if !self.initialized {
            return Ok(());
        }
        info!("Shutting down");
        self.abort_sweep("shutdown");
        if let Some(Err(e)) = self.wait_sweep().await {
            warn!(error = %e, "Sweep ended with error during shutdown");
        }
        if let Err(e) = self.stop_monitor().await {
            warn!(error = %e, "Safety monitor had failed before shutdown");
        }
        self.set_pmt_voltage_unchecked(0.0, false).await?;

        let devices = &self.devices;
        let (modulator, mono1, mono2, lockin, scope) = futures::join!(
            async { devices.modulator().await.close().await },
            async { devices.mono1().await.close().await },
            async {
                match devices.mono2().await {
                    Some(mono) => mono.close().await,
                    None => Ok(()),
                }
            },
            async { devices.lockin_daq().await.disconnect().await },
            async { devices.lockin_scope().await.disconnect().await },
        );
        self.initialized = false;
        modulator?;
        mono1?;
        mono2?;
        lockin?;
        scope?;
        info!("All instruments closed");
        Ok(())
    }

    // =========================================================================
    // Safety monitor
    // =========================================================================

    /// Start the oscilloscope monitor unless it is running.
    pub fn start_monitor(&mut self) {
        if self.monitor_running() {
            return;
        }
        self.monitor_worker = Some(self.monitor.start());
    }

    /// Whether the oscilloscope monitor is running.
    pub fn monitor_running(&self) -> bool {
        self.monitor_worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Stop the oscilloscope monitor and wait for it to disable capture.
    pub async fn stop_monitor(&mut self) -> AppResult<()> {
        match self.monitor_worker.take() {
            Some(worker) => worker.stop_and_join("monitor stopped").await?,
            None => Ok(()),
        }
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Check `request` against the values and the data directory.
    pub fn validate_request(&self, request: &AcquisitionRequest) -> AppResult<()> {
        request.validate()?;
        request.validate_with(|name| self.store.exists(name))?;
        Ok(())
    }

    /// Validate, claim the busy gate and start `request` in the background.
    pub async fn start_sweep(&mut self, request: AcquisitionRequest) -> AppResult<()> {
        self.require_initialized()?;
        self.validate_request(&request)?;
        let guard = self.gate.try_enter(Activity::Sweep)?;

        self.refresh_settings().await?;
        let corrections = self.store.load_corrections(&request)?;
        let record = ParameterRecord::new(&request, &self.settings());
        if let Err(e) = record.write_to(&self.config.storage.last_params_file) {
            warn!(error = %e, "Could not save last parameters");
        }
        let outputs = SweepOutputs {
            store: Some(self.store.clone()),
            corrections,
            blank_error: self.config.correction.blank_error_model,
            parameters: Some(record),
        };
        self.sweep = Some(self.scheduler.start(request, outputs, Some(guard)));
        Ok(())
    }

    /// Wait for the last started sweep. `None` if there is none.
    pub async fn wait_sweep(&mut self) -> Option<Result<SweepReport, SweepError>> {
        let handle = self.sweep.take()?;
        Some(handle.wait().await)
    }

    /// Start `request` and wait for it.
    pub async fn run_sweep(&mut self, request: AcquisitionRequest) -> Result<SweepReport, SweepError> {
        self.start_sweep(request).await?;
        match self.wait_sweep().await {
            Some(result) => result,
            None => Err(CplError::Processing("sweep handle missing".to_string())),
        }
    }

    /// Abort the running sweep. Returns `false` when idle or already aborting.
    pub fn abort_sweep(&self, reason: &str) -> bool {
        let aborted = self.scheduler.abort(reason);
        if aborted {
            info!(reason, "Sweep abort requested");
        }
        aborted
    }

    /// Whether a sweep is in flight.
    pub fn sweep_running(&self) -> bool {
        self.sweep.as_ref().is_some_and(SweepHandle::is_running)
    }

    // =========================================================================
    // Manual controls
    // =========================================================================

    /// Set the PMT control voltage, clamped to `[0, max_voltage]`, and
    /// auto-range the input.
    pub async fn set_pmt_voltage(&self, volt: f64) -> AppResult<f64> {
        self.require_initialized()?;
        let volt = volt.clamp(0.0, self.config.pmt.max_voltage);
        self.set_pmt_voltage_unchecked(volt, true).await?;
        Ok(volt)
    }

    /// Set the PMT to a relative gain. Returns the voltage applied.
    pub async fn set_pmt_gain(&self, gain: f64) -> AppResult<f64> {
        self.set_pmt_voltage(self.config.pmt.gain_to_volt(gain)).await
    }

    async fn set_pmt_voltage_unchecked(&self, volt: f64, autorange: bool) -> AppResult<()> {
        let range = {
            let lockin = self.devices.lockin_daq().await;
            lockin.set_pmt_voltage(volt, autorange).await?;
            lockin.signal_range().await?
        };
        let mut settings = self.settings.write();
        settings.pmt_voltage = volt;
        settings.pmt_gain = self.config.pmt.volt_to_gain(volt);
        settings.input_range = range;
        info!(volt, gain = settings.pmt_gain, "PMT voltage set");
        Ok(())
    }

    /// Set a fixed input range in volts.
    pub async fn set_input_range(&self, value: f64) -> AppResult<()> {
        self.require_initialized()?;
        {
            let lockin = self.devices.lockin_daq().await;
            lockin.set_input_range(value, false).await?;
        }
        self.settings.write().input_range = value;
        Ok(())
    }

    /// Auto-range the input. Returns the new range.
    pub async fn auto_range(&self) -> AppResult<f64> {
        self.require_initialized()?;
        let range = {
            let lockin = self.devices.lockin_daq().await;
            lockin.set_input_range(0.0, true).await?;
            lockin.signal_range().await?
        };
        self.settings.write().input_range = range;
        info!(range, "Input range auto-ranged to {} V", range);
        Ok(range)
    }

    /// Set the reference phase offset in degrees.
    pub async fn set_phase_offset(&self, degrees: f64) -> AppResult<()> {
        self.require_initialized()?;
        {
            let lockin = self.devices.lockin_daq().await;
            lockin.set_phaseoffset(degrees).await?;
        }
        self.settings.write().phase_offset = degrees;
        Ok(())
    }

    /// Switch polarization modulation on or off.
    pub async fn set_modulation_active(&self, active: bool) -> AppResult<()> {
        self.require_initialized()?;
        self.path.set_modulation_active(active).await?;
        Ok(())
    }

    /// Move the optical path to `nm`. Refused while a sweep or calibration
    /// holds the busy gate.
    pub async fn move_to(&self, nm: f64) -> AppResult<()> {
        self.require_initialized()?;
        if let Some(active) = self.gate.current() {
            return Err(CplError::Busy { active });
        }
        self.path.move_to(nm, true, None).await?;
        Ok(())
    }

    /// Push `settings` to the lock-in.
    pub async fn apply_settings(&self, settings: &InstrumentSettings) -> AppResult<()> {
        self.set_pmt_voltage(settings.pmt_voltage).await?;
        self.set_input_range(settings.input_range).await?;
        self.set_phase_offset(settings.phase_offset).await
    }

    async fn refresh_settings(&self) -> AppResult<()> {
        let (phase_offset, input_range) = {
            let lockin = self.devices.lockin_daq().await;
            (lockin.phase_offset().await?, lockin.signal_range().await?)
        };
        let mut settings = self.settings.write();
        settings.phase_offset = phase_offset;
        settings.input_range = input_range;
        Ok(())
    }

    // =========================================================================
    // Calibration
    // =========================================================================

    /// Open a phase-offset calibration. The session holds the busy gate.
    pub async fn begin_calibration(&self) -> AppResult<CalibrationSession> {
        self.require_initialized()?;
        let session = CalibrationSession::begin(
            Arc::clone(&self.devices),
            &self.gate,
            self.config.acquisition.max_read_attempts,
        )
        .await?;
        Ok(session.with_last_params(self.config.storage.last_params_file.clone()))
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Record `request` with the current settings as last-used parameters.
    pub async fn save_last_params(&self, request: &AcquisitionRequest) -> AppResult<()> {
        if self.initialized {
            self.refresh_settings().await?;
        }
        ParameterRecord::new(request, &self.settings()).write_to(&self.config.storage.last_params_file)
    }

    /// Read the last-used parameters.
    pub fn load_last_params(&self) -> AppResult<ParameterRecord> {
        ParameterRecord::read_from(&self.config.storage.last_params_file)
    }

    /// Read the last-used parameters and push their instrument settings to
    /// the lock-in. Returns the recorded request.
    pub async fn restore_last_params(&self) -> AppResult<AcquisitionRequest> {
        let record = self.load_last_params()?;
        self.apply_settings(&record.settings()).await?;
        info!(name = %record.name, "Last parameters restored");
        Ok(record.to_request())
    }

    fn require_initialized(&self) -> AppResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(CplError::NotInitialized)
        }
    }
}
