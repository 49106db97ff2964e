//! AcquisitionScheduler - wavelength sweep state machine
//!
//! Runs a validated [`AcquisitionRequest`] on the hardware: for every
//! repetition it steps the optical path through the [`SweepPlan`], waits for
//! the low-pass filter to settle and reads one point, retrying transient
//! failures up to the configured number of attempts.
//!
//! # State Machine
//!
//! ```text
//! Idle ─▶ Preparing ─▶ SteppingWavelength ─▶ Retrying(n) ─┬▶ PointAccepted ─┐
//!                             ▲                           └▶ HardFailure ───┤
//!                             └──────── more wavelengths ◀──────────────────┘
//!                                              │
//!                                       RepetitionDone ── more reps ─▶ SteppingWavelength
//!                                              │
//!                          (Aborting) ─▶ ReturningHome ─▶ Idle
//! ```
//!
//! `Aborting` is entered whenever the abort flag is seen. The PMT is set to
//! 0 V, remaining points are skipped and the path still returns to the start
//! wavelength with modulation on. The flag is cleared afterwards.
//!
//! Observers subscribe to [`SweepEvent`]s; every spectrum they receive is an
//! owned snapshot.

use crate::abort::{AbortFlag, ActiveAbort};
use crate::acquisition::accumulator::{average_spectra, Accumulator};
use crate::acquisition::client::DataAcquisitionClient;
use crate::acquisition::plan::SweepPlan;
use crate::acquisition::progress::SweepProgress;
use crate::acquisition::request::AcquisitionRequest;
use crate::busy::BusyGuard;
use crate::correction::{BaselineCorrector, BlankErrorModel, CorrectionSet, DerivedFormulas};
use crate::error::{AppResult, CplError, SweepError};
use crate::hardware::{DeviceLockRegistry, LockInReading, OpticalPath};
use crate::spectrum::{Spectrum, SpectrumPoint};
use crate::storage::{ParameterRecord, SpectrumStore};
use crate::worker::Worker;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Per-point timing and retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepTiming {
    /// Settling time of the lock-in low-pass filter after a move.
    pub lowpass_risetime: Duration,
    /// Reads per wavelength before the sweep fails.
    pub max_read_attempts: u32,
    /// `lp_theta_std` below this logs a linear polarization warning.
    pub lp_theta_std_warning_threshold: f64,
}

impl Default for SweepTiming {
    fn default() -> Self {
        Self {
            lowpass_risetime: Duration::from_millis(600),
            max_read_attempts: 5,
            lp_theta_std_warning_threshold: 1.0,
        }
    }
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    /// No sweep running
    Idle,
    /// Setting dwell time and modulation
    Preparing,
    /// Moving to the next wavelength
    SteppingWavelength,
    /// Reading a point, `attempt` is 1-based
    Retrying {
        /// Current attempt
        attempt: u32,
    },
    /// Point read and stored
    PointAccepted,
    /// No data after the last attempt
    HardFailure,
    /// One repetition finished and saved
    RepetitionDone,
    /// Abort observed, PMT going to 0 V
    Aborting,
    /// Moving back to the start wavelength
    ReturningHome,
}

impl std::fmt::Display for SweepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepState::Idle => write!(f, "idle"),
            SweepState::Preparing => write!(f, "preparing"),
            SweepState::SteppingWavelength => write!(f, "stepping"),
            SweepState::Retrying { attempt } => write!(f, "reading (attempt {})", attempt),
            SweepState::PointAccepted => write!(f, "point accepted"),
            SweepState::HardFailure => write!(f, "hard failure"),
            SweepState::RepetitionDone => write!(f, "repetition done"),
            SweepState::Aborting => write!(f, "aborting"),
            SweepState::ReturningHome => write!(f, "returning home"),
        }
    }
}

/// Notification published while a sweep runs.
#[derive(Debug, Clone)]
pub enum SweepEvent {
    /// Scheduler state changed.
    StateChanged(SweepState),
    /// Sent after every wavelength, accepted or not.
    Progress(SweepProgress),
    /// A point was accepted.
    PointAcquired {
        /// 0-based repetition.
        repetition: u32,
        /// The point with derived channels.
        point: SpectrumPoint,
    },
    /// Running average after a point of a multi-repetition sweep.
    AverageUpdated(Spectrum),
    /// A repetition finished (possibly partial after an abort).
    RepetitionCompleted {
        /// 0-based repetition.
        repetition: u32,
        /// Raw spectrum of the repetition.
        spectrum: Spectrum,
    },
    /// The lock-in reported linearly polarized light.
    LinearPolarization {
        /// Wavelength of the point.
        wavelength_nm: f64,
        /// Reported diagnostic.
        lp_theta_std: f64,
    },
    /// The sweep is being aborted.
    Aborted {
        /// Reason given to the abort flag.
        reason: String,
    },
    /// The sweep left the device back at its start wavelength.
    Finished,
}

/// Everything a sweep produced.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Raw spectrum of each repetition, in order.
    pub repetitions: Vec<Spectrum>,
    /// Corrected spectrum of each repetition, empty without corrections.
    pub corrected: Vec<Spectrum>,
    /// Cross-repetition average, multi-repetition sweeps only.
    pub average: Option<Spectrum>,
    /// Corrected average.
    pub average_corrected: Option<Spectrum>,
    /// Abort reason if the sweep ended early.
    pub aborted: Option<String>,
}

/// Where and how a sweep's results are written.
#[derive(Debug, Clone, Default)]
pub struct SweepOutputs {
    /// Target directory; nothing is written when `None`.
    pub store: Option<SpectrumStore>,
    /// Corrections applied to every saved spectrum.
    pub corrections: CorrectionSet,
    /// Error model for blank subtraction.
    pub blank_error: BlankErrorModel,
    /// Parameter record saved next to every spectrum.
    pub parameters: Option<ParameterRecord>,
}

enum PointRead {
    Accepted(LockInReading),
    Exhausted,
    Aborted,
}

/// Runs wavelength sweeps. Cloning shares devices, state and observers.
#[derive(Debug, Clone)]
pub struct AcquisitionScheduler {
    devices: Arc<DeviceLockRegistry>,
    path: OpticalPath,
    client: DataAcquisitionClient,
    timing: SweepTiming,
    formulas: DerivedFormulas,
    events: broadcast::Sender<SweepEvent>,
    state: Arc<RwLock<SweepState>>,
    active: ActiveAbort,
}

impl AcquisitionScheduler {
    /// Create a scheduler over the shared devices.
    pub fn new(
        devices: Arc<DeviceLockRegistry>,
        path: OpticalPath,
        timing: SweepTiming,
        formulas: DerivedFormulas,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            client: DataAcquisitionClient::new(Arc::clone(&devices)),
            devices,
            path,
            timing,
            formulas,
            events,
            state: Arc::new(RwLock::new(SweepState::Idle)),
            active: ActiveAbort::new(),
        }
    }

    /// Subscribe to sweep events.
    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.events.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> SweepState {
        *self.state.read()
    }

    /// Slot holding the running sweep's abort flag.
    pub fn active_sweep(&self) -> ActiveAbort {
        self.active.clone()
    }

    /// Abort the running sweep. Returns `false` when idle or already aborting.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        self.active.trigger(reason)
    }

    /// Spawn `run_sweep` on a [`Worker`]. `guard` is held until the sweep
    /// returns.
    pub fn start(
        &self,
        request: AcquisitionRequest,
        outputs: SweepOutputs,
        guard: Option<BusyGuard>,
    ) -> SweepHandle {
        let scheduler = self.clone();
        let worker = Worker::spawn("sweep", AbortFlag::new(), move |abort| async move {
            let _guard = guard;
            scheduler.run_sweep(&request, &outputs, &abort).await
        });
        SweepHandle { worker }
    }

    /// Run a whole sweep on the calling task.
    ///
    /// Returns after the optical path is back at `request.start_nm`. A hard
    /// acquisition failure or device fault is returned only after that tail
    /// has run and the PMT is at 0 V.
    pub async fn run_sweep(
        &self,
        request: &AcquisitionRequest,
        outputs: &SweepOutputs,
        abort: &AbortFlag,
    ) -> Result<SweepReport, SweepError> {
        self.active.register(abort);
        self.set_state(SweepState::Preparing);
        let formulas = self.formulas.with_sample(request.sample);
        let plan = SweepPlan::from_request(request);
        info!(
            name = %request.name,
            start_nm = request.start_nm,
            end_nm = request.end_nm,
            step_nm = request.step_nm,
            points = plan.len(),
            repetitions = request.repetitions,
            "Starting sweep"
        );

        let body = self.sweep_body(request, outputs, &plan, &formulas, abort).await;

        let failed = !matches!(body, Ok((_, None)));
        if failed || abort.is_triggered() {
            self.set_state(SweepState::Aborting);
            let reason = abort
                .reason()
                .or_else(|| body.as_ref().err().map(ToString::to_string))
                .unwrap_or_else(|| "sweep failed".to_string());
            self.emit(SweepEvent::Aborted { reason });
            if let Err(e) = self.zero_pmt().await {
                error!(error = %e, "Could not set PMT voltage to 0 V");
            }
        }

        self.set_state(SweepState::ReturningHome);
        let home = self.return_home(request.start_nm).await;

        abort.reset();
        self.active.clear();
        self.set_state(SweepState::Idle);
        self.emit(SweepEvent::Finished);

        match (body, home) {
            (Err(e), _) | (Ok((_, Some(e))), _) => Err(e),
            (Ok(_), Err(e)) => Err(CplError::Device(e)),
            (Ok((report, None)), Ok(())) => Ok(report),
        }
    }

    async fn sweep_body(
        &self,
        request: &AcquisitionRequest,
        outputs: &SweepOutputs,
        plan: &SweepPlan,
        formulas: &DerivedFormulas,
        abort: &AbortFlag,
    ) -> AppResult<(SweepReport, Option<CplError>)> {
        {
            let lockin = self.devices.lockin_daq().await;
            lockin.set_dwell_time(request.dwell_time_s).await?;
        }
        abort
            .sleep(Duration::from_secs_f64(request.dwell_time_s))
            .await;
        self.path
            .set_modulation_active(!request.modulator_off)
            .await?;

        let corrector = BaselineCorrector::new(*formulas, outputs.blank_error);
        let mut accumulator = Accumulator::new(*formulas);
        let mut report = SweepReport::default();
        let mut failure = None;
        let total_reps = request.repetitions;
        let started = Instant::now();

        for rep in 0..total_reps {
            if abort.is_triggered() {
                break;
            }
            info!(run = rep + 1, total = total_reps, "Run {}/{}", rep + 1, total_reps);
            let rep_started = Instant::now();
            let mut spectrum = Spectrum::new();

            for wl in plan.wavelengths() {
                if abort.is_triggered() {
                    break;
                }
                self.set_state(SweepState::SteppingWavelength);
                self.path
                    .move_to(wl, !request.modulator_off, Some(abort))
                    .await?;
                abort.sleep(self.timing.lowpass_risetime).await;

                match self.acquire_point(abort).await? {
                    PointRead::Accepted(reading) => {
                        let point = formulas
                            .point(wl, reading.dc, reading.ac)
                            .with_lp_theta_std(reading.lp_theta_std);
                        self.set_state(SweepState::PointAccepted);
                        spectrum.push(point);
                        self.emit(SweepEvent::PointAcquired {
                            repetition: rep,
                            point,
                        });
                        if total_reps > 1 {
                            accumulator.ingest(&point, rep);
                            self.emit(SweepEvent::AverageUpdated(accumulator.snapshot()));
                        }
                        self.check_linear_polarization(&point);
                    }
                    PointRead::Exhausted => {
                        let attempts = self.timing.max_read_attempts;
                        self.set_state(SweepState::HardFailure);
                        error!(
                            wavelength_nm = wl,
                            attempts, "Could not collect data after {} tries", attempts
                        );
                        abort.trigger(format!("no data at {} nm after {} tries", wl, attempts));
                        failure = Some(CplError::HardAcquisitionFailure {
                            wavelength_nm: wl,
                            attempts,
                        });
                    }
                    PointRead::Aborted => {}
                }

                self.emit(SweepEvent::Progress(SweepProgress {
                    start_nm: plan.start_nm(),
                    end_nm: plan.end_nm(),
                    current_nm: wl,
                    current_rep: rep + 1,
                    total_reps,
                    elapsed_seconds: started.elapsed().as_secs_f64(),
                }));
            }

            if abort.is_triggered() {
                self.set_state(SweepState::Aborting);
                self.zero_pmt().await?;
            }
            info!(
                seconds = rep_started.elapsed().as_secs_f64(),
                "This scan took {:.1} s",
                rep_started.elapsed().as_secs_f64()
            );
            self.set_state(SweepState::RepetitionDone);

            let corrected = self.persist(
                &request.repetition_name(rep),
                &spectrum,
                outputs,
                &corrector,
            )?;
            self.emit(SweepEvent::RepetitionCompleted {
                repetition: rep,
                spectrum: spectrum.clone(),
            });
            report.repetitions.push(spectrum);
            report.corrected.extend(corrected);
        }

        if total_reps > 1 && !abort.is_triggered() {
            let average = average_spectra(&report.repetitions, formulas);
            let average_corrected = self.persist(
                &format!("{}_avg", request.name),
                &average,
                outputs,
                &corrector,
            )?;
            report.average = Some(average);
            report.average_corrected = average_corrected;
        }

        report.aborted = abort.reason();
        Ok((report, failure))
    }

    /// Read one point, retrying transient failures.
    async fn acquire_point(&self, abort: &AbortFlag) -> AppResult<PointRead> {
        for attempt in 1..=self.timing.max_read_attempts {
            if abort.is_triggered() {
                return Ok(PointRead::Aborted);
            }
            self.set_state(SweepState::Retrying { attempt });
            let outcome = self.client.read_point(abort).await?;
            if outcome.success {
                return Ok(PointRead::Accepted(outcome.data));
            }
            debug!(attempt, "Lock-in read failed");
        }
        if abort.is_triggered() {
            Ok(PointRead::Aborted)
        } else {
            Ok(PointRead::Exhausted)
        }
    }

    fn check_linear_polarization(&self, point: &SpectrumPoint) {
        let Some(lp) = point.lp_theta_std else {
            return;
        };
        if lp < self.timing.lp_theta_std_warning_threshold {
            warn!(
                wavelength_nm = point.wavelength_nm,
                lp_theta_std = lp,
                "Linearly polarized light detected at {} nm (theta std {:.3})",
                point.wavelength_nm,
                lp
            );
            self.emit(SweepEvent::LinearPolarization {
                wavelength_nm: point.wavelength_nm,
                lp_theta_std: lp,
            });
        }
    }

    /// Correct `spectrum` if corrections are configured and write both
    /// versions. Returns the corrected spectrum.
    fn persist(
        &self,
        name: &str,
        spectrum: &Spectrum,
        outputs: &SweepOutputs,
        corrector: &BaselineCorrector,
    ) -> AppResult<Option<Spectrum>> {
        let corrected = if outputs.corrections.is_empty() {
            None
        } else {
            Some(corrector.correct(spectrum, &outputs.corrections))
        };

        if let Some(store) = &outputs.store {
            store.save_spectrum(name, spectrum)?;
            if let Some(params) = &outputs.parameters {
                store.save_parameters(name, params)?;
            }
            if let Some(corrected) = &corrected {
                store.save_spectrum(&format!("{}_corr", name), corrected)?;
            }
        }
        Ok(corrected)
    }

    async fn zero_pmt(&self) -> anyhow::Result<()> {
        let lockin = self.devices.lockin_daq().await;
        lockin.set_pmt_voltage(0.0, false).await
    }

    async fn return_home(&self, start_nm: f64) -> anyhow::Result<()> {
        self.path.set_modulation_active(true).await?;
        self.path.move_to(start_nm, true, None).await
    }

    fn set_state(&self, state: SweepState) {
        let changed = {
            let mut current = self.state.write();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            self.emit(SweepEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SweepEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// A sweep running on a background worker.
#[derive(Debug)]
pub struct SweepHandle {
    worker: Worker<Result<SweepReport, SweepError>>,
}

impl SweepHandle {
    /// Ask the sweep to stop. No-op once it has finished.
    pub fn abort(&self, reason: impl Into<String>) {
        if !self.worker.is_finished() {
            self.worker.stop(reason);
        }
    }

    /// The sweep's abort flag.
    pub fn abort_flag(&self) -> &AbortFlag {
        self.worker.abort_flag()
    }

    /// Whether the sweep is still running.
    pub fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }

    /// Wait for the sweep to return.
    pub async fn wait(self) -> Result<SweepReport, SweepError> {
        self.worker.join().await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockRig, ReadFailure};
    use crate::hardware::Topology;
    use crate::spectrum::Measurement;
    use tracing_test::traced_test;

    fn scheduler(rig: &MockRig) -> AcquisitionScheduler {
        let devices = Arc::new(rig.registry());
        let path = OpticalPath::new(Arc::clone(&devices), Topology::Dual, Duration::ZERO).unwrap();
        let timing = SweepTiming {
            lowpass_risetime: Duration::ZERO,
            ..SweepTiming::default()
        };
        AcquisitionScheduler::new(devices, path, timing, DerivedFormulas::default())
    }

    fn request(reps: u32) -> AcquisitionRequest {
        AcquisitionRequest::new(500.0, 504.0, 1.0, 0.001, reps, "test")
    }

    #[tokio::test]
    async fn test_single_repetition_visits_grid() {
        let rig = MockRig::dual();
        let scheduler = scheduler(&rig);

        let report = scheduler
            .run_sweep(&request(1), &SweepOutputs::default(), &AbortFlag::new())
            .await
            .unwrap();

        assert_eq!(report.repetitions.len(), 1);
        let wls: Vec<f64> = report.repetitions[0].wavelengths().collect();
        assert_eq!(wls, vec![500.0, 501.0, 502.0, 503.0, 504.0]);
        assert!(report.average.is_none());
        assert!(report.aborted.is_none());
        assert_eq!(rig.lockin.read_count(), 5);
        assert_eq!(rig.mono1.position(), Some(500.0));
        assert_eq!(scheduler.state(), SweepState::Idle);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let rig = MockRig::dual();
        rig.lockin.set_read_failure(ReadFailure::Next(4));
        let scheduler = scheduler(&rig);

        let report = scheduler
            .run_sweep(&request(1), &SweepOutputs::default(), &AbortFlag::new())
            .await
            .unwrap();
        assert_eq!(report.repetitions[0].len(), 5);
        assert_eq!(rig.lockin.read_count(), 9);
    }

    #[tokio::test]
    async fn test_multi_repetition_average() {
        let rig = MockRig::dual();
        let scheduler = scheduler(&rig);

        let report = scheduler
            .run_sweep(&request(3), &SweepOutputs::default(), &AbortFlag::new())
            .await
            .unwrap();
        assert_eq!(report.repetitions.len(), 3);
        let average = report.average.unwrap();
        assert_eq!(average.len(), 5);
        let expected: f64 = report
            .repetitions
            .iter()
            .map(|s| s.points()[2].dc.value)
            .sum::<f64>()
            / 3.0;
        assert!((average.points()[2].dc.value - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_modulator_off_sweep() {
        let rig = MockRig::dual();
        let scheduler = scheduler(&rig);

        scheduler
            .run_sweep(
                &request(1).with_modulator_off(true),
                &SweepOutputs::default(),
                &AbortFlag::new(),
            )
            .await
            .unwrap();

        // off during the sweep, back on afterwards
        assert_eq!(rig.modulator.active_history(), vec![false, true]);
        assert_eq!(rig.modulator.position(), Some(500.0));
    }

    #[tokio::test]
    async fn test_abort_when_idle_is_noop() {
        let rig = MockRig::dual();
        let scheduler = scheduler(&rig);
        assert!(!scheduler.abort("nothing to stop"));
        assert!(!scheduler.abort("still nothing"));
        assert_eq!(scheduler.state(), SweepState::Idle);
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let rig = MockRig::dual();
        let scheduler = scheduler(&rig);
        let mut rx = scheduler.subscribe();

        scheduler
            .run_sweep(&request(1), &SweepOutputs::default(), &AbortFlag::new())
            .await
            .unwrap();

        let mut progress = 0;
        let mut points = 0;
        let mut finished = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SweepEvent::Progress(_) => progress += 1,
                SweepEvent::PointAcquired { .. } => points += 1,
                SweepEvent::Finished => finished = true,
                _ => {}
            }
        }
        assert_eq!(progress, 5);
        assert_eq!(points, 5);
        assert!(finished);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_linear_polarization_is_logged() {
        let rig = MockRig::dual();
        rig.lockin.set_base_reading(LockInReading {
            dc: Measurement::new(1.0, 0.01),
            ac: Measurement::new(0.001, 0.0001),
            lp_theta_std: Some(0.4),
        });
        let scheduler = scheduler(&rig);

        scheduler
            .run_sweep(&request(1), &SweepOutputs::default(), &AbortFlag::new())
            .await
            .unwrap();

        assert!(logs_contain("Linearly polarized light detected at 500 nm"));
        assert!(logs_contain("This scan took"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_hard_failure_is_logged_and_saved() {
        let rig = MockRig::dual();
        rig.lockin.set_read_failure(ReadFailure::Always);
        let scheduler = scheduler(&rig);
        let dir = tempfile::tempdir().unwrap();
        let outputs = SweepOutputs {
            store: Some(SpectrumStore::new(dir.path())),
            ..SweepOutputs::default()
        };

        let err = scheduler
            .run_sweep(&request(1), &outputs, &AbortFlag::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CplError::HardAcquisitionFailure { attempts: 5, .. }));
        assert!(logs_contain("Could not collect data after 5 tries"));
        assert!(dir.path().join("test.csv").is_file());
        assert_eq!(rig.lockin.pmt_history().last(), Some(&0.0));
        assert_eq!(scheduler.state(), SweepState::Idle);
    }
}
