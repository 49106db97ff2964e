//! Phase-offset calibration wizard.
//!
//! The operator records the AC phase angle with a sample of known positive
//! and then negative circular polarization. Ideally these sit at +90° and
//! −90°; the mean deviation is added to the lock-in phase offset.
//!
//! ```text
//! 0 NotStarted ─▶ 1 CollectingPositive ─▶ 2 PositiveDone
//!      └──────── skip ───────────────────────▲
//! 2 PositiveDone ─▶ 3 CollectingNegative ─▶ 4 NegativeDone ─▶ 5 Applying
//!      └──────── skip ───────────────────────▲
//! ```
//!
//! A [`CalibrationSession`] holds the busy gate for its whole lifetime, so a
//! sweep cannot start while it exists.

use crate::abort::AbortFlag;
use crate::acquisition::DataAcquisitionClient;
use crate::busy::{Activity, BusyGate, BusyGuard};
use crate::error::{AppResult, CplError};
use crate::hardware::DeviceLockRegistry;
use crate::storage::ParameterRecord;
use crate::worker::Worker;
use parking_lot::RwLock;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Wizard step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    /// Session open, nothing recorded.
    NotStarted,
    /// Recording the positive polarization phase.
    CollectingPositive,
    /// Positive phase recorded or skipped.
    PositiveDone,
    /// Recording the negative polarization phase.
    CollectingNegative,
    /// Negative phase recorded or skipped, new offset computed.
    NegativeDone,
    /// New offset written to the lock-in.
    Applying,
}

impl CalibrationStep {
    /// Numeric step, 0 to 5.
    pub fn index(self) -> u8 {
        match self {
            CalibrationStep::NotStarted => 0,
            CalibrationStep::CollectingPositive => 1,
            CalibrationStep::PositiveDone => 2,
            CalibrationStep::CollectingNegative => 3,
            CalibrationStep::NegativeDone => 4,
            CalibrationStep::Applying => 5,
        }
    }
}

impl std::fmt::Display for CalibrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CalibrationStep::NotStarted => "not started",
            CalibrationStep::CollectingPositive => "collecting positive",
            CalibrationStep::PositiveDone => "positive done",
            CalibrationStep::CollectingNegative => "collecting negative",
            CalibrationStep::NegativeDone => "negative done",
            CalibrationStep::Applying => "applying",
        };
        write!(f, "{}", label)
    }
}

/// Running mean of phase samples.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseAverage {
    /// Mean angle in degrees, 0 before the first sample.
    pub mean_deg: f64,
    /// Samples averaged.
    pub count: u32,
}

impl PhaseAverage {
    /// Add one sample.
    pub fn push(&mut self, theta_deg: f64) {
        let n = f64::from(self.count);
        self.mean_deg = (self.mean_deg * n + theta_deg) / (n + 1.0);
        self.count += 1;
    }

    /// Mean, `None` without samples.
    pub fn value(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean_deg)
    }
}

/// Last-parameters record at `path`; a missing file gives the defaults.
fn load_or_default(path: &Path) -> AppResult<ParameterRecord> {
    match ParameterRecord::read_from(path) {
        Err(CplError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            Ok(ParameterRecord::default())
        }
        other => other,
    }
}

/// New phase offset from the recorded phases.
///
/// Every side that was recorded contributes its deviation from ±90°; the
/// deviations are averaged and added to `current`. `None` if both sides
/// were skipped.
pub fn compute_phase_offset(
    current: f64,
    positive_deg: Option<f64>,
    negative_deg: Option<f64>,
) -> Option<f64> {
    let diffs: Vec<f64> = positive_deg
        .map(|p| p - 90.0)
        .into_iter()
        .chain(negative_deg.map(|n| n + 90.0))
        .collect();
    if diffs.is_empty() {
        return None;
    }
    Some(current + diffs.iter().sum::<f64>() / diffs.len() as f64)
}

/// Read phase samples until `abort` trips or `max_failed_reads` reads in a
/// row return nothing.
async fn record_phase(
    client: DataAcquisitionClient,
    abort: AbortFlag,
    live: Arc<RwLock<PhaseAverage>>,
    max_failed_reads: u32,
) -> AppResult<PhaseAverage> {
    let mut average = PhaseAverage::default();
    let mut failed = 0;
    while !abort.is_triggered() {
        let theta = client.read_theta(&abort).await?;
        if theta.is_nan() {
            failed += 1;
            if failed >= max_failed_reads {
                warn!(failed, "No phase data from lock-in, recording stopped");
                break;
            }
        } else {
            failed = 0;
            average.push(theta);
            *live.write() = average;
        }
        tokio::task::yield_now().await;
    }
    Ok(average)
}

/// One calibration run.
#[derive(Debug)]
pub struct CalibrationSession {
    devices: Arc<DeviceLockRegistry>,
    client: DataAcquisitionClient,
    step: CalibrationStep,
    current_offset: f64,
    positive: Option<PhaseAverage>,
    negative: Option<PhaseAverage>,
    new_offset: Option<f64>,
    recording: Option<Worker<AppResult<PhaseAverage>>>,
    live: Arc<RwLock<PhaseAverage>>,
    max_failed_reads: u32,
    last_params_file: Option<PathBuf>,
    _guard: BusyGuard,
}

impl CalibrationSession {
    /// Claim the busy gate and read the current phase offset.
    pub async fn begin(
        devices: Arc<DeviceLockRegistry>,
        gate: &BusyGate,
        max_failed_reads: u32,
    ) -> AppResult<Self> {
        let guard = gate.try_enter(Activity::Calibration)?;
        let current_offset = {
            let lockin = devices.lockin_daq().await;
            lockin.phase_offset().await?
        };
        info!(current_offset, "Starting calibration, current phaseoffset: {:.3} deg", current_offset);
        Ok(Self {
            client: DataAcquisitionClient::new(Arc::clone(&devices)),
            devices,
            step: CalibrationStep::NotStarted,
            current_offset,
            positive: None,
            negative: None,
            new_offset: None,
            recording: None,
            live: Arc::new(RwLock::new(PhaseAverage::default())),
            max_failed_reads: max_failed_reads.max(1),
            last_params_file: None,
            _guard: guard,
        })
    }

    /// Persist the applied offset to this last-parameters file.
    pub fn with_last_params(mut self, path: impl Into<PathBuf>) -> Self {
        self.last_params_file = Some(path.into());
        self
    }

    /// Current step.
    pub fn step(&self) -> CalibrationStep {
        self.step
    }

    /// Phase offset when the session began.
    pub fn current_offset(&self) -> f64 {
        self.current_offset
    }

    /// Recorded positive phase, `None` if skipped or not yet done.
    pub fn positive(&self) -> Option<PhaseAverage> {
        self.positive
    }

    /// Recorded negative phase, `None` if skipped or not yet done.
    pub fn negative(&self) -> Option<PhaseAverage> {
        self.negative
    }

    /// Running average of the recording in progress.
    pub fn live_average(&self) -> PhaseAverage {
        *self.live.read()
    }

    /// Computed offset, available from [`CalibrationStep::NegativeDone`].
    pub fn new_offset(&self) -> Option<f64> {
        self.new_offset
    }

    /// Whether `apply` would do anything.
    pub fn can_apply(&self) -> bool {
        self.step == CalibrationStep::NegativeDone && self.new_offset.is_some()
    }

    /// Start recording the positive phase.
    pub fn start_positive(&mut self) -> AppResult<()> {
        self.require_step(CalibrationStep::NotStarted, "record positive phase")?;
        self.spawn_recording();
        self.step = CalibrationStep::CollectingPositive;
        Ok(())
    }

    /// Stop recording and keep the positive phase.
    pub async fn finish_positive(&mut self) -> AppResult<PhaseAverage> {
        self.require_step(CalibrationStep::CollectingPositive, "finish positive phase")?;
        let average = self.stop_recording().await?;
        info!(theta = average.mean_deg, samples = average.count, "Positive theta at {:.3} deg", average.mean_deg);
        self.positive = Some(average);
        self.step = CalibrationStep::PositiveDone;
        Ok(average)
    }

    /// Skip the positive phase, discarding a recording in progress.
    pub async fn skip_positive(&mut self) -> AppResult<()> {
        match self.step {
            CalibrationStep::NotStarted => {}
            CalibrationStep::CollectingPositive => {
                self.stop_recording().await?;
            }
            _ => return Err(self.invalid("skip positive phase")),
        }
        info!("Positive phase skipped");
        self.positive = None;
        self.step = CalibrationStep::PositiveDone;
        Ok(())
    }

    /// Start recording the negative phase.
    pub fn start_negative(&mut self) -> AppResult<()> {
        self.require_step(CalibrationStep::PositiveDone, "record negative phase")?;
        self.spawn_recording();
        self.step = CalibrationStep::CollectingNegative;
        Ok(())
    }

    /// Stop recording, keep the negative phase and compute the new offset.
    pub async fn finish_negative(&mut self) -> AppResult<PhaseAverage> {
        self.require_step(CalibrationStep::CollectingNegative, "finish negative phase")?;
        let average = self.stop_recording().await?;
        info!(theta = average.mean_deg, samples = average.count, "Negative theta at {:.3} deg", average.mean_deg);
        self.negative = Some(average);
        self.complete();
        Ok(average)
    }

    /// Skip the negative phase and compute the new offset.
    pub async fn skip_negative(&mut self) -> AppResult<()> {
        match self.step {
            CalibrationStep::PositiveDone => {}
            CalibrationStep::CollectingNegative => {
                self.stop_recording().await?;
            }
            _ => return Err(self.invalid("skip negative phase")),
        }
        info!("Negative phase skipped");
        self.negative = None;
        self.complete();
        Ok(())
    }

    /// Write the new offset to the lock-in and the last-parameters file.
    pub async fn apply(&mut self) -> AppResult<f64> {
        self.require_step(CalibrationStep::NegativeDone, "apply phase offset")?;
        let Some(offset) = self.new_offset else {
            return Err(self.invalid("apply a skipped calibration"));
        };
        // A damaged record fails here, before the lock-in is touched.
        let record = match &self.last_params_file {
            Some(path) => Some((path.clone(), load_or_default(path)?)),
            None => None,
        };
        self.step = CalibrationStep::Applying;
        {
            let lockin = self.devices.lockin_daq().await;
            lockin.set_phaseoffset(offset).await?;
        }
        info!(offset, "New phaseoffset: {:.3} deg", offset);

        if let Some((path, mut record)) = record {
            record.phase_offset = offset;
            record.write_to(&path)?;
        }
        info!("End of phase calibration");
        Ok(offset)
    }

    /// Stop any recording and end the session without applying.
    pub async fn cancel(mut self) -> AppResult<()> {
        if self.recording.is_some() {
            self.stop_recording().await?;
        }
        info!("Calibration aborted");
        Ok(())
    }

    fn complete(&mut self) {
        for (side, average) in [("positive", self.positive), ("negative", self.negative)] {
            if average.is_some_and(|a| a.value().is_none()) {
                warn!(side, "No phase samples recorded, side ignored");
            }
        }
        self.new_offset = compute_phase_offset(
            self.current_offset,
            self.positive.and_then(|p| p.value()),
            self.negative.and_then(|n| n.value()),
        );
        match self.new_offset {
            Some(offset) => info!(
                change = offset - self.current_offset,
                "Change in phaseoffset: {:.3} deg",
                offset - self.current_offset
            ),
            None => info!("Calibration was skipped"),
        }
        self.step = CalibrationStep::NegativeDone;
    }

    fn spawn_recording(&mut self) {
        *self.live.write() = PhaseAverage::default();
        let client = self.client.clone();
        let live = Arc::clone(&self.live);
        let max_failed = self.max_failed_reads;
        self.recording = Some(Worker::spawn(
            "calibration-record",
            AbortFlag::new(),
            move |abort| record_phase(client, abort, live, max_failed),
        ));
    }

    async fn stop_recording(&mut self) -> AppResult<PhaseAverage> {
        match self.recording.take() {
            Some(worker) => worker.stop_and_join("phase recorded").await?,
            None => Ok(PhaseAverage::default()),
        }
    }

    fn require_step(&self, step: CalibrationStep, action: &'static str) -> AppResult<()> {
        if self.step == step {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> CplError {
        CplError::InvalidTransition {
            action,
            step: self.step.to_string(),
        }
    }
}

impl Drop for CalibrationSession {
    fn drop(&mut self) {
        if let Some(worker) = &self.recording {
            worker.stop("calibration session dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockRig;
    use std::time::Duration;
    use tracing_test::traced_test;

    async fn wait_for_theta_reads(rig: &MockRig, reads: u32) {
        while rig.lockin.theta_reads() < reads {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn test_offset_from_both_sides() {
        assert_eq!(compute_phase_offset(150.0, Some(95.0), Some(-85.0)), Some(155.0));
    }

    #[test]
    fn test_offset_from_one_side() {
        assert_eq!(compute_phase_offset(150.0, None, Some(-85.0)), Some(155.0));
        assert_eq!(compute_phase_offset(10.0, Some(80.0), None), Some(0.0));
    }

    #[test]
    fn test_offset_when_both_skipped() {
        assert_eq!(compute_phase_offset(150.0, None, None), None);
    }

    #[test]
    fn test_phase_average() {
        let mut avg = PhaseAverage::default();
        assert_eq!(avg.value(), None);
        for theta in [94.0, 96.0, 95.0] {
            avg.push(theta);
        }
        assert_eq!(avg.count, 3);
        assert!((avg.mean_deg - 95.0).abs() < 1e-12);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_empty_recording_is_ignored_with_warning() {
        let rig = MockRig::dual();
        let gate = BusyGate::new();
        let mut session = CalibrationSession::begin(Arc::new(rig.registry()), &gate, 5)
            .await
            .unwrap();

        // No phase data: the recorder stops on its own.
        session.start_positive().unwrap();
        wait_for_theta_reads(&rig, 5).await;
        let positive = session.finish_positive().await.unwrap();
        assert_eq!(positive.count, 0);

        let before = rig.lockin.theta_reads();
        rig.lockin.push_theta_samples([-84.0, -86.0, -85.0]);
        session.start_negative().unwrap();
        wait_for_theta_reads(&rig, before + 3 + 5).await;
        let negative = session.finish_negative().await.unwrap();
        assert_eq!(negative.count, 3);

        assert_eq!(session.new_offset(), Some(5.0));
        assert!(logs_contain("No phase samples recorded, side ignored"));
    }

    #[test]
    fn test_step_indices() {
        assert_eq!(CalibrationStep::NotStarted.index(), 0);
        assert_eq!(CalibrationStep::Applying.index(), 5);
        assert_eq!(CalibrationStep::CollectingNegative.to_string(), "collecting negative");
    }
}
