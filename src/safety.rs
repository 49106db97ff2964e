//! Oscilloscope-based detector protection.
//!
//! The [`SafetyMonitor`] polls the lock-in oscilloscope on its own worker and
//! keeps a bounded history of frame maxima. Two hazards are checked after
//! every sample:
//!
//! - **Range limit**: the last `range_window` samples are equal (within
//!   `range_tolerance_v`) and all at or above `range_limit_fraction` of the
//!   acquisition lock-in's input range. The input is auto-ranged.
//! - **PMT overvoltage**: the last `pmt_window` samples are all at or above
//!   `shutdown_threshold_v`. The PMT is set to 0 V.
//!
//! Either hazard aborts a running sweep on every cycle it holds, so a sweep
//! started during an episode is stopped too. The device response (auto-range,
//! PMT to 0 V) is issued once per episode and repeated only when the hazard
//! stops another sweep. A device fault ends the monitor; it is reported as
//! [`SafetyEvent::MonitorFailed`] and aborts the running sweep.

use crate::abort::{AbortFlag, ActiveAbort};
use crate::error::AppResult;
use crate::hardware::{DeviceLockRegistry, ScopeSample};
use crate::worker::Worker;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Thresholds of the safety checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Samples kept in the history.
    #[serde(default = "default_history_length")]
    pub history_length: usize,
    /// PMT shutdown voltage.
    #[serde(default = "default_shutdown_threshold")]
    pub shutdown_threshold_v: f64,
    /// Fraction of the input range that counts as saturated.
    #[serde(default = "default_range_limit_fraction")]
    pub range_limit_fraction: f64,
    /// Consecutive samples for the range check.
    #[serde(default = "default_range_window")]
    pub range_window: usize,
    /// Consecutive samples for the PMT check.
    #[serde(default = "default_pmt_window")]
    pub pmt_window: usize,
    /// Absolute tolerance for "equal" samples in the range check.
    #[serde(default = "default_range_tolerance")]
    pub range_tolerance_v: f64,
}

fn default_history_length() -> usize {
    75
}

fn default_shutdown_threshold() -> f64 {
    2.95
}

fn default_range_limit_fraction() -> f64 {
    0.95
}

fn default_range_window() -> usize {
    5
}

fn default_pmt_window() -> usize {
    3
}

fn default_range_tolerance() -> f64 {
    1e-9
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            history_length: default_history_length(),
            shutdown_threshold_v: default_shutdown_threshold(),
            range_limit_fraction: default_range_limit_fraction(),
            range_window: default_range_window(),
            pmt_window: default_pmt_window(),
            range_tolerance_v: default_range_tolerance(),
        }
    }
}

/// Bounded history of oscilloscope maxima, oldest evicted first.
#[derive(Debug, Clone)]
pub struct VoltageHistory {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl VoltageHistory {
    /// Empty history holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `max_volt`. NaN (no frame) is skipped and `false` returned.
    pub fn push(&mut self, max_volt: f64) -> bool {
        if max_volt.is_nan() {
            return false;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(max_volt);
        true
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if no sample was recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    /// Samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    /// The last `n` samples, `None` while fewer are recorded.
    pub fn last(&self, n: usize) -> Option<impl Iterator<Item = f64> + '_> {
        if n == 0 || self.samples.len() < n {
            return None;
        }
        Some(self.samples.iter().skip(self.samples.len() - n).copied())
    }
}

/// Result of one hazard check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HazardState {
    /// Condition not met.
    Clear,
    /// First cycle of an episode.
    Onset,
    /// Condition still met since an earlier cycle.
    Ongoing,
}

impl HazardState {
    /// Whether the condition holds this cycle.
    pub fn is_reached(self) -> bool {
        self != Self::Clear
    }
}

/// History plus per-hazard latches.
#[derive(Debug, Clone)]
pub struct HazardDetector {
    history: VoltageHistory,
    limits: SafetyLimits,
    range_latched: bool,
    pmt_latched: bool,
}

impl HazardDetector {
    /// Detector with an empty history.
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            history: VoltageHistory::new(limits.history_length),
            limits,
            range_latched: false,
            pmt_latched: false,
        }
    }

    /// Recorded samples.
    pub fn history(&self) -> &VoltageHistory {
        &self.history
    }

    /// Record a sample. Returns `false` for a skipped NaN.
    pub fn push(&mut self, max_volt: f64) -> bool {
        self.history.push(max_volt)
    }

    /// Whether the last `range_window` samples sit on one value. Only then
    /// is the input range worth querying.
    pub fn range_plateau(&self) -> bool {
        let tol = self.limits.range_tolerance_v;
        let Some(latest) = self.history.latest() else {
            return false;
        };
        self.history
            .last(self.limits.range_window)
            .is_some_and(|mut window| window.all(|v| (v - latest).abs() <= tol))
    }

    /// Range check against the current input range. `None` means the range
    /// was not queried because there is no plateau.
    pub fn check_range(&mut self, signal_range: Option<f64>) -> HazardState {
        let limit = signal_range.map(|r| r * self.limits.range_limit_fraction);
        let reached = match limit {
            Some(limit) if self.range_plateau() => self
                .history
                .last(self.limits.range_window)
                .is_some_and(|mut window| window.all(|v| v >= limit)),
            _ => false,
        };
        Self::latch(&mut self.range_latched, reached)
    }

    /// PMT check.
    pub fn check_pmt(&mut self) -> HazardState {
        let threshold = self.limits.shutdown_threshold_v;
        let reached = self
            .history
            .last(self.limits.pmt_window)
            .is_some_and(|mut window| window.all(|v| v >= threshold));
        Self::latch(&mut self.pmt_latched, reached)
    }

    fn latch(latched: &mut bool, reached: bool) -> HazardState {
        let state = match (reached, *latched) {
            (false, _) => HazardState::Clear,
            (true, false) => HazardState::Onset,
            (true, true) => HazardState::Ongoing,
        };
        *latched = reached;
        state
    }
}

/// Notification from the safety monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum SafetyEvent {
    /// A frame summary was read.
    Sample(ScopeSample),
    /// Range limit reached, input auto-ranged.
    RangeLimit {
        /// Saturated sample value.
        max_volt: f64,
        /// Input range before auto-ranging.
        signal_range: f64,
        /// Input range after auto-ranging.
        new_range: f64,
    },
    /// PMT overvoltage, PMT set to 0 V.
    PmtOvervoltage {
        /// Offending sample value.
        max_volt: f64,
    },
    /// A running sweep was aborted.
    SweepAborted {
        /// Hazard that caused it.
        reason: String,
    },
    /// The monitor stopped on a device fault. Detector protection is off
    /// until it is restarted.
    MonitorFailed {
        /// Fault message.
        reason: String,
    },
}

const MONITOR_FAILED: &str = "safety monitor failed";
const RANGE_LIMIT: &str = "signal range limit reached";
const PMT_LIMIT: &str = "PMT voltage limit reached";

/// Polls the oscilloscope and protects the detector.
#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    devices: Arc<DeviceLockRegistry>,
    limits: SafetyLimits,
    refresh_interval: Duration,
    sweep: ActiveAbort,
    events: broadcast::Sender<SafetyEvent>,
}

impl SafetyMonitor {
    /// Monitor aborting whichever sweep is registered in `sweep`.
    pub fn new(
        devices: Arc<DeviceLockRegistry>,
        limits: SafetyLimits,
        refresh_interval: Duration,
        sweep: ActiveAbort,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            devices,
            limits,
            refresh_interval,
            sweep,
            events,
        }
    }

    /// Subscribe to safety events.
    pub fn subscribe(&self) -> broadcast::Receiver<SafetyEvent> {
        self.events.subscribe()
    }

    /// Configured limits.
    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Run [`run`](Self::run) on a background worker.
    pub fn start(&self) -> Worker<AppResult<()>> {
        let monitor = self.clone();
        Worker::spawn("safety-monitor", AbortFlag::new(), move |stop| async move {
            monitor.run(&stop).await
        })
    }

    /// Poll until `stop` trips, then stop the oscilloscope.
    ///
    /// A device fault ends the loop; the oscilloscope is stopped anyway, the
    /// fault is published and the running sweep is aborted.
    pub async fn run(&self, stop: &AbortFlag) -> AppResult<()> {
        let result = self.monitor(stop).await;
        if let Err(e) = &result {
            error!(error = %e, "Oscilloscope monitor failed, detector unprotected");
            self.emit(SafetyEvent::MonitorFailed {
                reason: e.to_string(),
            });
            self.abort_sweep(MONITOR_FAILED);
        }
        result
    }

    async fn monitor(&self, stop: &AbortFlag) -> AppResult<()> {
        {
            let scope = self.devices.lockin_scope().await;
            scope.start_scope().await?;
        }
        info!(
            refresh_ms = self.refresh_interval.as_millis() as u64,
            "Oscilloscope monitor started"
        );

        let result = self.poll(stop).await;

        let stopped = {
            let scope = self.devices.lockin_scope().await;
            scope.stop_scope().await
        };
        info!("Oscilloscope monitor stopped");
        result?;
        stopped?;
        Ok(())
    }

    async fn poll(&self, stop: &AbortFlag) -> AppResult<()> {
        let mut detector = HazardDetector::new(self.limits);
        while !stop.is_triggered() {
            let sample = {
                let scope = self.devices.lockin_scope().await;
                scope.read_scope().await?
            };
            self.emit(SafetyEvent::Sample(sample));

            if detector.push(sample.max_volt) {
                self.evaluate(&mut detector, sample.max_volt).await?;
            } else {
                debug!("Oscilloscope returned no data");
            }
            stop.sleep(self.refresh_interval).await;
        }
        Ok(())
    }

    async fn evaluate(&self, detector: &mut HazardDetector, max_volt: f64) -> AppResult<()> {
        let signal_range = if detector.range_plateau() {
            let lockin = self.devices.lockin_daq().await;
            Some(lockin.signal_range().await?)
        } else {
            None
        };

        let range = detector.check_range(signal_range);
        if range == HazardState::Onset {
            let new_range = {
                let lockin = self.devices.lockin_daq().await;
                lockin.set_input_range(0.0, true).await?;
                lockin.signal_range().await?
            };
            let signal_range = signal_range.unwrap_or(f64::NAN);
            warn!(
                max_volt,
                signal_range, new_range, "Signal range limit reached, input auto-ranged"
            );
            self.emit(SafetyEvent::RangeLimit {
                max_volt,
                signal_range,
                new_range,
            });
        }
        if range.is_reached() {
            self.abort_sweep(RANGE_LIMIT);
        }

        match detector.check_pmt() {
            HazardState::Onset => {
                self.zero_pmt().await?;
                error!(
                    max_volt,
                    threshold = self.limits.shutdown_threshold_v,
                    "PMT voltage limit reached, PMT set to 0 V"
                );
                self.emit(SafetyEvent::PmtOvervoltage { max_volt });
                self.abort_sweep(PMT_LIMIT);
            }
            // A sweep started during the episode may have raised the PMT again.
            HazardState::Ongoing => {
                if self.abort_sweep(PMT_LIMIT) {
                    self.zero_pmt().await?;
                    error!(max_volt, "PMT voltage still above limit, PMT set to 0 V");
                    self.emit(SafetyEvent::PmtOvervoltage { max_volt });
                }
            }
            HazardState::Clear => {}
        }
        Ok(())
    }

    async fn zero_pmt(&self) -> AppResult<()> {
        let lockin = self.devices.lockin_daq().await;
        lockin.set_pmt_voltage(0.0, false).await?;
        Ok(())
    }

    /// Abort the registered sweep. `true` if this call stopped it.
    fn abort_sweep(&self, reason: &str) -> bool {
        let aborted = self.sweep.trigger(reason);
        if aborted {
            warn!(reason, "Sweep aborted by safety monitor");
            self.emit(SafetyEvent::SweepAborted {
                reason: reason.to_string(),
            });
        }
        aborted
    }

    fn emit(&self, event: SafetyEvent) {
        let _ = self.events.send(event);
    }
}
