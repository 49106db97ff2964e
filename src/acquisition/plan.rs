//! Wavelength grid of a sweep.
//!
//! Points are generated as `start + k·inc` rather than by repeated addition,
//! so every repetition visits bit-identical wavelengths and the accumulator
//! can match them with plain equality.

use super::request::AcquisitionRequest;

const GRID_EPSILON: f64 = 1e-9;

/// Ordered wavelengths visited by every repetition.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    start_nm: f64,
    end_nm: f64,
    increment: f64,
    steps: u64,
}

impl SweepPlan {
    /// Grid for a validated request.
    ///
    /// The last point is the first one at or beyond `end_nm`, so it may
    /// overshoot the end by less than one step.
    pub fn from_request(request: &AcquisitionRequest) -> Self {
        let span = (request.end_nm - request.start_nm).abs();
        let step = request.step_nm.abs();
        let steps = if step > 0.0 {
            (span / step - GRID_EPSILON).ceil().max(0.0) as u64
        } else {
            0
        };
        Self {
            start_nm: request.start_nm,
            end_nm: request.end_nm,
            increment: request.direction() * step,
            steps,
        }
    }

    /// First wavelength.
    pub fn start_nm(&self) -> f64 {
        self.start_nm
    }

    /// Configured end wavelength.
    pub fn end_nm(&self) -> f64 {
        self.end_nm
    }

    /// Signed step.
    pub fn increment(&self) -> f64 {
        self.increment
    }

    /// Number of points per repetition.
    pub fn len(&self) -> usize {
        self.steps as usize + 1
    }

    /// Always false; a plan holds at least the start point.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Wavelength of point `k`.
    pub fn wavelength(&self, k: u64) -> f64 {
        round_nm(self.start_nm + k as f64 * self.increment)
    }

    /// All wavelengths in visiting order.
    pub fn wavelengths(&self) -> impl Iterator<Item = f64> + '_ {
        (0..=self.steps).map(move |k| self.wavelength(k))
    }
}

fn round_nm(nm: f64) -> f64 {
    (nm * 1e6).round() / 1e6
}
