//! Baseline correction of a finished spectrum.
//!
//! Order of operations:
//!
//! 1. detector sensitivity (DC and AC divided by an interpolated factor)
//! 2. AC blank subtraction
//! 3. DC blank subtraction
//! 4. base-reading blank subtraction (AC and DC)
//!
//! A correction whose wavelength range does not bound the measured range is
//! skipped with a warning. Blanks are never interpolated: a measured
//! wavelength missing from a blank turns that row into NaN, and NaN rows are
//! dropped before the derived channels are recomputed.

use super::derived::DerivedFormulas;
use crate::spectrum::{Measurement, Spectrum};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Absolute tolerance when matching blank wavelengths to measured ones.
pub const WAVELENGTH_MATCH_TOLERANCE: f64 = 1e-9;

/// How the measured and blank standard deviations are combined on
/// subtraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlankErrorModel {
    /// `sqrt((s_m/2)² + (s_b/2)²)`, compatible with existing data sets.
    #[default]
    Halved,
    /// `sqrt(s_m² + s_b²)`.
    Quadrature,
}

impl BlankErrorModel {
    /// Standard deviation of `measured − blank`.
    pub fn combine(self, measured_std: f64, blank_std: f64) -> f64 {
        match self {
            BlankErrorModel::Halved => ((measured_std / 2.0).powi(2) + (blank_std / 2.0).powi(2)).sqrt(),
            BlankErrorModel::Quadrature => (measured_std.powi(2) + blank_std.powi(2)).sqrt(),
        }
    }
}

/// Detector sensitivity curve: one factor per wavelength.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectorCorrection {
    points: Vec<(f64, f64)>,
}

impl DetectorCorrection {
    /// Build from `(wavelength_nm, factor)` pairs in any order.
    pub fn new(mut points: Vec<(f64, f64)>) -> Self {
        points.retain(|(wl, f)| wl.is_finite() && f.is_finite());
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { points }
    }

    /// `(wavelength_nm, factor)` pairs sorted by wavelength.
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// `(min, max)` wavelength covered.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        Some((self.points.first()?.0, self.points.last()?.0))
    }

    /// Linearly interpolated factor at `wavelength_nm`, `None` outside the
    /// covered range.
    pub fn factor_at(&self, wavelength_nm: f64) -> Option<f64> {
        let idx = self.points.partition_point(|(wl, _)| *wl < wavelength_nm);
        if let Some(&(wl, f)) = self.points.get(idx) {
            if (wl - wavelength_nm).abs() <= WAVELENGTH_MATCH_TOLERANCE {
                return Some(f);
            }
        }
        if idx > 0 {
            if let Some(&(wl, f)) = self.points.get(idx - 1) {
                if (wl - wavelength_nm).abs() <= WAVELENGTH_MATCH_TOLERANCE {
                    return Some(f);
                }
            }
        }
        if idx == 0 || idx >= self.points.len() {
            return None;
        }
        let (x0, y0) = self.points[idx - 1];
        let (x1, y1) = self.points[idx];
        Some(y0 + (y1 - y0) * (wavelength_nm - x0) / (x1 - x0))
    }
}

/// Optional correction inputs for one spectrum.
#[derive(Debug, Clone, Default)]
pub struct CorrectionSet {
    /// Detector sensitivity curve.
    pub detector: Option<DetectorCorrection>,
    /// Blank whose AC channel is subtracted.
    pub ac_blank: Option<Spectrum>,
    /// Blank whose DC channel is subtracted.
    pub dc_blank: Option<Spectrum>,
    /// Base reading subtracted from both channels.
    pub base_blank: Option<Spectrum>,
}

impl CorrectionSet {
    /// True if no correction input is present.
    pub fn is_empty(&self) -> bool {
        self.detector.is_none()
            && self.ac_blank.is_none()
            && self.dc_blank.is_none()
            && self.base_blank.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
enum Channels {
    Ac,
    Dc,
    Both,
}

/// Applies detector and blank corrections and recomputes derived channels.
#[derive(Debug, Clone)]
pub struct BaselineCorrector {
    formulas: DerivedFormulas,
    blank_error: BlankErrorModel,
}

impl BaselineCorrector {
    /// Corrector using the given derived formulas and blank error model.
    pub fn new(formulas: DerivedFormulas, blank_error: BlankErrorModel) -> Self {
        Self {
            formulas,
            blank_error,
        }
    }

    /// Formulas used for the final recomputation.
    pub fn formulas(&self) -> &DerivedFormulas {
        &self.formulas
    }

    /// Return a corrected copy of `spectrum`.
    pub fn correct(&self, spectrum: &Spectrum, corrections: &CorrectionSet) -> Spectrum {
        let mut out = spectrum.clone();
        let Some(bounds) = spectrum.wavelength_bounds() else {
            return out;
        };
        info!(points = spectrum.len(), "Baseline correction...");

        if let Some(detector) = &corrections.detector {
            if detector.bounds().is_some_and(|b| covers(b, bounds)) {
                self.apply_detector(&mut out, detector);
            } else {
                warn!("Detector correction file does not cover the measured wavelength range!");
            }
        }
        if let Some(blank) = &corrections.ac_blank {
            self.apply_blank(&mut out, blank, Channels::Ac, bounds, "AC blank");
        }
        if let Some(blank) = &corrections.dc_blank {
            self.apply_blank(&mut out, blank, Channels::Dc, bounds, "DC blank");
        }
        if let Some(blank) = &corrections.base_blank {
            self.apply_blank(&mut out, blank, Channels::Both, bounds, "Base reading blank");
        }

        let dropped = out.drop_nan_rows();
        if dropped > 0 {
            warn!(dropped, "Dropped rows without matching blank values");
        }
        self.formulas.recompute_all(&mut out);
        out
    }

    fn apply_detector(&self, spectrum: &mut Spectrum, detector: &DetectorCorrection) {
        for point in spectrum.points_mut() {
            let factor = detector.factor_at(point.wavelength_nm).unwrap_or(f64::NAN);
            point.dc = Measurement::new(point.dc.value / factor, point.dc.std / factor);
            point.ac = Measurement::new(point.ac.value / factor, point.ac.std / factor);
        }
    }

    fn apply_blank(
        &self,
        spectrum: &mut Spectrum,
        blank: &Spectrum,
        channels: Channels,
        bounds: (f64, f64),
        label: &str,
    ) {
        let covered = blank.wavelength_bounds().is_some_and(|b| covers(b, bounds));
        if !covered {
            warn!("{} correction file does not contain the measured wavelengths!", label);
            return;
        }
        info!("{} correction", label);

        let model = self.blank_error;
        let subtract = |m: Measurement, b: Measurement| {
            Measurement::new(m.value - b.value, model.combine(m.std, b.std))
        };
        let mut missing = 0usize;
        for point in spectrum.points_mut() {
            match blank.find(point.wavelength_nm, WAVELENGTH_MATCH_TOLERANCE) {
                Some(b) => match channels {
                    Channels::Ac => point.ac = subtract(point.ac, b.ac),
                    Channels::Dc => point.dc = subtract(point.dc, b.dc),
                    Channels::Both => {
                        point.ac = subtract(point.ac, b.ac);
                        point.dc = subtract(point.dc, b.dc);
                    }
                },
                None => {
                    missing += 1;
                    match channels {
                        Channels::Ac => point.ac = Measurement::nan(),
                        Channels::Dc => point.dc = Measurement::nan(),
                        Channels::Both => {
                            point.ac = Measurement::nan();
                            point.dc = Measurement::nan();
                        }
                    }
                }
            }
        }
        if missing > 0 {
            warn!(missing, "{} lacks values at measured wavelengths", label);
        }
    }
}

fn covers(correction: (f64, f64), measured: (f64, f64)) -> bool {
    correction.0 <= measured.0 + WAVELENGTH_MATCH_TOLERANCE
        && measured.1 <= correction.1 + WAVELENGTH_MATCH_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::SpectrumPoint;

    fn spectrum(points: &[(f64, f64, f64, f64, f64)]) -> Spectrum {
        let formulas = DerivedFormulas::default();
        points
            .iter()
            .map(|&(wl, dc, dc_std, ac, ac_std)| {
                formulas.point(wl, Measurement::new(dc, dc_std), Measurement::new(ac, ac_std))
            })
            .collect()
    }

    fn corrector() -> BaselineCorrector {
        BaselineCorrector::new(DerivedFormulas::default(), BlankErrorModel::Halved)
    }

    #[test]
    fn test_zero_blank_keeps_means() {
        let measured = spectrum(&[
            (500.0, 2.0, 0.1, 0.02, 0.004),
            (501.0, 2.1, 0.2, 0.03, 0.002),
            (502.0, 2.2, 0.1, 0.01, 0.001),
        ]);
        let blank = spectrum(&[
            (500.0, 0.0, 0.0, 0.0, 0.0),
            (501.0, 0.0, 0.0, 0.0, 0.0),
            (502.0, 0.0, 0.0, 0.0, 0.0),
        ]);
        let corrections = CorrectionSet {
            ac_blank: Some(blank.clone()),
            dc_blank: Some(blank),
            ..Default::default()
        };

        let out = corrector().correct(&measured, &corrections);
        assert_eq!(out.len(), measured.len());
        for (before, after) in measured.points().iter().zip(out.points()) {
            assert_eq!(before.dc.value, after.dc.value);
            assert_eq!(before.ac.value, after.ac.value);
            assert_eq!(before.cd.value, after.cd.value);
            assert_eq!(before.gabs.value, after.gabs.value);
            assert!(after.ac.std <= before.ac.std);
            assert!(after.dc.std <= before.dc.std);
        }
    }

    #[test]
    fn test_blank_subtraction_uses_halved_errors() {
        let measured = spectrum(&[(500.0, 2.0, 0.4, 0.5, 0.6)]);
        let blank = spectrum(&[(500.0, 0.5, 0.2, 0.1, 0.8)]);
        let corrections = CorrectionSet {
            base_blank: Some(blank),
            ..Default::default()
        };
        let out = corrector().correct(&measured, &corrections);
        let p = out.points()[0];
        assert!((p.dc.value - 1.5).abs() < 1e-12);
        assert!((p.ac.value - 0.4).abs() < 1e-12);
        assert!((p.dc.std - (0.04_f64 + 0.01).sqrt()).abs() < 1e-12);
        assert!((p.ac.std - (0.09_f64 + 0.16).sqrt()).abs() < 1e-12);
        assert!((p.i_l.value - 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_quadrature_model() {
        assert!((BlankErrorModel::Quadrature.combine(3.0, 4.0) - 5.0).abs() < 1e-12);
        assert!((BlankErrorModel::Halved.combine(3.0, 4.0) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_blank_missing_wavelength_drops_row() {
        let measured = spectrum(&[
            (500.0, 2.0, 0.1, 0.02, 0.0),
            (501.0, 2.0, 0.1, 0.02, 0.0),
            (502.0, 2.0, 0.1, 0.02, 0.0),
        ]);
        let blank = spectrum(&[
            (500.0, 0.1, 0.0, 0.0, 0.0),
            (502.0, 0.1, 0.0, 0.0, 0.0),
        ]);
        let corrections = CorrectionSet {
            dc_blank: Some(blank),
            ..Default::default()
        };
        let out = corrector().correct(&measured, &corrections);
        let wls: Vec<f64> = out.wavelengths().collect();
        assert_eq!(wls, vec![500.0, 502.0]);
    }

    #[test]
    fn test_uncovered_blank_is_skipped() {
        let measured = spectrum(&[(500.0, 2.0, 0.1, 0.02, 0.0), (510.0, 2.0, 0.1, 0.02, 0.0)]);
        let blank = spectrum(&[(500.0, 1.0, 0.0, 0.01, 0.0), (505.0, 1.0, 0.0, 0.01, 0.0)]);
        let corrections = CorrectionSet {
            ac_blank: Some(blank),
            ..Default::default()
        };
        let out = corrector().correct(&measured, &corrections);
        assert_eq!(out.len(), 2);
        assert_eq!(out.points()[0].ac.value, 0.02);
    }

    #[test]
    fn test_detector_factor_is_interpolated() {
        let detector = DetectorCorrection::new(vec![(510.0, 3.0), (500.0, 1.0)]);
        assert_eq!(detector.factor_at(500.0), Some(1.0));
        assert_eq!(detector.factor_at(505.0), Some(2.0));
        assert_eq!(detector.factor_at(510.0), Some(3.0));
        assert_eq!(detector.factor_at(511.0), None);

        let measured = spectrum(&[(505.0, 4.0, 0.2, 0.4, 0.02)]);
        let corrections = CorrectionSet {
            detector: Some(detector),
            ..Default::default()
        };
        let out = corrector().correct(&measured, &corrections);
        let p: SpectrumPoint = out.points()[0];
        assert!((p.dc.value - 2.0).abs() < 1e-12);
        assert!((p.dc.std - 0.1).abs() < 1e-12);
        assert!((p.ac.value - 0.2).abs() < 1e-12);
        assert!((p.ac.std - 0.01).abs() < 1e-12);
        // gabs is a ratio and is unaffected by a common factor
        assert!((p.gabs.value - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_correction_order_detector_before_blank() {
        let detector = DetectorCorrection::new(vec![(500.0, 2.0), (501.0, 2.0)]);
        let measured = spectrum(&[(500.0, 4.0, 0.0, 0.4, 0.0)]);
        let blank = spectrum(&[(500.0, 1.0, 0.0, 0.1, 0.0)]);
        let corrections = CorrectionSet {
            detector: Some(detector),
            dc_blank: Some(blank),
            ..Default::default()
        };
        let out = corrector().correct(&measured, &corrections);
        // (4 / 2) - 1
        assert!((out.points()[0].dc.value - 1.0).abs() < 1e-12);
    }
}
