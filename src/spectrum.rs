//! Spectrum data model.
//!
//! A [`SpectrumPoint`] carries the two measured channels (DC and AC) and the
//! optical quantities derived from them, each as a value with its standard
//! deviation. Derived channels are always recomputed from DC/AC through
//! [`DerivedFormulas`](crate::correction::DerivedFormulas), never averaged or
//! subtracted on their own.

use serde::{Deserialize, Serialize};

/// A value with its standard deviation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Measurement {
    /// Mean value.
    pub value: f64,
    /// Standard deviation.
    pub std: f64,
}

impl Measurement {
    /// Value with standard deviation.
    pub const fn new(value: f64, std: f64) -> Self {
        Self { value, std }
    }

    /// Value without uncertainty.
    pub const fn exact(value: f64) -> Self {
        Self { value, std: 0.0 }
    }

    /// Not-a-number marker used for rows that could not be corrected.
    pub const fn nan() -> Self {
        Self {
            value: f64::NAN,
            std: f64::NAN,
        }
    }

    /// True if either component is NaN.
    pub fn is_nan(&self) -> bool {
        self.value.is_nan() || self.std.is_nan()
    }
}

/// Sample geometry used by CD and molar ellipticity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleParameters {
    /// Optical path length in cm.
    pub path_length_cm: f64,
    /// Sample concentration in mol/L.
    pub concentration: f64,
}

impl SampleParameters {
    /// `path_length × concentration`.
    pub fn factor(&self) -> f64 {
        self.path_length_cm * self.concentration
    }
}

/// One wavelength step of a spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumPoint {
    /// Wavelength in nm.
    pub wavelength_nm: f64,
    /// Total intensity.
    pub dc: Measurement,
    /// Modulation-synchronous intensity.
    pub ac: Measurement,
    /// Circular dichroism.
    pub cd: Measurement,
    /// Left circularly polarized intensity.
    pub i_l: Measurement,
    /// Right circularly polarized intensity.
    pub i_r: Measurement,
    /// Dissymmetry factor.
    pub gabs: Measurement,
    /// Molar ellipticity. NaN when no sample parameters were given.
    pub m_ellip: Measurement,
    /// Ellipticity.
    pub ellip: Measurement,
    /// Linear polarization diagnostic reported by the lock-in, if any.
    pub lp_theta_std: Option<f64>,
}

impl SpectrumPoint {
    /// Point holding only primary channels; derived channels are NaN until
    /// recomputed.
    pub fn from_primary(wavelength_nm: f64, dc: Measurement, ac: Measurement) -> Self {
        Self {
            wavelength_nm,
            dc,
            ac,
            cd: Measurement::nan(),
            i_l: Measurement::nan(),
            i_r: Measurement::nan(),
            gabs: Measurement::nan(),
            m_ellip: Measurement::nan(),
            ellip: Measurement::nan(),
            lp_theta_std: None,
        }
    }

    /// Attach the linear polarization diagnostic.
    pub fn with_lp_theta_std(mut self, lp_theta_std: Option<f64>) -> Self {
        self.lp_theta_std = lp_theta_std;
        self
    }

    /// True if the wavelength or a primary channel is NaN.
    pub fn has_nan_primary(&self) -> bool {
        self.wavelength_nm.is_nan() || self.dc.is_nan() || self.ac.is_nan()
    }
}

/// Ordered points of one sweep repetition (or a derived result).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spectrum {
    points: Vec<SpectrumPoint>,
}

impl Spectrum {
    /// Empty spectrum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spectrum from points in acquisition order.
    pub fn from_points(points: Vec<SpectrumPoint>) -> Self {
        Self { points }
    }

    /// Append a point.
    pub fn push(&mut self, point: SpectrumPoint) {
        self.points.push(point);
    }

    /// Points in order.
    pub fn points(&self) -> &[SpectrumPoint] {
        &self.points
    }

    /// Mutable access for in-place correction.
    pub fn points_mut(&mut self) -> &mut [SpectrumPoint] {
        &mut self.points
    }

    /// Consume into the point vector.
    pub fn into_points(self) -> Vec<SpectrumPoint> {
        self.points
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True if there are no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Wavelengths in order.
    pub fn wavelengths(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|p| p.wavelength_nm)
    }

    /// `(min, max)` wavelength, `None` if empty.
    pub fn wavelength_bounds(&self) -> Option<(f64, f64)> {
        let first = self.points.first()?.wavelength_nm;
        let last = self.points.last()?.wavelength_nm;
        Some((first.min(last), first.max(last)))
    }

    /// Point measured at exactly `wavelength_nm`, within `tolerance`.
    pub fn find(&self, wavelength_nm: f64, tolerance: f64) -> Option<&SpectrumPoint> {
        self.points
            .iter()
            .find(|p| (p.wavelength_nm - wavelength_nm).abs() <= tolerance)
    }

    /// Drop points whose wavelength or primary channels are NaN.
    pub fn drop_nan_rows(&mut self) -> usize {
        let before = self.points.len();
        self.points.retain(|p| !p.has_nan_primary());
        before - self.points.len()
    }
}

impl FromIterator<SpectrumPoint> for Spectrum {
    fn from_iter<I: IntoIterator<Item = SpectrumPoint>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}
