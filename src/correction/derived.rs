//! Derived optical quantities and their Gaussian error propagation.
//!
//! All derived channels are functions of DC and AC only, with AC_std and
//! DC_std treated as independent inputs:
//!
//! | channel | value | std |
//! |---------|-------|-----|
//! | I_L | AC + DC | sqrt(AC_std² + DC_std²) |
//! | I_R | DC − AC | sqrt(AC_std² + DC_std²) |
//! | gabs | (I_L − I_R)/(I_L + I_R) | partial derivatives in I_L, I_R |
//! | ellip | AC/DC | quotient rule |
//! | m_ellip | ellip/(l·c) | ellip_std/(l·c) |
//! | CD | k·AC/(DC·l·c) | quotient rule |

use crate::spectrum::{Measurement, SampleParameters, Spectrum, SpectrumPoint};
use serde::{Deserialize, Serialize};

/// Instrument constant relating AC/DC to CD in mdeg.
pub const CD_CONSTANT: f64 = 3298.2;

/// Which dissymmetry formula is authoritative.
///
/// `HistoricalDifference` divides by `(I_L − I_R)` and therefore yields 1
/// wherever it is defined. It exists only to reproduce data written by the
/// old controller and must be selected explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GabsFormula {
    /// `(I_L − I_R)/(I_L + I_R)`.
    #[default]
    Sum,
    /// `(I_L − I_R)/(I_L − I_R)`.
    HistoricalDifference,
}

/// Parameters needed to recompute derived channels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedFormulas {
    /// CD instrument constant `k`.
    pub cd_constant: f64,
    /// Dissymmetry formula.
    pub gabs: GabsFormula,
    /// Sample geometry. Without it CD uses `l·c = 1` and molar ellipticity
    /// is NaN.
    pub sample: Option<SampleParameters>,
}

impl Default for DerivedFormulas {
    fn default() -> Self {
        Self {
            cd_constant: CD_CONSTANT,
            gabs: GabsFormula::Sum,
            sample: None,
        }
    }
}

impl DerivedFormulas {
    /// Same formulas for a different sample.
    pub fn with_sample(mut self, sample: Option<SampleParameters>) -> Self {
        self.sample = sample;
        self
    }

    /// Overwrite every derived channel of `point` from its DC and AC.
    pub fn recompute(&self, point: &mut SpectrumPoint) {
        let dc = point.dc.value;
        let dc_std = point.dc.std;
        let ac = point.ac.value;
        let ac_std = point.ac.std;

        let i_l = ac + dc;
        let i_r = dc - ac;
        let i_std = (ac_std.powi(2) + dc_std.powi(2)).sqrt();
        point.i_l = Measurement::new(i_l, i_std);
        point.i_r = Measurement::new(i_r, i_std);

        let gabs = match self.gabs {
            GabsFormula::Sum => (i_l - i_r) / (i_l + i_r),
            GabsFormula::HistoricalDifference => (i_l - i_r) / (i_l - i_r),
        };
        let denom = (i_l + i_r).powi(2);
        let d_il = 2.0 * i_r / denom;
        let d_ir = -2.0 * i_l / denom;
        let gabs_std = ((d_il * i_std).powi(2) + (d_ir * i_std).powi(2)).sqrt();
        point.gabs = Measurement::new(gabs, gabs_std);

        let ellip = ac / dc;
        let ellip_std = ((ac_std / dc).powi(2) + (ac / dc.powi(2) * dc_std).powi(2)).sqrt();
        point.ellip = Measurement::new(ellip, ellip_std);

        point.m_ellip = match self.sample {
            Some(sample) => {
                let f = sample.factor();
                Measurement::new(ellip / f, ellip_std / f)
            }
            None => Measurement::nan(),
        };

        let f = self.sample.map_or(1.0, |s| s.factor());
        let k = self.cd_constant;
        let cd = k * ac / (dc * f);
        let cd_std = ((k / (dc * f) * ac_std).powi(2)
            + (-k * ac / (dc.powi(2) * f) * dc_std).powi(2))
        .sqrt();
        point.cd = Measurement::new(cd, cd_std);
    }

    /// Recompute every point of `spectrum`.
    pub fn recompute_all(&self, spectrum: &mut Spectrum) {
        for point in spectrum.points_mut() {
            self.recompute(point);
        }
    }

    /// Build a fully derived point from primary channels.
    pub fn point(&self, wavelength_nm: f64, dc: Measurement, ac: Measurement) -> SpectrumPoint {
        let mut point = SpectrumPoint::from_primary(wavelength_nm, dc, ac);
        self.recompute(&mut point);
        point
    }
}
