//! Running average over the repetitions of a sweep.
//!
//! Only DC and AC are averaged. Derived channels are recomputed from the
//! updated means after every ingest.

use crate::correction::DerivedFormulas;
use crate::spectrum::{Measurement, Spectrum, SpectrumPoint};
use tracing::debug;

#[derive(Debug, Clone)]
struct Row {
    point: SpectrumPoint,
    dc_var_sum: f64,
    ac_var_sum: f64,
    count: u32,
}

/// Incrementally averaged spectrum keyed by wavelength.
#[derive(Debug, Clone)]
pub struct Accumulator {
    rows: Vec<Row>,
    formulas: DerivedFormulas,
}

impl Accumulator {
    /// Empty accumulator.
    pub fn new(formulas: DerivedFormulas) -> Self {
        Self {
            rows: Vec::new(),
            formulas,
        }
    }

    /// Add `point` from repetition `repetition_index` (0-based).
    ///
    /// Repetition 0 creates rows. Later repetitions update the row with the
    /// exactly equal wavelength: `mean = (mean·r + new)/(r + 1)` and
    /// `std = sqrt(Σ std_i²)/(r + 1)`. A point without a matching row is
    /// dropped and `false` is returned.
    pub fn ingest(&mut self, point: &SpectrumPoint, repetition_index: u32) -> bool {
        if repetition_index == 0 {
            let mut point = *point;
            self.formulas.recompute(&mut point);
            self.rows.push(Row {
                point,
                dc_var_sum: point.dc.std.powi(2),
                ac_var_sum: point.ac.std.powi(2),
                count: 1,
            });
            return true;
        }

        let Some(row) = self
            .rows
            .iter_mut()
            .find(|row| row.point.wavelength_nm == point.wavelength_nm)
        else {
            debug!(
                wavelength_nm = point.wavelength_nm,
                repetition_index, "No averaged row for wavelength, point dropped"
            );
            return false;
        };

        let r = f64::from(repetition_index);
        let n = r + 1.0;
        row.dc_var_sum += point.dc.std.powi(2);
        row.ac_var_sum += point.ac.std.powi(2);
        row.point.dc = Measurement::new(
            (row.point.dc.value * r + point.dc.value) / n,
            row.dc_var_sum.sqrt() / n,
        );
        row.point.ac = Measurement::new(
            (row.point.ac.value * r + point.ac.value) / n,
            row.ac_var_sum.sqrt() / n,
        );
        row.point.lp_theta_std = match (row.point.lp_theta_std, point.lp_theta_std) {
            (Some(mean), Some(new)) => Some((mean * r + new) / n),
            (mean, new) => mean.or(new),
        };
        row.count += 1;
        self.formulas.recompute(&mut row.point);
        true
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if nothing was ingested.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Repetitions that contributed to the row at `wavelength_nm`.
    pub fn count_at(&self, wavelength_nm: f64) -> Option<u32> {
        self.rows
            .iter()
            .find(|row| row.point.wavelength_nm == wavelength_nm)
            .map(|row| row.count)
    }

    /// Owned copy of the current averaged spectrum.
    pub fn snapshot(&self) -> Spectrum {
        self.rows.iter().map(|row| row.point).collect()
    }
}

/// Average complete repetitions point by point.
///
/// Points are aligned by exact wavelength with the first spectrum; a
/// wavelength missing from any repetition is left out. DC and AC become
/// `Σ v_i/n` with `sqrt(Σ (std_i/n)²)`, derived channels are recomputed.
pub fn average_spectra(spectra: &[Spectrum], formulas: &DerivedFormulas) -> Spectrum {
    let Some(first) = spectra.first() else {
        return Spectrum::new();
    };
    let n = spectra.len() as f64;

    first
        .points()
        .iter()
        .filter_map(|reference| {
            let wl = reference.wavelength_nm;
            let mut dc = Measurement::default();
            let mut ac = Measurement::default();
            for spectrum in spectra {
                let point = spectrum.points().iter().find(|p| p.wavelength_nm == wl)?;
                dc.value += point.dc.value / n;
                dc.std += (point.dc.std / n).powi(2);
                ac.value += point.ac.value / n;
                ac.std += (point.ac.std / n).powi(2);
            }
            dc.std = dc.std.sqrt();
            ac.std = ac.std.sqrt();
            Some(formulas.point(wl, dc, ac))
        })
        .collect()
}
