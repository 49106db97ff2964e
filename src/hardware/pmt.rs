//! Photomultiplier gain curve and modulator Bessel corrections.

use serde::{Deserialize, Serialize};

/// Exponential PMT gain curve `gain = 10^(volt·slope + offset) / gain_norm`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PmtCalibration {
    /// Slope of log10 gain over control voltage.
    #[serde(default = "default_slope")]
    pub slope: f64,
    /// Offset of log10 gain.
    #[serde(default = "default_offset")]
    pub offset: f64,
    /// Gain at the maximum control voltage.
    #[serde(default = "default_max_gain")]
    pub max_gain: f64,
    /// Normalisation so that gain 1 is the lowest usable gain.
    #[serde(default = "default_gain_norm")]
    pub gain_norm: f64,
    /// Maximum control voltage.
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
}

fn default_slope() -> f64 {
    4.913
}

fn default_offset() -> f64 {
    1.222
}

fn default_max_gain() -> f64 {
    885.6
}

fn default_gain_norm() -> f64 {
    4775.0
}

fn default_max_voltage() -> f64 {
    1.1
}

impl Default for PmtCalibration {
    fn default() -> Self {
        Self {
            slope: default_slope(),
            offset: default_offset(),
            max_gain: default_max_gain(),
            gain_norm: default_gain_norm(),
            max_voltage: default_max_voltage(),
        }
    }
}

impl PmtCalibration {
    /// Relative gain at control voltage `volt`.
    pub fn volt_to_gain(&self, volt: f64) -> f64 {
        10f64.powf(volt * self.slope + self.offset) / self.gain_norm
    }

    /// Control voltage for relative `gain`, clamped to `[0, max_voltage]`.
    pub fn gain_to_volt(&self, gain: f64) -> f64 {
        if gain < 1.0 {
            0.0
        } else if gain >= self.max_gain {
            self.max_voltage
        } else {
            ((gain * self.gain_norm).log10() - self.offset) / self.slope
        }
        .clamp(0.0, self.max_voltage)
    }
}

/// Bessel function of the first kind `J_n(x)` by power series.
///
/// Accurate to machine precision for the small arguments (|x| < 5) used for
/// modulator retardations.
pub fn bessel_j(n: u32, x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = half.powi(n as i32) / factorial(n);
    let mut sum = term;
    for m in 1..60u32 {
        term *= -half * half / (f64::from(m) * f64::from(m + n));
        sum += term;
        if term.abs() < 1e-17 * sum.abs() {
            break;
        }
    }
    sum
}

fn factorial(n: u32) -> f64 {
    (1..=n).map(f64::from).product()
}

/// Correction factors for the sinusoidal modulation at `retardation`
/// (in waves): `1/(2·J1(2π·r))` and `1/(2·J2(2π·r))`.
pub fn bessel_corrections(retardation: f64) -> (f64, f64) {
    let x = retardation * 2.0 * std::f64::consts::PI;
    (1.0 / (2.0 * bessel_j(1, x)), 1.0 / (2.0 * bessel_j(2, x)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_limits() {
        let pmt = PmtCalibration::default();
        assert_eq!(pmt.gain_to_volt(0.5), 0.0);
        assert_eq!(pmt.gain_to_volt(885.6), 1.1);
        assert_eq!(pmt.gain_to_volt(10_000.0), 1.1);
    }

    #[test]
    fn test_gain_volt_inverse() {
        let pmt = PmtCalibration::default();
        for volt in [0.6, 0.8, 1.0] {
            let gain = pmt.volt_to_gain(volt);
            assert!((pmt.gain_to_volt(gain) - volt).abs() < 1e-9);
        }
    }

    #[test]
    fn test_bessel_reference_values() {
        assert!((bessel_j(0, 0.0) - 1.0).abs() < 1e-15);
        assert!((bessel_j(1, 1.0) - 0.440_050_585_744_933_5).abs() < 1e-12);
        assert!((bessel_j(2, 1.0) - 0.114_903_484_931_900_5).abs() < 1e-12);
    }

    #[test]
    fn test_quarter_wave_corrections() {
        let (corr, corr_lp) = bessel_corrections(0.25);
        // J1(pi/2) = 0.566824..., J2(pi/2) = 0.249701...
        assert!((corr - 1.0 / (2.0 * 0.566_824_088_97)).abs() < 1e-6);
        assert!((corr_lp - 1.0 / (2.0 * 0.249_701_629_14)).abs() < 1e-5);
    }
}
