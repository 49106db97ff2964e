//! Sweep progress and remaining-time estimate.

use serde::Serialize;

/// Position of a running sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepProgress {
    /// First wavelength.
    pub start_nm: f64,
    /// Configured end wavelength.
    pub end_nm: f64,
    /// Wavelength just processed.
    pub current_nm: f64,
    /// Current repetition, 1-based.
    pub current_rep: u32,
    /// Total repetitions.
    pub total_reps: u32,
    /// Seconds since the sweep started.
    pub elapsed_seconds: f64,
}

impl SweepProgress {
    /// Progress through the current repetition in percent.
    pub fn percent(&self) -> f64 {
        let span = (self.end_nm - self.start_nm).abs();
        if span == 0.0 {
            return 0.0;
        }
        100.0 * (1.0 - (self.end_nm - self.current_nm).abs() / span)
    }

    /// Estimated seconds until the whole sweep is done, `None` before the
    /// first point of the first repetition.
    pub fn remaining_seconds(&self) -> Option<f64> {
        let pct = self.percent();
        if pct <= 0.0 && self.current_rep <= 1 {
            return None;
        }
        let done = pct + 100.0 * f64::from(self.current_rep.saturating_sub(1));
        if done <= 0.0 {
            return None;
        }
        let total = f64::from(self.total_reps) * 100.0;
        Some(((total / done) - 1.0) * self.elapsed_seconds)
    }

    /// Tooltip-style summary, e.g. `42.0 % (1/3), ca. 2.5 min`.
    pub fn summary(&self) -> String {
        format!(
            "{:.1} % ({}/{}), ca. {}",
            self.percent(),
            self.current_rep,
            self.total_reps,
            format_remaining(self.remaining_seconds().unwrap_or(0.0))
        )
    }
}

/// Render a duration in s, min or h with one decimal.
pub fn format_remaining(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1} s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.1} min", seconds / 60.0)
    } else {
        format!("{:.1} h", seconds / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(current_nm: f64, rep: u32, total: u32, elapsed: f64) -> SweepProgress {
        SweepProgress {
            start_nm: 400.0,
            end_nm: 500.0,
            current_nm,
            current_rep: rep,
            total_reps: total,
            elapsed_seconds: elapsed,
        }
    }

    #[test]
    fn test_percent_both_directions() {
        assert!((progress(450.0, 1, 1, 0.0).percent() - 50.0).abs() < 1e-9);
        let down = SweepProgress {
            start_nm: 500.0,
            end_nm: 400.0,
            current_nm: 475.0,
            current_rep: 1,
            total_reps: 1,
            elapsed_seconds: 0.0,
        };
        assert!((down.percent() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_remaining_time() {
        // halfway through rep 1 of 2 after 10 s: 4x the work, 3 parts left
        let p = progress(450.0, 1, 2, 10.0);
        assert!((p.remaining_seconds().unwrap() - 30.0).abs() < 1e-9);

        assert!(progress(400.0, 1, 2, 1.0).remaining_seconds().is_none());
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_remaining(12.34), "12.3 s");
        assert_eq!(format_remaining(150.0), "2.5 min");
        assert_eq!(format_remaining(5400.0), "1.5 h");
        assert_eq!(progress(450.0, 1, 2, 10.0).summary(), "50.0 % (1/2), ca. 30.0 s");
    }
}
