//! Immutable description of one sweep.

use crate::error::ValidationError;
use crate::spectrum::SampleParameters;
use serde::{Deserialize, Serialize};

/// Characters that may not appear in an output name.
pub const ILLEGAL_NAME_CHARS: &str = "#@$%^&*{}:;\"|<>/?\\`~'";

/// Parameters of a wavelength sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    /// First wavelength in nm.
    pub start_nm: f64,
    /// Last wavelength in nm. The sweep runs downwards if below `start_nm`.
    pub end_nm: f64,
    /// Step size in nm, always positive.
    pub step_nm: f64,
    /// Integration time per point in seconds.
    pub dwell_time_s: f64,
    /// Number of repetitions.
    pub repetitions: u32,
    /// Output name stem.
    pub name: String,
    /// Free-text comment stored with the parameters.
    #[serde(default)]
    pub comment: String,
    /// Spectrum whose AC channel is subtracted.
    #[serde(default)]
    pub ac_blank: Option<String>,
    /// Spectrum whose DC channel is subtracted.
    #[serde(default)]
    pub dc_blank: Option<String>,
    /// Base reading subtracted from AC and DC.
    #[serde(default)]
    pub base_blank: Option<String>,
    /// Detector sensitivity curve.
    #[serde(default)]
    pub detector_correction: Option<String>,
    /// Keep the modulator off (AC background measurement).
    #[serde(default)]
    pub modulator_off: bool,
    /// Sample geometry for CD and molar ellipticity.
    #[serde(default)]
    pub sample: Option<SampleParameters>,
}

impl AcquisitionRequest {
    /// Request with no corrections, comment or sample parameters.
    pub fn new(
        start_nm: f64,
        end_nm: f64,
        step_nm: f64,
        dwell_time_s: f64,
        repetitions: u32,
        name: impl Into<String>,
    ) -> Self {
        Self {
            start_nm,
            end_nm,
            step_nm,
            dwell_time_s,
            repetitions,
            name: name.into(),
            comment: String::new(),
            ac_blank: None,
            dc_blank: None,
            base_blank: None,
            detector_correction: None,
            modulator_off: false,
            sample: None,
        }
    }

    /// Set the comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Set the AC blank.
    pub fn with_ac_blank(mut self, name: impl Into<String>) -> Self {
        self.ac_blank = Some(name.into());
        self
    }

    /// Set the DC blank.
    pub fn with_dc_blank(mut self, name: impl Into<String>) -> Self {
        self.dc_blank = Some(name.into());
        self
    }

    /// Set the base reading blank.
    pub fn with_base_blank(mut self, name: impl Into<String>) -> Self {
        self.base_blank = Some(name.into());
        self
    }

    /// Set the detector correction.
    pub fn with_detector_correction(mut self, name: impl Into<String>) -> Self {
        self.detector_correction = Some(name.into());
        self
    }

    /// Turn the modulator off for the sweep.
    pub fn with_modulator_off(mut self, off: bool) -> Self {
        self.modulator_off = off;
        self
    }

    /// Set the sample geometry.
    pub fn with_sample(mut self, sample: SampleParameters) -> Self {
        self.sample = Some(sample);
        self
    }

    /// `+1.0` for increasing wavelength, `-1.0` for decreasing.
    pub fn direction(&self) -> f64 {
        if self.end_nm < self.start_nm {
            -1.0
        } else {
            1.0
        }
    }

    /// True if any correction input is referenced.
    pub fn has_corrections(&self) -> bool {
        self.ac_blank.is_some()
            || self.dc_blank.is_some()
            || self.base_blank.is_some()
            || self.detector_correction.is_some()
    }

    /// Name of the raw file for `repetition` (0-based).
    pub fn repetition_name(&self, repetition: u32) -> String {
        if self.repetitions > 1 {
            format!("{}_{}", self.name, repetition + 1)
        } else {
            self.name.clone()
        }
    }

    /// Name whose existence blocks the sweep.
    pub fn first_output_name(&self) -> String {
        self.repetition_name(0)
    }

    /// Check values that do not depend on the file system.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("start wavelength", self.start_nm),
            ("end wavelength", self.end_nm),
            ("step", self.step_nm),
            ("dwell time", self.dwell_time_s),
        ] {
            if !value.is_finite() {
                return Err(ValidationError::NotFinite { field });
            }
        }
        if self.step_nm <= 0.0 {
            return Err(ValidationError::NonPositive {
                field: "step",
                value: self.step_nm,
            });
        }
        if self.dwell_time_s <= 0.0 {
            return Err(ValidationError::NonPositive {
                field: "dwell time",
                value: self.dwell_time_s,
            });
        }
        if self.start_nm == self.end_nm {
            return Err(ValidationError::DegenerateRange(self.start_nm));
        }
        if self.repetitions == 0 {
            return Err(ValidationError::NoRepetitions);
        }
        if let Some(sample) = &self.sample {
            if !(sample.factor() > 0.0 && sample.factor().is_finite()) {
                return Err(ValidationError::NonPositive {
                    field: "path length x concentration",
                    value: sample.factor(),
                });
            }
        }
        validate_name(&self.name)
    }

    /// Full validation: [`validate`](Self::validate) plus output and
    /// correction file checks, with `exists` answering whether a named
    /// spectrum is present.
    pub fn validate_with(&self, exists: impl Fn(&str) -> bool) -> Result<(), ValidationError> {
        self.validate()?;

        for (role, file) in [
            ("AC blank", &self.ac_blank),
            ("DC blank", &self.dc_blank),
            ("Base reading blank", &self.base_blank),
            ("Detector correction", &self.detector_correction),
        ] {
            if let Some(name) = file {
                if !exists(name) {
                    return Err(ValidationError::MissingFile {
                        role,
                        name: name.clone(),
                    });
                }
            }
        }

        let output = self.first_output_name();
        if exists(&output) {
            return Err(ValidationError::OutputExists(output));
        }
        Ok(())
    }
}

/// Reject empty names and names with characters from
/// [`ILLEGAL_NAME_CHARS`].
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if let Some(character) = name.chars().find(|c| ILLEGAL_NAME_CHARS.contains(*c)) {
        return Err(ValidationError::IllegalCharacter {
            name: name.to_string(),
            character,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AcquisitionRequest {
        AcquisitionRequest::new(400.0, 500.0, 1.0, 0.5, 1, "sample")
    }

    #[test]
    fn test_valid_request() {
        assert!(request().validate().is_ok());
        assert_eq!(request().direction(), 1.0);
        let down = AcquisitionRequest::new(500.0, 400.0, 1.0, 0.5, 1, "down");
        assert_eq!(down.direction(), -1.0);
    }

    #[test]
    fn test_degenerate_range_rejected() {
        let req = AcquisitionRequest::new(450.0, 450.0, 1.0, 0.5, 1, "flat");
        assert_eq!(req.validate(), Err(ValidationError::DegenerateRange(450.0)));
    }

    #[test]
    fn test_numeric_checks() {
        let mut req = request();
        req.step_nm = 0.0;
        assert!(matches!(
            req.validate(),
            Err(ValidationError::NonPositive { field: "step", .. })
        ));

        let mut req = request();
        req.dwell_time_s = f64::NAN;
        assert!(matches!(
            req.validate(),
            Err(ValidationError::NotFinite { field: "dwell time" })
        ));

        let mut req = request();
        req.repetitions = 0;
        assert_eq!(req.validate(), Err(ValidationError::NoRepetitions));
    }

    #[test]
    fn test_illegal_characters() {
        for bad in ["a/b", "what?", "x'y", "tab`", "semi;colon"] {
            let req = AcquisitionRequest::new(400.0, 500.0, 1.0, 0.5, 1, bad);
            assert!(
                matches!(req.validate(), Err(ValidationError::IllegalCharacter { .. })),
                "{bad} should be rejected"
            );
        }
        let req = AcquisitionRequest::new(400.0, 500.0, 1.0, 0.5, 1, "  ");
        assert_eq!(req.validate(), Err(ValidationError::EmptyName));
    }

    #[test]
    fn test_missing_correction_file() {
        let req = request().with_dc_blank("solvent");
        let err = req.validate_with(|name| name == "other").unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingFile {
                role: "DC blank",
                name: "solvent".to_string()
            }
        );
        assert!(req.validate_with(|name| name == "solvent").is_ok());
    }

    #[test]
    fn test_output_exists_checks_first_repetition() {
        let single = request();
        assert_eq!(
            single.validate_with(|name| name == "sample"),
            Err(ValidationError::OutputExists("sample".to_string()))
        );

        let mut multi = request();
        multi.repetitions = 3;
        assert!(multi.validate_with(|name| name == "sample").is_ok());
        assert_eq!(
            multi.validate_with(|name| name == "sample_1"),
            Err(ValidationError::OutputExists("sample_1".to_string()))
        );
    }

    #[test]
    fn test_repetition_names() {
        let mut req = request();
        assert_eq!(req.repetition_name(0), "sample");
        req.repetitions = 2;
        assert_eq!(req.repetition_name(1), "sample_2");
    }
}
