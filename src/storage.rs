//! Spectrum and parameter persistence.
//!
//! Spectra are CSV files with a `WL` index column followed by one value and
//! one `_std` column per channel. Every saved spectrum gets a
//! `<name>_params.txt` parameter record (one `key = "value"` line per
//! setting, TOML encoded). The same record format holds the last-used
//! settings.

use crate::acquisition::AcquisitionRequest;
use crate::correction::{CorrectionSet, DetectorCorrection};
use crate::error::{AppResult, CplError};
use crate::spectrum::{Measurement, SampleParameters, Spectrum, SpectrumPoint};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct SpectrumRow {
    #[serde(rename = "WL")]
    wl: f64,
    #[serde(rename = "DC")]
    dc: f64,
    #[serde(rename = "DC_std")]
    dc_std: f64,
    #[serde(rename = "AC")]
    ac: f64,
    #[serde(rename = "AC_std")]
    ac_std: f64,
    #[serde(rename = "CD", default)]
    cd: Option<f64>,
    #[serde(rename = "CD_std", default)]
    cd_std: Option<f64>,
    #[serde(rename = "I_L", default)]
    i_l: Option<f64>,
    #[serde(rename = "I_L_std", default)]
    i_l_std: Option<f64>,
    #[serde(rename = "I_R", default)]
    i_r: Option<f64>,
    #[serde(rename = "I_R_std", default)]
    i_r_std: Option<f64>,
    #[serde(default)]
    gabs: Option<f64>,
    #[serde(default)]
    gabs_std: Option<f64>,
    #[serde(default)]
    m_ellip: Option<f64>,
    #[serde(default)]
    m_ellip_std: Option<f64>,
    #[serde(default)]
    ellip: Option<f64>,
    #[serde(default)]
    ellip_std: Option<f64>,
    #[serde(default)]
    lp_theta_std: Option<f64>,
}

fn pair(value: Option<f64>, std: Option<f64>) -> Measurement {
    Measurement::new(value.unwrap_or(f64::NAN), std.unwrap_or(f64::NAN))
}

impl From<&SpectrumPoint> for SpectrumRow {
    fn from(p: &SpectrumPoint) -> Self {
        Self {
            wl: p.wavelength_nm,
            dc: p.dc.value,
            dc_std: p.dc.std,
            ac: p.ac.value,
            ac_std: p.ac.std,
            cd: Some(p.cd.value),
            cd_std: Some(p.cd.std),
            i_l: Some(p.i_l.value),
            i_l_std: Some(p.i_l.std),
            i_r: Some(p.i_r.value),
            i_r_std: Some(p.i_r.std),
            gabs: Some(p.gabs.value),
            gabs_std: Some(p.gabs.std),
            m_ellip: Some(p.m_ellip.value),
            m_ellip_std: Some(p.m_ellip.std),
            ellip: Some(p.ellip.value),
            ellip_std: Some(p.ellip.std),
            lp_theta_std: p.lp_theta_std,
        }
    }
}

impl From<SpectrumRow> for SpectrumPoint {
    fn from(row: SpectrumRow) -> Self {
        SpectrumPoint {
            wavelength_nm: row.wl,
            dc: Measurement::new(row.dc, row.dc_std),
            ac: Measurement::new(row.ac, row.ac_std),
            cd: pair(row.cd, row.cd_std),
            i_l: pair(row.i_l, row.i_l_std),
            i_r: pair(row.i_r, row.i_r_std),
            gabs: pair(row.gabs, row.gabs_std),
            m_ellip: pair(row.m_ellip, row.m_ellip_std),
            ellip: pair(row.ellip, row.ellip_std),
            lp_theta_std: row.lp_theta_std,
        }
    }
}

/// Directory of named spectra.
#[derive(Debug, Clone)]
pub struct SpectrumStore {
    dir: PathBuf,
}

impl SpectrumStore {
    /// Store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of spectrum `name`.
    pub fn spectrum_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", name))
    }

    /// Path of the parameter record saved with spectrum `name`.
    pub fn params_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_params.txt", name))
    }

    /// Whether spectrum `name` exists.
    pub fn exists(&self, name: &str) -> bool {
        self.spectrum_path(name).is_file()
    }

    /// Write `spectrum` as `<name>.csv`.
    pub fn save_spectrum(&self, name: &str, spectrum: &Spectrum) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.spectrum_path(name);
        let mut writer = csv::Writer::from_writer(File::create(&path)?);
        for point in spectrum.points() {
            writer.serialize(SpectrumRow::from(point))?;
        }
        writer.flush()?;
        info!(path = %path.display(), "Data saved as: {}", path.display());
        Ok(path)
    }

    /// Read spectrum `name`.
    ///
    /// Only `WL`, `DC`, `DC_std`, `AC` and `AC_std` are required; missing
    /// derived columns load as NaN.
    pub fn load_spectrum(&self, name: &str) -> AppResult<Spectrum> {
        let mut reader = csv::Reader::from_path(self.spectrum_path(name))?;
        let mut points = Vec::new();
        for row in reader.deserialize::<SpectrumRow>() {
            points.push(SpectrumPoint::from(row?));
        }
        Ok(Spectrum::from_points(points))
    }

    /// Write a detector correction curve as `WL,factor`.
    pub fn save_detector_correction(
        &self,
        name: &str,
        correction: &DetectorCorrection,
    ) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.spectrum_path(name);
        let mut writer = csv::Writer::from_writer(File::create(&path)?);
        writer.write_record(["WL", "factor"])?;
        for (wl, factor) in correction.points() {
            writer.write_record([wl.to_string(), factor.to_string()])?;
        }
        writer.flush()?;
        Ok(path)
    }

    /// Read a detector correction: `WL` column plus one factor column.
    pub fn load_detector_correction(&self, name: &str) -> AppResult<DetectorCorrection> {
        let mut reader = csv::Reader::from_path(self.spectrum_path(name))?;
        let headers = reader.headers()?.clone();
        if headers.get(0) != Some("WL") || headers.len() < 2 {
            return Err(CplError::Processing(format!(
                "detector correction '{}' must start with a WL column and one factor column",
                name
            )));
        }
        let mut points = Vec::new();
        for record in reader.records() {
            let record = record?;
            let parse = |idx: usize| -> AppResult<f64> {
                record
                    .get(idx)
                    .unwrap_or_default()
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| {
                        CplError::Processing(format!("detector correction '{}': {}", name, e))
                    })
            };
            points.push((parse(0)?, parse(1)?));
        }
        Ok(DetectorCorrection::new(points))
    }

    /// Load every correction input referenced by `request`.
    pub fn load_corrections(&self, request: &AcquisitionRequest) -> AppResult<CorrectionSet> {
        let blank = |name: &Option<String>| -> AppResult<Option<Spectrum>> {
            name.as_deref().map(|n| self.load_spectrum(n)).transpose()
        };
        Ok(CorrectionSet {
            detector: request
                .detector_correction
                .as_deref()
                .map(|n| self.load_detector_correction(n))
                .transpose()?,
            ac_blank: blank(&request.ac_blank)?,
            dc_blank: blank(&request.dc_blank)?,
            base_blank: blank(&request.base_blank)?,
        })
    }

    /// Write the parameter record for spectrum `name`.
    pub fn save_parameters(&self, name: &str, record: &ParameterRecord) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.params_path(name);
        record.write_to(&path)?;
        Ok(path)
    }

    /// Read the parameter record of spectrum `name`.
    pub fn load_parameters(&self, name: &str) -> AppResult<ParameterRecord> {
        ParameterRecord::read_from(self.params_path(name))
    }
}

/// Instrument settings recorded with every spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// PMT control voltage in V.
    pub pmt_voltage: f64,
    /// Relative PMT gain.
    pub pmt_gain: f64,
    /// Lock-in input range in V.
    pub input_range: f64,
    /// Lock-in phase offset in degrees.
    pub phase_offset: f64,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            pmt_voltage: 0.0,
            pmt_gain: 0.0,
            input_range: 1.0,
            phase_offset: 0.0,
        }
    }
}

/// Provenance of a spectrum, also used as the last-used settings record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterRecord {
    /// Spectrum name.
    pub name: String,
    /// Local time the record was written.
    pub time: String,
    /// Start wavelength in nm.
    pub start_nm: f64,
    /// End wavelength in nm.
    pub end_nm: f64,
    /// Step in nm.
    pub step_nm: f64,
    /// Dwell time in s.
    pub dwell_time_s: f64,
    /// Repetitions.
    pub repetitions: u32,
    /// Comment.
    pub comment: String,
    /// AC blank name, empty if none.
    pub ac_blank: String,
    /// DC blank name, empty if none.
    pub dc_blank: String,
    /// Base reading blank name, empty if none.
    pub base_blank: String,
    /// Modulator switched off.
    pub modulator_off: bool,
    /// Detector correction name, empty if none.
    pub detector_correction: String,
    /// PMT voltage in V.
    pub pmt_voltage: f64,
    /// Relative PMT gain.
    pub pmt_gain: f64,
    /// Input range in V.
    pub input_range: f64,
    /// Phase offset in degrees.
    pub phase_offset: f64,
    /// Sample concentration in mol/L.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_concentration: Option<f64>,
    /// Path length in cm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_length_cm: Option<f64>,
}

impl Default for ParameterRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            time: String::new(),
            start_nm: 0.0,
            end_nm: 0.0,
            step_nm: 1.0,
            dwell_time_s: 1.0,
            repetitions: 1,
            comment: String::new(),
            ac_blank: String::new(),
            dc_blank: String::new(),
            base_blank: String::new(),
            modulator_off: false,
            detector_correction: String::new(),
            pmt_voltage: 0.0,
            pmt_gain: 0.0,
            input_range: 1.0,
            phase_offset: 0.0,
            sample_concentration: None,
            path_length_cm: None,
        }
    }
}

impl ParameterRecord {
    /// Record for `request` under `settings`, stamped with the current time.
    pub fn new(request: &AcquisitionRequest, settings: &InstrumentSettings) -> Self {
        let name_of = |n: &Option<String>| n.clone().unwrap_or_default();
        Self {
            name: request.name.clone(),
            time: chrono::Local::now().format("%a %b %e %H:%M:%S %Y").to_string(),
            start_nm: request.start_nm,
            end_nm: request.end_nm,
            step_nm: request.step_nm,
            dwell_time_s: request.dwell_time_s,
            repetitions: request.repetitions,
            comment: request.comment.clone(),
            ac_blank: name_of(&request.ac_blank),
            dc_blank: name_of(&request.dc_blank),
            base_blank: name_of(&request.base_blank),
            modulator_off: request.modulator_off,
            detector_correction: name_of(&request.detector_correction),
            pmt_voltage: settings.pmt_voltage,
            pmt_gain: settings.pmt_gain,
            input_range: settings.input_range,
            phase_offset: settings.phase_offset,
            sample_concentration: request.sample.map(|s| s.concentration),
            path_length_cm: request.sample.map(|s| s.path_length_cm),
        }
    }

    /// Replace the instrument settings part of the record.
    pub fn with_settings(mut self, settings: &InstrumentSettings) -> Self {
        self.pmt_voltage = settings.pmt_voltage;
        self.pmt_gain = settings.pmt_gain;
        self.input_range = settings.input_range;
        self.phase_offset = settings.phase_offset;
        self
    }

    /// Instrument settings stored in the record.
    pub fn settings(&self) -> InstrumentSettings {
        InstrumentSettings {
            pmt_voltage: self.pmt_voltage,
            pmt_gain: self.pmt_gain,
            input_range: self.input_range,
            phase_offset: self.phase_offset,
        }
    }

    /// Rebuild the acquisition request the record describes.
    pub fn to_request(&self) -> AcquisitionRequest {
        let some = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let sample = match (self.path_length_cm, self.sample_concentration) {
            (Some(path_length_cm), Some(concentration)) => Some(SampleParameters {
                path_length_cm,
                concentration,
            }),
            _ => None,
        };
        AcquisitionRequest {
            start_nm: self.start_nm,
            end_nm: self.end_nm,
            step_nm: self.step_nm,
            dwell_time_s: self.dwell_time_s,
            repetitions: self.repetitions,
            name: self.name.clone(),
            comment: self.comment.clone(),
            ac_blank: some(&self.ac_blank),
            dc_blank: some(&self.dc_blank),
            base_blank: some(&self.base_blank),
            detector_correction: some(&self.detector_correction),
            modulator_off: self.modulator_off,
            sample,
        }
    }

    /// Encode as `key = "value"` lines.
    pub fn to_text(&self) -> AppResult<String> {
        toml::to_string(self).map_err(|e| CplError::ParameterFormat(e.to_string()))
    }

    /// Decode from `key = "value"` lines. Missing keys keep their defaults.
    pub fn from_text(text: &str) -> AppResult<Self> {
        toml::from_str(text).map_err(|e| CplError::ParameterFormat(e.to_string()))
    }

    /// Write to `path`.
    pub fn write_to(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_text()?)?;
        info!(path = %path.display(), "Parameters saved");
        Ok(())
    }

    /// Read from `path`.
    pub fn read_from(path: impl AsRef<Path>) -> AppResult<Self> {
        Self::from_text(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::DerivedFormulas;
    use tempfile::TempDir;

    fn sample_spectrum() -> Spectrum {
        let formulas = DerivedFormulas::default();
        Spectrum::from_points(vec![
            formulas
                .point(500.0, Measurement::new(1.5, 0.01), Measurement::new(0.002, 0.0003))
                .with_lp_theta_std(Some(3.5)),
            formulas.point(501.0, Measurement::new(1.4, 0.02), Measurement::new(-0.001, 0.0002)),
        ])
    }

    #[test]
    fn test_spectrum_csv_layout() {
        let dir = TempDir::new().unwrap();
        let store = SpectrumStore::new(dir.path().join("data"));
        let path = store.save_spectrum("scan", &sample_spectrum()).unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "WL,DC,DC_std,AC,AC_std,CD,CD_std,I_L,I_L_std,I_R,I_R_std,gabs,gabs_std,m_ellip,m_ellip_std,ellip,ellip_std,lp_theta_std"
        );
        assert!(store.exists("scan"));
        assert!(!store.exists("other"));
    }

    #[test]
    fn test_spectrum_reload_keeps_values() {
        let dir = TempDir::new().unwrap();
        let store = SpectrumStore::new(dir.path());
        let original = sample_spectrum();
        store.save_spectrum("scan", &original).unwrap();

        let loaded = store.load_spectrum("scan").unwrap();
        assert_eq!(loaded.len(), 2);
        let (a, b) = (original.points()[0], loaded.points()[0]);
        assert_eq!(a.dc, b.dc);
        assert_eq!(a.cd, b.cd);
        assert_eq!(b.lp_theta_std, Some(3.5));
        assert_eq!(loaded.points()[1].lp_theta_std, None);
        // no sample parameters: molar ellipticity was NaN and stays NaN
        assert!(b.m_ellip.value.is_nan());
    }

    #[test]
    fn test_blank_with_primary_columns_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("blank.csv"),
            "WL,DC,DC_std,AC,AC_std\n500,0.1,0.01,0.001,0.0001\n",
        )
        .unwrap();
        let store = SpectrumStore::new(dir.path());
        let blank = store.load_spectrum("blank").unwrap();
        assert_eq!(blank.points()[0].dc.value, 0.1);
        assert!(blank.points()[0].cd.value.is_nan());
    }

    #[test]
    fn test_detector_correction_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("det.csv"), "WL,sensitivity\n510,3\n500,1\n").unwrap();
        let store = SpectrumStore::new(dir.path());
        let det = store.load_detector_correction("det").unwrap();
        assert_eq!(det.points(), &[(500.0, 1.0), (510.0, 3.0)]);

        std::fs::write(dir.path().join("bad.csv"), "nm,sensitivity\n500,1\n").unwrap();
        assert!(matches!(
            store.load_detector_correction("bad"),
            Err(CplError::Processing(_))
        ));
    }

    #[test]
    fn test_parameter_record_text_round_trip() {
        let request = AcquisitionRequest::new(400.0, 500.0, 0.5, 1.0, 3, "cpl run")
            .with_comment("ee = 98%")
            .with_dc_blank("solvent")
            .with_sample(SampleParameters {
                path_length_cm: 1.0,
                concentration: 1e-4,
            });
        let settings = InstrumentSettings {
            pmt_voltage: 0.55,
            pmt_gain: 1.3,
            input_range: 0.3,
            phase_offset: 151.2,
        };
        let record = ParameterRecord::new(&request, &settings);

        let text = record.to_text().unwrap();
        assert!(text.contains("name = \"cpl run\""));
        assert!(text.contains("dc_blank = \"solvent\""));
        assert!(text.contains("ac_blank = \"\""));

        let parsed = ParameterRecord::from_text(&text).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.to_request(), request);
        assert_eq!(parsed.settings(), settings);
    }

    #[test]
    fn test_partial_record_uses_defaults() {
        let parsed = ParameterRecord::from_text("name = \"old\"\nphase_offset = 12.5\n").unwrap();
        assert_eq!(parsed.name, "old");
        assert_eq!(parsed.phase_offset, 12.5);
        assert_eq!(parsed.repetitions, 1);
        assert!(matches!(
            ParameterRecord::from_text("name = "),
            Err(CplError::ParameterFormat(_))
        ));
    }

    #[test]
    fn test_load_corrections_reads_referenced_files() {
        let dir = TempDir::new().unwrap();
        let store = SpectrumStore::new(dir.path());
        store.save_spectrum("solvent", &sample_spectrum()).unwrap();
        store
            .save_detector_correction("det", &DetectorCorrection::new(vec![(400.0, 1.0), (600.0, 2.0)]))
            .unwrap();

        let request = AcquisitionRequest::new(500.0, 501.0, 1.0, 0.1, 1, "x")
            .with_ac_blank("solvent")
            .with_detector_correction("det");
        let set = store.load_corrections(&request).unwrap();
        assert!(set.ac_blank.is_some());
        assert!(set.dc_blank.is_none());
        assert_eq!(set.detector.unwrap().points().len(), 2);
    }
}
