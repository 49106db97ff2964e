//! Post-processing of measured spectra: derived optical quantities and
//! baseline correction.

pub mod baseline;
pub mod derived;

pub use baseline::{
    BaselineCorrector, BlankErrorModel, CorrectionSet, DetectorCorrection,
    WAVELENGTH_MATCH_TOLERANCE,
};
pub use derived::{DerivedFormulas, GabsFormula, CD_CONSTANT};
