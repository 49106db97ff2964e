//! Wavelength sweeps: request validation, the wavelength grid, locked lock-in
//! reads, running averages, progress and the sweep state machine.

pub mod accumulator;
pub mod client;
pub mod plan;
pub mod progress;
pub mod request;
pub mod scheduler;

pub use accumulator::{average_spectra, Accumulator};
pub use client::DataAcquisitionClient;
pub use plan::SweepPlan;
pub use progress::{format_remaining, SweepProgress};
pub use request::{validate_name, AcquisitionRequest, ILLEGAL_NAME_CHARS};
pub use scheduler::{
    AcquisitionScheduler, SweepEvent, SweepHandle, SweepOutputs, SweepReport, SweepState,
    SweepTiming,
};
