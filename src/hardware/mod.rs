//! Instrument access: capability traits, per-device locks, optical path
//! positioning, PMT conversions and mock devices.

pub mod capabilities;
pub mod locks;
pub mod mock;
pub mod optical_path;
pub mod pmt;

pub use capabilities::{
    AcquisitionLockIn, LockInReading, Modulator, Monochromator, ReadOutcome, ScopeLockIn,
    ScopeSample,
};
pub use locks::{DeviceId, DeviceLockRegistry, Instruments};
pub use optical_path::{OpticalPath, Topology};
pub use pmt::{bessel_corrections, PmtCalibration};
