//! Per-device mutual exclusion.
//!
//! Every device handle is owned by exactly one `tokio::sync::Mutex`. Callers
//! take the lock through the accessor, make their calls through the guard
//! and let the guard drop; cancellation and `?` early returns release it the
//! same way.
//!
//! Lock order rule: never await a second device lock while holding one.
//! Operations that touch several devices take and release them one at a time
//! (or in independent concurrent futures, as in
//! [`OpticalPath::move_to`](crate::hardware::OpticalPath::move_to)).

use crate::hardware::capabilities::{AcquisitionLockIn, Modulator, Monochromator, ScopeLockIn};
use tokio::sync::{Mutex, MutexGuard};

/// Identifies one physical device resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceId {
    /// Photoelastic modulator.
    Modulator,
    /// First monochromator.
    Mono1,
    /// Second monochromator.
    Mono2,
    /// Lock-in amplifier, acquisition session.
    LockInDaq,
    /// Lock-in amplifier, oscilloscope session.
    LockInScope,
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeviceId::Modulator => "modulator",
            DeviceId::Mono1 => "mono1",
            DeviceId::Mono2 => "mono2",
            DeviceId::LockInDaq => "lockin_daq",
            DeviceId::LockInScope => "lockin_scope",
        };
        write!(f, "{}", label)
    }
}

/// Device handles handed over to the registry.
pub struct Instruments {
    /// Photoelastic modulator.
    pub modulator: Box<dyn Modulator>,
    /// First monochromator.
    pub mono1: Box<dyn Monochromator>,
    /// Second monochromator, absent on single-monochromator setups.
    pub mono2: Option<Box<dyn Monochromator>>,
    /// Lock-in acquisition session.
    pub lockin_daq: Box<dyn AcquisitionLockIn>,
    /// Lock-in oscilloscope session.
    pub lockin_scope: Box<dyn ScopeLockIn>,
}

/// One lock per device resource.
pub struct DeviceLockRegistry {
    modulator: Mutex<Box<dyn Modulator>>,
    mono1: Mutex<Box<dyn Monochromator>>,
    mono2: Option<Mutex<Box<dyn Monochromator>>>,
    lockin_daq: Mutex<Box<dyn AcquisitionLockIn>>,
    lockin_scope: Mutex<Box<dyn ScopeLockIn>>,
}

impl std::fmt::Debug for DeviceLockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLockRegistry")
            .field("has_mono2", &self.mono2.is_some())
            .finish_non_exhaustive()
    }
}

impl DeviceLockRegistry {
    /// Take ownership of the device handles.
    pub fn new(instruments: Instruments) -> Self {
        Self {
            modulator: Mutex::new(instruments.modulator),
            mono1: Mutex::new(instruments.mono1),
            mono2: instruments.mono2.map(Mutex::new),
            lockin_daq: Mutex::new(instruments.lockin_daq),
            lockin_scope: Mutex::new(instruments.lockin_scope),
        }
    }

    /// Lock the modulator.
    pub async fn modulator(&self) -> MutexGuard<'_, Box<dyn Modulator>> {
        self.modulator.lock().await
    }

    /// Lock the first monochromator.
    pub async fn mono1(&self) -> MutexGuard<'_, Box<dyn Monochromator>> {
        self.mono1.lock().await
    }

    /// Lock the second monochromator, if installed.
    pub async fn mono2(&self) -> Option<MutexGuard<'_, Box<dyn Monochromator>>> {
        match &self.mono2 {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    /// Lock the lock-in acquisition session.
    pub async fn lockin_daq(&self) -> MutexGuard<'_, Box<dyn AcquisitionLockIn>> {
        self.lockin_daq.lock().await
    }

    /// Lock the lock-in oscilloscope session.
    pub async fn lockin_scope(&self) -> MutexGuard<'_, Box<dyn ScopeLockIn>> {
        self.lockin_scope.lock().await
    }

    /// Whether a second monochromator is installed.
    pub fn has_mono2(&self) -> bool {
        self.mono2.is_some()
    }

    /// Whether the lock for `device` is currently held. Absent devices are
    /// never locked.
    pub fn is_locked(&self, device: DeviceId) -> bool {
        match device {
            DeviceId::Modulator => self.modulator.try_lock().is_err(),
            DeviceId::Mono1 => self.mono1.try_lock().is_err(),
            DeviceId::Mono2 => self
                .mono2
                .as_ref()
                .is_some_and(|lock| lock.try_lock().is_err()),
            DeviceId::LockInDaq => self.lockin_daq.try_lock().is_err(),
            DeviceId::LockInScope => self.lockin_scope.try_lock().is_err(),
        }
    }

    /// Devices present in this registry.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut ids = vec![DeviceId::Modulator, DeviceId::Mono1];
        if self.has_mono2() {
            ids.push(DeviceId::Mono2);
        }
        ids.push(DeviceId::LockInDaq);
        ids.push(DeviceId::LockInScope);
        ids
    }

    /// True if no device lock is held.
    pub fn all_released(&self) -> bool {
        self.devices().into_iter().all(|id| !self.is_locked(id))
    }
}
