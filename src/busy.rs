//! Mutual exclusion between sweeps and calibration.
//!
//! Device locks only serialize single device calls. A sweep and a
//! calibration interleaving their reads would still leave the instrument in
//! an incoherent state, so both take the [`BusyGate`] first and hold the
//! returned [`BusyGuard`] for their whole lifetime.

use crate::error::{AppResult, CplError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Long-running activity holding the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// A wavelength sweep.
    Sweep,
    /// A phase-offset calibration session.
    Calibration,
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Activity::Sweep => write!(f, "sweep"),
            Activity::Calibration => write!(f, "calibration"),
        }
    }
}

/// Shared "busy" state checked before starting a sweep or a calibration.
#[derive(Debug, Clone, Default)]
pub struct BusyGate {
    active: Arc<Mutex<Option<Activity>>>,
}

impl BusyGate {
    /// Create an idle gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate for `activity`, failing if anything else holds it.
    pub fn try_enter(&self, activity: Activity) -> AppResult<BusyGuard> {
        let mut active = self.active.lock();
        if let Some(current) = *active {
            return Err(CplError::Busy { active: current });
        }
        *active = Some(activity);
        Ok(BusyGuard {
            active: Arc::clone(&self.active),
        })
    }

    /// Activity currently holding the gate.
    pub fn current(&self) -> Option<Activity> {
        *self.active.lock()
    }

    /// Whether any activity holds the gate.
    pub fn is_busy(&self) -> bool {
        self.current().is_some()
    }
}

/// Releases the gate on drop.
#[derive(Debug)]
pub struct BusyGuard {
    active: Arc<Mutex<Option<Activity>>>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_is_exclusive() {
        let gate = BusyGate::new();
        let guard = gate.try_enter(Activity::Sweep).unwrap();
        assert_eq!(gate.current(), Some(Activity::Sweep));

        let err = gate.try_enter(Activity::Calibration).unwrap_err();
        assert!(matches!(
            err,
            CplError::Busy {
                active: Activity::Sweep
            }
        ));

        drop(guard);
        assert!(!gate.is_busy());
        assert!(gate.try_enter(Activity::Calibration).is_ok());
    }
}
