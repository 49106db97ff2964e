//! Single locked reads from the acquisition lock-in.
//!
//! The client holds the lock-in lock for exactly one read and releases it
//! before returning, so the caller evaluates success (and decides whether to
//! retry) without blocking the safety monitor or manual controls. It never
//! retries on its own.

use crate::abort::AbortFlag;
use crate::hardware::{DeviceLockRegistry, ReadOutcome};
use anyhow::Result;
use std::sync::Arc;

/// Locked access to `read_data` and `read_ac_theta`.
#[derive(Debug, Clone)]
pub struct DataAcquisitionClient {
    devices: Arc<DeviceLockRegistry>,
}

impl DataAcquisitionClient {
    /// Client over the shared device registry.
    pub fn new(devices: Arc<DeviceLockRegistry>) -> Self {
        Self { devices }
    }

    /// Read one data point.
    ///
    /// A transient failure comes back as `success = false`; only a driver
    /// fault is an `Err`.
    pub async fn read_point(&self, abort: &AbortFlag) -> Result<ReadOutcome> {
        let lockin = self.devices.lockin_daq().await;
        lockin.read_data(abort).await
    }

    /// Read one AC phase sample in degrees (NaN if none was available).
    pub async fn read_theta(&self, abort: &AbortFlag) -> Result<f64> {
        let lockin = self.devices.lockin_daq().await;
        lockin.read_ac_theta(abort).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockRig, ReadFailure};
    use crate::hardware::DeviceId;

    #[tokio::test]
    async fn test_lock_released_after_read() {
        let rig = MockRig::dual();
        let devices = Arc::new(rig.registry());
        let client = DataAcquisitionClient::new(Arc::clone(&devices));

        let outcome = client.read_point(&AbortFlag::new()).await.unwrap();
        assert!(outcome.success);
        assert!(!devices.is_locked(DeviceId::LockInDaq));
    }

    #[tokio::test]
    async fn test_transient_failure_is_not_an_error() {
        let rig = MockRig::dual();
        rig.lockin.set_read_failure(ReadFailure::Always);
        let devices = Arc::new(rig.registry());
        let client = DataAcquisitionClient::new(Arc::clone(&devices));

        let outcome = client.read_point(&AbortFlag::new()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(rig.lockin.read_count(), 1);
    }

    #[tokio::test]
    async fn test_fault_releases_lock() {
        let rig = MockRig::dual();
        rig.lockin.set_read_failure(ReadFailure::FaultAfter(0));
        let devices = Arc::new(rig.registry());
        let client = DataAcquisitionClient::new(Arc::clone(&devices));

        assert!(client.read_point(&AbortFlag::new()).await.is_err());
        assert!(devices.all_released());
    }
}
