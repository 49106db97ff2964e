//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use cpl_daq::config::SpectrometerConfig;
use cpl_daq::hardware::mock::MockRig;
use cpl_daq::spectrometer::Spectrometer;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Configuration with every delay removed and storage inside `dir`.
pub fn fast_config(dir: &Path) -> SpectrometerConfig {
    let mut config = SpectrometerConfig::default();
    config.timing.lowpass_filter_risetime_s = 0.0;
    config.timing.move_delay_s = 0.0;
    config.timing.osc_refresh_interval_ms = 2;
    config.storage.data_dir = dir.join("data");
    config.storage.last_params_file = dir.join("last_params.txt");
    config
}

/// An initialized spectrometer on a dual mock rig.
pub async fn ready_spectrometer() -> (Spectrometer, MockRig, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let rig = MockRig::dual();
    let mut spectrometer = Spectrometer::new(rig.instruments(), fast_config(dir.path())).unwrap();
    spectrometer.initialize().await.unwrap();
    (spectrometer, rig, dir)
}

/// Fail the test if `fut` takes longer than five seconds.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// Poll `cond` every millisecond for up to five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
}
