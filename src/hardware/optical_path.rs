//! Wavelength positioning of the whole optical path.
//!
//! Single and dual monochromator setups share one scheduler; the difference
//! is a configuration-time [`Topology`].

use crate::abort::AbortFlag;
use crate::error::{AppResult, CplError};
use crate::hardware::locks::DeviceLockRegistry;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Number of monochromators in the light path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// One monochromator.
    Single,
    /// Two monochromators moved together.
    #[default]
    Dual,
}

/// Moves monochromator(s) and modulator to a wavelength.
#[derive(Debug, Clone)]
pub struct OpticalPath {
    devices: Arc<DeviceLockRegistry>,
    topology: Topology,
    move_delay: Duration,
}

impl OpticalPath {
    /// Path over `devices`. A dual topology requires a second monochromator.
    pub fn new(
        devices: Arc<DeviceLockRegistry>,
        topology: Topology,
        move_delay: Duration,
    ) -> AppResult<Self> {
        if topology == Topology::Dual && !devices.has_mono2() {
            return Err(CplError::Configuration(
                "dual monochromator topology configured but no second monochromator installed"
                    .to_string(),
            ));
        }
        Ok(Self {
            devices,
            topology,
            move_delay,
        })
    }

    /// Configured topology.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Switch polarization modulation on or off.
    ///
    /// The lock-in external reference is switched first so it keeps the
    /// last modulator frequency, then the modulator itself. The two locks
    /// are taken one after the other.
    pub async fn set_modulation_active(&self, active: bool) -> Result<()> {
        {
            let lockin = self.devices.lockin_daq().await;
            lockin.set_extref_active(0, active).await?;
        }
        let modulator = self.devices.modulator().await;
        modulator.set_active(active).await
    }

    /// Move every element to `nm`, then wait for the move delay.
    ///
    /// The monochromators and the modulator move concurrently, each under
    /// its own lock. When `abort` is given the delay ends early once it
    /// trips.
    pub async fn move_to(
        &self,
        nm: f64,
        move_modulator: bool,
        abort: Option<&AbortFlag>,
    ) -> Result<()> {
        info!(nm, "Move to {} nm", nm);

        let devices = &self.devices;
        let mono1 = async {
            devices.mono1().await.set_nm(nm).await
        };
        let mono2 = async {
            if self.topology == Topology::Dual {
                if let Some(mono) = devices.mono2().await {
                    return mono.set_nm(nm).await;
                }
            }
            Ok(())
        };
        let modulator = async {
            if move_modulator {
                devices.modulator().await.set_nm(nm).await
            } else {
                Ok(())
            }
        };
        tokio::try_join!(mono1, mono2, modulator)?;

        match abort {
            Some(flag) => {
                flag.sleep(self.move_delay).await;
            }
            None => tokio::time::sleep(self.move_delay).await,
        }
        Ok(())
    }
}
