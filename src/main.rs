//! CLI Entry Point for cpl-daq
//!
//! Runs the acquisition engine against mock instruments:
//! - `sweep`: acquire a spectrum and write it to the data directory
//! - `calibrate`: run a phase-offset calibration with simulated phases
//! - `config`: print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! cpl-daq --config config/cpl.toml sweep --start 400 --end 500 --step 1 --dwell 1 --reps 3 --name sample
//! cpl-daq calibrate --record-ms 500
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cpl_daq::acquisition::{AcquisitionRequest, SweepEvent};
use cpl_daq::config::{SpectrometerConfig, DEFAULT_CONFIG_PATH};
use cpl_daq::hardware::mock::MockRig;
use cpl_daq::logging::{self, OutputFormat, TracingConfig};
use cpl_daq::spectrometer::Spectrometer;
use cpl_daq::spectrum::SampleParameters;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cpl-daq")]
#[command(about = "CD/CPL spectrometer acquisition engine", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format (pretty, compact, json)
    #[arg(long, default_value = "compact")]
    log_format: OutputFormat,

    /// Use a single-monochromator mock rig
    #[arg(long)]
    single: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a spectrum
    Sweep {
        /// Start wavelength in nm
        #[arg(long)]
        start: f64,

        /// End wavelength in nm
        #[arg(long)]
        end: f64,

        /// Step in nm
        #[arg(long, default_value = "1.0")]
        step: f64,

        /// Dwell time per point in seconds
        #[arg(long, default_value = "1.0")]
        dwell: f64,

        /// Number of repetitions
        #[arg(long, default_value = "1")]
        reps: u32,

        /// Output name
        #[arg(long)]
        name: String,

        /// Free text saved with the parameters
        #[arg(long, default_value = "")]
        comment: String,

        /// AC blank spectrum name
        #[arg(long)]
        ac_blank: Option<String>,

        /// DC blank spectrum name
        #[arg(long)]
        dc_blank: Option<String>,

        /// Base reading blank spectrum name
        #[arg(long)]
        base_blank: Option<String>,

        /// Detector correction name
        #[arg(long)]
        detector_correction: Option<String>,

        /// Keep the modulator off
        #[arg(long)]
        modulator_off: bool,

        /// Path length in cm, enables molar ellipticity
        #[arg(long, requires = "concentration")]
        path_length: Option<f64>,

        /// Sample concentration in mol/L
        #[arg(long, requires = "path_length")]
        concentration: Option<f64>,

        /// PMT control voltage applied before the sweep
        #[arg(long)]
        pmt_voltage: Option<f64>,

        /// Print a JSON summary instead of log lines
        #[arg(long)]
        json: bool,
    },

    /// Phase-offset calibration with simulated phase readings
    Calibrate {
        /// Recording time per phase in milliseconds
        #[arg(long, default_value = "500")]
        record_ms: u64,

        /// Simulated phase with a positive CPL sample, degrees
        #[arg(long, default_value = "95.0", allow_hyphen_values = true)]
        positive_theta: f64,

        /// Simulated phase with a negative CPL sample, degrees
        #[arg(long, default_value = "-85.0", allow_hyphen_values = true)]
        negative_theta: f64,

        /// Skip the positive sample
        #[arg(long)]
        skip_positive: bool,

        /// Skip the negative sample
        #[arg(long)]
        skip_negative: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SpectrometerConfig::load_from(&cli.config)?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.application.log_level);
    logging::init(TracingConfig::new(logging::parse_log_level(level)?).with_format(cli.log_format))?;
    info!(app = %config.application.name, "Starting");

    let rig = if cli.single {
        MockRig::single()
    } else {
        MockRig::dual()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Sweep {
            start,
            end,
            step,
            dwell,
            reps,
            name,
            comment,
            ac_blank,
            dc_blank,
            base_blank,
            detector_correction,
            modulator_off,
            path_length,
            concentration,
            pmt_voltage,
            json,
        } => {
            let mut request = AcquisitionRequest::new(start, end, step, dwell, reps, name)
                .with_comment(comment)
                .with_modulator_off(modulator_off);
            request.ac_blank = ac_blank;
            request.dc_blank = dc_blank;
            request.base_blank = base_blank;
            request.detector_correction = detector_correction;
            if let (Some(path_length_cm), Some(concentration)) = (path_length, concentration) {
                request = request.with_sample(SampleParameters {
                    path_length_cm,
                    concentration,
                });
            }
            run_sweep(&rig, config, request, pmt_voltage, json).await
        }
        Commands::Calibrate {
            record_ms,
            positive_theta,
            negative_theta,
            skip_positive,
            skip_negative,
        } => {
            let record = Duration::from_millis(record_ms);
            run_calibration(
                &rig,
                config,
                record,
                (!skip_positive).then_some(positive_theta),
                (!skip_negative).then_some(negative_theta),
            )
            .await
        }
    }
}

async fn run_sweep(
    rig: &MockRig,
    config: SpectrometerConfig,
    request: AcquisitionRequest,
    pmt_voltage: Option<f64>,
    json: bool,
) -> Result<()> {
    let mut spectrometer = Spectrometer::new(rig.instruments(), config)?;
    spectrometer.initialize().await?;
    if let Some(volt) = pmt_voltage {
        spectrometer.set_pmt_voltage(volt).await?;
    }

    let mut events = spectrometer.subscribe_sweep();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SweepEvent::Progress(progress) => info!("{}", progress.summary()),
                SweepEvent::Finished => break,
                _ => {}
            }
        }
    });

    let name = request.name.clone();
    let outcome = spectrometer.run_sweep(request).await;
    // A request rejected before the sweep started emits no Finished event.
    if outcome.is_err() {
        printer.abort();
    } else if let Err(e) = printer.await {
        warn!(error = %e, "Progress printer failed");
    }
    spectrometer.shutdown().await?;
    let report = outcome.with_context(|| format!("sweep '{}' failed", name))?;

    if json {
        let summary = serde_json::json!({
            "name": name,
            "repetitions": report.repetitions.iter().map(|s| s.len()).collect::<Vec<_>>(),
            "corrected": !report.corrected.is_empty(),
            "averaged": report.average.is_some(),
            "aborted": report.aborted,
            "data_dir": spectrometer.store().dir(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            repetitions = report.repetitions.len(),
            aborted = ?report.aborted,
            "Sweep '{}' done",
            name
        );
    }
    Ok(())
}

async fn run_calibration(
    rig: &MockRig,
    config: SpectrometerConfig,
    record: Duration,
    positive_theta: Option<f64>,
    negative_theta: Option<f64>,
) -> Result<()> {
    let mut spectrometer = Spectrometer::new(rig.instruments(), config)?;
    spectrometer.initialize().await?;
    let mut session = spectrometer.begin_calibration().await?;
    info!(current = session.current_offset(), "Calibration started");

    match positive_theta {
        Some(theta) => {
            rig.lockin.set_theta_default(Some(theta));
            session.start_positive()?;
            tokio::time::sleep(record).await;
            let average = session.finish_positive().await?;
            info!(mean = ?average.value(), samples = average.count, "Positive phase");
        }
        None => session.skip_positive().await?,
    }

    match negative_theta {
        Some(theta) => {
            rig.lockin.set_theta_default(Some(theta));
            session.start_negative()?;
            tokio::time::sleep(record).await;
            let average = session.finish_negative().await?;
            info!(mean = ?average.value(), samples = average.count, "Negative phase");
        }
        None => session.skip_negative().await?,
    }

    if session.can_apply() {
        let offset = session.apply().await?;
        info!(offset, "New phase offset applied");
    } else {
        warn!("No phase recorded, offset unchanged");
        session.cancel().await?;
    }
    spectrometer.shutdown().await?;
    Ok(())
}
