//! Integration tests for wavelength sweeps through the `Spectrometer` facade
//!
//! Covers hard acquisition failures, operator aborts, file outputs of
//! multi-repetition sweeps with blank correction, request validation and
//! the busy gate.

mod common;

use common::{ready_spectrometer, within};
use cpl_daq::acquisition::{AcquisitionRequest, SweepEvent, SweepState};
use cpl_daq::busy::Activity;
use cpl_daq::error::{CplError, ValidationError};
use cpl_daq::hardware::mock::ReadFailure;
use cpl_daq::hardware::LockInReading;
use cpl_daq::spectrum::Measurement;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_hard_failure_zeroes_pmt_and_returns_to_start() {
    let (mut spectrometer, rig, _dir) = ready_spectrometer().await;
    spectrometer.set_pmt_voltage(0.8).await.unwrap();
    rig.lockin.set_read_failure(ReadFailure::Always);

    let request = AcquisitionRequest::new(450.0, 440.0, 1.0, 0.001, 1, "failing");
    let err = within(spectrometer.run_sweep(request)).await.unwrap_err();

    assert!(matches!(
        err,
        CplError::HardAcquisitionFailure {
            wavelength_nm,
            attempts: 5
        } if wavelength_nm == 450.0
    ));
    assert_eq!(rig.lockin.read_count(), 5);
    assert_eq!(rig.lockin.pmt_history().last(), Some(&0.0));
    assert_eq!(rig.mono1.position(), Some(450.0));
    assert_eq!(rig.mono2.position(), Some(450.0));
    assert_eq!(spectrometer.sweep_state(), SweepState::Idle);
    assert!(spectrometer.busy().is_none());

    // The engine stays usable after a hard failure.
    rig.lockin.set_read_failure(ReadFailure::None);
    let request = AcquisitionRequest::new(450.0, 440.0, 1.0, 0.001, 1, "recovered");
    let report = within(spectrometer.run_sweep(request)).await.unwrap();
    assert_eq!(report.repetitions[0].len(), 11);
    assert!(report.aborted.is_none());

    spectrometer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_driver_fault_is_not_retried() {
    let (mut spectrometer, rig, _dir) = ready_spectrometer().await;
    rig.lockin.set_read_failure(ReadFailure::FaultAfter(2));

    let request = AcquisitionRequest::new(400.0, 410.0, 1.0, 0.001, 1, "fault");
    let err = within(spectrometer.run_sweep(request)).await.unwrap_err();

    assert!(err.is_device_fault());
    assert_eq!(rig.lockin.read_count(), 3);
    assert_eq!(rig.lockin.pmt_history().last(), Some(&0.0));
    assert_eq!(rig.mono1.position(), Some(400.0));

    spectrometer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_operator_abort_mid_sweep() {
    let (mut spectrometer, rig, _dir) = ready_spectrometer().await;
    rig.lockin.set_read_delay(Duration::from_millis(5));
    let mut events = spectrometer.subscribe_sweep();

    let request = AcquisitionRequest::new(400.0, 500.0, 1.0, 0.001, 1, "aborted");
    spectrometer.start_sweep(request).await.unwrap();
    assert_eq!(spectrometer.busy(), Some(Activity::Sweep));

    within(async {
        loop {
            if let SweepEvent::PointAcquired { .. } = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await;
    assert!(spectrometer.abort_sweep("operator"));

    let report = within(spectrometer.wait_sweep()).await.unwrap().unwrap();
    assert_eq!(report.aborted.as_deref(), Some("operator"));
    let points = report.repetitions[0].len();
    assert!(points >= 1 && points < 101, "got {} points", points);
    assert_eq!(rig.mono1.position(), Some(400.0));
    assert_eq!(rig.lockin.pmt_history().last(), Some(&0.0));

    let mut saw_aborted = false;
    let mut saw_finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SweepEvent::Aborted { reason } => {
                assert_eq!(reason, "operator");
                saw_aborted = true;
            }
            SweepEvent::Finished => saw_finished = true,
            _ => {}
        }
    }
    assert!(saw_aborted && saw_finished);

    // Idle again: aborting is a no-op.
    assert!(!spectrometer.abort_sweep("late"));
    assert!(spectrometer.busy().is_none());

    spectrometer.shutdown().await.unwrap();
}

// =============================================================================
// Outputs
// =============================================================================

#[tokio::test]
async fn test_repetitions_average_and_corrections_are_saved() {
    let (mut spectrometer, _rig, _dir) = ready_spectrometer().await;
    let store = spectrometer.store().clone();

    let blank = AcquisitionRequest::new(400.0, 402.0, 1.0, 0.001, 1, "blank");
    assert_ok!(within(spectrometer.run_sweep(blank)).await);
    assert!(store.exists("blank"));

    let request = AcquisitionRequest::new(400.0, 402.0, 1.0, 0.001, 2, "sample")
        .with_ac_blank("blank")
        .with_comment("racemic reference");
    let report = within(spectrometer.run_sweep(request)).await.unwrap();

    assert_eq!(report.repetitions.len(), 2);
    assert_eq!(report.corrected.len(), 2);
    assert!(report.average.is_some());
    assert!(report.average_corrected.is_some());

    for name in [
        "sample_1",
        "sample_2",
        "sample_avg",
        "sample_1_corr",
        "sample_2_corr",
        "sample_avg_corr",
    ] {
        assert!(store.exists(name), "missing {}", name);
    }
    assert!(store.params_path("sample_1").is_file());
    assert!(!store.exists("sample"));

    let average = store.load_spectrum("sample_avg").unwrap();
    let wavelengths: Vec<f64> = average.wavelengths().collect();
    assert_eq!(wavelengths, vec![400.0, 401.0, 402.0]);

    let corrected = store.load_spectrum("sample_1_corr").unwrap();
    for point in corrected.points() {
        assert!(point.ac.value.abs() < 1e-9);
        assert!((point.dc.value - 1.0).abs() < 1e-9);
    }

    let params = store.load_parameters("sample_1").unwrap();
    assert_eq!(params.name, "sample");
    assert_eq!(params.repetitions, 2);
    assert_eq!(params.ac_blank, "blank");
    assert_eq!(params.comment, "racemic reference");

    spectrometer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_linear_polarization_warning_event() {
    let (mut spectrometer, rig, _dir) = ready_spectrometer().await;
    rig.lockin.set_base_reading(LockInReading {
        dc: Measurement::new(1.0, 0.01),
        ac: Measurement::new(0.001, 0.0001),
        lp_theta_std: Some(0.2),
    });
    let mut events = spectrometer.subscribe_sweep();

    let request = AcquisitionRequest::new(600.0, 601.0, 1.0, 0.001, 1, "linear");
    within(spectrometer.run_sweep(request)).await.unwrap();

    let mut warnings = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SweepEvent::LinearPolarization { wavelength_nm, .. } = event {
            warnings.push(wavelength_nm);
        }
    }
    assert_eq!(warnings, vec![600.0, 601.0]);

    spectrometer.shutdown().await.unwrap();
}

// =============================================================================
// Validation and exclusion
// =============================================================================

#[tokio::test]
async fn test_existing_output_and_missing_blank_are_rejected() {
    let (mut spectrometer, rig, _dir) = ready_spectrometer().await;

    let request = AcquisitionRequest::new(400.0, 401.0, 1.0, 0.001, 1, "taken");
    within(spectrometer.run_sweep(request.clone())).await.unwrap();
    let reads = rig.lockin.read_count();

    let err = spectrometer.start_sweep(request).await.unwrap_err();
    assert!(matches!(
        err,
        CplError::Validation(ValidationError::OutputExists(ref name)) if name == "taken"
    ));

    let request =
        AcquisitionRequest::new(400.0, 401.0, 1.0, 0.001, 1, "other").with_dc_blank("nowhere");
    let err = spectrometer.start_sweep(request).await.unwrap_err();
    assert!(matches!(
        err,
        CplError::Validation(ValidationError::MissingFile { .. })
    ));

    let request = AcquisitionRequest::new(400.0, 401.0, 1.0, 0.001, 1, "bad:name");
    assert_err!(spectrometer.start_sweep(request).await);

    assert_eq!(rig.lockin.read_count(), reads);
    assert!(spectrometer.busy().is_none());

    spectrometer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sweep_refused_during_calibration() {
    let (mut spectrometer, _rig, _dir) = ready_spectrometer().await;
    let session = spectrometer.begin_calibration().await.unwrap();

    let request = AcquisitionRequest::new(400.0, 401.0, 1.0, 0.001, 1, "blocked");
    let err = spectrometer.start_sweep(request.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        CplError::Busy {
            active: Activity::Calibration
        }
    ));
    assert!(matches!(
        spectrometer.move_to(500.0).await,
        Err(CplError::Busy { .. })
    ));

    session.cancel().await.unwrap();
    assert_ok!(within(spectrometer.run_sweep(request)).await);

    spectrometer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_last_params_round_trip_through_facade() {
    let (mut spectrometer, _rig, _dir) = ready_spectrometer().await;
    spectrometer.set_pmt_voltage(0.5).await.unwrap();
    spectrometer.set_phase_offset(152.5).await.unwrap();

    let request = AcquisitionRequest::new(500.0, 450.0, 0.5, 2.0, 3, "remembered");
    spectrometer.save_last_params(&request).await.unwrap();

    let record = spectrometer.load_last_params().unwrap();
    assert_eq!(record.name, "remembered");
    assert_eq!(record.pmt_voltage, 0.5);
    assert_eq!(record.phase_offset, 152.5);

    spectrometer.set_phase_offset(0.0).await.unwrap();
    let restored = spectrometer.restore_last_params().await.unwrap();
    assert_eq!(restored.start_nm, 500.0);
    assert_eq!(restored.end_nm, 450.0);
    assert_eq!(restored.repetitions, 3);
    assert_eq!(spectrometer.settings().phase_offset, 152.5);

    spectrometer.shutdown().await.unwrap();
}
