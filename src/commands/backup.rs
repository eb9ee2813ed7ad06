use crate::args::BackupArgs;
use crate::gnss::GnssMessage;
use crate::gnss::decoder::StreamDecoder;
use crate::gnss::device::{backup_conditions_met, perform_backup};
use crate::record::{CalibState, CalibrationRecord, ImuInitState, StatusRecord};
use crate::shared::signal::install_ctrlc_handler;
use anyhow::{Context, Result, bail};
use std::io::{self, Read};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

// Public backup command entrypoint: watch the receiver until the
// dead-reckoning filter is converged, then save its navigation state to
// flash. `--force` skips the convergence wait.
pub fn run_backup(args: BackupArgs) -> Result<()> {
    let running = install_ctrlc_handler()?;

    let mut port = serialport::new(&args.gnss_port, args.gnss_baud_rate)
        .timeout(Duration::from_millis(args.read_timeout_ms))
        .open()
        .with_context(|| {
            format!(
                "opening GNSS serial port failed: {} @ {}",
                args.gnss_port, args.gnss_baud_rate
            )
        })?;

    if !args.force {
        let deadline = Instant::now() + Duration::from_secs(args.wait_secs);
        let mut decoder = StreamDecoder::new();
        let mut buffer = [0_u8; 2048];
        let mut decoded = Vec::new();
        let mut status = StatusRecord::default();
        let mut calibration = CalibrationRecord::default();
        let mut ready = false;

        eprintln!(
            "Waiting up to {}s for fusion convergence on {}",
            args.wait_secs, args.gnss_port
        );
        while running.load(Ordering::SeqCst) && Instant::now() < deadline {
            let size = match port.read(&mut buffer) {
                Ok(size) => size,
                Err(err) if err.kind() == io::ErrorKind::TimedOut => continue,
                Err(err) => return Err(err).context("reading GNSS stream failed"),
            };
            decoded.clear();
            decoder.push(&buffer[..size], &mut decoded);
            for (_, message) in &decoded {
                observe(message, &mut status, &mut calibration);
            }
            if backup_conditions_met(&status, &calibration) {
                ready = true;
                break;
            }
        }

        if !running.load(Ordering::SeqCst) {
            bail!("interrupted before the receiver was ready");
        }
        if !ready {
            bail!(
                "receiver not ready for backup (fix {}, fusion mode {}, calibrated: {})",
                status.fix_quality,
                status.fusion_mode,
                calibration.fully_calibrated()
            );
        }
        eprintln!("Receiver converged, saving navigation state");
    }

    perform_backup(&mut port, Duration::from_secs(5))?;
    eprintln!("Navigation state saved to receiver flash");
    Ok(())
}

// Track just enough state to evaluate the backup gate.
fn observe(message: &GnssMessage, status: &mut StatusRecord, calibration: &mut CalibrationRecord) {
    match message {
        GnssMessage::PositionFix(fix) => {
            status.fix_quality = fix.quality;
            status.satellites = fix.satellites;
        }
        GnssMessage::EsfStatus {
            fusion_mode,
            imu_init,
            sensors,
        } => {
            status.fusion_mode = *fusion_mode;
            status.imu_init = ImuInitState::from_code(*imu_init);
            for sensor in sensors {
                calibration
                    .set_by_sensor_type(sensor.sensor_type, CalibState::from_code(sensor.calib_status));
            }
        }
        _ => {}
    }
}
