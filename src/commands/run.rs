use crate::args::RunArgs;
use crate::commands::gnss::spawn_gnss_pipeline;
use crate::commands::imu::spawn_imu_pipeline;
use crate::pipeline::{ErrorReceiver, RunFlag, SharedSnapshot, error_channel};
use crate::record::CompleteRecord;
use crate::shared::lock::LockGuard;
use crate::shared::signal::install_ctrlc_handler;
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

// Public run command entrypoint: both sensor pipelines in one process with
// a periodic status display on stderr.
pub fn run_mode(args: RunArgs) -> Result<()> {
    let _imu_lock = LockGuard::acquire(&args.imu_lock_file)?;
    let _gnss_lock = LockGuard::acquire(&args.gnss_lock_file)?;
    let running = install_ctrlc_handler()?;
    let (errors, error_rx) = error_channel();

    let imu_snapshot = SharedSnapshot::new();
    let gnss_snapshot = SharedSnapshot::new();

    let imu_pipeline = spawn_imu_pipeline(
        &args.to_imu_args(),
        Arc::clone(&running),
        errors.clone(),
        Arc::clone(&imu_snapshot),
    )?;
    let (gnss_pipeline, relay_control) = spawn_gnss_pipeline(
        &args.to_gnss_args(),
        args.fusion,
        Arc::clone(&running),
        errors,
        Arc::clone(&gnss_snapshot),
    )?;

    display_loop(
        &args,
        &running,
        &error_rx,
        &imu_snapshot,
        &gnss_snapshot,
    );

    // Shutdown order: correction session first so the uplink goes quiet,
    // then the pipelines in stage order.
    relay_control.request_stop();
    imu_pipeline.join();
    gnss_pipeline.join();
    eprintln!("Run mode stopped");
    Ok(())
}

// Poll the latest snapshots on a fixed cadence and surface advisory
// errors. Display never touches the data queues.
fn display_loop(
    args: &RunArgs,
    running: &RunFlag,
    error_rx: &ErrorReceiver,
    imu_snapshot: &SharedSnapshot,
    gnss_snapshot: &SharedSnapshot,
) {
    let interval = Duration::from_secs(args.display_interval_secs.max(1));
    let mut last_display = Instant::now();
    while running.load(Ordering::SeqCst) {
        while let Ok(event) = error_rx.try_recv() {
            eprintln!("[ERROR:{}] {}", event.category, event.message);
        }

        if last_display.elapsed() >= interval {
            if let Some(record) = gnss_snapshot.latest_record() {
                eprintln!("[GNSS] {}", summarize_gnss(&record));
                let status = gnss_snapshot.latest_status();
                let calibration = gnss_snapshot.latest_calibration();
                eprintln!(
                    "[ESF] fusion={} imu={} calib={} rtcm_used={} rtcm_crc_failed={}",
                    status.fusion_mode,
                    status.imu_init,
                    if calibration.fully_calibrated() {
                        "full"
                    } else {
                        "partial"
                    },
                    status.rtcm_msg_used,
                    status.rtcm_crc_failed,
                );
            }
            if let Some(record) = imu_snapshot.latest_record() {
                eprintln!("[IMU] {}", summarize_imu(&record));
            }
            last_display = Instant::now();
        }
        thread::sleep(Duration::from_millis(100));
    }

    while let Ok(event) = error_rx.try_recv() {
        eprintln!("[ERROR:{}] {}", event.category, event.message);
    }
}

pub fn summarize_gnss(record: &CompleteRecord) -> String {
    let field = |name: &str| {
        let value = record.field(name).unwrap_or("");
        if value.is_empty() { "-" } else { value }.to_string()
    };
    format!(
        "time={} fix={} sat={} lat={} lon={} alt={} hdop={}",
        field("gpstime"),
        field("fix"),
        record.status.satellites,
        field("lat"),
        field("lon"),
        field("alt"),
        field("hdop"),
    )
}

pub fn summarize_imu(record: &CompleteRecord) -> String {
    let field = |name: &str| record.field(name).unwrap_or("-").to_string();
    format!(
        "roll={} pitch={} yaw={} accX={} accY={} accZ={}",
        field("roll"),
        field("pitch"),
        field("yaw"),
        field("accX"),
        field("accY"),
        field("accZ"),
    )
}
