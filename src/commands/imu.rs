use crate::args::ImuArgs;
use crate::persist::PersistenceBuffer;
use crate::pipeline::{
    ErrorCategory, ErrorReceiver, ErrorSender, QUEUE_CAPACITY, RECV_TIMEOUT, RunFlag,
    SensorPipeline, SharedSnapshot, error_channel, report, send_bounded, spawn_persister,
};
use crate::commands::run::summarize_imu;
use crate::record::{CompleteRecord, Template};
use crate::shared::lock::LockGuard;
use crate::shared::signal::install_ctrlc_handler;
use crate::witmotion::{FrameDecoder, ImuAssembler, ImuFrame};
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{RecvTimeoutError, SyncSender, sync_channel};
use std::thread;
use std::time::{Duration, Instant};

// Public IMU command entrypoint: one sensor, three stages, errors printed
// inline until Ctrl-C.
pub fn run_imu(args: ImuArgs) -> Result<()> {
    let _lock = LockGuard::acquire(&args.lock_file)?;
    let running = install_ctrlc_handler()?;
    let (errors, error_rx) = error_channel();
    let snapshot = SharedSnapshot::new();

    let pipeline = spawn_imu_pipeline(&args, Arc::clone(&running), errors, Arc::clone(&snapshot))?;
    monitor_until_stopped(&running, &error_rx, &snapshot, "IMU", summarize_imu);
    pipeline.join();
    Ok(())
}

// Foreground loop for the standalone commands: surfaces advisory errors as
// they arrive and prints the latest snapshot once per second. The data path
// never blocks on this loop.
pub fn monitor_until_stopped(
    running: &RunFlag,
    error_rx: &ErrorReceiver,
    snapshot: &SharedSnapshot,
    label: &str,
    summarize: fn(&CompleteRecord) -> String,
) {
    let mut last_display = Instant::now();
    while running.load(Ordering::SeqCst) {
        match error_rx.recv_timeout(RECV_TIMEOUT) {
            Ok(event) => eprintln!("[ERROR:{}] {}", event.category, event.message),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_display.elapsed() >= RECV_TIMEOUT {
            if let Some(record) = snapshot.latest_record() {
                eprintln!("[{label}] {}", summarize(&record));
            }
            last_display = Instant::now();
        }
    }
    while let Ok(event) = error_rx.try_recv() {
        eprintln!("[ERROR:{}] {}", event.category, event.message);
    }
}

// Build the IMU reader/assembler/persister stages. Shared with run-mode so
// both commands execute the exact same pipeline.
pub fn spawn_imu_pipeline(
    args: &ImuArgs,
    running: RunFlag,
    errors: ErrorSender,
    snapshot: Arc<SharedSnapshot>,
) -> Result<SensorPipeline> {
    fs::create_dir_all(&args.data_dir).with_context(|| {
        format!(
            "creating data directory failed: {}",
            args.data_dir.display()
        )
    })?;

    let port = serialport::new(&args.imu_port, args.imu_baud_rate)
        .timeout(Duration::from_millis(args.read_timeout_ms))
        .open()
        .with_context(|| {
            format!(
                "opening IMU serial port failed: {} @ {}",
                args.imu_port, args.imu_baud_rate
            )
        })?;

    let template = Template::imu();
    let csv_path = args
        .data_dir
        .join(format!("imu_{}.csv", Utc::now().format("%Y%m%d_%H%M%S")));
    let buffer = PersistenceBuffer::create(&csv_path, &template, args.flush_threshold)?;
    eprintln!("[IMU] logging inertial records to {}", csv_path.display());

    let (frame_tx, frame_rx) = sync_channel::<ImuFrame>(QUEUE_CAPACITY);
    let (record_tx, record_rx) = sync_channel(QUEUE_CAPACITY);

    let reader = {
        let running = Arc::clone(&running);
        let errors = errors.clone();
        thread::spawn(move || reader_loop(FrameDecoder::new(port), frame_tx, running, errors))
    };

    let assembler = {
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let mut assembler = ImuAssembler::new();
            loop {
                match frame_rx.recv_timeout(RECV_TIMEOUT) {
                    Ok(frame) => {
                        assembler.apply(&frame);
                        if let Some(record) = assembler.try_complete() {
                            snapshot.publish(&record);
                            if !send_bounded(&record_tx, record, &running) {
                                break;
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    };

    let persister = spawn_persister("IMU", record_rx, buffer, running, errors);

    Ok(SensorPipeline {
        label: "IMU",
        reader,
        assembler,
        persister,
    })
}

// Reader stage body. A failed read is reported and the loop keeps trying:
// serial transports come back after transient faults, and only shutdown or
// a closed queue stops the stage.
fn reader_loop<R: Read>(
    mut decoder: FrameDecoder<R>,
    frames: SyncSender<ImuFrame>,
    running: RunFlag,
    errors: ErrorSender,
) {
    while running.load(Ordering::SeqCst) {
        match decoder.read_frame() {
            Ok(Some(frame)) => {
                if !send_bounded(&frames, frame, &running) {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => report(&errors, ErrorCategory::Transport, format!("{err:#}")),
        }
    }
}
