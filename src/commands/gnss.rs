use crate::args::GnssArgs;
use crate::commands::imu::monitor_until_stopped;
use crate::commands::run::summarize_gnss;
use crate::gnss::{GnssAssembler, GnssMessage};
use crate::gnss::decoder::StreamDecoder;
use crate::ntrip::{CorrectionRelay, NtripConfig, RelayControl};
use crate::persist::PersistenceBuffer;
use crate::pipeline::{
    ErrorCategory, ErrorSender, QUEUE_CAPACITY, RECV_TIMEOUT, RunFlag, SensorPipeline,
    SharedSnapshot, error_channel, report, send_bounded, spawn_persister,
};
use crate::record::Template;
use crate::shared::lock::LockGuard;
use crate::shared::signal::install_ctrlc_handler;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{RecvTimeoutError, SyncSender, sync_channel};
use std::thread;
use std::time::Duration;

// Public GNSS command entrypoint. Without fusion the record template stops
// at the position fields; the correction relay is wired in either way.
pub fn run_gnss(args: GnssArgs) -> Result<()> {
    let _lock = LockGuard::acquire(&args.lock_file)?;
    let running = install_ctrlc_handler()?;
    let (errors, error_rx) = error_channel();
    let snapshot = SharedSnapshot::new();

    let (pipeline, relay_control) =
        spawn_gnss_pipeline(&args, false, Arc::clone(&running), errors, Arc::clone(&snapshot))?;
    monitor_until_stopped(&running, &error_rx, &snapshot, "GNSS", summarize_gnss);

    // Stop the correction session before joining so the uplink goes quiet
    // while the persister drains.
    relay_control.request_stop();
    pipeline.join();
    Ok(())
}

// Build the NTRIP configuration up front so a partial configuration fails
// at startup instead of at activation time.
fn build_ntrip_config(args: &GnssArgs) -> Result<Option<NtripConfig>> {
    if !args.enable_ntrip {
        return Ok(None);
    }
    let config = NtripConfig {
        server: args.ntrip_server.clone(),
        port: args.ntrip_port,
        mountpoint: args.ntrip_mountpoint.clone(),
        datatype: args.ntrip_datatype.clone(),
        username: args.ntrip_user.clone(),
        password: args.ntrip_password.clone(),
        gga_interval: Duration::from_secs(args.gga_interval_secs.max(1)),
        gga_mode: args.gga_mode,
    };
    config.validate()?;
    Ok(Some(config))
}

// Build the GNSS reader/assembler/persister stages plus the correction
// relay. Returns the relay control so the caller can stop the session
// ahead of the pipeline join.
pub fn spawn_gnss_pipeline(
    args: &GnssArgs,
    fusion: bool,
    running: RunFlag,
    errors: ErrorSender,
    snapshot: Arc<SharedSnapshot>,
) -> Result<(SensorPipeline, RelayControl)> {
    fs::create_dir_all(&args.data_dir).with_context(|| {
        format!(
            "creating data directory failed: {}",
            args.data_dir.display()
        )
    })?;

    let port = serialport::new(&args.gnss_port, args.gnss_baud_rate)
        .timeout(Duration::from_millis(args.read_timeout_ms))
        .open()
        .with_context(|| {
            format!(
                "opening GNSS serial port failed: {} @ {}",
                args.gnss_port, args.gnss_baud_rate
            )
        })?;

    let ntrip_config = build_ntrip_config(args)?;
    let uplink = if ntrip_config.is_some() {
        Some(Box::new(port.try_clone().context("cloning GNSS port for correction uplink")?)
            as Box<dyn io::Write + Send>)
    } else {
        None
    };
    let relay = CorrectionRelay::new(ntrip_config, uplink, Arc::clone(&running), errors.clone());
    let relay_control = relay.control();

    let template = Template::gnss(fusion, args.high_precision);
    let csv_path = args
        .data_dir
        .join(format!("gnss_{}.csv", Utc::now().format("%Y%m%d_%H%M%S")));
    let buffer = PersistenceBuffer::create(&csv_path, &template, args.flush_threshold)?;
    eprintln!("[GNSS] logging position records to {}", csv_path.display());

    let (message_tx, message_rx) = sync_channel::<(Vec<u8>, GnssMessage)>(QUEUE_CAPACITY);
    let (record_tx, record_rx) = sync_channel(QUEUE_CAPACITY);

    let reader = {
        let running = Arc::clone(&running);
        let errors = errors.clone();
        thread::spawn(move || reader_loop(port, message_tx, running, errors))
    };

    let assembler = {
        let running = Arc::clone(&running);
        let mut relay = relay;
        thread::spawn(move || {
            let mut assembler = GnssAssembler::new(template);
            loop {
                match message_rx.recv_timeout(RECV_TIMEOUT) {
                    Ok((raw, message)) => {
                        if matches!(message, GnssMessage::PositionFix(_)) {
                            relay.note_position_report(&raw);
                        }
                        assembler.apply(&message);
                        if let Some(record) = assembler.try_complete() {
                            relay.maybe_activate(&record);
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
            relay.shutdown();
        })
    };

    let persister = spawn_persister("GNSS", record_rx, buffer, running, errors);

    Ok((
        SensorPipeline {
            label: "GNSS",
            reader,
            assembler,
            persister,
        },
        relay_control,
    ))
}

// Reader stage body. Read failures are reported and the loop keeps trying,
// the same retry stance as the IMU reader; only shutdown or a closed queue
// stops the stage.
fn reader_loop<R: Read>(
    mut port: R,
    messages: SyncSender<(Vec<u8>, GnssMessage)>,
    running: RunFlag,
    errors: ErrorSender,
) {
    let mut decoder = StreamDecoder::new();
    let mut buffer = [0_u8; 2048];
    let mut decoded = Vec::new();
    while running.load(Ordering::SeqCst) {
        match port.read(&mut buffer) {
            Ok(0) => {}
            Ok(size) => {
                decoded.clear();
                decoder.push(&buffer[..size], &mut decoded);
                for message in decoded.drain(..) {
                    if !send_bounded(&messages, message, &running) {
                        return;
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => report(
                &errors,
                ErrorCategory::Transport,
                format!("reading GNSS stream failed: {err}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    enum Step {
        Fail,
        Bytes(Vec<u8>),
    }

    struct Scripted {
        steps: Vec<Step>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.steps.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "idle"));
            }
            match self.steps.remove(0) {
                Step::Fail => Err(io::Error::new(io::ErrorKind::BrokenPipe, "device reset")),
                Step::Bytes(mut bytes) => {
                    let take = bytes.len().min(buf.len());
                    buf[..take].copy_from_slice(&bytes[..take]);
                    if take < bytes.len() {
                        self.steps.insert(0, Step::Bytes(bytes.split_off(take)));
                    }
                    Ok(take)
                }
            }
        }
    }

    #[test]
    fn reader_keeps_running_after_transport_error() {
        let gga = b"$GNGGA,123519.00,5331.2,N,11330.6,W,1,08,0.9,545.4,M,46.9,M,,\r\n".to_vec();
        let source = Scripted {
            steps: vec![Step::Fail, Step::Bytes(gga)],
        };
        let (message_tx, message_rx) = sync_channel(8);
        let (err_tx, err_rx) = crate::pipeline::error_channel();
        let running: RunFlag = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = Arc::clone(&running);
            thread::spawn(move || reader_loop(source, message_tx, running, err_tx))
        };

        // The error is advisory; the sentence behind it still decodes.
        let (_, message) = message_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("message after the failed read");
        assert!(matches!(message, GnssMessage::PositionFix(_)));

        let event = err_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("reported transport error");
        assert_eq!(event.category, ErrorCategory::Transport);
        assert!(running.load(Ordering::SeqCst));

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
