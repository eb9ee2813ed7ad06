use crate::persist::PersistenceBuffer;
use crate::record::{CalibrationRecord, CompleteRecord, StatusRecord};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Mutex, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// Bounded hand-off depth between stages. Deep enough to ride out a slow
// flush, small enough to keep memory flat on a stalled consumer.
pub const QUEUE_CAPACITY: usize = 256;

// Receive timeout for every stage loop, so the run flag stays observable
// while a queue is idle.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub type RunFlag = Arc<AtomicBool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Persistence,
    Correction,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Persistence => "persistence",
            ErrorCategory::Correction => "correction",
            ErrorCategory::General => "general",
        };
        f.write_str(text)
    }
}

// Advisory error event, reported at stage boundaries and surfaced by the
// display loop. Errors never cross the data queues.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub category: ErrorCategory,
    pub message: String,
}

pub type ErrorSender = Sender<ErrorEvent>;
pub type ErrorReceiver = Receiver<ErrorEvent>;

pub fn error_channel() -> (ErrorSender, ErrorReceiver) {
    mpsc::channel()
}

// Report an error to the channel; if the display side is already gone,
// fall back to stderr so nothing is silently lost.
pub fn report(errors: &ErrorSender, category: ErrorCategory, message: impl Into<String>) {
    let event = ErrorEvent {
        category,
        message: message.into(),
    };
    if errors.send(event.clone()).is_err() {
        eprintln!("[ERROR:{}] {}", event.category, event.message);
    }
}

// Send into a bounded queue without wedging shutdown: on a full queue the
// producer briefly backs off and re-checks the run flag instead of blocking
// indefinitely.
pub fn send_bounded<T>(tx: &SyncSender<T>, value: T, running: &RunFlag) -> bool {
    let mut item = value;
    loop {
        match tx.try_send(item) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                if !running.load(Ordering::SeqCst) {
                    return false;
                }
                item = back;
                thread::sleep(Duration::from_millis(10));
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

// Most recent snapshots published for non-blocking display polling. Each
// slot holds an immutable value swapped in whole, never mutated in place.
#[derive(Default)]
pub struct SharedSnapshot {
    record: Mutex<Option<Arc<CompleteRecord>>>,
    status: Mutex<StatusRecord>,
    calibration: Mutex<CalibrationRecord>,
}

impl SharedSnapshot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, record: &CompleteRecord) {
        let shared = Arc::new(record.clone());
        *self.record.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&shared));
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = record.status.clone();
        *self.calibration.lock().unwrap_or_else(|e| e.into_inner()) = record.calibration.clone();
    }

    pub fn latest_record(&self) -> Option<Arc<CompleteRecord>> {
        self.record
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn latest_status(&self) -> StatusRecord {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn latest_calibration(&self) -> CalibrationRecord {
        self.calibration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

// Handles for one sensor's reader/assembler/persister stages, joined in
// pipeline order at shutdown.
pub struct SensorPipeline {
    pub label: &'static str,
    pub reader: JoinHandle<()>,
    pub assembler: JoinHandle<()>,
    pub persister: JoinHandle<()>,
}

impl SensorPipeline {
    pub fn join(self) {
        for (stage, handle) in [
            ("reader", self.reader),
            ("assembler", self.assembler),
            ("persister", self.persister),
        ] {
            if handle.join().is_err() {
                eprintln!("[{}] {stage} stage panicked", self.label);
            }
        }
    }
}

// Persister stage shared by both sensors: drain the record queue with a
// timeout, batch into the sink, and flush whatever is left once the run
// flag drops.
pub fn spawn_persister(
    label: &'static str,
    rx: Receiver<CompleteRecord>,
    mut buffer: PersistenceBuffer,
    running: RunFlag,
    errors: ErrorSender,
) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            match rx.recv_timeout(RECV_TIMEOUT) {
                Ok(record) => {
                    if let Err(err) = buffer.push(record) {
                        report(&errors, ErrorCategory::Persistence, format!("{err:#}"));
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

        // Drain any records still queued, then force the final flush.
        while let Ok(record) = rx.try_recv() {
            if let Err(err) = buffer.push(record) {
                report(&errors, ErrorCategory::Persistence, format!("{err:#}"));
            }
        }
        if let Err(err) = buffer.flush() {
            report(&errors, ErrorCategory::Persistence, format!("{err:#}"));
        }
        eprintln!(
            "[{label}] persister stopped, wrote {} record(s) to {}",
            buffer.written(),
            buffer.path().display()
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::assembler::Assembler;
    use crate::record::{Field, Template};
    use std::sync::mpsc::sync_channel;

    fn sample_record(marker: i64) -> CompleteRecord {
        let template = Template::imu();
        let mut assembler = Assembler::new(template);
        let names: Vec<&'static str> = assembler.template().fields().to_vec();
        for name in names {
            assembler.set(name, Field::Int(marker));
        }
        assembler
            .try_complete(&StatusRecord::default(), &CalibrationRecord::default())
            .expect("filled record")
    }

    #[test]
    fn send_bounded_gives_up_when_flag_drops() {
        let (tx, _rx) = sync_channel::<u32>(1);
        let running: RunFlag = Arc::new(AtomicBool::new(true));

        assert!(send_bounded(&tx, 1, &running));
        // Queue now full and the flag is down: must return instead of spin.
        running.store(false, Ordering::SeqCst);
        assert!(!send_bounded(&tx, 2, &running));
    }

    #[test]
    fn send_bounded_reports_disconnect() {
        let (tx, rx) = sync_channel::<u32>(1);
        drop(rx);
        let running: RunFlag = Arc::new(AtomicBool::new(true));
        assert!(!send_bounded(&tx, 1, &running));
    }

    #[test]
    fn snapshot_returns_copies_not_live_state() {
        let snapshot = SharedSnapshot::new();
        assert!(snapshot.latest_record().is_none());

        let record = sample_record(7);
        snapshot.publish(&record);

        let seen = snapshot.latest_record().expect("published record");
        assert_eq!(seen.values[2], "7");
        // A later publish does not disturb the snapshot already handed out.
        snapshot.publish(&sample_record(8));
        assert_eq!(seen.values[2], "7");
        assert_eq!(snapshot.latest_record().unwrap().values[2], "8");
    }

    #[test]
    fn persister_drains_and_flushes_on_shutdown() {
        let dir = std::env::temp_dir().join("pipeline_persister_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("records.csv");

        let template = Template::imu();
        let buffer = PersistenceBuffer::create(&path, &template, 1000).unwrap();
        let (tx, rx) = sync_channel::<CompleteRecord>(QUEUE_CAPACITY);
        let (err_tx, _err_rx) = error_channel();
        let running: RunFlag = Arc::new(AtomicBool::new(true));

        let handle = spawn_persister("test", rx, buffer, Arc::clone(&running), err_tx);
        for marker in 0..5_i64 {
            assert!(send_bounded(&tx, sample_record(marker), &running));
        }
        running.store(false, Ordering::SeqCst);
        drop(tx);
        handle.join().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        // Header plus all five records despite the threshold never firing.
        assert_eq!(contents.lines().count(), 6);
        std::fs::remove_file(&path).unwrap();
    }
}
