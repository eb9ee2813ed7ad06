use crate::pipeline::{ErrorCategory, ErrorSender, RunFlag, report};
use crate::record::CompleteRecord;
use anyhow::{Result, bail};
use base64::{Engine as _, engine::general_purpose};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_HEADER_LEN: usize = 2048;

// Correction session lifecycle. The relay leaves Inactive at most once per
// run and never returns to it; Stopped is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Inactive,
    Requesting,
    Relaying,
    Stopped,
}

// NTRIP caster coordinates. All fields are required before the relay may
// attempt activation.
#[derive(Debug, Clone)]
pub struct NtripConfig {
    pub server: String,
    pub port: u16,
    pub mountpoint: String,
    pub datatype: String,
    pub username: String,
    pub password: String,
    pub gga_interval: Duration,
    pub gga_mode: u8,
}

impl NtripConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            bail!("NTRIP server host is required");
        }
        if self.port == 0 {
            bail!("NTRIP server port is required");
        }
        if self.mountpoint.is_empty() {
            bail!("NTRIP mount point is required");
        }
        if self.username.is_empty() {
            bail!("NTRIP username is required");
        }
        Ok(())
    }
}

// Shared state cell handed to the session worker and to whoever drives
// shutdown. Transitions happen whole under the lock.
#[derive(Clone)]
pub struct RelayControl {
    state: Arc<Mutex<RelayState>>,
}

impl RelayControl {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::Inactive)),
        }
    }

    pub fn state(&self) -> RelayState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, next: RelayState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    // Move from `from` to `to` only if nothing changed the state meanwhile.
    fn transition(&self, from: RelayState, to: RelayState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    pub fn request_stop(&self) {
        self.set(RelayState::Stopped);
    }
}

// Network-to-device bridge for differential corrections. Once a completed
// record shows a usable fix, the relay opens a caster session and forwards
// every received block verbatim to the device uplink.
pub struct CorrectionRelay {
    config: Option<NtripConfig>,
    control: RelayControl,
    worker: Option<JoinHandle<()>>,
    uplink: Option<Box<dyn Write + Send>>,
    latest_gga: Arc<Mutex<Option<Vec<u8>>>>,
    running: RunFlag,
    errors: ErrorSender,
}

impl CorrectionRelay {
    // `config` None means the relay is disabled and never activates.
    pub fn new(
        config: Option<NtripConfig>,
        uplink: Option<Box<dyn Write + Send>>,
        running: RunFlag,
        errors: ErrorSender,
    ) -> Self {
        Self {
            config,
            control: RelayControl::new(),
            worker: None,
            uplink,
            latest_gga: Arc::new(Mutex::new(None)),
            running,
            errors,
        }
    }

    pub fn control(&self) -> RelayControl {
        self.control.clone()
    }

    pub fn state(&self) -> RelayState {
        self.control.state()
    }

    // Keep the latest raw GGA sentence for periodic position reports to the
    // caster.
    pub fn note_position_report(&self, raw: &[u8]) {
        *self
            .latest_gga
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(raw.to_vec());
    }

    // Activation predicate, checked once per completed GNSS record: the
    // relay is still Inactive, a configuration exists, the position fields
    // are non-empty, and the fix quality is better than "no fix".
    pub fn maybe_activate(&mut self, record: &CompleteRecord) {
        if self.control.state() != RelayState::Inactive {
            return;
        }
        let Some(config) = self.config.clone() else {
            return;
        };

        let lat = record.field("lat").unwrap_or("");
        let lon = record.field("lon").unwrap_or("");
        let fix: i64 = record
            .field("fix")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        if lat.is_empty() || lon.is_empty() || fix <= 0 {
            return;
        }

        let Some(uplink) = self.uplink.take() else {
            return;
        };

        eprintln!(
            "[NTRIP] starting correction session to {}:{}/{}",
            config.server, config.port, config.mountpoint
        );
        self.control.set(RelayState::Requesting);

        let control = self.control.clone();
        let running = Arc::clone(&self.running);
        let latest_gga = Arc::clone(&self.latest_gga);
        let errors = self.errors.clone();
        self.worker = Some(thread::spawn(move || {
            relay_session(config, control, running, uplink, latest_gga, errors);
        }));
    }

    // Terminal stop: mark Stopped so the worker exits its loop, then join
    // it. The relay never activates again afterwards.
    pub fn shutdown(&mut self) {
        let was_active = self.control.state() != RelayState::Inactive;
        self.control.request_stop();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            eprintln!("[NTRIP] session worker panicked");
        }
        if was_active {
            eprintln!("[NTRIP] correction session stopped");
        }
    }
}

fn relay_session(
    config: NtripConfig,
    control: RelayControl,
    running: RunFlag,
    mut uplink: Box<dyn Write + Send>,
    latest_gga: Arc<Mutex<Option<Vec<u8>>>>,
    errors: ErrorSender,
) {
    let mut stream = match open_caster_session(&config) {
        Ok(stream) => stream,
        Err(err) => {
            // Stay in Requesting: the relay is abandoned, not retried.
            report(&errors, ErrorCategory::Correction, format!("{err:#}"));
            return;
        }
    };

    if !control.transition(RelayState::Requesting, RelayState::Relaying) {
        return;
    }
    eprintln!("[NTRIP] caster accepted, relaying correction data");

    let mut buffer = [0_u8; 2048];
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) && control.state() == RelayState::Relaying {
        if config.gga_mode == 0 && last_report.elapsed() >= config.gga_interval {
            let sentence = latest_gga
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(sentence) = sentence
                && let Err(err) = stream.write_all(&sentence)
            {
                report(
                    &errors,
                    ErrorCategory::Correction,
                    format!("sending position report to caster failed: {err}"),
                );
                break;
            }
            last_report = Instant::now();
        }

        match stream.read(&mut buffer) {
            Ok(0) => {
                report(
                    &errors,
                    ErrorCategory::Correction,
                    "caster closed the correction stream",
                );
                break;
            }
            Ok(size) => {
                if let Err(err) = uplink.write_all(&buffer[..size]) {
                    report(
                        &errors,
                        ErrorCategory::Transport,
                        format!("writing correction block to device failed: {err}"),
                    );
                    break;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                report(
                    &errors,
                    ErrorCategory::Correction,
                    format!("reading correction stream failed: {err}"),
                );
                break;
            }
        }
    }

    // A session that ends for any reason is dead; reflect that in the state.
    control.transition(RelayState::Relaying, RelayState::Stopped);
}

// TCP connect + HTTP-style mount point request + response status check.
fn open_caster_session(config: &NtripConfig) -> Result<TcpStream> {
    let address = format!("{}:{}", config.server, config.port);
    let mut last_error = None;
    let mut stream = None;
    for candidate in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&candidate, CONNECT_TIMEOUT) {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(err) => last_error = Some(err),
        }
    }
    let Some(mut stream) = stream else {
        bail!(
            "connecting to NTRIP caster {} failed: {}",
            address,
            last_error.map_or_else(|| "no address resolved".to_string(), |err| err.to_string())
        );
    };
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let credentials =
        general_purpose::STANDARD.encode(format!("{}:{}", config.username, config.password));
    let request = format!(
        "GET /{} HTTP/1.1\r\nHost: {}\r\nNtrip-Version: Ntrip/2.0\r\nUser-Agent: NTRIP gnss-imu-logger/0.1.0\r\nAccept: */*\r\nAuthorization: Basic {}\r\nConnection: close\r\n\r\n",
        config.mountpoint, address, credentials
    );
    stream.write_all(request.as_bytes())?;

    let header = read_response_header(&mut stream)?;
    if header.contains("SOURCETABLE") {
        bail!(
            "caster returned a source table: unknown mount point {}",
            config.mountpoint
        );
    }
    if !header.contains("200") {
        let status = header.lines().next().unwrap_or("").trim();
        bail!("caster rejected the request: {status}");
    }
    Ok(stream)
}

// Collect the response header up to the blank line, bounded in size and
// time so a silent caster cannot hang activation.
fn read_response_header(stream: &mut TcpStream) -> Result<String> {
    let mut header = Vec::new();
    let mut byte = [0_u8; 1];
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    while !header.ends_with(b"\r\n\r\n") && header.len() < MAX_HEADER_LEN {
        if Instant::now() > deadline {
            bail!("caster response timed out");
        }
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => header.push(byte[0]),
            Err(err)
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(String::from_utf8_lossy(&header).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error_channel;
    use crate::record::assembler::Assembler;
    use crate::record::{CalibrationRecord, Field, StatusRecord, Template};
    use std::io;
    use std::sync::atomic::AtomicBool;

    fn gnss_record(fix: i64, lat: &str, lon: &str) -> CompleteRecord {
        let mut assembler = Assembler::new(Template::gnss(false, false));
        let names: Vec<&'static str> = assembler.template().fields().to_vec();
        for name in names {
            assembler.set(name, Field::Int(1));
        }
        assembler.set("fix", Field::Int(fix));
        assembler.set("lat", Field::Text(lat.to_string()));
        assembler.set("lon", Field::Text(lon.to_string()));
        assembler
            .try_complete(&StatusRecord::default(), &CalibrationRecord::default())
            .expect("filled record")
    }

    fn test_config() -> NtripConfig {
        NtripConfig {
            // Discard port on localhost: connects are refused immediately.
            server: "127.0.0.1".to_string(),
            port: 9,
            mountpoint: "TEST00".to_string(),
            datatype: "RTCM".to_string(),
            username: "user@example.com".to_string(),
            password: "none".to_string(),
            gga_interval: Duration::from_secs(1),
            gga_mode: 0,
        }
    }

    fn relay(config: Option<NtripConfig>) -> CorrectionRelay {
        let (errors, _rx) = error_channel();
        CorrectionRelay::new(
            config,
            Some(Box::new(io::sink())),
            Arc::new(AtomicBool::new(true)),
            errors,
        )
    }

    #[test]
    fn config_validation_requires_all_coordinates() {
        assert!(test_config().validate().is_ok());
        let mut missing = test_config();
        missing.mountpoint.clear();
        assert!(missing.validate().is_err());
        let mut missing = test_config();
        missing.server.clear();
        assert!(missing.validate().is_err());
    }

    #[test]
    fn stays_inactive_without_fix_quality() {
        let mut relay = relay(Some(test_config()));
        relay.maybe_activate(&gnss_record(0, "53.5", "-113.5"));
        assert_eq!(relay.state(), RelayState::Inactive);
    }

    #[test]
    fn stays_inactive_with_empty_position() {
        let mut relay = relay(Some(test_config()));
        relay.maybe_activate(&gnss_record(4, "", ""));
        assert_eq!(relay.state(), RelayState::Inactive);
    }

    #[test]
    fn disabled_relay_never_activates() {
        let mut relay = relay(None);
        relay.maybe_activate(&gnss_record(4, "53.5", "-113.5"));
        assert_eq!(relay.state(), RelayState::Inactive);
    }

    #[test]
    fn activates_once_and_never_after_stop() {
        let mut relay = relay(Some(test_config()));
        relay.maybe_activate(&gnss_record(4, "53.5", "-113.5"));
        // The connection attempt fails, so the session is abandoned in
        // Requesting; there is no retry path back to Inactive.
        assert_ne!(relay.state(), RelayState::Inactive);

        relay.shutdown();
        assert_eq!(relay.state(), RelayState::Stopped);

        relay.maybe_activate(&gnss_record(4, "53.5", "-113.5"));
        assert_eq!(relay.state(), RelayState::Stopped);
    }

    #[test]
    fn session_aborts_to_stopped_when_caster_closes() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test caster");
        let address = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().expect("accept relay connection");
            let mut request = [0_u8; 1024];
            let _ = socket.read(&mut request);
            socket.write_all(b"ICY 200 OK\r\n\r\n").unwrap();
            // Dropping the socket closes the correction stream mid-session.
        });

        let mut config = test_config();
        config.port = address.port();
        config.gga_mode = 1;

        let control = RelayControl::new();
        control.set(RelayState::Requesting);
        let (errors, error_rx) = error_channel();
        relay_session(
            config,
            control.clone(),
            Arc::new(AtomicBool::new(true)),
            Box::new(io::sink()),
            Arc::new(Mutex::new(None)),
            errors,
        );
        server.join().unwrap();

        assert_eq!(control.state(), RelayState::Stopped);
        let mut saw_correction_error = false;
        while let Ok(event) = error_rx.try_recv() {
            saw_correction_error |= event.category == ErrorCategory::Correction;
        }
        assert!(saw_correction_error);
    }

    #[test]
    fn position_reports_are_replaced_whole() {
        let relay = relay(Some(test_config()));
        relay.note_position_report(b"$GNGGA,1\r\n");
        relay.note_position_report(b"$GNGGA,2\r\n");
        let stored = relay.latest_gga.lock().unwrap().clone().unwrap();
        assert_eq!(stored, b"$GNGGA,2\r\n");
    }
}
