use super::GnssMessage;
use super::decoder::{StreamDecoder, encode_packet};
use crate::record::{CalibState, CalibrationRecord, StatusRecord};
use anyhow::{Context, Result, bail};
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

const BACKUP_CLASS: u8 = 0x09;
const BACKUP_ID: u8 = 0x14;
const COMMAND_SPACING: Duration = Duration::from_millis(100);

// The receiver acknowledges a backup request with command 2 and a
// non-zero response byte.
const ACK_COMMAND: u8 = 2;
const ACK_OK: u8 = 1;

// Navigation-state backups are only worth taking once the dead-reckoning
// filter is fully converged: an RTK-grade fix, fusion running, and every
// sensor through calibration.
pub fn backup_conditions_met(status: &StatusRecord, calibration: &CalibrationRecord) -> bool {
    status.fix_quality > 2 && status.fusion_mode == 1 && calibration.fully_calibrated()
}

pub fn clear_backup_packet() -> Vec<u8> {
    encode_packet(BACKUP_CLASS, BACKUP_ID, &[1, 0, 0, 0])
}

pub fn create_backup_packet() -> Vec<u8> {
    encode_packet(BACKUP_CLASS, BACKUP_ID, &[0, 0, 0, 0])
}

// Clear any stale backup in flash, request a fresh one, and wait for the
// receiver's acknowledgement. The receiver stays silent on the clear
// command, so only the create is confirmed.
pub fn perform_backup<S: Read + Write>(port: &mut S, timeout: Duration) -> Result<()> {
    port.write_all(&clear_backup_packet())
        .context("sending backup clear command")?;
    thread::sleep(COMMAND_SPACING);
    port.write_all(&create_backup_packet())
        .context("sending backup create command")?;

    wait_for_acknowledgement(port, timeout)
}

fn wait_for_acknowledgement<S: Read>(port: &mut S, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut decoder = StreamDecoder::new();
    let mut buffer = [0_u8; 512];
    let mut decoded = Vec::new();

    while Instant::now() < deadline {
        let size = match port.read(&mut buffer) {
            Ok(0) => {
                thread::sleep(Duration::from_millis(10));
                continue;
            }
            Ok(size) => size,
            Err(err)
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(err) => return Err(err).context("reading backup acknowledgement"),
        };

        decoded.clear();
        decoder.push(&buffer[..size], &mut decoded);
        for (_, message) in &decoded {
            if let GnssMessage::BackupResponse { command, response } = message {
                if *command == ACK_COMMAND && *response == ACK_OK {
                    return Ok(());
                }
                if *command == ACK_COMMAND {
                    bail!("receiver rejected backup request (response {response})");
                }
            }
        }
    }
    bail!("timed out waiting for backup acknowledgement");
}
