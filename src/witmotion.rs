use crate::record::assembler::Assembler;
use crate::record::{CalibrationRecord, CompleteRecord, Field, StatusRecord, Template};
use anyhow::{Context, Result};
use chrono::Utc;
use std::io::{self, Read};

pub const FRAME_LEN: usize = 11;
pub const TERMINATOR: u8 = 0x55;

const GRAVITY: f64 = 9.80665;
const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

// One decoded WitMotion frame. Values carry the raw protocol scaling;
// unit conversions happen when a frame is applied to a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImuFrame {
    // m/s² equivalent at ±16 g full scale
    Acceleration([f64; 3]),
    // deg/s at ±2000 full scale
    AngularRate([f64; 3]),
    // deg at ±180 full scale
    Angle([f64; 3]),
    // unit quaternion reordered to (x, y, z, w)
    Quaternion([f64; 4]),
}

// Pure frame decode: dispatch on the tag byte to a fixed scaled-i16
// conversion. Short frames and unknown tags yield nothing.
pub fn decode_frame(frame: &[u8]) -> Option<ImuFrame> {
    let tag = *frame.first()?;
    match tag {
        b'Q' => three_axis(frame, 16.0).map(ImuFrame::Acceleration),
        b'R' => three_axis(frame, 2000.0).map(ImuFrame::AngularRate),
        b'S' => three_axis(frame, 180.0).map(ImuFrame::Angle),
        b'Y' => quaternion(frame).map(ImuFrame::Quaternion),
        _ => None,
    }
}

fn three_axis(frame: &[u8], scale: f64) -> Option<[f64; 3]> {
    if frame.len() < 7 {
        return None;
    }
    let mut out = [0.0; 3];
    for (axis, chunk) in frame[1..7].chunks_exact(2).enumerate() {
        let raw = i16::from_le_bytes([chunk[0], chunk[1]]);
        out[axis] = f64::from(raw) / 32768.0 * scale;
    }
    Some(out)
}

fn quaternion(frame: &[u8]) -> Option<[f64; 4]> {
    if frame.len() < 9 {
        return None;
    }
    let mut wxyz = [0.0; 4];
    for (i, chunk) in frame[1..9].chunks_exact(2).enumerate() {
        let raw = i16::from_le_bytes([chunk[0], chunk[1]]);
        wxyz[i] = f64::from(raw) / 32768.0;
    }
    // Device order is (w, x, y, z); records store (x, y, z, w).
    Some([wxyz[1], wxyz[2], wxyz[3], wxyz[0]])
}

// Turns the raw serial byte stream into discrete frames. Alignment is found
// by scanning for the 0x55 terminator; once synced, frames are consumed in
// fixed 11-byte reads. A short read drops the frame and resumes the
// terminator search.
pub struct FrameDecoder<R: Read> {
    source: R,
    synced: bool,
}

impl<R: Read> FrameDecoder<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            synced: false,
        }
    }

    // Read the next decoded frame. Ok(None) covers every transient case:
    // timeout, short read, unknown tag, lost alignment. Err is a transport
    // failure for the caller's error channel.
    pub fn read_frame(&mut self) -> Result<Option<ImuFrame>> {
        if !self.synced {
            if !self.seek_terminator()? {
                return Ok(None);
            }
            self.synced = true;
        }

        let mut frame = [0_u8; FRAME_LEN];
        if !self.fill(&mut frame)? {
            self.synced = false;
            return Ok(None);
        }

        // The trailing byte must be the next frame's terminator, otherwise
        // alignment was lost mid-stream.
        if frame[FRAME_LEN - 1] != TERMINATOR {
            self.synced = false;
            return Ok(None);
        }

        Ok(decode_frame(&frame[..FRAME_LEN - 1]))
    }

    // Scan byte-by-byte for the terminator. Returns false on timeout so the
    // caller can re-check the run flag.
    fn seek_terminator(&mut self) -> Result<bool> {
        let mut byte = [0_u8; 1];
        loop {
            match self.source.read(&mut byte) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    if byte[0] == TERMINATOR {
                        return Ok(true);
                    }
                }
                Err(err) if is_transient(&err) => return Ok(false),
                Err(err) => {
                    return Err(err).context("reading IMU stream from serial port failed");
                }
            }
        }
    }

    // Fill the whole buffer; false means the read came up short (timeout or
    // quiet line) and the partial frame must be discarded.
    fn fill(&mut self, buffer: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buffer.len() {
            match self.source.read(&mut buffer[filled..]) {
                Ok(0) => return Ok(false),
                Ok(read) => filled += read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if is_transient(&err) => return Ok(false),
                Err(err) => {
                    return Err(err).context("reading IMU stream from serial port failed");
                }
            }
        }
        Ok(true)
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// Applies decoded frames to the IMU partial record and snapshots it once
// all axes have reported since the last reset.
pub struct ImuAssembler {
    assembler: Assembler,
    status: StatusRecord,
    calibration: CalibrationRecord,
}

impl ImuAssembler {
    pub fn new() -> Self {
        Self {
            assembler: Assembler::new(Template::imu()),
            status: StatusRecord::default(),
            calibration: CalibrationRecord::default(),
        }
    }

    pub fn apply(&mut self, frame: &ImuFrame) {
        match frame {
            ImuFrame::Acceleration([x, y, z]) => {
                // Gravity compensation on the vertical axis only.
                self.assembler.set("accX", Field::Float(*x));
                self.assembler.set("accY", Field::Float(*y));
                self.assembler.set("accZ", Field::Float(*z - GRAVITY));
            }
            ImuFrame::AngularRate([x, y, z]) => {
                self.assembler.set("gyroX", Field::Float(*x * DEG_TO_RAD));
                self.assembler.set("gyroY", Field::Float(*y * DEG_TO_RAD));
                self.assembler.set("gyroZ", Field::Float(*z * DEG_TO_RAD));
            }
            ImuFrame::Angle([roll, pitch, yaw]) => {
                self.assembler.set("roll", Field::Float(*roll * DEG_TO_RAD));
                self.assembler
                    .set("pitch", Field::Float(*pitch * DEG_TO_RAD));
                self.assembler.set("yaw", Field::Float(*yaw * DEG_TO_RAD));
            }
            ImuFrame::Quaternion([x, y, z, w]) => {
                self.assembler.set("qX", Field::Float(*x));
                self.assembler.set("qY", Field::Float(*y));
                self.assembler.set("qZ", Field::Float(*z));
                self.assembler.set("qW", Field::Float(*w));
            }
        }
        self.assembler.stamp_system_time(Utc::now());
    }

    pub fn try_complete(&mut self) -> Option<CompleteRecord> {
        self.assembler.try_complete(&self.status, &self.calibration)
    }
}

impl Default for ImuAssembler {
    fn default() -> Self {
        Self::new()
    }
}
