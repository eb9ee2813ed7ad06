use super::{EsfMeasurement, EsfSensorStatus, GnssMessage, PositionFix};

pub const SYNC1: u8 = 0xB5;
pub const SYNC2: u8 = 0x62;

const MAX_PAYLOAD_LEN: usize = 512;
const MAX_SENTENCE_LEN: usize = 160;

// Incremental splitter for the receiver's interleaved UBX binary and NMEA
// text output. Feed arbitrary byte slices; complete messages come out as
// (raw bytes, decoded message) pairs. Truncated or checksum-failed units
// are dropped silently and the scan resynchronizes.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8], out: &mut Vec<(Vec<u8>, GnssMessage)>) {
        self.buf.extend_from_slice(bytes);
        loop {
            // Align to the next plausible message start.
            match self.buf.iter().position(|b| *b == SYNC1 || *b == b'$') {
                Some(0) => {}
                Some(skip) => {
                    self.buf.drain(..skip);
                }
                None => {
                    self.buf.clear();
                    return;
                }
            }

            if self.buf[0] == SYNC1 {
                if !self.take_ubx(out) {
                    return;
                }
            } else if !self.take_nmea(out) {
                return;
            }
        }
    }

    // Returns false when more bytes are needed before progress can be made.
    fn take_ubx(&mut self, out: &mut Vec<(Vec<u8>, GnssMessage)>) -> bool {
        if self.buf.len() < 2 {
            return false;
        }
        if self.buf[1] != SYNC2 {
            self.buf.drain(..1);
            return true;
        }
        if self.buf.len() < 6 {
            return false;
        }

        let payload_len = usize::from(u16::from_le_bytes([self.buf[4], self.buf[5]]));
        if payload_len > MAX_PAYLOAD_LEN {
            self.buf.drain(..2);
            return true;
        }
        let total = 8 + payload_len;
        if self.buf.len() < total {
            return false;
        }

        let packet: Vec<u8> = self.buf.drain(..total).collect();
        let (ck_a, ck_b) = checksum(&packet[2..total - 2]);
        if ck_a != packet[total - 2] || ck_b != packet[total - 1] {
            return true;
        }

        let message = decode_ubx(packet[2], packet[3], &packet[6..total - 2]);
        out.push((packet, message));
        true
    }

    fn take_nmea(&mut self, out: &mut Vec<(Vec<u8>, GnssMessage)>) -> bool {
        let Some(end) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > MAX_SENTENCE_LEN {
                // Never a complete sentence; discard the lead byte and rescan.
                self.buf.drain(..1);
                return true;
            }
            return false;
        };

        let line: Vec<u8> = self.buf.drain(..=end).collect();
        if let Ok(text) = std::str::from_utf8(&line) {
            let sentence = text.trim_end_matches(['\r', '\n']);
            if sentence.starts_with('$') && sentence.len() > 1 {
                let message = decode_nmea(sentence);
                out.push((line.clone(), message));
            }
        }
        true
    }
}

// UBX Fletcher checksum over class/id/length/payload bytes.
pub fn checksum(data: &[u8]) -> (u8, u8) {
    let mut ck_a = 0_u8;
    let mut ck_b = 0_u8;
    for byte in data {
        ck_a = ck_a.wrapping_add(*byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    (ck_a, ck_b)
}

// Build a full UBX packet with header, little-endian length, and checksum.
pub fn encode_packet(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + 8);
    packet.extend_from_slice(&[SYNC1, SYNC2, class, id]);
    packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    packet.extend_from_slice(payload);
    let (ck_a, ck_b) = checksum(&packet[2..]);
    packet.push(ck_a);
    packet.push(ck_b);
    packet
}

fn decode_ubx(class: u8, id: u8, payload: &[u8]) -> GnssMessage {
    match (class, id) {
        (0x01, 0x05) => decode_nav_att(payload),
        (0x01, 0x13) => decode_hpposecef(payload),
        (0x01, 0x14) => decode_hpposllh(payload),
        (0x02, 0x32) => decode_rxm_rtcm(payload),
        (0x09, 0x14) => decode_upd_sos(payload),
        (0x10, 0x02) => decode_esf_meas(payload),
        (0x10, 0x10) => decode_esf_status(payload),
        (0x10, 0x15) => decode_esf_ins(payload),
        _ => GnssMessage::Unhandled {
            identity: format!("UBX-{class:02X}-{id:02X}"),
        },
    }
}

fn decode_nav_att(payload: &[u8]) -> GnssMessage {
    if payload.len() < 32 {
        return unhandled_short("NAV-ATT");
    }
    GnssMessage::NavAttitude {
        roll_deg: f64::from(read_i32(payload, 8)) * 1e-5,
        pitch_deg: f64::from(read_i32(payload, 12)) * 1e-5,
        heading_deg: f64::from(read_i32(payload, 16)) * 1e-5,
        acc_roll_deg: f64::from(read_u32(payload, 20)) * 1e-5,
        acc_pitch_deg: f64::from(read_u32(payload, 24)) * 1e-5,
        acc_heading_deg: f64::from(read_u32(payload, 28)) * 1e-5,
    }
}

fn decode_esf_meas(payload: &[u8]) -> GnssMessage {
    if payload.len() < 8 {
        return unhandled_short("ESF-MEAS");
    }
    let flags = u16::from_le_bytes([payload[4], payload[5]]);
    let num_meas = usize::from((flags >> 11) & 0x1F);
    let mut measurements = Vec::with_capacity(num_meas);
    for index in 0..num_meas {
        let offset = 8 + index * 4;
        if payload.len() < offset + 4 {
            break;
        }
        let word = read_u32(payload, offset);
        // dataField is a signed 24-bit quantity in the low bits.
        let value = ((word as i32) << 8) >> 8;
        let data_type = ((word >> 24) & 0x3F) as u8;
        measurements.push(EsfMeasurement { data_type, value });
    }
    GnssMessage::EsfRawMeasurement { measurements }
}

fn decode_esf_ins(payload: &[u8]) -> GnssMessage {
    if payload.len() < 36 {
        return unhandled_short("ESF-INS");
    }
    GnssMessage::EsfInsSolution {
        x_accel: f64::from(read_i32(payload, 24)) * 1e-2,
        y_accel: f64::from(read_i32(payload, 28)) * 1e-2,
        z_accel: f64::from(read_i32(payload, 32)) * 1e-2,
    }
}

fn decode_esf_status(payload: &[u8]) -> GnssMessage {
    if payload.len() < 16 {
        return unhandled_short("ESF-STATUS");
    }
    let num_sens = usize::from(payload[15]);
    let mut sensors = Vec::with_capacity(num_sens);
    for index in 0..num_sens {
        let offset = 16 + index * 4;
        if payload.len() < offset + 4 {
            break;
        }
        sensors.push(EsfSensorStatus {
            sensor_type: payload[offset] & 0x3F,
            calib_status: payload[offset + 1] & 0x03,
        });
    }
    GnssMessage::EsfStatus {
        fusion_mode: payload[12],
        imu_init: payload[6] & 0x03,
        sensors,
    }
}

fn decode_rxm_rtcm(payload: &[u8]) -> GnssMessage {
    if payload.len() < 8 {
        return unhandled_short("RXM-RTCM");
    }
    let flags = payload[1];
    GnssMessage::CorrectionUsage {
        crc_failed: u32::from(flags & 0x01),
        msg_used: u32::from((flags >> 1) & 0x03),
    }
}

fn decode_hpposecef(payload: &[u8]) -> GnssMessage {
    if payload.len() < 28 {
        return unhandled_short("NAV-HPPOSECEF");
    }
    GnssMessage::HighPrecisionEcef {
        p_acc_mm: f64::from(read_u32(payload, 24)) * 0.1,
    }
}

fn decode_hpposllh(payload: &[u8]) -> GnssMessage {
    if payload.len() < 36 {
        return unhandled_short("NAV-HPPOSLLH");
    }
    GnssMessage::HighPrecisionLlh {
        h_acc_mm: f64::from(read_u32(payload, 28)) * 0.1,
        v_acc_mm: f64::from(read_u32(payload, 32)) * 0.1,
    }
}

fn decode_upd_sos(payload: &[u8]) -> GnssMessage {
    if payload.len() < 8 {
        return unhandled_short("UPD-SOS");
    }
    GnssMessage::BackupResponse {
        command: payload[0],
        response: payload[4],
    }
}

fn unhandled_short(identity: &str) -> GnssMessage {
    GnssMessage::Unhandled {
        identity: identity.to_string(),
    }
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ])
}

fn read_i32(payload: &[u8], offset: usize) -> i32 {
    read_u32(payload, offset) as i32
}

fn decode_nmea(sentence: &str) -> GnssMessage {
    let Some(fields) = parse_nmea_fields(sentence) else {
        return GnssMessage::Unhandled {
            identity: sentence.chars().take(8).collect(),
        };
    };
    let head = field(&fields, 0);
    let message_id = if head.len() >= 3 {
        &head[head.len() - 3..]
    } else {
        head
    };

    match message_id {
        "GGA" => GnssMessage::PositionFix(PositionFix {
            time_of_day: field(&fields, 1).to_string(),
            lat: parse_coord(field(&fields, 2), field(&fields, 3), 2),
            lon: parse_coord(field(&fields, 4), field(&fields, 5), 3),
            quality: field(&fields, 6).parse().unwrap_or(0),
            satellites: field(&fields, 7).parse().unwrap_or(0),
            hdop: parse_f64(field(&fields, 8)),
            altitude: parse_f64(field(&fields, 9)),
            separation: parse_f64(field(&fields, 11)),
            diff_age: parse_f64(field(&fields, 13)),
            diff_station: field(&fields, 14).to_string(),
        }),
        "VTG" => GnssMessage::CourseOverGround {
            course_deg: parse_f64(field(&fields, 1)),
        },
        _ => GnssMessage::Unhandled {
            identity: head.to_string(),
        },
    }
}

fn parse_nmea_fields(sentence: &str) -> Option<Vec<&str>> {
    let core = sentence
        .strip_prefix('$')?
        .split('*')
        .next()
        .unwrap_or_default();
    Some(core.split(',').collect())
}

fn field<'a>(fields: &'a [&'a str], idx: usize) -> &'a str {
    fields.get(idx).copied().unwrap_or("")
}

fn parse_f64(raw: &str) -> Option<f64> {
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok()
}

// NMEA ddmm.mmmm coordinate with hemisphere letter; degree_digits is 2 for
// latitude and 3 for longitude.
fn parse_coord(value: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if value.len() <= degree_digits {
        return None;
    }
    let (deg_str, min_str) = value.split_at(degree_digits);
    let degrees = deg_str.parse::<f64>().ok()?;
    let minutes = min_str.parse::<f64>().ok()?;

    let mut decimal = degrees + minutes / 60.0;
    if hemisphere == "S" || hemisphere == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}
