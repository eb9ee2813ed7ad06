pub mod decoder;
pub mod device;

use crate::record::assembler::{Assembler, format_epoch, format_iso8601};
use crate::record::{
    CalibState, CalibrationRecord, CompleteRecord, Field, ImuInitState, StatusRecord, Template,
};
use chrono::{NaiveDateTime, NaiveTime, Utc};
use std::sync::Arc;

const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

// One raw ESF measurement word: a sensor data-type code and its signed
// 24-bit value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EsfMeasurement {
    pub data_type: u8,
    pub value: i32,
}

// Per-sensor calibration entry from an ESF status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EsfSensorStatus {
    pub sensor_type: u8,
    pub calib_status: u8,
}

// GGA-class position/time fix. Columns the receiver left empty arrive as
// None and are stored as present-but-empty fields.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    pub time_of_day: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub quality: u8,
    pub satellites: u32,
    pub hdop: Option<f64>,
    pub altitude: Option<f64>,
    pub separation: Option<f64>,
    pub diff_age: Option<f64>,
    pub diff_station: String,
}

// The closed set of GNSS message identities this system consumes. Anything
// else the decoder sees becomes Unhandled and is ignored by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum GnssMessage {
    NavAttitude {
        roll_deg: f64,
        pitch_deg: f64,
        heading_deg: f64,
        acc_roll_deg: f64,
        acc_pitch_deg: f64,
        acc_heading_deg: f64,
    },
    EsfRawMeasurement {
        measurements: Vec<EsfMeasurement>,
    },
    EsfInsSolution {
        x_accel: f64,
        y_accel: f64,
        z_accel: f64,
    },
    EsfStatus {
        fusion_mode: u8,
        imu_init: u8,
        sensors: Vec<EsfSensorStatus>,
    },
    PositionFix(PositionFix),
    CourseOverGround {
        course_deg: Option<f64>,
    },
    CorrectionUsage {
        crc_failed: u32,
        msg_used: u32,
    },
    HighPrecisionEcef {
        p_acc_mm: f64,
    },
    HighPrecisionLlh {
        h_acc_mm: f64,
        v_acc_mm: f64,
    },
    BackupResponse {
        command: u8,
        response: u8,
    },
    Unhandled {
        identity: String,
    },
}

// ESF-MEAS data-type codes for the three gyro axes (values in milli-deg/s).
const ESF_GYRO_X: u8 = 16;
const ESF_GYRO_Y: u8 = 17;
const ESF_GYRO_Z: u8 = 18;

// Consumes decoded GNSS messages, applying one fixed update rule per
// identity to the partial record, the status record, or the calibration
// record. Owns all three exclusively.
pub struct GnssAssembler {
    assembler: Assembler,
    status: StatusRecord,
    calibration: CalibrationRecord,
}

impl GnssAssembler {
    pub fn new(template: Arc<Template>) -> Self {
        Self {
            assembler: Assembler::new(template),
            status: StatusRecord::default(),
            calibration: CalibrationRecord::default(),
        }
    }

    pub fn status(&self) -> &StatusRecord {
        &self.status
    }

    pub fn calibration(&self) -> &CalibrationRecord {
        &self.calibration
    }

    pub fn apply(&mut self, message: &GnssMessage) {
        match message {
            GnssMessage::NavAttitude {
                roll_deg,
                pitch_deg,
                heading_deg,
                acc_roll_deg,
                acc_pitch_deg,
                acc_heading_deg,
            } => {
                let roll = roll_deg * DEG_TO_RAD;
                let pitch = pitch_deg * DEG_TO_RAD;
                let yaw = heading_deg * DEG_TO_RAD;
                let [qx, qy, qz, qw] = quaternion_from_euler(roll, pitch, yaw);

                self.assembler.set("roll", Field::Float(roll));
                self.assembler.set("pitch", Field::Float(pitch));
                self.assembler.set("yaw", Field::Float(yaw));
                self.assembler.set("qX", Field::Float(qx));
                self.assembler.set("qY", Field::Float(qy));
                self.assembler.set("qZ", Field::Float(qz));
                self.assembler.set("qW", Field::Float(qw));
                self.assembler.set("azimuth", Field::Float(yaw));

                self.status.roll_acc = *acc_roll_deg;
                self.status.pitch_acc = *acc_pitch_deg;
                self.status.heading_acc = *acc_heading_deg;
            }
            GnssMessage::EsfRawMeasurement { measurements } => {
                for measurement in measurements {
                    let rate = f64::from(measurement.value) / 1000.0 * DEG_TO_RAD;
                    match measurement.data_type {
                        ESF_GYRO_X => self.assembler.set("gyroX", Field::Float(rate)),
                        ESF_GYRO_Y => self.assembler.set("gyroY", Field::Float(rate)),
                        ESF_GYRO_Z => self.assembler.set("gyroZ", Field::Float(rate)),
                        _ => {}
                    }
                }
            }
            GnssMessage::EsfInsSolution {
                x_accel,
                y_accel,
                z_accel,
            } => {
                self.assembler.set("accX", Field::Float(*x_accel));
                self.assembler.set("accY", Field::Float(*y_accel));
                self.assembler.set("accZ", Field::Float(*z_accel));
            }
            GnssMessage::EsfStatus {
                fusion_mode,
                imu_init,
                sensors,
            } => {
                self.status.fusion_mode = *fusion_mode;
                self.status.imu_init = ImuInitState::from_code(*imu_init);
                for sensor in sensors {
                    self.calibration.set_by_sensor_type(
                        sensor.sensor_type,
                        CalibState::from_code(sensor.calib_status),
                    );
                }
            }
            GnssMessage::PositionFix(fix) => {
                let now = Utc::now();
                self.assembler.stamp_system_time(now);

                match synthesize_gps_time(&fix.time_of_day, now) {
                    Some((iso, epoch)) => {
                        self.assembler.set("gpstime", Field::Text(iso));
                        self.assembler.set("gpsepoch", Field::Text(epoch));
                    }
                    None => {
                        self.assembler.set("gpstime", Field::Text(String::new()));
                        self.assembler.set("gpsepoch", Field::Text(String::new()));
                    }
                }

                self.assembler
                    .set("lat", Field::from_optional_float(fix.lat));
                self.assembler
                    .set("lon", Field::from_optional_float(fix.lon));
                self.assembler
                    .set("alt", Field::from_optional_float(fix.altitude));
                self.assembler
                    .set("sep", Field::from_optional_float(fix.separation));
                self.assembler
                    .set("fix", Field::Int(i64::from(fix.quality)));
                self.assembler
                    .set("sip", Field::Int(i64::from(fix.satellites)));
                self.assembler
                    .set("hdop", Field::from_optional_float(fix.hdop));
                self.assembler
                    .set("diffage", Field::from_optional_float(fix.diff_age));
                self.assembler
                    .set("diffstation", Field::Text(fix.diff_station.clone()));

                self.status.fix_quality = fix.quality;
                self.status.satellites = fix.satellites;
            }
            GnssMessage::CourseOverGround { course_deg } => {
                self.assembler
                    .set("azimuth", Field::from_optional_float(*course_deg));
            }
            GnssMessage::CorrectionUsage {
                crc_failed,
                msg_used,
            } => {
                self.status.rtcm_crc_failed = *crc_failed;
                self.status.rtcm_msg_used = *msg_used;
            }
            GnssMessage::HighPrecisionEcef { p_acc_mm } => {
                self.assembler
                    .set("pAcc3d", Field::Float(p_acc_mm / 1000.0));
            }
            GnssMessage::HighPrecisionLlh { h_acc_mm, v_acc_mm } => {
                self.assembler
                    .set("hAcc2d", Field::Float(h_acc_mm / 1000.0));
                self.assembler
                    .set("vAcc2d", Field::Float(v_acc_mm / 1000.0));
                self.status.h_acc = h_acc_mm / 1000.0;
                self.status.v_acc = v_acc_mm / 1000.0;
            }
            // Maintenance acks are consumed by the backup command, not the
            // steady-state record path.
            GnssMessage::BackupResponse { .. } => {}
            GnssMessage::Unhandled { .. } => {}
        }
    }

    pub fn try_complete(&mut self) -> Option<CompleteRecord> {
        self.assembler.try_complete(&self.status, &self.calibration)
    }
}

// ISO8601 GPS time synthesized from a GGA time-of-day ("hhmmss.sss") and
// today's UTC date, plus the matching epoch string.
fn synthesize_gps_time(time_of_day: &str, now: chrono::DateTime<Utc>) -> Option<(String, String)> {
    let (hms, frac) = match time_of_day.split_once('.') {
        Some((head, tail)) => (head, tail),
        None => (time_of_day, ""),
    };
    if hms.len() != 6 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let mut micros_text = frac.to_string();
    while micros_text.len() < 6 {
        micros_text.push('0');
    }
    let micros: u32 = micros_text.get(..6)?.parse().ok()?;

    let hour: u32 = hms.get(..2)?.parse().ok()?;
    let minute: u32 = hms.get(2..4)?.parse().ok()?;
    let second: u32 = hms.get(4..6)?.parse().ok()?;
    let time = NaiveTime::from_hms_micro_opt(hour, minute, second, micros)?;
    let stamp = NaiveDateTime::new(now.date_naive(), time).and_utc();
    Some((format_iso8601(stamp), format_epoch(stamp)))
}

// Quaternion derived from the roll-pitch-yaw triple by composing the three
// elemental rotations in x-y-z order. Components returned as (x, y, z, w).
pub fn quaternion_from_euler(roll: f64, pitch: f64, yaw: f64) -> [f64; 4] {
    let qx = [(roll / 2.0).sin(), 0.0, 0.0, (roll / 2.0).cos()];
    let qy = [0.0, (pitch / 2.0).sin(), 0.0, (pitch / 2.0).cos()];
    let qz = [0.0, 0.0, (yaw / 2.0).sin(), (yaw / 2.0).cos()];
    quat_mul(quat_mul(qx, qy), qz)
}

// Hamilton product over (x, y, z, w) component order.
fn quat_mul(a: [f64; 4], b: [f64; 4]) -> [f64; 4] {
    let [ax, ay, az, aw] = a;
    let [bx, by, bz, bw] = b;
    [
        aw * bx + ax * bw + ay * bz - az * by,
        aw * by - ax * bz + ay * bw + az * bx,
        aw * bz + ax * by - ay * bx + az * bw,
        aw * bw - ax * bx - ay * by - az * bz,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gga(quality: u8, lat: Option<f64>, lon: Option<f64>) -> GnssMessage {
        GnssMessage::PositionFix(PositionFix {
            time_of_day: "123519.00".to_string(),
            lat,
            lon,
            quality,
            satellites: 8,
            hdop: Some(0.9),
            altitude: Some(545.4),
            separation: Some(46.9),
            diff_age: None,
            diff_station: String::new(),
        })
    }

    #[test]
    fn identity_quaternion_for_zero_angles() {
        let [x, y, z, w] = quaternion_from_euler(0.0, 0.0, 0.0);
        assert_relative_eq!(x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(z, 0.0, epsilon = 1e-12);
        assert_relative_eq!(w, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn single_axis_quaternions() {
        let half = std::f64::consts::FRAC_PI_4;
        let [x, _, _, w] = quaternion_from_euler(std::f64::consts::FRAC_PI_2, 0.0, 0.0);
        assert_relative_eq!(x, half.sin(), epsilon = 1e-12);
        assert_relative_eq!(w, half.cos(), epsilon = 1e-12);

        let [_, _, z, w] = quaternion_from_euler(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        assert_relative_eq!(z, half.sin(), epsilon = 1e-12);
        assert_relative_eq!(w, half.cos(), epsilon = 1e-12);
    }

    #[test]
    fn derived_quaternion_is_unit_norm() {
        let [x, y, z, w] = quaternion_from_euler(0.3, -0.7, 2.1);
        let norm = (x * x + y * y + z * z + w * w).sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn attitude_updates_record_and_status() {
        let mut assembler = GnssAssembler::new(Template::gnss(true, false));
        assembler.apply(&GnssMessage::NavAttitude {
            roll_deg: 10.0,
            pitch_deg: -5.0,
            heading_deg: 90.0,
            acc_roll_deg: 0.5,
            acc_pitch_deg: 0.4,
            acc_heading_deg: 1.2,
        });

        match assembler.assembler.current().get("yaw").unwrap() {
            Field::Float(yaw) => assert_relative_eq!(*yaw, 90.0 * DEG_TO_RAD, epsilon = 1e-12),
            other => panic!("unexpected field: {other:?}"),
        }
        match assembler.assembler.current().get("azimuth").unwrap() {
            Field::Float(azimuth) => {
                assert_relative_eq!(*azimuth, 90.0 * DEG_TO_RAD, epsilon = 1e-12)
            }
            other => panic!("unexpected field: {other:?}"),
        }
        assert_relative_eq!(assembler.status().heading_acc, 1.2, epsilon = 1e-12);
        assert!(assembler.assembler.current().get("qW").is_some());
    }

    #[test]
    fn raw_measurements_select_axis_by_type_code() {
        let mut assembler = GnssAssembler::new(Template::gnss(true, false));
        assembler.apply(&GnssMessage::EsfRawMeasurement {
            measurements: vec![
                EsfMeasurement {
                    data_type: 16,
                    value: 1000,
                },
                EsfMeasurement {
                    data_type: 18,
                    value: -2000,
                },
                EsfMeasurement {
                    data_type: 99,
                    value: 5,
                },
            ],
        });

        match assembler.assembler.current().get("gyroX").unwrap() {
            Field::Float(x) => assert_relative_eq!(*x, DEG_TO_RAD, epsilon = 1e-12),
            other => panic!("unexpected field: {other:?}"),
        }
        match assembler.assembler.current().get("gyroZ").unwrap() {
            Field::Float(z) => assert_relative_eq!(*z, -2.0 * DEG_TO_RAD, epsilon = 1e-12),
            other => panic!("unexpected field: {other:?}"),
        }
        assert!(assembler.assembler.current().get("gyroY").unwrap().is_absent());
    }

    #[test]
    fn esf_status_drives_calibration_table() {
        let mut assembler = GnssAssembler::new(Template::gnss(false, false));
        assembler.apply(&GnssMessage::EsfStatus {
            fusion_mode: 1,
            imu_init: 2,
            sensors: vec![
                EsfSensorStatus {
                    sensor_type: 5,
                    calib_status: 3,
                },
                EsfSensorStatus {
                    sensor_type: 14,
                    calib_status: 1,
                },
            ],
        });
        assert_eq!(assembler.status().fusion_mode, 1);
        assert_eq!(assembler.status().imu_init, ImuInitState::Initialized);
        assert_eq!(assembler.calibration().gyro_x, CalibState::Calibrated);
        assert_eq!(assembler.calibration().acc_y, CalibState::Calibrating);
        assert_eq!(assembler.calibration().acc_z, CalibState::NotCalibrated);
    }

    #[test]
    fn gga_and_vtg_complete_the_base_template() {
        let mut assembler = GnssAssembler::new(Template::gnss(false, false));
        assembler.apply(&gga(1, Some(53.52), Some(-113.51)));
        assert!(assembler.try_complete().is_none());

        assembler.apply(&GnssMessage::CourseOverGround {
            course_deg: Some(214.8),
        });
        let record = assembler.try_complete().expect("complete after GGA+VTG");
        assert_eq!(record.field("fix"), Some("1"));
        assert_eq!(record.field("sip"), Some("8"));
        assert_eq!(record.field("lat"), Some("53.52"));
        assert_eq!(record.field("diffage"), Some(""));
        let gpstime = record.field("gpstime").unwrap();
        assert!(gpstime.ends_with("T12:35:19.000000Z"), "got {gpstime}");
    }

    #[test]
    fn no_fix_gga_still_completes_with_empty_position() {
        let mut assembler = GnssAssembler::new(Template::gnss(false, false));
        assembler.apply(&gga(0, None, None));
        assembler.apply(&GnssMessage::CourseOverGround { course_deg: None });
        let record = assembler.try_complete().expect("empty columns still count");
        assert_eq!(record.field("lat"), Some(""));
        assert_eq!(record.field("fix"), Some("0"));
    }

    #[test]
    fn unhandled_identities_change_nothing() {
        let mut assembler = GnssAssembler::new(Template::gnss(false, false));
        assembler.apply(&GnssMessage::Unhandled {
            identity: "NAV-SAT".to_string(),
        });
        assert!(!assembler.assembler.current().is_complete());
        assert_eq!(assembler.status().satellites, 0);
    }

    #[test]
    fn high_precision_accuracies_convert_to_meters() {
        let mut assembler = GnssAssembler::new(Template::gnss(false, true));
        assembler.apply(&GnssMessage::HighPrecisionLlh {
            h_acc_mm: 14.0,
            v_acc_mm: 20.0,
        });
        assembler.apply(&GnssMessage::HighPrecisionEcef { p_acc_mm: 25.0 });
        match assembler.assembler.current().get("hAcc2d").unwrap() {
            Field::Float(h) => assert_relative_eq!(*h, 0.014, epsilon = 1e-12),
            other => panic!("unexpected field: {other:?}"),
        }
        match assembler.assembler.current().get("pAcc3d").unwrap() {
            Field::Float(p) => assert_relative_eq!(*p, 0.025, epsilon = 1e-12),
            other => panic!("unexpected field: {other:?}"),
        }
    }

    #[test]
    fn fusion_template_requires_both_sensor_families() {
        let mut assembler = GnssAssembler::new(Template::gnss(true, false));
        assembler.apply(&gga(4, Some(53.5), Some(-113.5)));
        assembler.apply(&GnssMessage::CourseOverGround {
            course_deg: Some(10.0),
        });
        // GNSS family alone never completes a fusion record.
        assert!(assembler.try_complete().is_none());

        assembler.apply(&GnssMessage::NavAttitude {
            roll_deg: 0.0,
            pitch_deg: 0.0,
            heading_deg: 0.0,
            acc_roll_deg: 0.0,
            acc_pitch_deg: 0.0,
            acc_heading_deg: 0.0,
        });
        assembler.apply(&GnssMessage::EsfRawMeasurement {
            measurements: vec![
                EsfMeasurement {
                    data_type: 16,
                    value: 0,
                },
                EsfMeasurement {
                    data_type: 17,
                    value: 0,
                },
                EsfMeasurement {
                    data_type: 18,
                    value: 0,
                },
            ],
        });
        assert!(assembler.try_complete().is_none());

        assembler.apply(&GnssMessage::EsfInsSolution {
            x_accel: 0.1,
            y_accel: 0.2,
            z_accel: 9.8,
        });
        assert!(assembler.try_complete().is_some());
    }
}
