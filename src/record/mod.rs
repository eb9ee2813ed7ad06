pub mod assembler;

use std::fmt;
use std::sync::Arc;

// IMU-derived fields shared by the IMU template and the GNSS fusion template.
const IMU_FIELDS: [&str; 13] = [
    "roll", "pitch", "yaw", "accX", "accY", "accZ", "gyroX", "gyroY", "gyroZ", "qX", "qY", "qZ",
    "qW",
];

// GNSS fields filled by GGA and VTG sentences.
const GNSS_FIELDS: [&str; 12] = [
    "gpstime",
    "gpsepoch",
    "lat",
    "lon",
    "alt",
    "sep",
    "fix",
    "sip",
    "hdop",
    "diffage",
    "diffstation",
    "azimuth",
];

// High-precision accuracy fields, present only when the receiver is
// configured to emit NAV-HPPOS* messages.
const HIGH_PRECISION_FIELDS: [&str; 3] = ["hAcc2d", "vAcc2d", "pAcc3d"];

const TIME_FIELDS: [&str; 2] = ["systemtime", "systemepoch"];

// A single named scalar in a record. Absent fields block record completion;
// empty text counts as present (an empty GGA column was still reported).
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Absent,
    Float(f64),
    Int(i64),
    Text(String),
}

impl Field {
    pub fn is_absent(&self) -> bool {
        matches!(self, Field::Absent)
    }

    // Canonical string form used for persistence and display.
    pub fn canonical(&self) -> String {
        match self {
            Field::Absent => String::new(),
            Field::Float(value) => format!("{value}"),
            Field::Int(value) => format!("{value}"),
            Field::Text(value) => value.clone(),
        }
    }

    // Map an optionally-parsed numeric column: parsed values become floats,
    // reported-but-empty columns become present empty text.
    pub fn from_optional_float(value: Option<f64>) -> Self {
        match value {
            Some(v) => Field::Float(v),
            None => Field::Text(String::new()),
        }
    }
}

// The fixed, ordered set of field names a complete record must carry for one
// operating mode. Built once at startup and shared by the assembler, the
// persistence sink, and the display side.
#[derive(Debug)]
pub struct Template {
    fields: Vec<&'static str>,
}

impl Template {
    // IMU-only template: snapshot timestamps plus the twelve WitMotion axes
    // and the four quaternion components.
    pub fn imu() -> Arc<Self> {
        let mut fields: Vec<&'static str> = TIME_FIELDS.to_vec();
        fields.extend_from_slice(&IMU_FIELDS);
        Arc::new(Self { fields })
    }

    // GNSS template, optionally extended with the IMU field family (fusion
    // mode) and the high-precision accuracy fields.
    pub fn gnss(fusion: bool, high_precision: bool) -> Arc<Self> {
        let mut fields: Vec<&'static str> = TIME_FIELDS.to_vec();
        fields.extend_from_slice(&GNSS_FIELDS);
        if high_precision {
            fields.extend_from_slice(&HIGH_PRECISION_FIELDS);
        }
        if fusion {
            fields.extend_from_slice(&IMU_FIELDS);
        }
        Arc::new(Self { fields })
    }

    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| *field == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// A template-shaped mutable record being filled in by message updates.
// The key set is fixed at creation; updates for names outside the template
// are ignored.
#[derive(Debug, Clone)]
pub struct Record {
    template: Arc<Template>,
    values: Vec<Field>,
}

impl Record {
    pub fn empty(template: Arc<Template>) -> Self {
        let values = vec![Field::Absent; template.len()];
        Self { template, values }
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    pub fn set(&mut self, name: &str, value: Field) {
        if let Some(index) = self.template.index_of(name) {
            self.values[index] = value;
        }
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.template.index_of(name).map(|index| &self.values[index])
    }

    pub fn is_complete(&self) -> bool {
        self.values.iter().all(|value| !value.is_absent())
    }

    pub fn reset(&mut self) {
        for value in &mut self.values {
            *value = Field::Absent;
        }
    }

    pub fn canonical_values(&self) -> Vec<String> {
        self.values.iter().map(Field::canonical).collect()
    }
}

// Tri-state IMU initialization reported by ESF-STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImuInitState {
    Uninitialized,
    Initializing,
    Initialized,
}

impl ImuInitState {
    pub fn from_code(code: u8) -> Self {
        match code {
            2 => ImuInitState::Initialized,
            1 => ImuInitState::Initializing,
            _ => ImuInitState::Uninitialized,
        }
    }
}

impl fmt::Display for ImuInitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ImuInitState::Uninitialized => "Uninitialized",
            ImuInitState::Initializing => "Initializing",
            ImuInitState::Initialized => "Initialized",
        };
        f.write_str(text)
    }
}

// Tri-state per-axis calibration reported by ESF-STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibState {
    NotCalibrated,
    Calibrating,
    Calibrated,
}

impl CalibState {
    pub fn from_code(code: u8) -> Self {
        match code {
            2 | 3 => CalibState::Calibrated,
            1 => CalibState::Calibrating,
            _ => CalibState::NotCalibrated,
        }
    }
}

impl fmt::Display for CalibState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CalibState::NotCalibrated => "Not Calibrated",
            CalibState::Calibrating => "Calibrating",
            CalibState::Calibrated => "Calibrated",
        };
        f.write_str(text)
    }
}

// Receiver status updated independently of the current record. Not part of
// the completion predicate; merged onto each snapshot as-is.
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub fusion_mode: u8,
    pub imu_init: ImuInitState,
    pub fix_quality: u8,
    pub satellites: u32,
    pub h_acc: f64,
    pub v_acc: f64,
    pub roll_acc: f64,
    pub pitch_acc: f64,
    pub heading_acc: f64,
    pub rtcm_crc_failed: u32,
    pub rtcm_msg_used: u32,
}

impl StatusRecord {
    pub const FIELD_NAMES: [&'static str; 11] = [
        "fusionMode",
        "imuStatus",
        "gpsFix",
        "nvSat",
        "gpsHAcc",
        "gpsVAcc",
        "rollAcc",
        "pitchAcc",
        "yawAcc",
        "rtcmCrcFailed",
        "rtcmMsgUsed",
    ];

    pub fn canonical_values(&self) -> Vec<String> {
        vec![
            format!("{}", self.fusion_mode),
            format!("{}", self.imu_init),
            format!("{}", self.fix_quality),
            format!("{}", self.satellites),
            format!("{}", self.h_acc),
            format!("{}", self.v_acc),
            format!("{}", self.roll_acc),
            format!("{}", self.pitch_acc),
            format!("{}", self.heading_acc),
            format!("{}", self.rtcm_crc_failed),
            format!("{}", self.rtcm_msg_used),
        ]
    }
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self {
            fusion_mode: 0,
            imu_init: ImuInitState::Uninitialized,
            fix_quality: 0,
            satellites: 0,
            h_acc: 0.0,
            v_acc: 0.0,
            roll_acc: 0.0,
            pitch_acc: 0.0,
            heading_acc: 0.0,
            rtcm_crc_failed: 0,
            rtcm_msg_used: 0,
        }
    }
}

// Per-axis calibration state keyed by the fixed ESF sensor-type table.
#[derive(Debug, Clone)]
pub struct CalibrationRecord {
    pub gyro_x: CalibState,
    pub gyro_y: CalibState,
    pub gyro_z: CalibState,
    pub acc_x: CalibState,
    pub acc_y: CalibState,
    pub acc_z: CalibState,
}

impl CalibrationRecord {
    pub const FIELD_NAMES: [&'static str; 6] = [
        "gyroX_calib",
        "gyroY_calib",
        "gyroZ_calib",
        "accX_calib",
        "accY_calib",
        "accZ_calib",
    ];

    // ESF-STATUS sensor-type codes mapped to calibration slots.
    pub fn set_by_sensor_type(&mut self, sensor_type: u8, state: CalibState) {
        match sensor_type {
            5 => self.gyro_x = state,
            17 => self.gyro_y = state,
            18 => self.gyro_z = state,
            13 => self.acc_x = state,
            14 => self.acc_y = state,
            16 => self.acc_z = state,
            _ => {}
        }
    }

    pub fn fully_calibrated(&self) -> bool {
        [
            self.gyro_x, self.gyro_y, self.gyro_z, self.acc_x, self.acc_y, self.acc_z,
        ]
        .iter()
        .all(|state| *state == CalibState::Calibrated)
    }

    pub fn canonical_values(&self) -> Vec<String> {
        [
            self.gyro_x, self.gyro_y, self.gyro_z, self.acc_x, self.acc_y, self.acc_z,
        ]
        .iter()
        .map(|state| state.to_string())
        .collect()
    }
}

impl Default for CalibrationRecord {
    fn default() -> Self {
        Self {
            gyro_x: CalibState::NotCalibrated,
            gyro_y: CalibState::NotCalibrated,
            gyro_z: CalibState::NotCalibrated,
            acc_x: CalibState::NotCalibrated,
            acc_y: CalibState::NotCalibrated,
            acc_z: CalibState::NotCalibrated,
        }
    }
}

// Immutable snapshot of a completed record merged with the status and
// calibration state as of snapshot time. Moves between stages by value.
#[derive(Debug, Clone)]
pub struct CompleteRecord {
    pub template: Arc<Template>,
    pub values: Vec<String>,
    pub status: StatusRecord,
    pub calibration: CalibrationRecord,
}

impl CompleteRecord {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.template
            .index_of(name)
            .map(|index| self.values[index].as_str())
    }

    // Header line: template fields, then status, then calibration, in the
    // fixed order the rows are written in.
    pub fn csv_header(template: &Template) -> String {
        let mut names: Vec<&str> = template.fields().to_vec();
        names.extend_from_slice(&StatusRecord::FIELD_NAMES);
        names.extend_from_slice(&CalibrationRecord::FIELD_NAMES);
        names.join(",")
    }

    pub fn csv_row(&self) -> String {
        let mut columns = self.values.clone();
        columns.extend(self.status.canonical_values());
        columns.extend(self.calibration.canonical_values());
        columns.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_have_fixed_field_order() {
        let imu = Template::imu();
        assert_eq!(imu.fields()[0], "systemtime");
        assert_eq!(imu.fields()[1], "systemepoch");
        assert_eq!(imu.len(), 15);

        let gnss = Template::gnss(false, false);
        assert_eq!(gnss.len(), 14);
        assert!(gnss.index_of("lat").is_some());
        assert!(gnss.index_of("roll").is_none());

        let fusion = Template::gnss(true, true);
        assert_eq!(fusion.len(), 14 + 3 + 13);
        assert!(fusion.index_of("hAcc2d").is_some());
        assert!(fusion.index_of("qW").is_some());
    }

    #[test]
    fn record_ignores_names_outside_template() {
        let mut record = Record::empty(Template::gnss(false, false));
        record.set("roll", Field::Float(1.0));
        assert!(record.get("roll").is_none());
        record.set("lat", Field::Float(53.5));
        assert_eq!(record.get("lat"), Some(&Field::Float(53.5)));
    }

    #[test]
    fn empty_text_counts_as_present() {
        let mut record = Record::empty(Template::imu());
        assert!(!record.is_complete());
        for name in Template::imu().fields() {
            record.set(name, Field::Text(String::new()));
        }
        assert!(record.is_complete());
    }

    #[test]
    fn canonical_float_keeps_precision() {
        assert_eq!(Field::Float(0.123456789012345).canonical(), "0.123456789012345");
        assert_eq!(Field::Float(16.0).canonical(), "16");
        assert_eq!(Field::Int(-3).canonical(), "-3");
        assert_eq!(Field::Absent.canonical(), "");
    }

    #[test]
    fn csv_header_covers_all_column_groups() {
        let template = Template::gnss(false, false);
        let header = CompleteRecord::csv_header(&template);
        let columns: Vec<&str> = header.split(',').collect();
        assert_eq!(columns.len(), template.len() + 11 + 6);
        assert_eq!(columns[0], "systemtime");
        assert_eq!(columns[template.len()], "fusionMode");
        assert_eq!(columns.last(), Some(&"accZ_calib"));
    }

    #[test]
    fn calibration_table_addresses_expected_axes() {
        let mut calib = CalibrationRecord::default();
        for code in [5, 13, 14, 16, 17, 18] {
            calib.set_by_sensor_type(code, CalibState::Calibrated);
        }
        assert!(calib.fully_calibrated());
        calib.set_by_sensor_type(99, CalibState::NotCalibrated);
        assert!(calib.fully_calibrated());
    }
}
