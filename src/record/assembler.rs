use super::{CalibrationRecord, CompleteRecord, Field, Record, StatusRecord, Template};
use chrono::{DateTime, Utc};
use std::sync::Arc;

// Accumulates field updates into a partial record and snapshots it the
// moment every template field has been set. Owned exclusively by one
// assembler stage; consumers only ever see the immutable snapshots.
#[derive(Debug)]
pub struct Assembler {
    current: Record,
}

impl Assembler {
    pub fn new(template: Arc<Template>) -> Self {
        Self {
            current: Record::empty(template),
        }
    }

    pub fn template(&self) -> &Arc<Template> {
        self.current.template()
    }

    pub fn set(&mut self, name: &str, value: Field) {
        self.current.set(name, value);
    }

    pub fn current(&self) -> &Record {
        &self.current
    }

    // Stamp wall-clock fields. ISO8601 text plus a millisecond-precision
    // epoch, the same pair every record family carries.
    pub fn stamp_system_time(&mut self, now: DateTime<Utc>) {
        self.current
            .set("systemtime", Field::Text(format_iso8601(now)));
        self.current
            .set("systemepoch", Field::Text(format_epoch(now)));
    }

    // Completion check: if every template field is non-absent, emit an
    // immutable snapshot merged with the caller's status records and reset
    // the partial record to all-absent. Status state is never reset here.
    pub fn try_complete(
        &mut self,
        status: &StatusRecord,
        calibration: &CalibrationRecord,
    ) -> Option<CompleteRecord> {
        if !self.current.is_complete() {
            return None;
        }

        let snapshot = CompleteRecord {
            template: Arc::clone(self.current.template()),
            values: self.current.canonical_values(),
            status: status.clone(),
            calibration: calibration.clone(),
        };
        self.current.reset();
        Some(snapshot)
    }
}

pub fn format_iso8601(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn format_epoch(at: DateTime<Utc>) -> String {
    format!("{:.3}", at.timestamp_micros() as f64 / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fill_except(assembler: &mut Assembler, skip: &str) {
        let names: Vec<&'static str> = assembler.template().fields().to_vec();
        for name in names {
            if name != skip {
                assembler.set(name, Field::Float(1.0));
            }
        }
    }

    #[test]
    fn no_snapshot_until_every_field_is_set() {
        let mut assembler = Assembler::new(Template::imu());
        let status = StatusRecord::default();
        let calib = CalibrationRecord::default();

        fill_except(&mut assembler, "qW");
        assert!(assembler.try_complete(&status, &calib).is_none());

        assembler.set("qW", Field::Float(1.0));
        let snapshot = assembler.try_complete(&status, &calib);
        assert!(snapshot.is_some());
        assert_eq!(snapshot.unwrap().values.len(), 15);
    }

    #[test]
    fn snapshot_resets_partial_but_not_status() {
        let mut assembler = Assembler::new(Template::imu());
        let mut status = StatusRecord::default();
        status.satellites = 9;
        let calib = CalibrationRecord::default();

        fill_except(&mut assembler, "");
        let first = assembler.try_complete(&status, &calib).unwrap();
        assert_eq!(first.status.satellites, 9);

        // Partial is all-absent again; the very next completion requires a
        // full new round of updates.
        assert!(assembler.try_complete(&status, &calib).is_none());
        assert!(!assembler.current().is_complete());
        assert_eq!(status.satellites, 9);
    }

    #[test]
    fn snapshot_carries_stale_status_values() {
        let mut assembler = Assembler::new(Template::gnss(false, false));
        let mut status = StatusRecord::default();
        status.fix_quality = 4;
        let calib = CalibrationRecord::default();

        fill_except(&mut assembler, "");
        let snapshot = assembler.try_complete(&status, &calib).unwrap();
        assert_eq!(snapshot.status.fix_quality, 4);
        let row = snapshot.csv_row();
        assert!(row.contains(",4,"));
    }

    #[test]
    fn system_time_stamp_formats() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
        assert_eq!(format_iso8601(at), "2025-03-14T15:09:26.000000Z");
        assert_eq!(format_epoch(at), "1741964966.000");
    }
}
