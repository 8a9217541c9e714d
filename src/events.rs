use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::serial::LinkState;

/// One tag seen at one reader.
#[derive(Debug, Clone, Serialize)]
pub struct RfidDetection {
    pub reader_id: u32,
    pub reader_name: String,
    pub tag: i64,
    pub timestamp: DateTime<Utc>,
}

/// One converted measurement from a balance. `locked` implies `stable` and a
/// non-null tag; only locked readings are persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MassReading {
    pub balance_id: u32,
    pub balance_name: String,
    pub reader_id: u32,
    pub reader_name: String,
    pub tag: Option<i64>,
    pub mass_kg: f64,
    pub timestamp: DateTime<Utc>,
    pub stable: bool,
    pub locked: bool,
}

/// Emitted whenever a soft tare or calibrate-to-reference lands.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub balance_id: u32,
    pub balance_name: String,
    pub zero_value: Option<i64>,
    pub refload_value: Option<i64>,
    pub refload_mass_kg: f64,
}

/// Everything the device threads report upstream to the supervisor.
#[derive(Debug)]
pub enum DeviceEvent {
    Rfid(RfidDetection),
    Mass(MassReading),
    Calibration(CalibrationReport),
    Link {
        device_id: u32,
        name: String,
        state: LinkState,
    },
    Fault {
        device_id: u32,
        name: String,
        message: String,
    },
}

pub fn iso8601(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_render_with_microseconds() {
        let ts = Utc.with_ymd_and_hms(2016, 3, 1, 12, 30, 5).unwrap()
            + chrono::Duration::microseconds(250);
        assert_eq!(iso8601(ts), "2016-03-01T12:30:05.000250Z");
    }
}
