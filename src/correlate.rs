use std::{
    collections::HashMap,
    sync::Mutex,
};

use chrono::{DateTime, Duration, Utc};

use crate::events::MassReading;

/// Correlates the RFID and mass event streams: remembers the most recent tag
/// seen at each reader and locks a stable mass reading onto that tag when the
/// detection is still within the effective window.
///
/// Detections and readings originate on different device threads, so the
/// per-reader cache is mutex-guarded.
pub struct Correlator {
    effective: Duration,
    last_rfid: Mutex<HashMap<u32, (i64, DateTime<Utc>)>>,
}

impl Correlator {
    pub fn new(effective_time_s: f64) -> Self {
        Self {
            effective: Duration::microseconds((effective_time_s * 1_000_000.0) as i64),
            last_rfid: Mutex::new(HashMap::new()),
        }
    }

    /// Overwrites the cached detection for this reader.
    pub fn note_rfid(&self, reader_id: u32, tag: i64, timestamp: DateTime<Utc>) {
        let mut cache = self.last_rfid.lock().expect("rfid cache lock poisoned");
        cache.insert(reader_id, (tag, timestamp));
    }

    /// Attributes a stable reading to the tag last seen at its paired reader,
    /// if that detection happened no later than the reading and at most the
    /// effective window before it. Equality counts as within the window; a
    /// detection newer than the reading never attributes it (the two streams
    /// race onto the bus from different threads). Unstable readings pass
    /// through untouched.
    pub fn attribute(&self, reading: &mut MassReading) {
        if !reading.stable {
            return;
        }
        let cache = self.last_rfid.lock().expect("rfid cache lock poisoned");
        match cache.get(&reading.reader_id) {
            Some(&(tag, detected_at))
                if detected_at <= reading.timestamp
                    && reading.timestamp - detected_at <= self.effective =>
            {
                reading.tag = Some(tag);
                reading.locked = true;
            }
            _ => {
                reading.tag = None;
                reading.locked = false;
            }
        }
    }
}
