use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

use crate::events::{MassReading, RfidDetection};

/// Schema revision this build expects the event store to carry. The store is
/// migrated by an external tool; a mismatch is fatal at start-up.
pub const HEAD_REVISION: &str = "0003";

const META_FILE: &str = "store.json";
const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "event store revision should be {expected} but is {found}; \
         run the migration tool or upgrade starfeeder"
    )]
    Revision { expected: String, found: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    schema_revision: String,
}

/// A run of consecutive detections of one (reader, tag) pair, coalesced
/// while each detection falls within the effective window of the last.
#[derive(Debug, Clone, Serialize)]
pub struct RfidEpisode {
    pub reader_id: u32,
    pub reader_name: String,
    pub tag: i64,
    pub first_detected_at: DateTime<Utc>,
    pub last_detected_at: DateTime<Utc>,
    pub n_events: u32,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EventRecord<'a> {
    Rfid(&'a RfidEpisode),
    Mass(&'a MassReading),
}

/// Append-only JSON-lines persistence rooted in one directory: `store.json`
/// holds the schema revision, `events.jsonl` the records.
pub struct EventStore {
    events: File,
    effective: Duration,
    open_episodes: HashMap<(u32, i64), RfidEpisode>,
}

impl EventStore {
    pub fn open(dir: &Path, effective_time_s: f64) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let meta_path = dir.join(META_FILE);
        if meta_path.exists() {
            let meta: StoreMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;
            if meta.schema_revision != HEAD_REVISION {
                return Err(StoreError::Revision {
                    expected: HEAD_REVISION.to_string(),
                    found: meta.schema_revision,
                });
            }
        } else {
            let meta = StoreMeta {
                schema_revision: HEAD_REVISION.to_string(),
            };
            fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;
        }
        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;
        Ok(Self {
            events,
            effective: Duration::microseconds((effective_time_s * 1_000_000.0) as i64),
            open_episodes: HashMap::new(),
        })
    }

    /// Folds the detection into the open episode for its (reader, tag) when
    /// it falls within the effective window; otherwise the old episode is
    /// written out and a fresh one begins.
    pub fn record_rfid(&mut self, detection: &RfidDetection) -> Result<(), StoreError> {
        let key = (detection.reader_id, detection.tag);
        if let Some(episode) = self.open_episodes.get_mut(&key)
            && detection.timestamp - episode.last_detected_at <= self.effective
        {
            episode.last_detected_at = detection.timestamp;
            episode.n_events += 1;
            return Ok(());
        }
        let fresh = RfidEpisode {
            reader_id: detection.reader_id,
            reader_name: detection.reader_name.clone(),
            tag: detection.tag,
            first_detected_at: detection.timestamp,
            last_detected_at: detection.timestamp,
            n_events: 1,
        };
        if let Some(closed) = self.open_episodes.insert(key, fresh) {
            self.append(&EventRecord::Rfid(&closed))?;
        }
        Ok(())
    }

    /// Persists a reading only when it is locked onto a tag.
    pub fn record_mass(&mut self, reading: &MassReading) -> Result<(), StoreError> {
        if !reading.locked {
            return Ok(());
        }
        self.append(&EventRecord::Mass(reading))
    }

    /// Writes out every episode still open. Called at shutdown.
    pub fn close(&mut self) -> Result<(), StoreError> {
        let episodes: Vec<RfidEpisode> = self.open_episodes.drain().map(|(_, ep)| ep).collect();
        for episode in &episodes {
            self.append(&EventRecord::Rfid(episode))?;
        }
        Ok(())
    }

    fn append(&mut self, record: &EventRecord<'_>) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.events.write_all(line.as_bytes())?;
        self.events.flush()?;
        Ok(())
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("failed to flush event store: {err}");
        }
    }
}

/// Narrow interface between the acquisition engine and the outside world:
/// persistence plus the Whisker relay. Callable from any controller thread.
pub trait EventSink: Send + Sync {
    fn record_rfid(&self, detection: &RfidDetection);
    fn record_mass(&self, reading: &MassReading);
    fn broadcast(&self, message: &str);
}

pub struct StoreSink {
    store: Mutex<EventStore>,
    whisker: UnboundedSender<String>,
    prefix: String,
}

impl StoreSink {
    pub fn new(store: EventStore, whisker: UnboundedSender<String>, prefix: &str) -> Self {
        Self {
            store: Mutex::new(store),
            whisker,
            prefix: prefix.to_string(),
        }
    }
}

impl EventSink for StoreSink {
    fn record_rfid(&self, detection: &RfidDetection) {
        let mut store = self.store.lock().expect("event store lock poisoned");
        if let Err(err) = store.record_rfid(detection) {
            error!("failed to record RFID event: {err}");
        }
    }

    fn record_mass(&self, reading: &MassReading) {
        let mut store = self.store.lock().expect("event store lock poisoned");
        if let Err(err) = store.record_mass(reading) {
            error!("failed to record mass event: {err}");
        }
    }

    fn broadcast(&self, message: &str) {
        let line = format!("{}{}", self.prefix, message);
        if self.whisker.send(line).is_err() {
            debug!("Whisker relay is gone; broadcast dropped");
        }
    }
}
