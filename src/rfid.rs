use std::{
    sync::{LazyLock, mpsc},
    time::{Duration, Instant},
};

use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

use crate::{
    events::{DeviceEvent, RfidDetection},
    serial::{Line, Outbound},
};

// Commands are single bytes with no terminator; a newline cancels an
// ongoing continuous read, so it doubles as the no-op cancel.
const CMD_RESET: &[u8] = b"x";
const CMD_READ_CONTINUOUS: &[u8] = b"c";
const CMD_CANCEL: &[u8] = b"\n";

const RESET_PAUSE: Duration = Duration::from_millis(200);

static HELLO_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^MULTITAG").expect("hello regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    InvalidCommand,
    NotExecuted,
    ReadStopped,
    AntennaOff,
}

/// Classification of one line from an RFID reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderLine {
    Tag(i64),
    Hello,
    Ack(AckKind),
    Unknown,
}

pub fn decode_line(line: &str) -> ReaderLine {
    match line {
        "?" => ReaderLine::Ack(AckKind::InvalidCommand),
        "N" => ReaderLine::Ack(AckKind::NotExecuted),
        "S" => ReaderLine::Ack(AckKind::ReadStopped),
        "P" => ReaderLine::Ack(AckKind::AntennaOff),
        _ if HELLO_REGEX.is_match(line) => ReaderLine::Hello,
        _ => match ztag_to_tag_number(line) {
            Some(tag) => ReaderLine::Tag(tag),
            None => ReaderLine::Unknown,
        },
    }
}

/// Decodes an FDX-B "Z-tag" (`Z` + 16 hex digits) into the decimal tag
/// number printed on the transponder's bar code.
///
/// The 64 identification bits carry a 38-bit national id followed by a
/// 10-bit country code, both transmitted LSB-first, so each field is
/// bit-reversed before being read as an unsigned integer. The decimal
/// presentation is the country code followed by the national id
/// zero-padded to 12 digits, which fits a signed 64-bit integer.
pub fn ztag_to_tag_number(ztag: &str) -> Option<i64> {
    let hex = ztag.strip_prefix('Z')?;
    if hex.len() != 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let value = u64::from_str_radix(hex, 16).ok()?;
    let national_id = reverse_bits(value >> 26, 38);
    let country = reverse_bits((value >> 16) & 0x3FF, 10);
    // The trailing bits (additional-data flag, padding, animal flag) are
    // not part of the presented number.
    Some((country * 1_000_000_000_000 + national_id) as i64)
}

fn reverse_bits(value: u64, width: u32) -> u64 {
    value.reverse_bits() >> (64 - width)
}

/// Mailbox messages for one reader's controller thread.
#[derive(Debug)]
pub enum ReaderMsg {
    Line(Line),
    Stop,
}

impl From<Line> for ReaderMsg {
    fn from(line: Line) -> Self {
        ReaderMsg::Line(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderPhase {
    Idle,
    Resetting1,
    Resetting2,
    Starting,
    Reading,
    Stopping,
}

/// Per-reader state machine driving the device into continuous-read mode
/// and surfacing tag detections upstream.
pub struct RfidController {
    reader_id: u32,
    name: String,
    outbound: mpsc::Sender<Outbound>,
    events: UnboundedSender<DeviceEvent>,
    phase: ReaderPhase,
    swallow_next_stopped_read: bool,
    reset_deadline: Option<Instant>,
}

impl RfidController {
    pub fn new(
        reader_id: u32,
        name: &str,
        outbound: mpsc::Sender<Outbound>,
        events: UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            reader_id,
            name: name.to_string(),
            outbound,
            events,
            phase: ReaderPhase::Idle,
            swallow_next_stopped_read: false,
            reset_deadline: None,
        }
    }

    /// Controller thread body: resets the reader, then handles lines and
    /// commands in message order until stopped.
    pub fn run(mut self, mailbox: mpsc::Receiver<ReaderMsg>) {
        self.begin_reset();
        loop {
            let msg = match self.reset_deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match mailbox.recv_timeout(timeout) {
                        Ok(msg) => msg,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            self.on_timer();
                            continue;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match mailbox.recv() {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };
            match msg {
                ReaderMsg::Line(line) => self.on_line(&line),
                ReaderMsg::Stop => {
                    self.send(CMD_CANCEL);
                    self.phase = ReaderPhase::Stopping;
                    break;
                }
            }
        }
        info!(device = self.name.as_str(), "reader controller finished");
    }

    fn begin_reset(&mut self) {
        info!(device = self.name.as_str(), "resetting reader: phase 1");
        self.swallow_next_stopped_read = true;
        self.send(CMD_CANCEL);
        self.reset_deadline = Some(Instant::now() + RESET_PAUSE);
        self.phase = ReaderPhase::Resetting1;
    }

    fn on_timer(&mut self) {
        self.reset_deadline = None;
        if self.phase == ReaderPhase::Resetting1 {
            info!(device = self.name.as_str(), "resetting reader: phase 2");
            self.send(CMD_RESET);
            self.phase = ReaderPhase::Resetting2;
        }
    }

    fn start_reading(&mut self) {
        info!(device = self.name.as_str(), "asking reader to start reading");
        self.send(CMD_READ_CONTINUOUS);
        if self.phase != ReaderPhase::Reading {
            self.phase = ReaderPhase::Starting;
        }
    }

    fn on_line(&mut self, line: &Line) {
        let text = String::from_utf8_lossy(&line.bytes);
        match decode_line(&text) {
            ReaderLine::Tag(tag) => {
                self.phase = ReaderPhase::Reading;
                debug!(device = self.name.as_str(), tag, "tag detected");
                let _ = self.events.send(DeviceEvent::Rfid(RfidDetection {
                    reader_id: self.reader_id,
                    reader_name: self.name.clone(),
                    tag,
                    timestamp: line.timestamp,
                }));
            }
            ReaderLine::Hello => {
                info!(device = self.name.as_str(), "reader says hello: {text}");
                self.start_reading();
            }
            ReaderLine::Ack(AckKind::ReadStopped) => {
                if self.swallow_next_stopped_read {
                    self.swallow_next_stopped_read = false;
                } else {
                    self.start_reading();
                }
            }
            ReaderLine::Ack(AckKind::InvalidCommand) => {
                // Expected when the cancel byte lands while the reader is
                // waiting for a command.
                debug!(device = self.name.as_str(), "reader rejected a command");
            }
            ReaderLine::Ack(AckKind::NotExecuted) => {
                error!(device = self.name.as_str(), "reader did not execute command");
            }
            ReaderLine::Ack(AckKind::AntennaOff) => {
                info!(device = self.name.as_str(), "reader antenna powered off");
            }
            ReaderLine::Unknown => {
                error!(device = self.name.as_str(), "unknown data from reader: {text:?}");
            }
        }
    }

    fn send(&self, data: &[u8]) {
        let _ = self.outbound.send(Outbound {
            data: data.to_vec(),
            delay_ms: 0,
        });
    }
}
