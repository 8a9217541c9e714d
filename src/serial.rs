use std::{
    io::{Read, Write},
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

use crate::{
    config::{ParityMode, SerialParams},
    events::DeviceEvent,
};

pub const READ_TIMEOUT: Duration = Duration::from_millis(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the writer re-checks the stop flag while idle or delaying.
const WRITER_POLL: Duration = Duration::from_millis(50);

pub const CRLF: &[u8] = b"\r\n";
pub const LF: &[u8] = b"\n";
pub const NO_EOL: &[u8] = b"";
pub const SEMICOLON: &[u8] = b";";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("link '{0}' is not stopped")]
    Busy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// One framed line off the wire, stamped when its chunk arrived.
#[derive(Debug, Clone)]
pub struct Line {
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// One entry in the outbound queue. The writer appends the link's `tx_eol`,
/// flushes, and then honours `delay_ms` before the next entry.
#[derive(Debug)]
pub struct Outbound {
    pub data: Vec<u8>,
    pub delay_ms: u64,
}

/// Accumulates raw chunks and splits out complete lines; a residual buffer
/// carries partial lines across reads.
pub struct LineFramer {
    eol: Vec<u8>,
    residual: Vec<u8>,
}

impl LineFramer {
    pub fn new(eol: &[u8]) -> Self {
        debug_assert!(!eol.is_empty());
        Self {
            eol: eol.to_vec(),
            residual: Vec::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.residual.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = find_subsequence(&self.residual, &self.eol) {
            let mut line: Vec<u8> = self.residual.drain(..pos + self.eol.len()).collect();
            line.truncate(pos);
            lines.push(line);
        }
        lines
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Owns one serial port: a reader thread framing inbound bytes into lines for
/// the controller's mailbox, and a writer thread draining the outbound queue.
pub struct SerialLink {
    device_id: u32,
    name: String,
    params: SerialParams,
    rx_eol: &'static [u8],
    tx_eol: &'static [u8],
    bus: UnboundedSender<DeviceEvent>,
    state: LinkState,
    stop_flag: Arc<AtomicBool>,
    outbound_tx: Option<mpsc::Sender<Outbound>>,
    reader: Option<thread::JoinHandle<()>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl SerialLink {
    pub fn new(
        device_id: u32,
        name: &str,
        params: SerialParams,
        rx_eol: &'static [u8],
        tx_eol: &'static [u8],
        bus: UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            device_id,
            name: name.to_string(),
            params,
            rx_eol,
            tx_eol,
            bus,
            state: LinkState::Stopped,
            stop_flag: Arc::new(AtomicBool::new(false)),
            outbound_tx: None,
            reader: None,
            writer: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Opens the port and spawns the writer, then the reader. Framed lines are
    /// converted into `M` and delivered to `mailbox` in arrival order.
    pub fn start<M>(&mut self, mailbox: mpsc::Sender<M>) -> Result<mpsc::Sender<Outbound>, DeviceError>
    where
        M: From<Line> + Send + 'static,
    {
        if self.state != LinkState::Stopped {
            return Err(DeviceError::Busy(self.name.clone()));
        }
        self.set_state(LinkState::Starting);
        info!(
            device = self.name.as_str(),
            port = self.params.port.as_str(),
            "opening serial port"
        );

        let read_port = match open_port(&self.params) {
            Ok(port) => port,
            Err(err) => {
                self.set_state(LinkState::Stopped);
                return Err(err);
            }
        };
        let write_port = match read_port.try_clone().and_then(|mut p| {
            p.set_timeout(WRITE_TIMEOUT)?;
            Ok(p)
        }) {
            Ok(port) => port,
            Err(source) => {
                self.set_state(LinkState::Stopped);
                return Err(DeviceError::Open {
                    port: self.params.port.clone(),
                    source,
                });
            }
        };

        self.stop_flag.store(false, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel();

        // Writers start before readers; the reader loop never yields once
        // it is in its read cycle.
        self.writer = Some(thread::spawn({
            let stop = Arc::clone(&self.stop_flag);
            let bus = self.bus.clone();
            let tx_eol = self.tx_eol;
            let (device_id, name) = (self.device_id, self.name.clone());
            move || writer_loop(write_port, tx_eol, outbound_rx, stop, bus, device_id, name)
        }));
        self.reader = Some(thread::spawn({
            let stop = Arc::clone(&self.stop_flag);
            let bus = self.bus.clone();
            let rx_eol = self.rx_eol;
            let (device_id, name) = (self.device_id, self.name.clone());
            move || reader_loop(read_port, rx_eol, mailbox, stop, bus, device_id, name)
        }));

        self.outbound_tx = Some(outbound_tx.clone());
        self.set_state(LinkState::Running);
        Ok(outbound_tx)
    }

    /// Cooperative stop: flags the loops, then joins them. The port handles
    /// are owned by the threads, so the port closes only after both have
    /// quiesced.
    pub fn stop(&mut self) {
        if self.state == LinkState::Stopped {
            error!(device = self.name.as_str(), "cannot stop: already stopped");
            return;
        }
        self.set_state(LinkState::Stopping);
        self.stop_flag.store(true, Ordering::Relaxed);
        self.outbound_tx = None;
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        self.set_state(LinkState::Stopped);
    }

    fn set_state(&mut self, state: LinkState) {
        debug!(
            device = self.name.as_str(),
            "link state: {:?} -> {state:?}", self.state
        );
        self.state = state;
        let _ = self.bus.send(DeviceEvent::Link {
            device_id: self.device_id,
            name: self.name.clone(),
            state,
        });
    }
}

fn open_port(params: &SerialParams) -> Result<Box<dyn SerialPort>, DeviceError> {
    let data_bits = match params.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    };
    let parity = match params.parity {
        ParityMode::None => Parity::None,
        ParityMode::Even => Parity::Even,
        ParityMode::Odd => Parity::Odd,
    };
    let stop_bits = match params.stop_bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    };
    let flow = if params.xonxoff {
        FlowControl::Software
    } else if params.rtscts {
        FlowControl::Hardware
    } else {
        FlowControl::None
    };

    let mut port = serialport::new(params.port.clone(), params.baud)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|source| DeviceError::Open {
            port: params.port.clone(),
            source,
        })?;

    if params.dtrdsr {
        port.write_data_terminal_ready(true)
            .map_err(|source| DeviceError::Open {
                port: params.port.clone(),
                source,
            })?;
    }
    Ok(port)
}

fn reader_loop<M>(
    mut port: Box<dyn SerialPort>,
    rx_eol: &[u8],
    mailbox: mpsc::Sender<M>,
    stop: Arc<AtomicBool>,
    bus: UnboundedSender<DeviceEvent>,
    device_id: u32,
    name: String,
) where
    M: From<Line> + Send + 'static,
{
    let mut framer = LineFramer::new(rx_eol);
    let mut first = [0u8; 1];
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match port.read(&mut first) {
            Ok(0) => {}
            Ok(_) => {
                let mut chunk = first.to_vec();
                // Drain whatever else has already arrived.
                if let Ok(waiting) = port.bytes_to_read()
                    && waiting > 0
                {
                    let mut rest = vec![0u8; waiting as usize];
                    if let Ok(n) = port.read(&mut rest) {
                        chunk.extend_from_slice(&rest[..n]);
                    }
                }
                let timestamp = Utc::now();
                for bytes in framer.feed(&chunk) {
                    debug!(device = name.as_str(), "line: {:?}", bytes);
                    if mailbox.send(M::from(Line { bytes, timestamp })).is_err() {
                        return;
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                error!(device = name.as_str(), "serial read error: {err}; stopping");
                stop.store(true, Ordering::Relaxed);
                let _ = bus.send(DeviceEvent::Fault {
                    device_id,
                    name,
                    message: format!("read error: {err}"),
                });
                return;
            }
        }
    }
}

fn writer_loop(
    mut port: Box<dyn SerialPort>,
    tx_eol: &[u8],
    outbound: mpsc::Receiver<Outbound>,
    stop: Arc<AtomicBool>,
    bus: UnboundedSender<DeviceEvent>,
    device_id: u32,
    name: String,
) {
    loop {
        match outbound.recv_timeout(WRITER_POLL) {
            Ok(entry) => {
                let mut frame = entry.data;
                frame.extend_from_slice(tx_eol);
                debug!(device = name.as_str(), "sending: {:?}", frame);
                if let Err(err) = port.write_all(&frame).and_then(|()| port.flush()) {
                    error!(device = name.as_str(), "serial write error: {err}; stopping");
                    stop.store(true, Ordering::Relaxed);
                    let _ = bus.send(DeviceEvent::Fault {
                        device_id,
                        name,
                        message: format!("write error: {err}"),
                    });
                    return;
                }
                if entry.delay_ms > 0 {
                    sleep_unless_stopped(Duration::from_millis(entry.delay_ms), &stop);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(WRITER_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_splits_crlf_lines() {
        let mut framer = LineFramer::new(CRLF);
        let lines = framer.feed(b"MULTITAG-125 01\r\nS\r\n");
        assert_eq!(lines, vec![b"MULTITAG-125 01".to_vec(), b"S".to_vec()]);
    }

    #[test]
    fn framer_carries_residual_across_reads() {
        let mut framer = LineFramer::new(CRLF);
        assert!(framer.feed(b"Z5A2080A7").is_empty());
        assert!(framer.feed(b"0C2C0001\r").is_empty());
        let lines = framer.feed(b"\n123\r\n");
        assert_eq!(lines, vec![b"Z5A2080A70C2C0001".to_vec(), b"123".to_vec()]);
    }

    #[test]
    fn framer_preserves_arrival_order() {
        let mut framer = LineFramer::new(LF);
        let lines = framer.feed(b"a\nb\nc\npartial");
        assert_eq!(lines, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(framer.feed(b"\n"), vec![b"partial".to_vec()]);
    }

    #[test]
    fn framer_yields_empty_lines_between_delimiters() {
        let mut framer = LineFramer::new(CRLF);
        let lines = framer.feed(b"\r\n0\r\n");
        assert_eq!(lines, vec![Vec::<u8>::new(), b"0".to_vec()]);
    }
}
