use std::{
    collections::VecDeque,
    fmt,
    sync::{LazyLock, mpsc},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::{
    config::{BalanceConfig, ParityMode},
    events::{CalibrationReport, DeviceEvent, MassReading},
    serial::{Line, Outbound},
    stability::StabilityDetector,
};

// Command vocabulary of the balance transducer. All outbound commands are
// terminated with ';' by the link; replies arrive one per CR+LF line.
const CMD_NO_OP: &str = "";
const CMD_STOP_MEASURING: &str = "STP";
const CMD_WARM_RESTART: &str = "RES"; // no reply; takes up to 3 s
const CMD_SET_BAUD_RATE: &str = "BDR";
const CMD_QUERY_BAUD_RATE: &str = "BDR?";
const CMD_QUERY_IDENTIFICATION: &str = "IDN?";
const CMD_QUERY_STATUS: &str = "ESR?";
const CMD_ASCII_RESULT_OUTPUT: &str = "COF3";
const CMD_DATA_DELIMITER_COMMA_CRLF: &str = "TEX172";
const CMD_QUERY_OUTPUT_SCALING: &str = "NOV?";
const CMD_MEASUREMENT_RATE: &str = "ICR";
const CMD_QUERY_MEASURE: &str = "MSV?";
const CMD_SIGNAL_FILTER: &str = "ASF";
const CMD_FILTER_TYPE: &str = "FMD";

const RESET_PAUSE: Duration = Duration::from_millis(3000);
const BAUDRATE_PAUSE: Duration = Duration::from_millis(200);

const RESPONSE_OK: &str = "0";
const RESPONSE_UNKNOWN: &str = "?";

static BAUDRATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+),(\d)$").expect("baud rate regex"));

/// Device measurement rates in Hz with their `ICR` codes, ascending.
const DEVICE_RATES: [(u32, u32); 8] = [
    (1, 7),
    (2, 6),
    (3, 5),
    (6, 4),
    (12, 3),
    (25, 2),
    (50, 1),
    (100, 0),
];

/// Maps a configured rate onto the `ICR` code of the closest supported
/// device rate at or above it (10 Hz runs the device at 12 Hz).
pub fn rate_code(rate_hz: u32) -> u32 {
    DEVICE_RATES
        .iter()
        .find(|(device_hz, _)| *device_hz >= rate_hz)
        .map_or(0, |(_, code)| *code)
}

/// `ESR?` status: the low six bits, most significant first, are
/// command error, execution error, hardware error and three pad bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFlags {
    pub command_error: bool,
    pub execution_error: bool,
    pub hardware_error: bool,
}

pub fn decode_esr(value: u32) -> StatusFlags {
    StatusFlags {
        command_error: value & 0b10_0000 != 0,
        execution_error: value & 0b01_0000 != 0,
        hardware_error: value & 0b00_1000 != 0,
    }
}

impl StatusFlags {
    pub fn any(self) -> bool {
        self.command_error || self.execution_error || self.hardware_error
    }
}

/// Software zero/reference calibration, preferred over the hardware tare.
///
/// Raw values convert to kilograms by linear interpolation between the two
/// points; with either point missing no conversion is possible and readings
/// are dropped.
#[derive(Debug, Clone, Copy)]
pub struct SoftCalibration {
    pub zero_value: Option<i64>,
    pub refload_value: Option<i64>,
    pub refload_mass_kg: f64,
}

impl SoftCalibration {
    pub fn value_to_mass(&self, value: i64) -> Option<f64> {
        let zero = self.zero_value?;
        let refload = self.refload_value?;
        if refload == zero {
            return None;
        }
        Some(self.refload_mass_kg * (value - zero) as f64 / (refload - zero) as f64)
    }

    /// Re-zeroes on `value`. An existing calibration is shifted so the mass
    /// scale is unchanged; if the shifted reference coincides with the new
    /// zero it is cleared.
    fn tare(&mut self, value: i64) {
        match self.zero_value {
            None => self.zero_value = Some(value),
            Some(zero) => {
                let delta = value - zero;
                self.zero_value = Some(value);
                if let Some(refload) = self.refload_value {
                    let shifted = refload + delta;
                    self.refload_value = (shifted != value).then_some(shifted);
                }
            }
        }
    }

    /// Takes `value` as the reading for the known reference mass; cleared
    /// instead if it coincides with the zero point.
    fn set_reference(&mut self, value: i64) {
        if self.zero_value == Some(value) {
            self.refload_value = None;
        } else {
            self.refload_value = Some(value);
        }
    }
}

/// Replies the controller is waiting for, head of queue first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    SetBaudRate,
    QueryBaudRate,
    Identification,
    Status,
    AsciiOutput,
    Delimiter,
    OutputScaling,
    MeasurementRate,
    SignalFilter,
    FilterType,
    Measure,
}

impl Pending {
    fn command(self) -> &'static str {
        match self {
            Pending::SetBaudRate => CMD_SET_BAUD_RATE,
            Pending::QueryBaudRate => CMD_QUERY_BAUD_RATE,
            Pending::Identification => CMD_QUERY_IDENTIFICATION,
            Pending::Status => CMD_QUERY_STATUS,
            Pending::AsciiOutput => CMD_ASCII_RESULT_OUTPUT,
            Pending::Delimiter => CMD_DATA_DELIMITER_COMMA_CRLF,
            Pending::OutputScaling => CMD_QUERY_OUTPUT_SCALING,
            Pending::MeasurementRate => CMD_MEASUREMENT_RATE,
            Pending::SignalFilter => CMD_SIGNAL_FILTER,
            Pending::FilterType => CMD_FILTER_TYPE,
            Pending::Measure => CMD_QUERY_MEASURE,
        }
    }
}

/// Mailbox messages for one balance's controller thread.
#[derive(Debug)]
pub enum BalanceMsg {
    Line(Line),
    /// A tag was seen at the paired reader; keep measuring until the
    /// effective window closes.
    Rfid(DateTime<Utc>),
    Tare,
    Calibrate,
    Ping,
    Stop,
}

impl From<Line> for BalanceMsg {
    fn from(line: Line) -> Self {
        BalanceMsg::Line(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BalancePhase {
    Idle,
    ResetPause,
    BaudPause,
    Measuring,
    /// Configured and quiet: no batch in flight, waiting for an RFID.
    Waiting,
}

/// Per-balance state machine: multi-phase reset, queued command/response
/// tracking, batched measurement cycles and soft calibration.
pub struct BalanceController {
    balance_id: u32,
    name: String,
    reader_id: u32,
    reader_name: String,
    rate_hz: u32,
    read_continuously: bool,
    asf_mode: u8,
    fast_response_filter: bool,
    baud: u32,
    parity_code: u8,
    rfid_effective: chrono::Duration,
    outbound: mpsc::Sender<Outbound>,
    events: UnboundedSender<DeviceEvent>,
    phase: BalancePhase,
    queue: VecDeque<Pending>,
    pending_measurements: u32,
    read_until: Option<DateTime<Utc>>,
    calibration: SoftCalibration,
    pending_tare: bool,
    pending_calibrate: bool,
    stability: StabilityDetector,
    timer_deadline: Option<Instant>,
}

impl BalanceController {
    pub fn new(
        config: &BalanceConfig,
        reader_name: &str,
        rfid_effective_time_s: f64,
        outbound: mpsc::Sender<Outbound>,
        events: UnboundedSender<DeviceEvent>,
    ) -> Self {
        let parity_code = match config.serial.parity {
            ParityMode::None => 0,
            ParityMode::Even => 1,
            ParityMode::Odd => {
                error!(
                    device = config.name.as_str(),
                    "balance does not support odd parity; sending even parity code"
                );
                1
            }
        };
        Self {
            balance_id: config.id,
            name: config.name.clone(),
            reader_id: config.reader_id,
            reader_name: reader_name.to_string(),
            rate_hz: config.measurement_rate_hz,
            read_continuously: config.read_continuously,
            asf_mode: config.amp_signal_filter_mode,
            fast_response_filter: config.fast_response_filter,
            baud: config.serial.baud,
            parity_code,
            rfid_effective: chrono::Duration::microseconds(
                (rfid_effective_time_s * 1_000_000.0) as i64,
            ),
            outbound,
            events,
            phase: BalancePhase::Idle,
            queue: VecDeque::new(),
            pending_measurements: 0,
            read_until: None,
            calibration: SoftCalibration {
                zero_value: config.zero_value,
                refload_value: config.refload_value,
                refload_mass_kg: config.refload_mass_kg,
            },
            pending_tare: false,
            pending_calibrate: false,
            stability: StabilityDetector::new(
                config.stability_n,
                config.tolerance_kg,
                config.min_mass_kg,
                config.unlock_mass_kg,
            ),
            timer_deadline: None,
        }
    }

    /// Controller thread body: resets the balance, then handles lines and
    /// commands in message order until stopped.
    pub fn run(mut self, mailbox: mpsc::Receiver<BalanceMsg>) {
        self.begin_reset();
        loop {
            let msg = match self.timer_deadline {
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
                BalanceMsg::Line(line) => self.on_line(&line),
                BalanceMsg::Rfid(timestamp) => self.on_rfid(timestamp),
                BalanceMsg::Tare => self.tare(),
                BalanceMsg::Calibrate => self.calibrate(),
                BalanceMsg::Ping => self.ping(),
                BalanceMsg::Stop => {
                    self.stop_measuring();
                    break;
                }
            }
        }
        info!(device = self.name.as_str(), "balance controller finished");
    }

    fn begin_reset(&mut self) {
        info!(device = self.name.as_str(), "balance resetting: phase 1");
        self.phase = BalancePhase::ResetPause;
        self.send_unqueued(CMD_NO_OP); // a bare terminator clears the input buffer
        self.send_unqueued(CMD_STOP_MEASURING);
        self.send_unqueued(CMD_WARM_RESTART);
        self.timer_deadline = Some(Instant::now() + RESET_PAUSE);
    }

    fn on_timer(&mut self) {
        self.timer_deadline = None;
        match self.phase {
            BalancePhase::ResetPause => {
                info!(device = self.name.as_str(), "balance resetting: phase 2");
                let params = format!("{},{}", self.baud, self.parity_code);
                self.send_queued(Pending::SetBaudRate, params);
                self.timer_deadline = Some(Instant::now() + BAUDRATE_PAUSE);
                self.phase = BalancePhase::BaudPause;
            }
            BalancePhase::BaudPause => {
                info!(device = self.name.as_str(), "balance resetting: phase 3");
                self.send_queued(Pending::SignalFilter, self.asf_mode);
                self.send_queued(Pending::FilterType, u8::from(self.fast_response_filter));
                self.send_queued(Pending::QueryBaudRate, "");
                self.send_queued(Pending::Identification, "");
                self.send_queued(Pending::Status, "");
                self.send_queued(Pending::AsciiOutput, "");
                self.send_queued(Pending::Delimiter, "");
                self.send_queued(Pending::OutputScaling, "");
                self.send_queued(Pending::MeasurementRate, rate_code(self.rate_hz));
                self.start_measuring();
            }
            _ => {}
        }
    }

    fn batch_size(&self) -> u32 {
        self.rate_hz.div_ceil(2).max(1)
    }

    fn start_measuring(&mut self) {
        let batch = self.batch_size();
        self.pending_measurements += batch;
        self.send_queued(Pending::Measure, batch);
        for _ in 1..batch {
            self.queue.push_back(Pending::Measure);
        }
        self.phase = BalancePhase::Measuring;
    }

    fn finish_batch(&mut self) {
        let keep_reading = self.read_continuously
            || self.read_until.is_some_and(|until| Utc::now() < until);
        if keep_reading {
            self.start_measuring();
        } else {
            debug!(device = self.name.as_str(), "measurement cycle idle");
            self.phase = BalancePhase::Waiting;
        }
    }

    fn on_rfid(&mut self, timestamp: DateTime<Utc>) {
        self.read_until = Some(timestamp + self.rfid_effective);
        if self.phase == BalancePhase::Waiting {
            self.start_measuring();
        }
    }

    /// Arms a soft tare; it lands on the next measured value. If both a tare
    /// and a calibrate are armed, the tare wins.
    fn tare(&mut self) {
        info!(device = self.name.as_str(), "tare armed");
        self.pending_tare = true;
        if self.phase == BalancePhase::Waiting {
            self.start_measuring();
        }
    }

    /// Arms a calibrate-to-reference; it lands on the next measured value.
    fn calibrate(&mut self) {
        info!(device = self.name.as_str(), "calibrate armed");
        self.pending_calibrate = true;
        if self.phase == BalancePhase::Waiting {
            self.start_measuring();
        }
    }

    /// Identification and status queries queue behind any pending
    /// measurement cycle.
    fn ping(&mut self) {
        info!(device = self.name.as_str(), "asking balance for identification and status");
        self.send_queued(Pending::Identification, "");
        self.send_queued(Pending::Status, "");
    }

    fn stop_measuring(&mut self) {
        self.send_unqueued(CMD_STOP_MEASURING);
        self.queue.retain(|pending| *pending != Pending::Measure);
        self.pending_measurements = 0;
    }

    fn on_line(&mut self, line: &Line) {
        let text = String::from_utf8_lossy(&line.bytes).into_owned();
        let Some(pending) = self.queue.pop_front() else {
            warn!(
                device = self.name.as_str(),
                "balance reply with no pending command: {text:?}"
            );
            return;
        };
        debug!(
            device = self.name.as_str(),
            command = pending.command(),
            "balance reply: {text:?}"
        );

        match pending {
            Pending::Measure => {
                match text.trim().parse::<i64>() {
                    Ok(value) => self.on_measurement(value, line.timestamp),
                    Err(_) => {
                        error!(device = self.name.as_str(), "balance sent a bad value: {text:?}");
                    }
                }
                self.pending_measurements = self.pending_measurements.saturating_sub(1);
                if self.pending_measurements == 0 {
                    self.finish_batch();
                }
            }
            _ if text == RESPONSE_UNKNOWN => {
                warn!(
                    device = self.name.as_str(),
                    command = pending.command(),
                    "balance rejected command"
                );
            }
            Pending::SetBaudRate | Pending::QueryBaudRate => {
                if let Some(caps) = BAUDRATE_REGEX.captures(&text) {
                    let baud = &caps[1];
                    let parity = match &caps[2] {
                        "0" => "N",
                        "1" => "E",
                        _ => "?",
                    };
                    info!(
                        device = self.name.as_str(),
                        "balance is using {baud} bps, parity {parity}"
                    );
                } else if pending == Pending::SetBaudRate && text == RESPONSE_OK {
                    debug!(device = self.name.as_str(), "balance acknowledges baud rate");
                } else {
                    error!(
                        device = self.name.as_str(),
                        "unexpected baud rate reply: {text:?}"
                    );
                }
            }
            Pending::Identification => {
                info!(device = self.name.as_str(), "balance identification: {text}");
            }
            Pending::Status => match text.trim().parse::<u32>() {
                Ok(value) => {
                    let status = decode_esr(value);
                    if status.any() {
                        warn!(device = self.name.as_str(), "balance status: {status:?}");
                    } else {
                        info!(device = self.name.as_str(), "balance status clean");
                    }
                }
                Err(_) => {
                    warn!(
                        device = self.name.as_str(),
                        "cannot interpret balance status: {text:?}"
                    );
                }
            },
            Pending::OutputScaling => match text.trim().parse::<i64>() {
                Ok(value) => {
                    info!(device = self.name.as_str(), "balance output scaling: {value}");
                }
                Err(_) => {
                    error!(
                        device = self.name.as_str(),
                        "bad output scaling value: {text:?}"
                    );
                }
            },
            Pending::AsciiOutput
            | Pending::Delimiter
            | Pending::MeasurementRate
            | Pending::SignalFilter
            | Pending::FilterType => {
                if text == RESPONSE_OK {
                    debug!(
                        device = self.name.as_str(),
                        command = pending.command(),
                        "balance acknowledges command"
                    );
                } else {
                    error!(
                        device = self.name.as_str(),
                        command = pending.command(),
                        "unexpected reply: {text:?}"
                    );
                }
            }
        }
    }

    fn on_measurement(&mut self, value: i64, timestamp: DateTime<Utc>) {
        if self.pending_tare {
            self.pending_tare = false;
            self.calibration.tare(value);
            self.report_calibration();
        } else if self.pending_calibrate {
            self.pending_calibrate = false;
            self.calibration.set_reference(value);
            self.report_calibration();
        }

        // Without both calibration points the value cannot be converted.
        let Some(mass_kg) = self.calibration.value_to_mass(value) else {
            return;
        };
        let stable = self.stability.judge(mass_kg);
        let _ = self.events.send(DeviceEvent::Mass(MassReading {
            balance_id: self.balance_id,
            balance_name: self.name.clone(),
            reader_id: self.reader_id,
            reader_name: self.reader_name.clone(),
            tag: None,
            mass_kg,
            timestamp,
            stable,
            locked: false,
        }));
    }

    fn report_calibration(&self) {
        info!(
            device = self.name.as_str(),
            zero = ?self.calibration.zero_value,
            refload = ?self.calibration.refload_value,
            "calibration updated"
        );
        let _ = self.events.send(DeviceEvent::Calibration(CalibrationReport {
            balance_id: self.balance_id,
            balance_name: self.name.clone(),
            zero_value: self.calibration.zero_value,
            refload_value: self.calibration.refload_value,
            refload_mass_kg: self.calibration.refload_mass_kg,
        }));
    }

    fn send_queued(&mut self, pending: Pending, params: impl fmt::Display) {
        self.queue.push_back(pending);
        let data = format!("{}{}", pending.command(), params);
        self.transmit(&data);
    }

    fn send_unqueued(&self, command: &str) {
        self.transmit(command);
    }

    fn transmit(&self, data: &str) {
        let _ = self.outbound.send(Outbound {
            data: data.as_bytes().to_vec(),
            delay_ms: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerialParams;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    fn test_config() -> BalanceConfig {
        BalanceConfig {
            id: 2,
            name: "balance-test".to_string(),
            serial: SerialParams {
                port: "/dev/ttyUSB1".to_string(),
                baud: 9600,
                data_bits: 8,
                parity: ParityMode::Even,
                stop_bits: 1,
                xonxoff: true,
                rtscts: false,
                dtrdsr: false,
            },
            enabled: true,
            reader_id: 1,
            measurement_rate_hz: 6,
            stability_n: 3,
            tolerance_kg: 0.001,
            min_mass_kg: 0.050,
            unlock_mass_kg: 0.010,
            refload_mass_kg: 1.0,
            zero_value: Some(100),
            refload_value: Some(1100),
            amp_signal_filter_mode: 3,
            fast_response_filter: false,
            read_continuously: true,
        }
    }

    fn controller(
        config: &BalanceConfig,
    ) -> (
        BalanceController,
        mpsc::Receiver<Outbound>,
        UnboundedReceiver<DeviceEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel();
        let (events_tx, events_rx) = unbounded_channel();
        let ctrl = BalanceController::new(config, "reader-test", 5.0, outbound_tx, events_tx);
        (ctrl, outbound_rx, events_rx)
    }

    fn sent(outbound: &mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut all = Vec::new();
        while let Ok(entry) = outbound.try_recv() {
            all.push(String::from_utf8(entry.data).expect("ascii command"));
        }
        all
    }

    fn line(text: &str) -> Line {
        Line {
            bytes: text.as_bytes().to_vec(),
            timestamp: Utc::now(),
        }
    }

    /// Runs a controller through reset phases 1..3 and drains the outbound
    /// commands sent along the way.
    fn configured(config: &BalanceConfig) -> (
        BalanceController,
        mpsc::Receiver<Outbound>,
        UnboundedReceiver<DeviceEvent>,
    ) {
        let (mut ctrl, outbound, events) = controller(config);
        ctrl.begin_reset();
        ctrl.on_timer();
        ctrl.on_timer();
        let _ = sent(&outbound);
        (ctrl, outbound, events)
    }

    fn drain_setup_replies(ctrl: &mut BalanceController) {
        // ASF, FMD acks; BDR?; IDN?; ESR?; COF3; TEX172; NOV?; ICR.
        for reply in ["0", "0", "9600,1", "AD105 V1.0", "000", "0", "0", "100000", "0"] {
            ctrl.on_line(&line(reply));
        }
    }

    #[test]
    fn rate_codes_match_the_device_table() {
        assert_eq!(rate_code(1), 7);
        assert_eq!(rate_code(2), 6);
        assert_eq!(rate_code(3), 5);
        assert_eq!(rate_code(6), 4);
        assert_eq!(rate_code(10), 3); // device runs at 12 Hz
    }

    #[test]
    fn batch_is_half_the_rate_rounded_up() {
        let mut config = test_config();
        for (rate, batch) in [(1, 1), (2, 1), (3, 2), (6, 3), (10, 5)] {
            config.measurement_rate_hz = rate;
            let (ctrl, _outbound, _events) = controller(&config);
            assert_eq!(ctrl.batch_size(), batch, "rate {rate}");
        }
    }

    #[test]
    fn reset_sequence_commands_in_order() {
        let (mut ctrl, outbound, _events) = controller(&test_config());

        ctrl.begin_reset();
        assert_eq!(sent(&outbound), vec!["", "STP", "RES"]);

        ctrl.on_timer();
        assert_eq!(sent(&outbound), vec!["BDR9600,1"]);

        ctrl.on_timer();
        let wire: String = sent(&outbound)
            .iter()
            .map(|cmd| format!("{cmd};"))
            .collect();
        assert_eq!(
            wire,
            "ASF3;FMD0;BDR?;IDN?;ESR?;COF3;TEX172;NOV?;ICR4;MSV?3;"
        );
        assert!(wire.contains("BDR?;IDN?;ESR?;COF3;TEX172;NOV?;ICR4;MSV?3;"));
    }

    #[test]
    fn esr_status_decodes_low_six_bits() {
        assert_eq!(
            decode_esr(0b10_0000),
            StatusFlags {
                command_error: true,
                execution_error: false,
                hardware_error: false,
            }
        );
        assert_eq!(
            decode_esr(0b01_1000),
            StatusFlags {
                command_error: false,
                execution_error: true,
                hardware_error: true,
            }
        );
        assert!(!decode_esr(0).any());
    }

    #[test]
    fn value_to_mass_is_exact_linear_interpolation() {
        let calibration = SoftCalibration {
            zero_value: Some(100),
            refload_value: Some(1100),
            refload_mass_kg: 1.0,
        };
        for value in [-500_i64, 0, 100, 650, 1100, 40_000] {
            let expected = 1.0 * (value - 100) as f64 / (1100 - 100) as f64;
            assert_eq!(calibration.value_to_mass(value), Some(expected));
        }
    }

    #[test]
    fn uncalibrated_values_are_dropped_silently() {
        let mut config = test_config();
        config.zero_value = None;
        config.refload_value = None;
        let (mut ctrl, _outbound, mut events) = configured(&config);
        drain_setup_replies(&mut ctrl);

        ctrl.on_line(&line("650"));
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, DeviceEvent::Mass(_)),
                "uncalibrated value must not produce a mass reading"
            );
        }
    }

    #[test]
    fn measurement_replies_emit_mass_readings() {
        let (mut ctrl, _outbound, mut events) = configured(&test_config());
        drain_setup_replies(&mut ctrl);

        ctrl.on_line(&line("650"));
        let mass = loop {
            match events.try_recv() {
                Ok(DeviceEvent::Mass(reading)) => break reading,
                Ok(_) => {}
                Err(_) => panic!("expected a mass reading"),
            }
        };
        assert_eq!(mass.balance_id, 2);
        assert_eq!(mass.reader_name, "reader-test");
        assert_eq!(mass.mass_kg, 0.55);
        assert!(!mass.locked);
    }

    #[test]
    fn batch_restarts_when_reading_continuously() {
        let (mut ctrl, outbound, _events) = configured(&test_config());
        drain_setup_replies(&mut ctrl);
        let _ = sent(&outbound);

        // Rate 6 Hz: batch of three replies, then a fresh MSV?3.
        ctrl.on_line(&line("650"));
        ctrl.on_line(&line("651"));
        assert!(sent(&outbound).is_empty());
        ctrl.on_line(&line("652"));
        assert_eq!(sent(&outbound), vec!["MSV?3"]);
    }

    #[test]
    fn batch_idles_without_rfid_and_resumes_on_rfid() {
        let mut config = test_config();
        config.read_continuously = false;
        let (mut ctrl, outbound, _events) = configured(&config);
        drain_setup_replies(&mut ctrl);
        let _ = sent(&outbound);

        for value in ["650", "651", "652"] {
            ctrl.on_line(&line(value));
        }
        assert!(sent(&outbound).is_empty(), "no RFID: no new batch");
        assert_eq!(ctrl.phase, BalancePhase::Waiting);

        ctrl.on_rfid(Utc::now());
        assert_eq!(sent(&outbound), vec!["MSV?3"]);

        // Still inside the effective window at batch end: keep going.
        for value in ["650", "651", "652"] {
            ctrl.on_line(&line(value));
        }
        assert_eq!(sent(&outbound), vec!["MSV?3"]);
    }

    #[test]
    fn tare_shifts_both_calibration_points() {
        let (mut ctrl, _outbound, mut events) = configured(&test_config());
        drain_setup_replies(&mut ctrl);

        ctrl.tare();
        ctrl.on_line(&line("150"));

        assert_eq!(ctrl.calibration.zero_value, Some(150));
        assert_eq!(ctrl.calibration.refload_value, Some(1150));
        // Mass scale unchanged: (v - 150) / 1000.
        assert_eq!(ctrl.calibration.value_to_mass(1150), Some(1.0));
        assert_eq!(ctrl.calibration.value_to_mass(650), Some(0.5));

        let report = loop {
            match events.try_recv() {
                Ok(DeviceEvent::Calibration(report)) => break report,
                Ok(_) => {}
                Err(_) => panic!("expected a calibration report"),
            }
        };
        assert_eq!(report.zero_value, Some(150));
        assert_eq!(report.refload_value, Some(1150));
    }

    #[test]
    fn tare_on_unset_zero_sets_it() {
        let mut config = test_config();
        config.zero_value = None;
        config.refload_value = None;
        let (mut ctrl, _outbound, _events) = configured(&config);
        drain_setup_replies(&mut ctrl);

        ctrl.tare();
        ctrl.on_line(&line("150"));
        assert_eq!(ctrl.calibration.zero_value, Some(150));
        assert_eq!(ctrl.calibration.refload_value, None);
    }

    #[test]
    fn calibrate_sets_reference_and_clears_on_collision() {
        let mut config = test_config();
        config.refload_value = None;
        let (mut ctrl, _outbound, _events) = configured(&config);
        drain_setup_replies(&mut ctrl);

        ctrl.calibrate();
        ctrl.on_line(&line("1100"));
        assert_eq!(ctrl.calibration.refload_value, Some(1100));

        ctrl.calibrate();
        ctrl.on_line(&line("100")); // coincides with the zero point
        assert_eq!(ctrl.calibration.refload_value, None);
    }

    #[test]
    fn pending_tare_takes_precedence_over_calibrate() {
        let (mut ctrl, _outbound, _events) = configured(&test_config());
        drain_setup_replies(&mut ctrl);

        ctrl.calibrate();
        ctrl.tare();
        ctrl.on_line(&line("150"));
        // The tare consumed the value; the calibrate stays armed.
        assert_eq!(ctrl.calibration.zero_value, Some(150));
        assert!(ctrl.pending_calibrate);
        assert!(!ctrl.pending_tare);

        ctrl.on_line(&line("1200"));
        assert_eq!(ctrl.calibration.refload_value, Some(1200));
        assert!(!ctrl.pending_calibrate);
    }

    #[test]
    fn rejected_command_pops_head_and_keeps_queue_aligned() {
        let (mut ctrl, outbound, mut events) = configured(&test_config());

        // ASF, FMD, BDR?, IDN?, ESR? succeed.
        for reply in ["0", "0", "9600,1", "AD105 V1.0", "000"] {
            ctrl.on_line(&line(reply));
        }
        // COF3 is rejected with '?': head popped, logged, queue advances.
        ctrl.on_line(&line("?"));
        // TEX172, NOV?, ICR still match their own replies.
        for reply in ["0", "100000", "0"] {
            ctrl.on_line(&line(reply));
        }

        // The measurement batch still decrements its own counter.
        let _ = sent(&outbound);
        ctrl.on_line(&line("650"));
        ctrl.on_line(&line("651"));
        ctrl.on_line(&line("652"));
        assert_eq!(sent(&outbound), vec!["MSV?3"], "batch restarted after three replies");
        assert!(matches!(
            events.try_recv(),
            Ok(DeviceEvent::Mass(_))
        ));
    }

    #[test]
    fn reply_with_empty_queue_is_dropped() {
        let mut config = test_config();
        config.read_continuously = false;
        let (mut ctrl, outbound, mut events) = configured(&config);
        drain_setup_replies(&mut ctrl);
        for value in ["650", "651", "652"] {
            ctrl.on_line(&line(value));
        }
        assert_eq!(ctrl.phase, BalancePhase::Waiting);
        let _ = sent(&outbound);
        while events.try_recv().is_ok() {}

        // An unsolicited reply with nothing queued is dropped on the floor.
        ctrl.on_line(&line("999"));
        assert_eq!(ctrl.pending_measurements, 0);
        assert!(ctrl.queue.is_empty());
        assert!(events.try_recv().is_err());
        assert!(sent(&outbound).is_empty());
    }

    #[test]
    fn stop_measuring_clears_pending_measure_entries() {
        let (mut ctrl, outbound, _events) = configured(&test_config());
        drain_setup_replies(&mut ctrl);
        let _ = sent(&outbound);

        ctrl.ping();
        ctrl.stop_measuring();
        assert_eq!(ctrl.pending_measurements, 0);
        assert!(ctrl.queue.iter().all(|p| *p != Pending::Measure));
        // The ping queries survive the stop.
        assert_eq!(ctrl.queue.len(), 2);
        let commands = sent(&outbound);
        assert_eq!(commands, vec!["IDN?", "ESR?", "STP"]);
    }
}
