use std::{collections::HashMap, sync::Arc, sync::mpsc, thread};

use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{debug, error, info};

use crate::{
    AnyResult,
    balance::{BalanceController, BalanceMsg},
    config::Config,
    correlate::Correlator,
    events::{DeviceEvent, iso8601},
    pipe::serve_control_pipe,
    rfid::{ReaderMsg, RfidController},
    serial::{CRLF, LinkState, NO_EOL, SEMICOLON, SerialLink},
    sink::{EventSink, EventStore, StoreSink},
    whisker,
};

enum DeviceMailbox {
    Reader(mpsc::Sender<ReaderMsg>),
    Balance(mpsc::Sender<BalanceMsg>),
}

struct DeviceRuntime {
    device_id: u32,
    name: String,
    link: SerialLink,
    mailbox: DeviceMailbox,
    controller: Option<thread::JoinHandle<()>>,
}

impl DeviceRuntime {
    /// Controller first (so its farewell commands still reach the writer),
    /// then the link's reader and writer; the port closes after both have
    /// quiesced.
    fn stop(&mut self) {
        match &self.mailbox {
            DeviceMailbox::Reader(tx) => {
                let _ = tx.send(ReaderMsg::Stop);
            }
            DeviceMailbox::Balance(tx) => {
                let _ = tx.send(BalanceMsg::Stop);
            }
        }
        if let Some(handle) = self.controller.take() {
            let _ = handle.join();
        }
        if self.link.state() != LinkState::Stopped {
            self.link.stop();
        }
    }
}

/// Builds and runs the whole acquisition engine from one configuration
/// snapshot; returns once every link is stopped.
pub async fn run(config: Config) -> AnyResult<()> {
    let store = EventStore::open(&config.event_store, config.rfid_effective_time_s)?;
    let correlator = Correlator::new(config.rfid_effective_time_s);

    let (bus_tx, bus_rx) = unbounded_channel();
    let mut devices: Vec<DeviceRuntime> = Vec::new();
    // reader id -> mailbox of the balance paired with it
    let mut balance_by_reader: HashMap<u32, mpsc::Sender<BalanceMsg>> = HashMap::new();
    // balance name -> mailbox, for the control pipe
    let mut balance_by_name: HashMap<String, mpsc::Sender<BalanceMsg>> = HashMap::new();

    for reader in config.readers.iter().filter(|r| r.enabled) {
        let (mailbox_tx, mailbox_rx) = mpsc::channel();
        let mut link = SerialLink::new(
            reader.id,
            &reader.name,
            reader.serial.clone(),
            CRLF,
            NO_EOL,
            bus_tx.clone(),
        );
        match link.start(mailbox_tx.clone()) {
            Ok(outbound) => {
                let controller =
                    RfidController::new(reader.id, &reader.name, outbound, bus_tx.clone());
                let handle = thread::spawn(move || controller.run(mailbox_rx));
                devices.push(DeviceRuntime {
                    device_id: reader.id,
                    name: reader.name.clone(),
                    link,
                    mailbox: DeviceMailbox::Reader(mailbox_tx),
                    controller: Some(handle),
                });
            }
            Err(err) => {
                error!("reader '{}' failed to start: {err}", reader.name);
                stop_all(&mut devices);
                return Err(err.into());
            }
        }
    }

    for balance in config.balances.iter().filter(|b| b.enabled) {
        // Pairing is checked at validation; an unknown reader cannot occur.
        let reader_name = config
            .reader(balance.reader_id)
            .map(|r| r.name.clone())
            .unwrap_or_default();
        let (mailbox_tx, mailbox_rx) = mpsc::channel();
        let mut link = SerialLink::new(
            balance.id,
            &balance.name,
            balance.serial.clone(),
            CRLF,
            SEMICOLON,
            bus_tx.clone(),
        );
        match link.start(mailbox_tx.clone()) {
            Ok(outbound) => {
                let controller = BalanceController::new(
                    balance,
                    &reader_name,
                    config.rfid_effective_time_s,
                    outbound,
                    bus_tx.clone(),
                );
                let handle = thread::spawn(move || controller.run(mailbox_rx));
                balance_by_reader.insert(balance.reader_id, mailbox_tx.clone());
                balance_by_name.insert(balance.name.clone(), mailbox_tx.clone());
                devices.push(DeviceRuntime {
                    device_id: balance.id,
                    name: balance.name.clone(),
                    link,
                    mailbox: DeviceMailbox::Balance(mailbox_tx),
                    controller: Some(handle),
                });
            }
            Err(err) => {
                error!("balance '{}' failed to start: {err}", balance.name);
                stop_all(&mut devices);
                return Err(err.into());
            }
        }
    }

    if devices.is_empty() {
        info!("no devices enabled; nothing to acquire");
        return Ok(());
    }

    // The Whisker relay is connected last, after every link is up.
    let whisker_tx = whisker::spawn(config.whisker.host.clone(), config.whisker.port);
    let sink: Arc<dyn EventSink> = Arc::new(StoreSink::new(store, whisker_tx, &config.whisker.prefix));

    if let Some(pipe_path) = config.control_pipe.clone() {
        info!("starting control pipe at {}", pipe_path.display());
        let balances = balance_by_name.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_control_pipe(pipe_path, balances).await {
                error!("control pipe failed: {err}");
            }
        });
    }

    info!("acquisition running on {} device(s)", devices.len());
    route_events(bus_rx, &correlator, sink.as_ref(), &balance_by_reader, &mut devices).await;

    info!("stopping all devices");
    tokio::task::block_in_place(|| stop_all(&mut devices));
    info!("all links stopped");
    Ok(())
}

/// Routes device events between controllers, the correlator and the sink
/// until shutdown is requested or every link has stopped.
async fn route_events(
    mut bus: UnboundedReceiver<DeviceEvent>,
    correlator: &Correlator,
    sink: &dyn EventSink,
    balance_by_reader: &HashMap<u32, mpsc::Sender<BalanceMsg>>,
    devices: &mut Vec<DeviceRuntime>,
) {
    loop {
        let event = tokio::select! {
            event = bus.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return;
            }
        };

        match event {
            DeviceEvent::Rfid(detection) => {
                correlator.note_rfid(detection.reader_id, detection.tag, detection.timestamp);
                sink.record_rfid(&detection);
                sink.broadcast(&format!(
                    "RFID_EVENT: reader {}, RFID {}, timestamp {}",
                    detection.reader_name,
                    detection.tag,
                    iso8601(detection.timestamp)
                ));
                if let Some(mailbox) = balance_by_reader.get(&detection.reader_id) {
                    let _ = mailbox.send(BalanceMsg::Rfid(detection.timestamp));
                }
            }
            DeviceEvent::Mass(mut reading) => {
                correlator.attribute(&mut reading);
                sink.record_mass(&reading);
                if reading.locked
                    && let Some(tag) = reading.tag
                {
                    sink.broadcast(&format!(
                        "MASS_EVENT: reader {}, RFID {}, balance {}, mass {} kg, timestamp {}",
                        reading.reader_name,
                        tag,
                        reading.balance_name,
                        reading.mass_kg,
                        iso8601(reading.timestamp)
                    ));
                }
            }
            DeviceEvent::Calibration(report) => {
                info!(
                    "balance '{}' calibration: zero {:?}, reference {:?} for {} kg",
                    report.balance_name,
                    report.zero_value,
                    report.refload_value,
                    report.refload_mass_kg
                );
            }
            DeviceEvent::Link {
                name, state, ..
            } => {
                debug!("link '{name}' is now {state:?}");
            }
            DeviceEvent::Fault {
                device_id,
                name,
                message,
            } => {
                error!("device '{name}' fault: {message}");
                if let Some(runtime) = devices.iter_mut().find(|d| d.device_id == device_id) {
                    tokio::task::block_in_place(|| runtime.stop());
                }
                if devices.iter().all(|d| d.link.state() == LinkState::Stopped) {
                    info!("every link has stopped");
                    return;
                }
            }
        }
    }
}

fn stop_all(devices: &mut Vec<DeviceRuntime>) {
    for device in devices.iter_mut() {
        if device.link.state() != LinkState::Stopped {
            info!("stopping '{}'", device.name);
        }
        device.stop();
    }
}
