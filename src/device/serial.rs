use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info, warn};
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, SerialPortType, StopBits};
use tokio::task::{spawn_blocking, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::types::TransportKind;
use crate::device::constants::SERIAL_READ_TIMEOUT;
use crate::device::transport::{with_newline, LinkSender, Transport};
use crate::device::types::{DeviceInfo, LineSource, LinkEvent, LinkState};
use crate::error::TransportError;
use crate::protocol::framer::LineFramer;

/// Blocking port calls run on their own thread. When that thread panics, or the runtime shuts
/// down under it, the operation fails instead of the session.
fn joined<T>(result: Result<T, JoinError>, error: fn(String) -> TransportError) -> Result<T, TransportError> {
    result.map_err(|err| error(format!("serial task failed: {}", err)))
}

/// Stable identity of a port: vendor/product id for USB adapters, otherwise the port name.
pub fn port_identity(info: &SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => format!("usb:{:04x}:{:04x}", usb.vid, usb.pid),
        _ => info.port_name.clone(),
    }
}

pub fn port_label(info: &SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => usb.product.clone().unwrap_or_else(|| info.port_name.clone()),
        SerialPortType::BluetoothPort => format!("Bluetooth serial {}", info.port_name),
        SerialPortType::PciPort => format!("PCI serial {}", info.port_name),
        SerialPortType::Unknown => info.port_name.clone(),
    }
}

/// Stands in for the port picker: the port matching `selector` (port name or identity), or
/// else the first USB port, or else the first port at all.
pub fn choose_port(ports: Vec<SerialPortInfo>, selector: Option<&str>) -> Option<SerialPortInfo> {
    match selector {
        Some(selector) => ports.into_iter().find(|port| {
            port.port_name.contains(selector) || port_identity(port).contains(&selector.to_lowercase())
        }),
        None => {
            let usb = ports.iter().position(|port| matches!(port.port_type, SerialPortType::UsbPort(_)));
            match usb {
                Some(index) => ports.into_iter().nth(index),
                None => ports.into_iter().next(),
            }
        },
    }
}

fn forward(events: &LinkSender, lines: Vec<String>) -> bool {
    for line in lines {
        if events.unbounded_send(LinkEvent::Line { source: LineSource::SerialPort, line }).is_err() {
            return false;
        }
    }
    true
}

/// Blocking read loop; runs until cancelled or until reading fails. The carried-over partial
/// line is flushed in both cases, a failure is then reported as `Dropped`.
pub fn read_loop<R: Read>(mut reader: R, cancel: CancellationToken, events: LinkSender) {
    let mut framer = LineFramer::new();
    let mut buffer = [0u8; 256];

    let failure = loop {
        if cancel.is_cancelled() {
            break None;
        }

        match reader.read(&mut buffer) {
            Ok(0) => break Some("Serial port closed".to_string()),
            Ok(n) => {
                if !forward(&events, framer.feed_bytes(&buffer[..n])) {
                    break None;
                }
            },
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {},
            Err(err) => break Some(format!("Serial read error: {}", err)),
        }
    };

    forward(&events, framer.finish().into_iter().collect());

    if let Some(reason) = failure {
        let _ = events.unbounded_send(LinkEvent::Dropped(reason));
    }
}

pub struct SerialTransport {
    selector: Option<String>,
    baud_rate: u32,
    writer: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    reader_cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    state: LinkState,
}

impl SerialTransport {
    pub fn new(selector: Option<String>, baud_rate: u32) -> Self {
        SerialTransport {
            selector,
            baud_rate,
            writer: None,
            reader_cancel: CancellationToken::new(),
            reader: None,
            state: LinkState::Disconnected,
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!("Serial link {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    async fn request_port(&self) -> Result<SerialPortInfo, TransportError> {
        let ports = joined(spawn_blocking(serialport::available_ports).await, TransportError::Connect)??;

        for port in &ports {
            debug!("Found serial port {} ({})", port.port_name, port_identity(port));
        }

        choose_port(ports, self.selector.as_deref()).ok_or(TransportError::NoPortSelected)
    }

    async fn open(&mut self, info: &SerialPortInfo, events: LinkSender) -> Result<(), TransportError> {
        info!("Opening serial port {} at {} baud", info.port_name, self.baud_rate);

        let builder = serialport::new(info.port_name.clone(), self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(SERIAL_READ_TIMEOUT));

        let port = joined(spawn_blocking(move || builder.open()).await, TransportError::Connect)?
            .map_err(|err| TransportError::Connect(format!("{}: {}", info.port_name, err)))?;
        let reader = port.try_clone()?;

        self.reader_cancel = CancellationToken::new();
        let cancel = self.reader_cancel.clone();
        self.reader = Some(spawn_blocking(move || read_loop(reader, cancel, events)));
        self.writer = Some(Arc::new(Mutex::new(port)));
        Ok(())
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn state(&self) -> LinkState {
        self.state
    }

    async fn is_supported(&mut self) -> bool {
        match spawn_blocking(serialport::available_ports).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                warn!("Serial ports unavailable: {}", err);
                false
            },
            Err(err) => {
                warn!("Failed to list serial ports: {:?}", err);
                false
            },
        }
    }

    async fn connect(&mut self, events: LinkSender) -> Result<DeviceInfo, TransportError> {
        self.disconnect().await;

        self.set_state(LinkState::PortRequested);
        let info = match self.request_port().await {
            Ok(info) => info,
            Err(err) => {
                self.set_state(LinkState::Disconnected);
                return Err(err);
            },
        };

        self.set_state(LinkState::Opening);
        if let Err(err) = self.open(&info, events).await {
            self.disconnect().await;
            return Err(err);
        }

        self.set_state(LinkState::Ready);
        Ok(DeviceInfo { id: port_identity(&info), name: port_label(&info) })
    }

    fn supports_reconnect(&self) -> bool {
        false
    }

    async fn reconnect(&mut self, _events: LinkSender) -> Result<DeviceInfo, TransportError> {
        Err(TransportError::Unsupported("Reconnecting a serial port without a new port choice"))
    }

    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let Some(writer) = self.writer.clone() else {
            return Err(TransportError::NotConnected);
        };
        let payload = with_newline(line).into_owned();

        let written = spawn_blocking(move || -> io::Result<()> {
            let mut port = writer.lock().map_err(|_| io::Error::other("serial writer poisoned"))?;
            port.write_all(payload.as_bytes())?;
            port.flush()
        })
        .await;
        joined(written, TransportError::Dropped)??;

        Ok(())
    }

    async fn disconnect(&mut self) {
        self.reader_cancel.cancel();
        // the port closes once the reader and the writer handle are both dropped
        self.writer = None;

        if let Some(handle) = self.reader.take() {
            if let Err(err) = handle.await {
                warn!("Serial read task failed: {:?}", err);
            }
        }

        self.set_state(LinkState::Disconnected);
    }

    fn reports_disconnects(&self) -> bool {
        false
    }
}
