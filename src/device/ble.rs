use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::TransportKind;
use crate::device::constants::{
    make_lamp_command_uuid, make_lamp_service_uuid, make_lamp_status_uuid, LAMP_ADVERTISED_NAMES, WRITE_DEADLINE,
};
use crate::device::transport::{with_newline, LinkSender, Transport};
use crate::device::types::{DeviceInfo, LineSource, LinkEvent, LinkState};
use crate::error::TransportError;
use crate::protocol::framer::LineFramer;

/// Decides whether an advertising peripheral is the lamp we are looking for.
///
/// `selector` is a case-insensitive substring of the name or address. Without a selector, the
/// unfiltered fallback scan only accepts the names the firmware advertises by default.
fn is_lamp(name: Option<&str>, address: &str, services: &[Uuid], require_service: bool, selector: Option<&str>) -> bool {
    if let Some(selector) = selector {
        let selector = selector.to_lowercase();
        let name_hit = name.map_or(false, |name| name.to_lowercase().contains(&selector));
        if !name_hit && !address.to_lowercase().contains(&selector) {
            return false;
        }
    }

    if require_service {
        // Some environments ignore the scan filter, so check the service uuid again
        return services.contains(&make_lamp_service_uuid());
    }

    selector.is_some() || name.map_or(false, |name| LAMP_ADVERTISED_NAMES.iter().any(|known| name.contains(known)))
}

async fn find_peripheral(adapters: &[Adapter], require_service: bool, selector: Option<&str>) -> Option<(Adapter, Peripheral)> {
    for adapter in adapters {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            },
        };

        for peripheral in peripherals {
            match peripheral.properties().await {
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                },
                Ok(None) => {
                    debug!("Peripheral has no properties");
                },
                Ok(Some(properties)) => {
                    let address = properties.address.to_string();
                    let services: Vec<Uuid> = properties.services.clone();

                    if is_lamp(properties.local_name.as_deref(), &address, &services, require_service, selector) {
                        info!(
                            "Using peripheral {} {:?} {} {:?}",
                            properties.address,
                            properties.address_type,
                            properties.local_name.as_deref().unwrap_or("NONE"),
                            properties.services,
                        );
                        return Some((adapter.clone(), peripheral));
                    }
                },
            }
        }
    }

    None
}

async fn connect_peripheral(peripheral: &Peripheral) -> Result<(Characteristic, Characteristic), TransportError> {
    let service_uuid = make_lamp_service_uuid();
    let command_uuid = make_lamp_command_uuid();
    let status_uuid = make_lamp_status_uuid();

    info!("Connecting to peripheral...");
    peripheral.connect().await.map_err(|err| TransportError::Connect(err.to_string()))?;

    info!("Connected; Discovering services...");
    peripheral.discover_services().await.map_err(|err| TransportError::Connect(err.to_string()))?;

    let service = peripheral
        .services()
        .into_iter()
        .find(|service| service.uuid == service_uuid)
        .ok_or_else(|| TransportError::Connect("lamp service not found".to_string()))?;

    let find = |uuid: Uuid, what: &str| {
        service
            .characteristics
            .iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .cloned()
            .ok_or_else(|| TransportError::Connect(format!("{} characteristic not found", what)))
    };

    Ok((find(command_uuid, "command")?, find(status_uuid, "status")?))
}

fn line_source(uuid: Uuid) -> LineSource {
    if uuid == make_lamp_command_uuid() {
        LineSource::CommandCharacteristic
    } else {
        LineSource::StatusCharacteristic
    }
}

/// A stream that could not be set up is replaced by one that never yields, the link stays up.
fn or_silent<T: Send + 'static>(stream: btleplug::Result<BoxStream<'static, T>>, what: &str) -> BoxStream<'static, T> {
    stream.unwrap_or_else(|err| {
        warn!("{} unavailable: {}", what, err);
        futures::stream::pending().boxed()
    })
}

/// Reads notifications of both characteristics until cancelled, or until the peripheral goes
/// away, which is reported as one `Dropped` event.
fn notification_pump(cancel: CancellationToken, adapter: Adapter, peripheral: Peripheral, events: LinkSender) -> JoinHandle<()> {
    spawn(async move {
        // without notifications commands still go out, the lamp just stays quiet
        let mut notification_stream = or_silent(peripheral.notifications().await, "Notifications");
        let mut central_events = or_silent(
            adapter.events().await,
            "Adapter events (disconnects are only noticed on write)",
        );
        let peripheral_id = peripheral.id();
        // one framer per characteristic, fragments of different characteristics must not mix
        let mut framers: HashMap<Uuid, LineFramer> = HashMap::new();

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                notification = notification_stream.next() => {
                    let Some(data) = notification else {
                        let _ = events.unbounded_send(LinkEvent::Dropped("Notification stream ended".to_string()));
                        break 'mainloop;
                    };

                    let source = line_source(data.uuid);
                    let framer = framers.entry(data.uuid).or_default();
                    for line in framer.feed_bytes(&data.value) {
                        if events.unbounded_send(LinkEvent::Line { source, line }).is_err() {
                            break 'mainloop;
                        }
                    }
                },
                Some(event) = central_events.next() => {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        if id == peripheral_id {
                            let _ = events.unbounded_send(LinkEvent::Dropped("Device disconnected".to_string()));
                            break 'mainloop;
                        }
                    }
                },
            }
        }
    })
}

pub struct BleTransport {
    selector: Option<String>,
    scan_duration: Duration,
    manager: Option<Manager>,
    // the device handle of the last connect, kept for reconnecting
    adapter: Option<Adapter>,
    peripheral: Option<Peripheral>,
    command_char: Option<Characteristic>,
    status_char: Option<Characteristic>,
    pump_cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
    state: LinkState,
}

impl BleTransport {
    pub fn new(selector: Option<String>, scan_duration: Duration) -> Self {
        BleTransport {
            selector,
            scan_duration,
            manager: None,
            adapter: None,
            peripheral: None,
            command_char: None,
            status_char: None,
            pump_cancel: CancellationToken::new(),
            pump: None,
            state: LinkState::Disconnected,
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!("BLE link {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    async fn manager(&mut self) -> Result<Manager, TransportError> {
        if let Some(manager) = &self.manager {
            return Ok(manager.clone());
        }
        let manager = Manager::new().await?;
        self.manager = Some(manager.clone());
        Ok(manager)
    }

    async fn scan(&self, adapters: &[Adapter], filter: ScanFilter, require_service: bool) -> Result<Option<(Adapter, Peripheral)>, TransportError> {
        for adapter in adapters {
            info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
            adapter.start_scan(filter.clone()).await?;
        }

        sleep(self.scan_duration).await;
        let found = find_peripheral(adapters, require_service, self.selector.as_deref()).await;

        for adapter in adapters {
            if let Err(err) = adapter.stop_scan().await {
                debug!("Failed to stop scanning: {}", err);
            }
        }

        Ok(found)
    }

    /// Stands in for a device picker: the first peripheral that advertises the lamp service
    /// (and matches the selector) wins. Lamps that leave the service out of their advertisement
    /// are found by a second, unfiltered scan.
    async fn request_device(&mut self) -> Result<(Adapter, Peripheral), TransportError> {
        let manager = self.manager().await?;
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(TransportError::Unsupported("Bluetooth LE"));
        }

        let filter = ScanFilter { services: vec![make_lamp_service_uuid()] };
        match self.scan(&adapters, filter, true).await {
            Ok(Some(found)) => return Ok(found),
            Ok(None) => info!("No device advertised the lamp service; scanning all devices"),
            Err(TransportError::Btle { source: btleplug::Error::PermissionDenied }) => {
                return Err(TransportError::Unsupported("Bluetooth LE (permission denied)"));
            },
            Err(err) => warn!("Filtered scan failed ({}); scanning all devices", err),
        }

        self.scan(&adapters, ScanFilter::default(), false)
            .await?
            .ok_or(TransportError::NoDeviceSelected)
    }

    async fn open(&mut self, adapter: Adapter, peripheral: Peripheral, events: LinkSender) -> Result<DeviceInfo, TransportError> {
        self.adapter = Some(adapter.clone());
        self.peripheral = Some(peripheral.clone());

        self.set_state(LinkState::Connecting);
        let (command_char, status_char) = match connect_peripheral(&peripheral).await {
            Ok(v) => v,
            Err(err) => {
                self.disconnect().await;
                return Err(err);
            },
        };

        self.set_state(LinkState::Subscribing);
        for characteristic in [&command_char, &status_char] {
            // not fatal: firmware without notify on a characteristic still takes commands
            if let Err(err) = peripheral.subscribe(characteristic).await {
                warn!("Notifications not available for {}: {}", characteristic.uuid, err);
            }
        }

        self.pump_cancel = CancellationToken::new();
        self.pump = Some(notification_pump(self.pump_cancel.clone(), adapter, peripheral.clone(), events));
        self.command_char = Some(command_char);
        self.status_char = Some(status_char);

        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            _ => None,
        };

        self.set_state(LinkState::Ready);
        Ok(DeviceInfo {
            id: peripheral.address().to_string(),
            name: name.unwrap_or_else(|| "BLE Device".to_string()),
        })
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn state(&self) -> LinkState {
        self.state
    }

    async fn is_supported(&mut self) -> bool {
        let manager = match self.manager().await {
            Ok(manager) => manager,
            Err(err) => {
                warn!("Bluetooth manager unavailable: {}", err);
                return false;
            },
        };

        match manager.adapters().await {
            Ok(adapters) => !adapters.is_empty(),
            Err(err) => {
                warn!("Failed to list Bluetooth adapters: {}", err);
                false
            },
        }
    }

    async fn connect(&mut self, events: LinkSender) -> Result<DeviceInfo, TransportError> {
        self.disconnect().await;

        self.set_state(LinkState::Discovering);
        let (adapter, peripheral) = match self.request_device().await {
            Ok(found) => found,
            Err(err) => {
                self.set_state(LinkState::Disconnected);
                return Err(err);
            },
        };

        self.open(adapter, peripheral, events).await
    }

    fn supports_reconnect(&self) -> bool {
        true
    }

    async fn reconnect(&mut self, events: LinkSender) -> Result<DeviceInfo, TransportError> {
        let (Some(adapter), Some(peripheral)) = (self.adapter.clone(), self.peripheral.clone()) else {
            return Err(TransportError::NotConnected);
        };

        self.disconnect().await;
        self.open(adapter, peripheral, events).await
    }

    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let (Some(peripheral), Some(command_char)) = (&self.peripheral, &self.command_char) else {
            return Err(TransportError::NotConnected);
        };

        let payload = with_newline(line);
        let fut = peripheral.write(command_char, payload.as_bytes(), WriteType::WithoutResponse);

        tokio::select! {
            _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                warn!("Sending to command characteristic took too long");
                Err(TransportError::Timeout("Writing to the lamp"))
            }
            result = fut => result.map_err(TransportError::from),
        }
    }

    async fn disconnect(&mut self) {
        self.pump_cancel.cancel();
        if let Some(handle) = self.pump.take() {
            if let Err(err) = handle.await {
                warn!("Notification task failed: {:?}", err);
            }
        }

        let characteristics: Vec<Characteristic> = self.command_char.take().into_iter().chain(self.status_char.take()).collect();

        if let Some(peripheral) = &self.peripheral {
            if peripheral.is_connected().await.unwrap_or(false) {
                for characteristic in &characteristics {
                    if let Err(err) = peripheral.unsubscribe(characteristic).await {
                        debug!("Failed to unsubscribe from {}: {}", characteristic.uuid, err);
                    }
                }

                info!("Disconnecting from peripheral");
                if let Err(err) = peripheral.disconnect().await {
                    warn!("Failed to disconnect: {}", err);
                }
            }
        }

        self.set_state(LinkState::Disconnected);
    }
}
