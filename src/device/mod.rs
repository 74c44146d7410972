pub mod ble;
pub mod constants;
pub mod serial;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};
    use async_trait::async_trait;

    use crate::config::types::TransportKind;
    use crate::device::transport::{LinkSender, Transport};
    use crate::device::types::{DeviceInfo, LineSource, LinkEvent, LinkState};
    use crate::error::TransportError;

    #[derive(Debug)]
    pub struct FakeState {
        pub supported: bool,
        pub connect_error: Option<fn() -> TransportError>,
        pub reconnect_error: Option<fn() -> TransportError>,
        pub fail_writes: bool,
        pub reconnectable: bool,
        pub reports_disconnects: bool,
        pub device: DeviceInfo,
        pub connects: usize,
        pub reconnects: usize,
        pub disconnects: usize,
        pub writes: Vec<String>,
        pub events: Option<LinkSender>,
        pub state: LinkState,
    }

    /// Scripted transport; the test keeps a handle on the shared state to steer it and to
    /// look at what the session did.
    #[derive(Clone)]
    pub struct FakeTransport {
        pub kind: TransportKind,
        pub shared: Arc<Mutex<FakeState>>,
    }

    impl FakeTransport {
        pub fn new(kind: TransportKind) -> Self {
            let state = FakeState {
                supported: true,
                connect_error: None,
                reconnect_error: None,
                fail_writes: false,
                reconnectable: kind == TransportKind::Ble,
                reports_disconnects: kind == TransportKind::Ble,
                device: DeviceInfo { id: "AA:BB:CC:DD:EE:FF".to_string(), name: "Quarzlampe".to_string() },
                connects: 0,
                reconnects: 0,
                disconnects: 0,
                writes: Vec::new(),
                events: None,
                state: LinkState::Disconnected,
            };

            FakeTransport { kind, shared: Arc::new(Mutex::new(state)) }
        }

        pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
            f(&mut self.shared.lock().unwrap())
        }

        pub fn writes(&self) -> Vec<String> {
            self.with(|state| state.writes.clone())
        }

        /// Delivers a line as if the device had sent it.
        pub fn emit_line(&self, line: &str) {
            self.emit(LinkEvent::Line { source: LineSource::StatusCharacteristic, line: line.to_string() });
        }

        pub fn emit(&self, event: LinkEvent) {
            let events = self.with(|state| state.events.clone()).expect("fake transport is not connected");
            events.unbounded_send(event).unwrap();
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn state(&self) -> LinkState {
            self.with(|state| state.state)
        }

        async fn is_supported(&mut self) -> bool {
            self.with(|state| state.supported)
        }

        async fn connect(&mut self, events: LinkSender) -> Result<DeviceInfo, TransportError> {
            self.with(|state| {
                state.connects += 1;
                if let Some(error) = state.connect_error {
                    return Err(error());
                }
                state.events = Some(events);
                state.state = LinkState::Ready;
                Ok(state.device.clone())
            })
        }

        fn supports_reconnect(&self) -> bool {
            self.with(|state| state.reconnectable)
        }

        async fn reconnect(&mut self, events: LinkSender) -> Result<DeviceInfo, TransportError> {
            self.with(|state| {
                state.reconnects += 1;
                if let Some(error) = state.reconnect_error {
                    return Err(error());
                }
                state.events = Some(events);
                state.state = LinkState::Ready;
                Ok(state.device.clone())
            })
        }

        async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
            self.with(|state| {
                if state.state != LinkState::Ready {
                    return Err(TransportError::NotConnected);
                }
                if state.fail_writes {
                    return Err(TransportError::Dropped("write failed".to_string()));
                }
                state.writes.push(line.to_string());
                Ok(())
            })
        }

        async fn disconnect(&mut self) {
            self.with(|state| {
                state.disconnects += 1;
                state.events = None;
                state.state = LinkState::Disconnected;
            })
        }

        fn reports_disconnects(&self) -> bool {
            self.with(|state| state.reports_disconnects)
        }
    }
}
