use futures::channel::mpsc::UnboundedSender;
use log::info;

use crate::config::devices::KnownDevices;
use crate::config::types::{Preferences, TransportKind};
use crate::device::transport::Transport;
use crate::error::{ConfigError, TransportError};
use crate::protocol::status::DeviceStatus;
use crate::session::log::LogBuffer;
use crate::session::{Session, SessionEvent, Wake};

macro_rules! on_active {
    ($self:ident, |ref $session:ident| $body:expr) => {
        match $self.active {
            TransportKind::Ble => {
                let $session = &$self.ble;
                $body
            },
            TransportKind::Serial => {
                let $session = &$self.serial;
                $body
            },
        }
    };
    ($self:ident, |$session:ident| $body:expr) => {
        match $self.active {
            TransportKind::Ble => {
                let $session = &mut $self.ble;
                $body
            },
            TransportKind::Serial => {
                let $session = &mut $self.serial;
                $body
            },
        }
    };
}

/// Both transports behind one interface; only the active one is connected and serviced.
pub struct Connection<B: Transport, S: Transport> {
    ble: Session<B>,
    serial: Session<S>,
    active: TransportKind,
    prefs: Preferences,
}

impl<B: Transport, S: Transport> Connection<B, S> {
    /// Starts out on the transport used last time, Bluetooth LE otherwise.
    pub fn new(ble: B, serial: S, prefs: Preferences, events: UnboundedSender<SessionEvent>) -> Self {
        let active = prefs.last_transport().unwrap_or(TransportKind::Ble);

        Connection {
            ble: Session::new(ble, prefs.clone(), events.clone()),
            serial: Session::new(serial, prefs.clone(), events),
            active,
            prefs,
        }
    }

    pub fn active(&self) -> TransportKind {
        self.active
    }

    /// Switching transports disconnects the one in use.
    pub async fn select_transport(&mut self, kind: TransportKind) {
        if kind != self.active {
            info!("Switching from {} to {}", self.active, kind);
            on_active!(self, |session| session.disconnect().await);
            self.active = kind;
        }
        self.prefs.set_last_transport(Some(kind));
    }

    /// Only a connect that went through is remembered as the transport to start on next time.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        let result = on_active!(self, |session| session.connect().await);
        if result.is_ok() {
            self.prefs.set_last_transport(Some(self.active));
        }
        result
    }

    pub async fn disconnect(&mut self) {
        on_active!(self, |session| session.disconnect().await);
        self.prefs.set_last_transport(None);
    }

    /// Closes the link on shutdown; unlike `disconnect` the transport is still used next time.
    pub async fn close(&mut self) {
        on_active!(self, |session| session.disconnect().await)
    }

    pub async fn reconnect_now(&mut self) -> Result<(), TransportError> {
        on_active!(self, |session| session.reconnect_now().await)
    }

    pub async fn send_cmd(&mut self, command: &str) -> Result<(), TransportError> {
        on_active!(self, |session| session.send_cmd(command).await)
    }

    pub async fn refresh_status(&mut self) -> Result<(), TransportError> {
        on_active!(self, |session| session.refresh_status().await)
    }

    pub fn status(&self) -> &DeviceStatus {
        on_active!(self, |ref session| session.status())
    }

    pub fn log(&self) -> &LogBuffer {
        on_active!(self, |ref session| session.log())
    }

    pub fn known_devices(&self) -> &KnownDevices {
        on_active!(self, |ref session| session.known_devices())
    }

    pub fn auto_reconnect(&self) -> bool {
        on_active!(self, |ref session| session.auto_reconnect())
    }

    pub fn reconnect_pending(&self) -> bool {
        on_active!(self, |ref session| session.reconnect_pending())
    }

    /// The connected device's name, or else the one connected last time.
    pub fn device_name(&self) -> Option<String> {
        let name = &self.status().device_name;
        if name.is_empty() {
            self.prefs.last_device_name()
        } else {
            Some(name.clone())
        }
    }

    pub fn set_live_log(&mut self, live: bool) {
        self.ble.set_live_log(live);
        self.serial.set_live_log(live);
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.ble.set_auto_reconnect(enabled);
        self.serial.set_auto_reconnect(enabled);
    }

    pub fn set_noise_filter(&mut self, enabled: bool) {
        self.ble.set_noise_filter(enabled);
        self.serial.set_noise_filter(enabled);
    }

    pub fn rename_device(&mut self, id: &str, name: &str) -> Result<bool, ConfigError> {
        on_active!(self, |session| session.rename_device(id, name))
    }

    pub fn forget_device(&mut self, id: &str) -> Result<bool, ConfigError> {
        on_active!(self, |session| session.forget_device(id))
    }

    /// See `Session::wait`.
    pub async fn wait(&mut self) -> Wake {
        on_active!(self, |session| session.wait().await)
    }

    pub async fn process(&mut self, wake: Wake) {
        on_active!(self, |session| session.process(wake).await)
    }
}
