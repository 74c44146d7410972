use std::time::{Duration, SystemTime, UNIX_EPOCH};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use ::log::{debug, info, warn};
use tokio::time::{sleep_until, Instant};

use crate::config::devices::KnownDevices;
use crate::config::types::{Preferences, TransportKind};
use crate::device::constants::{COMMAND_CUSTOM_EXPORT, COMMAND_STATUS, RECONNECT_DELAY};
use crate::device::transport::Transport;
use crate::device::types::{DeviceInfo, LinkEvent};
use crate::error::{ConfigError, TransportError};
use crate::protocol::decoder::decode;
use crate::protocol::status::DeviceStatus;
use crate::session::log::{LogBuffer, LogEntry};
use crate::session::notice::NoticeGate;

pub mod facade;
pub mod log;
pub mod notice;

/// What happened in a session, for whoever shows it to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Log(LogEntry),
    Notice(String),
    StatusChanged,
    Connected(DeviceInfo),
    Disconnected,
    ReconnectScheduled,
}

/// Something `Session::wait` noticed; hand it to `Session::process`.
#[derive(Debug)]
pub enum Wake {
    Link(Option<LinkEvent>),
    Reconnect,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One transport plus everything built on top of it: status decoding, the log, user
/// notices and the reconnect policy.
///
/// Link events are only looked at from `wait`/`process` (or `next_event`), so all state is
/// owned by the task driving the session.
pub struct Session<T: Transport> {
    transport: T,
    prefs: Preferences,
    devices: KnownDevices,
    status: DeviceStatus,
    log: LogBuffer,
    notices: NoticeGate,
    auto_reconnect: bool,
    link: Option<UnboundedReceiver<LinkEvent>>,
    reconnect_at: Option<Instant>,
    /// The device to reconnect to; kept across a dropped link, forgotten on `disconnect`.
    device: Option<DeviceInfo>,
    events: UnboundedSender<SessionEvent>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, prefs: Preferences, events: UnboundedSender<SessionEvent>) -> Self {
        let devices = prefs.known_devices(transport.kind());
        let auto_reconnect = prefs.auto_reconnect();
        let log = LogBuffer::new(prefs.log_filter());

        Session {
            transport,
            prefs,
            devices,
            status: DeviceStatus::default(),
            log,
            notices: NoticeGate::default(),
            auto_reconnect,
            link: None,
            reconnect_at: None,
            device: None,
            events,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub fn known_devices(&self) -> &KnownDevices {
        &self.devices
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    fn emit(&self, event: SessionEvent) {
        // nobody listening is fine
        let _ = self.events.unbounded_send(event);
    }

    fn notify(&mut self, message: String) {
        if self.notices.admit(&message) {
            warn!("{}", message);
            self.emit(SessionEvent::Notice(message));
        } else {
            debug!("Repeated notice suppressed: {}", message);
        }
    }

    pub fn push_log(&mut self, line: &str) {
        if let Some(entry) = self.log.push(line, now_ms()) {
            self.emit(SessionEvent::Log(entry));
        }
    }

    /// Decodes a received line into the status, and logs it unless it was a recognized status
    /// line while the noise filter is on.
    pub fn handle_line(&mut self, line: &str) {
        let decoded = decode(line);

        if decoded.handled {
            self.status.apply(decoded.patch, decoded.defaults, now_ms());
            self.emit(SessionEvent::StatusChanged);
        }

        if !(decoded.handled && self.log.noise_filter()) {
            self.push_log(line);
        }
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if !self.transport.is_supported().await {
            let err = TransportError::Unsupported(self.kind().label());
            self.push_log(&format!("{} not available", self.kind()));
            self.notify(err.to_string());
            return Err(err);
        }

        self.reconnect_at = None;
        self.close_link().await;

        self.status.connecting = true;
        self.emit(SessionEvent::StatusChanged);

        let (sender, receiver) = unbounded();
        match self.transport.connect(sender).await {
            Ok(device) => {
                self.link = Some(receiver);
                self.on_connected(device).await;
                Ok(())
            },
            Err(err) if err.is_user_cancelled() => {
                info!("{}", err);
                self.status.connecting = false;
                self.emit(SessionEvent::StatusChanged);
                Err(err)
            },
            Err(err) => {
                let message = format!("Connect error: {}", err);
                self.push_log(&message);
                self.notify(message);
                self.cleanup().await;
                Err(err)
            },
        }
    }

    async fn on_connected(&mut self, device: DeviceInfo) {
        self.notices.reset();

        match self.devices.remember(&device.id, &device.name) {
            Ok(true) => info!("Remembering new device {} ({})", device.name, device.id),
            Ok(false) => {},
            Err(err) => warn!("Failed to save known devices: {}", err),
        }
        self.prefs.set_last_device(&device.id, &device.name);

        let name = self.devices.name_of(&device.id).unwrap_or(&device.name).to_string();
        info!("Connected to {} ({})", name, device.id);

        self.status.connected = true;
        self.status.connecting = false;
        self.status.device_name = name.clone();
        self.device = Some(device.clone());
        self.emit(SessionEvent::StatusChanged);
        self.emit(SessionEvent::Connected(device));
        self.push_log(&format!("Connected to {}", name));

        // a failing refresh has already been reported and cleaned up; it must not start
        // another reconnect from here or a broken link would be retried forever
        let _ = self.refresh(false).await;
    }

    /// Stops the link and drops everything tied to it. The device stays known for reconnecting.
    async fn close_link(&mut self) {
        self.link = None;
        self.transport.disconnect().await;
    }

    async fn cleanup(&mut self) {
        let was_connected = self.status.connected;
        self.close_link().await;
        self.status.reset_disconnected();
        self.emit(SessionEvent::StatusChanged);
        if was_connected {
            self.emit(SessionEvent::Disconnected);
        }
    }

    pub async fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.device = None;
        let was_connected = self.status.connected;
        self.cleanup().await;
        if was_connected {
            self.push_log("Disconnected");
        }
    }

    fn should_reconnect(&self) -> bool {
        self.auto_reconnect && self.device.is_some() && self.transport.supports_reconnect()
    }

    fn schedule_reconnect(&mut self) {
        info!("Reconnecting in {} ms", RECONNECT_DELAY);
        self.reconnect_at = Some(Instant::now() + Duration::from_millis(RECONNECT_DELAY));
        self.emit(SessionEvent::ReconnectScheduled);
    }

    pub async fn send_cmd(&mut self, command: &str) -> Result<(), TransportError> {
        match self.transport.write_line(command).await {
            Ok(()) => {
                self.push_log(&format!("> {}", command));
                Ok(())
            },
            Err(err) => {
                self.notify(format!("Send error: {}", err));
                if err.is_link_failure() && !self.transport.reports_disconnects() {
                    // the only sign of a lost serial port
                    self.push_log("Disconnected");
                    self.cleanup().await;
                }
                Err(err)
            },
        }
    }

    /// Asks the lamp for a full snapshot of its state.
    pub async fn refresh_status(&mut self) -> Result<(), TransportError> {
        self.refresh(true).await
    }

    async fn refresh(&mut self, may_reconnect: bool) -> Result<(), TransportError> {
        for command in [COMMAND_STATUS, COMMAND_CUSTOM_EXPORT] {
            if let Err(err) = self.transport.write_line(command).await {
                let message = format!("Status error: {}", err);
                self.push_log(&message);
                self.notify(message);
                self.cleanup().await;
                if may_reconnect && self.should_reconnect() {
                    self.schedule_reconnect();
                }
                return Err(err);
            }
            self.push_log(&format!("> {}", command));
        }

        Ok(())
    }

    async fn handle_drop(&mut self, reason: &str) {
        warn!("Link dropped: {}", reason);
        self.push_log("Disconnected");
        self.cleanup().await;
        if self.should_reconnect() {
            self.schedule_reconnect();
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Line { source, line } => {
                debug!("{:?}: {}", source, line);
                self.handle_line(&line);
            },
            LinkEvent::Dropped(reason) => self.handle_drop(&reason).await,
        }
    }

    /// Opens the link to the last device again; without one (or without transport support for
    /// it) this is a fresh `connect`. A failure is reported and not retried.
    pub async fn reconnect_now(&mut self) -> Result<(), TransportError> {
        self.reconnect_at = None;

        let Some(device) = self.device.clone() else {
            return self.connect().await;
        };
        if !self.transport.supports_reconnect() {
            return self.connect().await;
        }

        info!("Reconnecting to {} ({})", device.name, device.id);
        self.close_link().await;
        self.status.connecting = true;
        self.emit(SessionEvent::StatusChanged);

        let (sender, receiver) = unbounded();
        match self.transport.reconnect(sender).await {
            Ok(device) => {
                self.link = Some(receiver);
                self.on_connected(device).await;
                Ok(())
            },
            Err(err) => {
                let message = format!("Reconnect error: {}", err);
                self.push_log(&message);
                self.notify(message);
                self.cleanup().await;
                Err(err)
            },
        }
    }

    /// Waits for the next link event or the reconnect deadline. Cancel safe: nothing is lost
    /// when the returned future is dropped before completion.
    pub async fn wait(&mut self) -> Wake {
        let deadline = self.reconnect_at;
        let link = self.link.as_mut();
        let link = async move {
            match link {
                Some(link) => link.next().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = link => Wake::Link(event),
            _ = sleep_until_deadline(deadline) => Wake::Reconnect,
        }
    }

    pub async fn process(&mut self, wake: Wake) {
        match wake {
            Wake::Link(Some(event)) => self.handle_link_event(event).await,
            Wake::Link(None) => {
                debug!("Link event channel closed");
                self.link = None;
            },
            Wake::Reconnect => {
                // failures are reported inside
                let _ = self.reconnect_now().await;
            },
        }
    }

    pub async fn next_event(&mut self) {
        let wake = self.wait().await;
        self.process(wake).await;
    }

    pub fn set_live_log(&mut self, live: bool) {
        for entry in self.log.set_live(live) {
            self.emit(SessionEvent::Log(entry));
        }
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.auto_reconnect = enabled;
        self.prefs.set_auto_reconnect(enabled);
        if !enabled {
            self.reconnect_at = None;
        }
    }

    pub fn set_noise_filter(&mut self, enabled: bool) {
        self.log.set_noise_filter(enabled);
        self.prefs.set_log_filter(enabled);
    }

    pub fn rename_device(&mut self, id: &str, name: &str) -> Result<bool, ConfigError> {
        let renamed = self.devices.rename(id, name)?;
        let current = self.device.as_ref().is_some_and(|device| device.id == id);
        if renamed && current && self.status.connected {
            self.status.device_name = name.to_string();
            self.emit(SessionEvent::StatusChanged);
        }
        Ok(renamed)
    }

    pub fn forget_device(&mut self, id: &str) -> Result<bool, ConfigError> {
        self.devices.forget(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::UnboundedReceiver;
    use crate::device::fake::FakeTransport;
    use crate::device::types::LineSource;

    fn session(kind: TransportKind) -> (Session<FakeTransport>, FakeTransport, UnboundedReceiver<SessionEvent>) {
        let fake = FakeTransport::new(kind);
        let (sender, receiver) = unbounded();
        let session = Session::new(fake.clone(), Preferences::in_memory(), sender);
        (session, fake, receiver)
    }

    fn drain(receiver: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn notices(events: &[SessionEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Notice(message) => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }

    fn log_lines<T: Transport>(session: &Session<T>) -> Vec<String> {
        session.log().entries().map(|entry| entry.line.clone()).collect()
    }

    #[tokio::test]
    async fn connect_refreshes_and_remembers() {
        let (mut session, fake, mut receiver) = session(TransportKind::Ble);

        session.connect().await.unwrap();

        assert!(session.status().connected);
        assert!(!session.status().connecting);
        assert_eq!(session.status().device_name, "Quarzlampe");
        assert_eq!(fake.writes(), vec!["status", "custom export"]);
        assert_eq!(log_lines(&session), vec!["Connected to Quarzlampe", "> status", "> custom export"]);
        assert_eq!(session.known_devices().name_of("AA:BB:CC:DD:EE:FF"), Some("Quarzlampe"));
        assert_eq!(session.prefs.last_device_id().as_deref(), Some("AA:BB:CC:DD:EE:FF"));

        let events = drain(&mut receiver);
        assert!(events.contains(&SessionEvent::Connected(fake.with(|state| state.device.clone()))));
    }

    #[tokio::test]
    async fn renamed_device_keeps_its_name_on_connect() {
        let (mut session, _fake, _receiver) = session(TransportKind::Ble);
        session.connect().await.unwrap();
        assert!(session.rename_device("AA:BB:CC:DD:EE:FF", "Wohnzimmer").unwrap());
        assert_eq!(session.status().device_name, "Wohnzimmer");

        session.disconnect().await;
        session.connect().await.unwrap();
        assert_eq!(session.status().device_name, "Wohnzimmer");

        assert!(session.forget_device("AA:BB:CC:DD:EE:FF").unwrap());
        assert!(session.known_devices().is_empty());
    }

    #[tokio::test]
    async fn lines_update_status_and_log() {
        let (mut session, fake, _receiver) = session(TransportKind::Ble);
        session.connect().await.unwrap();

        fake.emit_line("Lamp=ON Brightness=42.0 Cap=80.0 Switch=ON");
        fake.emit_line("booting up...");
        fake.emit(LinkEvent::Line { source: LineSource::CommandCharacteristic, line: "[Light] raw=40".to_string() });
        for _ in 0..3 {
            session.next_event().await;
        }

        assert_eq!(session.status().report.brightness, Some(42.0));
        assert_eq!(session.status().report.lamp_state.as_deref(), Some("ON"));
        assert!(session.status().last_status_at.is_some());
        assert_eq!(session.status().report.has_light, Some(true));
        assert_eq!(session.status().report.light_raw, Some(40.0));
        // recognized and telemetry lines stay out of the log while filtering
        assert_eq!(log_lines(&session).last().map(String::as_str), Some("booting up..."));
        assert!(!log_lines(&session).iter().any(|line| line.starts_with("Lamp=")));

        session.set_noise_filter(false);
        assert!(!session.prefs.log_filter());
        fake.emit_line("Lamp=OFF Brightness=0.0");
        session.next_event().await;
        assert_eq!(log_lines(&session).last().map(String::as_str), Some("Lamp=OFF Brightness=0.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_reconnects_once_after_delay() {
        let (mut session, fake, mut receiver) = session(TransportKind::Ble);
        session.connect().await.unwrap();

        fake.emit(LinkEvent::Dropped("gone".to_string()));
        session.next_event().await;

        assert!(!session.status().connected);
        assert!(session.reconnect_pending());
        assert!(drain(&mut receiver).contains(&SessionEvent::ReconnectScheduled));

        let started = Instant::now();
        session.next_event().await;

        assert!(started.elapsed() >= Duration::from_millis(RECONNECT_DELAY));
        assert_eq!(fake.with(|state| (state.connects, state.reconnects)), (1, 1));
        assert!(session.status().connected);
        assert!(!session.reconnect_pending());

        // nothing else is scheduled
        let idle = tokio::time::timeout(Duration::from_secs(10), session.next_event()).await;
        assert!(idle.is_err());
        assert_eq!(fake.with(|state| state.reconnects), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_without_auto_reconnect_stays_down() {
        let (mut session, fake, _receiver) = session(TransportKind::Ble);
        session.set_auto_reconnect(false);
        session.connect().await.unwrap();

        fake.emit(LinkEvent::Dropped("gone".to_string()));
        session.next_event().await;
        assert!(!session.reconnect_pending());

        let idle = tokio::time::timeout(Duration::from_secs(10), session.next_event()).await;
        assert!(idle.is_err());
        assert_eq!(fake.with(|state| state.reconnects), 0);
        assert_eq!(log_lines(&session).last().map(String::as_str), Some("Disconnected"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_is_not_retried() {
        let (mut session, fake, mut receiver) = session(TransportKind::Ble);
        session.connect().await.unwrap();
        fake.with(|state| state.reconnect_error = Some(|| TransportError::Connect("out of range".to_string())));

        fake.emit(LinkEvent::Dropped("gone".to_string()));
        session.next_event().await;
        session.next_event().await;

        assert_eq!(fake.with(|state| state.reconnects), 1);
        assert!(!session.reconnect_pending());
        assert_eq!(notices(&drain(&mut receiver)), vec!["Reconnect error: Connect failed: out of range"]);
    }

    #[tokio::test]
    async fn unsupported_platform_is_reported_without_attempt() {
        let (mut session, fake, mut receiver) = session(TransportKind::Ble);
        fake.with(|state| state.supported = false);

        assert!(matches!(session.connect().await, Err(TransportError::Unsupported(_))));
        assert!(matches!(session.connect().await, Err(TransportError::Unsupported(_))));

        assert_eq!(fake.with(|state| state.connects), 0);
        assert_eq!(notices(&drain(&mut receiver)).len(), 1);
    }

    #[tokio::test]
    async fn cancelled_choice_is_silent() {
        let (mut session, fake, mut receiver) = session(TransportKind::Serial);
        fake.with(|state| state.connect_error = Some(|| TransportError::NoPortSelected));

        assert!(session.connect().await.unwrap_err().is_user_cancelled());
        assert!(!session.status().connecting);
        assert!(notices(&drain(&mut receiver)).is_empty());
        assert!(session.log().is_empty());
    }

    #[tokio::test]
    async fn connect_error_is_logged_and_cleaned_up() {
        let (mut session, fake, mut receiver) = session(TransportKind::Ble);
        fake.with(|state| state.connect_error = Some(|| TransportError::Connect("no service".to_string())));

        assert!(session.connect().await.is_err());
        assert!(!session.status().connecting);
        assert_eq!(log_lines(&session), vec!["Connect error: Connect failed: no service"]);
        assert_eq!(notices(&drain(&mut receiver)).len(), 1);
        assert_eq!(fake.with(|state| state.disconnects), 2);
    }

    #[tokio::test]
    async fn repeated_send_failures_notify_once() {
        let (mut session, fake, mut receiver) = session(TransportKind::Ble);

        for _ in 0..3 {
            assert!(session.send_cmd("bri 50").await.is_err());
        }
        assert_eq!(notices(&drain(&mut receiver)), vec!["Send error: Not connected"]);

        session.connect().await.unwrap();
        fake.with(|state| state.fail_writes = true);
        for _ in 0..2 {
            assert!(session.send_cmd("bri 50").await.is_err());
        }
        assert_eq!(notices(&drain(&mut receiver)), vec!["Send error: Connection lost: write failed"]);

        // a reporting transport stays up until it says otherwise
        assert!(session.status().connected);
    }

    #[tokio::test]
    async fn serial_write_failure_counts_as_drop() {
        let (mut session, fake, _receiver) = session(TransportKind::Serial);
        session.connect().await.unwrap();
        fake.with(|state| state.fail_writes = true);

        assert!(session.send_cmd("mode 3").await.is_err());

        assert!(!session.status().connected);
        assert!(!session.reconnect_pending());
        assert_eq!(log_lines(&session).last().map(String::as_str), Some("Disconnected"));
    }

    #[tokio::test]
    async fn refresh_failure_schedules_reconnect() {
        let (mut session, fake, _receiver) = session(TransportKind::Ble);
        session.connect().await.unwrap();
        fake.with(|state| state.fail_writes = true);

        assert!(session.refresh_status().await.is_err());
        assert!(!session.status().connected);
        assert!(session.reconnect_pending());
        assert_eq!(
            log_lines(&session).last().map(String::as_str),
            Some("Status error: Connection lost: write failed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_refresh_after_reconnect_is_not_retried() {
        let (mut session, fake, _receiver) = session(TransportKind::Ble);
        session.connect().await.unwrap();
        fake.with(|state| state.fail_writes = true);

        fake.emit(LinkEvent::Dropped("gone".to_string()));
        let idle = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                session.next_event().await;
            }
        })
        .await;

        assert!(idle.is_err());
        assert_eq!(fake.with(|state| state.reconnects), 1);
        assert!(!session.status().connected);
        assert!(!session.reconnect_pending());
        assert_eq!(
            log_lines(&session).last().map(String::as_str),
            Some("Status error: Connection lost: write failed")
        );
    }

    #[tokio::test]
    async fn failing_refresh_on_connect_schedules_nothing() {
        let (mut session, fake, _receiver) = session(TransportKind::Ble);
        fake.with(|state| state.fail_writes = true);

        assert!(session.connect().await.is_ok());
        assert!(!session.status().connected);
        assert!(!session.reconnect_pending());
        assert_eq!(fake.with(|state| state.connects), 1);
    }

    #[tokio::test]
    async fn user_disconnect_forgets_device() {
        let (mut session, fake, _receiver) = session(TransportKind::Ble);
        session.connect().await.unwrap();
        session.disconnect().await;

        assert!(!session.status().connected);
        assert!(session.status().device_name.is_empty());
        assert!(!session.reconnect_pending());
        assert!(session.refresh_status().await.is_err());
        // no device to go back to
        assert!(!session.reconnect_pending());
        assert_eq!(fake.with(|state| state.state), crate::device::types::LinkState::Disconnected);
    }

    #[tokio::test]
    async fn paused_log_flushes_on_resume() {
        let (mut session, fake, mut receiver) = session(TransportKind::Ble);
        session.connect().await.unwrap();
        drain(&mut receiver);

        session.set_live_log(false);
        fake.emit_line("hello");
        fake.emit_line("world");
        session.next_event().await;
        session.next_event().await;
        assert!(!log_lines(&session).contains(&"hello".to_string()));

        session.set_live_log(true);
        let flushed: Vec<_> = drain(&mut receiver)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Log(entry) => Some(entry.line),
                _ => None,
            })
            .collect();
        assert_eq!(flushed, vec!["hello", "world"]);
        assert!(log_lines(&session).ends_with(&["hello".to_string(), "world".to_string()]));
    }
}
