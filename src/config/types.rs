use std::sync::Arc;
use clap::ValueEnum;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::devices::KnownDevices;
use crate::config::io::{MemoryPreferences, PreferenceStore};

pub const KEY_LAST_TRANSPORT: &str = "ql-last-transport";
pub const KEY_LAST_DEVICE_ID: &str = "ql-last-device-id";
pub const KEY_LAST_DEVICE_NAME: &str = "ql-last-device-name";
pub const KEY_AUTO_RECONNECT: &str = "ql-auto-reconnect";
pub const KEY_LOG_FILTER: &str = "ql-log-filter";
pub const KEY_BLE_NAMES: &str = "ql-ble-names";
pub const KEY_SERIAL_NAMES: &str = "ql-serial-names";
pub const KEY_THEME: &str = "ql-theme";
pub const KEY_LANGUAGE: &str = "ql-lang";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ble,
    Serial,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Ble => "ble",
            TransportKind::Serial => "serial",
        }
    }

    pub fn parse(value: &str) -> Option<TransportKind> {
        match value {
            "ble" => Some(TransportKind::Ble),
            "serial" => Some(TransportKind::Serial),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Ble => "Bluetooth LE",
            TransportKind::Serial => "Serial",
        }
    }

    fn names_key(&self) -> &'static str {
        match self {
            TransportKind::Ble => KEY_BLE_NAMES,
            TransportKind::Serial => KEY_SERIAL_NAMES,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Typed access to the persisted preferences.
///
/// Failing to persist a preference is logged and otherwise ignored: the value in effect for
/// this run does not depend on it.
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn PreferenceStore>,
}

impl std::fmt::Debug for Preferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preferences").finish_non_exhaustive()
    }
}

impl Preferences {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Preferences { store }
    }

    pub fn in_memory() -> Self {
        Preferences::new(Arc::new(MemoryPreferences::default()))
    }

    pub fn store(&self) -> Arc<dyn PreferenceStore> {
        self.store.clone()
    }

    fn set(&self, key: &str, value: &str) {
        if let Err(err) = self.store.set(key, value) {
            warn!("Failed to save preference {}: {}", key, err);
        }
    }

    fn remove(&self, key: &str) {
        if let Err(err) = self.store.remove(key) {
            warn!("Failed to remove preference {}: {}", key, err);
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.store.get(key).as_deref() {
            Some("1") | Some("true") => true,
            Some("0") | Some("false") => false,
            _ => default,
        }
    }

    fn set_bool(&self, key: &str, value: bool) {
        self.set(key, if value { "1" } else { "0" });
    }

    pub fn last_transport(&self) -> Option<TransportKind> {
        self.store.get(KEY_LAST_TRANSPORT).as_deref().and_then(TransportKind::parse)
    }

    pub fn set_last_transport(&self, transport: Option<TransportKind>) {
        match transport {
            Some(transport) => self.set(KEY_LAST_TRANSPORT, transport.as_str()),
            None => self.remove(KEY_LAST_TRANSPORT),
        }
    }

    pub fn last_device_id(&self) -> Option<String> {
        self.store.get(KEY_LAST_DEVICE_ID)
    }

    pub fn last_device_name(&self) -> Option<String> {
        self.store.get(KEY_LAST_DEVICE_NAME)
    }

    pub fn set_last_device(&self, id: &str, name: &str) {
        self.set(KEY_LAST_DEVICE_ID, id);
        self.set(KEY_LAST_DEVICE_NAME, name);
    }

    pub fn auto_reconnect(&self) -> bool {
        self.get_bool(KEY_AUTO_RECONNECT, true)
    }

    pub fn set_auto_reconnect(&self, value: bool) {
        self.set_bool(KEY_AUTO_RECONNECT, value);
    }

    pub fn log_filter(&self) -> bool {
        self.get_bool(KEY_LOG_FILTER, true)
    }

    pub fn set_log_filter(&self, value: bool) {
        self.set_bool(KEY_LOG_FILTER, value);
    }

    pub fn theme(&self) -> Option<String> {
        self.store.get(KEY_THEME)
    }

    pub fn set_theme(&self, theme: &str) {
        self.set(KEY_THEME, theme);
    }

    pub fn language(&self) -> Option<String> {
        self.store.get(KEY_LANGUAGE)
    }

    pub fn set_language(&self, language: &str) {
        self.set(KEY_LANGUAGE, language);
    }

    pub fn known_devices(&self, transport: TransportKind) -> KnownDevices {
        KnownDevices::load(self.store.clone(), transport.names_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let prefs = Preferences::in_memory();
        assert!(prefs.auto_reconnect());
        assert!(prefs.log_filter());
        assert_eq!(prefs.last_transport(), None);
        assert_eq!(prefs.last_device_id(), None);
        assert_eq!(prefs.theme(), None);
    }

    #[test]
    fn round_trip_values() {
        let prefs = Preferences::in_memory();
        prefs.set_auto_reconnect(false);
        prefs.set_log_filter(false);
        prefs.set_last_transport(Some(TransportKind::Serial));
        prefs.set_last_device("usb:1a86:7523", "CH340");
        prefs.set_theme("dark");
        prefs.set_language("de");

        assert!(!prefs.auto_reconnect());
        assert!(!prefs.log_filter());
        assert_eq!(prefs.last_transport(), Some(TransportKind::Serial));
        assert_eq!(prefs.last_device_name().as_deref(), Some("CH340"));
        assert_eq!(prefs.theme().as_deref(), Some("dark"));
        assert_eq!(prefs.language().as_deref(), Some("de"));

        prefs.set_last_transport(None);
        assert_eq!(prefs.last_transport(), None);
    }

    #[test]
    fn unknown_transport_value_is_ignored() {
        let prefs = Preferences::in_memory();
        prefs.store().set(KEY_LAST_TRANSPORT, "usb").unwrap();
        assert_eq!(prefs.last_transport(), None);
    }
}
