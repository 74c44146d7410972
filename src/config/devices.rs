use std::sync::Arc;
use indexmap::IndexMap;
use log::warn;

use crate::config::io::PreferenceStore;
use crate::error::ConfigError;

/// Display names the user gave to devices, keyed by the platform's device identifier
/// (BLE address, or serial port identity). One registry per transport.
pub struct KnownDevices {
    store: Arc<dyn PreferenceStore>,
    key: &'static str,
    names: IndexMap<String, String>,
}

impl std::fmt::Debug for KnownDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnownDevices")
            .field("key", &self.key)
            .field("names", &self.names)
            .finish()
    }
}

impl KnownDevices {
    pub fn load(store: Arc<dyn PreferenceStore>, key: &'static str) -> Self {
        let names = match store.get(key) {
            None => IndexMap::new(),
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|err| {
                warn!("Ignoring unreadable device names in {}: {}", key, err);
                IndexMap::new()
            }),
        };

        KnownDevices { store, key, names }
    }

    fn save(&self) -> Result<(), ConfigError> {
        let json = serde_json::to_string(&self.names)?;
        self.store.set(self.key, &json)
    }

    /// Adds a device seen on connect; an existing (possibly renamed) entry is kept.
    /// Returns true if the device was new.
    pub fn remember(&mut self, id: &str, name: &str) -> Result<bool, ConfigError> {
        if self.names.contains_key(id) {
            return Ok(false);
        }
        self.names.insert(id.to_string(), name.to_string());
        self.save()?;
        Ok(true)
    }

    pub fn rename(&mut self, id: &str, name: &str) -> Result<bool, ConfigError> {
        match self.names.get_mut(id) {
            None => Ok(false),
            Some(current) => {
                *current = name.to_string();
                self.save()?;
                Ok(true)
            },
        }
    }

    pub fn forget(&mut self, id: &str) -> Result<bool, ConfigError> {
        if self.names.shift_remove(id).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names.iter().map(|(id, name)| (id.as_str(), name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
