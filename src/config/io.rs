use std::collections::BTreeMap;
use std::env::current_exe;
use std::fs::OpenOptions;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use directories_next::ProjectDirs;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{info, warn};
use serde_json;

use crate::error::ConfigError;

/// Key/value persistence used for preferences and the known-device registries.
/// Every `set`/`remove` is persisted before it returns.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
    fn remove(&self, key: &str) -> Result<(), ConfigError>;
}

// creates a path to quarzlampe-link.json in the same directory as the executable
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to quarzlampe-link.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("de", "quarzlampe", "quarzlampe-link").map(|dirs| {
        dirs.config_dir().join("quarzlampe-link.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        if let Ok(attr) = std::fs::metadata(&path) {
            if attr.is_file() {
                return Ok(path);
            }
        }
    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

pub struct PreferencesLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl PreferencesLocker {
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        match self.rw_lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(source) => Err(ConfigError::CanNotLock { source }),
        }
    }
}

struct FilePreferencesInner {
    file: std::fs::File,
    values: BTreeMap<String, String>,
}

impl FilePreferencesInner {
    fn persist(&mut self) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(&self.values)?;
        self.file.rewind()?;
        self.file.set_len(0)?;
        self.file.write_all(content.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

/// Preferences stored as one flat JSON object on disk.
#[derive(Clone)]
pub struct FilePreferences {
    inner: Arc<Mutex<FilePreferencesInner>>,
}

impl FilePreferences {
    pub fn new_sync() -> Result<Self, ConfigError> {
        let path = get_config_path()?;
        info!("Using preferences file {}", path.to_string_lossy());
        Self::open_sync(&path)
    }

    pub fn open_sync(path: &Path) -> Result<Self, ConfigError> {
        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(path)?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let values = if content.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&content)?
        };

        let inner = FilePreferencesInner { file, values };
        Ok(FilePreferences { inner: Arc::new(Mutex::new(inner)) })
    }

    /// An exclusive lock on the preferences file, so that only one instance of this
    /// application talks to the lamp.
    pub fn locker(&self) -> Result<PreferencesLocker, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock FilePreferences inner");

        Ok(PreferencesLocker {
            rw_lock: RwLock::new(inner.file.try_clone()?),
        })
    }
}

impl PreferenceStore for FilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().expect("Failed to lock FilePreferences inner");
        inner.values.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut inner = self.inner.lock().expect("Failed to lock FilePreferences inner");
        inner.values.insert(key.to_string(), value.to_string());
        inner.persist()
    }

    fn remove(&self, key: &str) -> Result<(), ConfigError> {
        let mut inner = self.inner.lock().expect("Failed to lock FilePreferences inner");
        if inner.values.remove(key).is_some() {
            inner.persist()?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, String>>,
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().expect("Failed to lock MemoryPreferences").get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.values.lock().expect("Failed to lock MemoryPreferences").insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ConfigError> {
        self.values.lock().expect("Failed to lock MemoryPreferences").remove(key);
        Ok(())
    }
}
