//! Durable string-keyed storage shared between tabs.
//!
//! [`LocalStorage`] mirrors the browser's local storage: a flat map of string
//! keys to string values, optionally persisted to a JSON file, with a change
//! notification channel. Every handle created through
//! [`LocalStorage::sibling`] behaves like another tab over the same store:
//! it sees the same values, and it is notified of changes made by every
//! handle except itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;

/// Storage keys used by the session core.
pub mod keys {
    /// Bearer token issued by the server.
    pub const TOKEN: &str = "token";
    /// Server-confirmed user id.
    pub const USER_ID: &str = "userId";
    /// `"true"` / `"false"` login marker.
    pub const IS_LOGGED_IN: &str = "isLoggedIn";
    /// Stable per-profile device identifier.
    pub const DEVICE_ID: &str = "deviceId";
    /// Last navigation path recorded by the application.
    pub const LAST_PATH: &str = "lastPath";
    /// `"true"` while a restoration is in progress.
    pub const SESSION_LOCK: &str = "sessionLock";
    /// RFC 3339 timestamp of when `sessionLock` was taken.
    pub const SESSION_LOCK_AT: &str = "sessionLockAt";
}

/// Capacity of the change notification channel.
const EVENT_CAPACITY: usize = 64;

/// A change made to the store by another handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// The key that changed.
    pub key: String,
    /// Value before the change.
    pub old_value: Option<String>,
    /// Value after the change (`None` when removed).
    pub new_value: Option<String>,
    origin: u64,
}

#[derive(Debug)]
struct Shared {
    entries: Mutex<BTreeMap<String, String>>,
    path: Option<PathBuf>,
    events: broadcast::Sender<StorageEvent>,
    next_handle: AtomicU64,
}

/// Handle onto a shared durable store.
///
/// Cloning a handle yields the same tab; use [`LocalStorage::sibling`] to
/// open another one.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    shared: Arc<Shared>,
    handle: u64,
}

impl LocalStorage {
    /// Creates an empty store that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_entries(BTreeMap::new(), None)
    }

    /// Opens a store persisted to the JSON file at `path`.
    ///
    /// A missing file yields an empty store; the file and its parent
    /// directories are created on the first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or does not
    /// contain a JSON object of strings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = entries.len(), "Opened storage file");
        Ok(Self::with_entries(entries, Some(path)))
    }

    fn with_entries(entries: BTreeMap<String, String>, path: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(entries),
                path,
                events,
                next_handle: AtomicU64::new(1),
            }),
            handle: 0,
        }
    }

    /// Opens another handle ("tab") over the same store.
    #[must_use]
    pub fn sibling(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            handle: self.shared.next_handle.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    /// Returns `true` if `key` holds exactly `"true"`.
    #[must_use]
    pub fn get_flag(&self, key: &str) -> bool {
        self.get(key).as_deref() == Some("true")
    }

    /// Stores `value` under `key`, overwriting any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is file-backed and persisting fails.
    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        let mut entries = self.entries();
        let old_value = entries.insert(key.to_string(), value.clone());
        if old_value.as_deref() == Some(value.as_str()) {
            return Ok(());
        }
        self.persist(&entries)?;
        drop(entries);
        self.notify(key, old_value, Some(value));
        Ok(())
    }

    /// Stores `"true"` or `"false"` under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" })
    }

    /// Removes `key` from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    pub fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries();
        let Some(old_value) = entries.remove(key) else {
            return Ok(());
        };
        self.persist(&entries)?;
        drop(entries);
        self.notify(key, Some(old_value), None);
        Ok(())
    }

    /// Subscribes to changes made by other handles.
    #[must_use]
    pub fn subscribe(&self) -> StorageEvents {
        StorageEvents {
            receiver: self.shared.events.subscribe(),
            handle: self.handle,
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        // No subscribers is not an error
        let _ = self.shared.events.send(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
            origin: self.handle,
        });
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let Some(path) = &self.shared.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Stream of changes made by other handles over the same store.
#[derive(Debug)]
pub struct StorageEvents {
    receiver: broadcast::Receiver<StorageEvent>,
    handle: u64,
}

impl StorageEvents {
    /// Waits for the next change made by another handle.
    ///
    /// Returns `None` once every handle onto the store has been dropped.
    pub async fn next(&mut self) -> Option<StorageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.origin == self.handle => {}
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Storage change listener lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
