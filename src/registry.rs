//! Session registry.
//!
//! Persists, per container, the ordered list of tab keys and the terminal
//! session each tab is bound to, so a restarted front-end can silently
//! reattach to sessions that are still alive on the server.
//!
//! Writes are last-writer-wins. Two front-ends driving the same container
//! should pass distinct window ids so their keys do not collide.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};

use crate::constants::STORAGE_PREFIX;

/// Durable string key/value storage.
pub trait Storage {
    /// Read a value. `Ok(None)` when the key was never written.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

impl<T: Storage + ?Sized> Storage for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

/// One JSON file per key inside a directory, named by the Base32 of the key.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Store files under `dir`, creating it on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for a key. Base32 keeps every key distinct and filesystem-safe,
    /// including on case-insensitive filesystems.
    fn path_for(&self, key: &str) -> PathBuf {
        let name = BASE32_NOPAD.encode(key.as_bytes());
        self.dir.join(format!("{name}.json"))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(content))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(key);
        fs::write(&path, value).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

/// In-process storage for tests and ephemeral front-ends.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

/// A persisted tab and the session it was attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRecord {
    /// Local tab identifier, e.g. `tab-3`.
    pub tab_key: String,
    /// Server-side terminal session id.
    pub session_id: String,
}

impl TabRecord {
    /// Build a record.
    pub fn new(tab_key: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            tab_key: tab_key.into(),
            session_id: session_id.into(),
        }
    }
}

/// Per-container tab → session mapping on top of a [`Storage`].
#[derive(Debug)]
pub struct SessionRegistry<S> {
    storage: S,
    window: Option<String>,
}

impl<S: Storage> SessionRegistry<S> {
    /// Registry sharing one namespace across all front-ends.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            window: None,
        }
    }

    /// Namespace keys with a per-window id.
    #[must_use]
    pub fn with_window(mut self, window: Option<String>) -> Self {
        self.window = window.filter(|w| !w.is_empty());
        self
    }

    /// Underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Durable key for a container.
    pub fn key(&self, container_id: &str) -> String {
        match &self.window {
            Some(window) => format!("{STORAGE_PREFIX}:{window}:terminal-tabs:{container_id}"),
            None => format!("{STORAGE_PREFIX}:terminal-tabs:{container_id}"),
        }
    }

    /// Saved tabs for a container, in saved order.
    ///
    /// Missing, unreadable or corrupt data yields an empty list.
    pub fn load(&self, container_id: &str) -> Vec<TabRecord> {
        let key = self.key(container_id);
        let raw = match self.storage.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::warn!("[Registry] Failed to read {}: {:#}", key, e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<StoredRecord>>(&raw) {
            Ok(stored) => normalize(stored.into_iter().filter_map(StoredRecord::into_record)),
            Err(e) => {
                log::warn!("[Registry] Ignoring corrupt entry {}: {}", key, e);
                Vec::new()
            }
        }
    }

    /// Replace the saved tabs for a container.
    ///
    /// Entries without a session id are skipped and duplicate tab keys keep
    /// their first occurrence. Saving an empty list removes the key.
    pub fn save<'a, I>(&self, container_id: &str, tabs: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        let records = normalize(tabs.into_iter().filter_map(|(tab_key, session_id)| {
            session_id
                .filter(|s| !s.is_empty())
                .map(|s| TabRecord::new(tab_key, s))
        }));

        let key = self.key(container_id);
        if records.is_empty() {
            log::debug!("[Registry] No sessions to keep for {}", container_id);
            return self.storage.remove(&key);
        }

        let json = serde_json::to_string(&records).context("Failed to serialize tab records")?;
        self.storage.set(&key, &json)?;
        log::debug!(
            "[Registry] Saved {} tab(s) for {}",
            records.len(),
            container_id
        );
        Ok(())
    }

    /// Forget every tab for a container.
    pub fn clear(&self, container_id: &str) -> Result<()> {
        self.storage.remove(&self.key(container_id))
    }
}

/// Lenient on-disk shape: older writers may have stored a null session id.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    tab_key: String,
    #[serde(default)]
    session_id: Option<String>,
}

impl StoredRecord {
    fn into_record(self) -> Option<TabRecord> {
        let session_id = self.session_id.filter(|s| !s.is_empty())?;
        Some(TabRecord {
            tab_key: self.tab_key,
            session_id,
        })
    }
}

fn normalize(records: impl Iterator<Item = TabRecord>) -> Vec<TabRecord> {
    let mut seen = HashSet::new();
    records
        .filter(|record| seen.insert(record.tab_key.clone()))
        .collect()
}
