use crate::types::{SarError, SarResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Progress of one work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub state: WorkState,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Shared progress record: work-unit id to state
///
/// Unit ids are namespaced by stage: `calibrate:<scene>`, `composite:P05_T126`,
/// `mosaic:P05`, `stack`, `smooth`.
pub trait StatusStore: Send + Sync {
    fn get(&self, unit: &str) -> Option<StatusEntry>;

    fn set(&self, unit: &str, state: WorkState, detail: Option<String>) -> SarResult<()>;

    fn entries(&self) -> BTreeMap<String, StatusEntry>;

    fn is_completed(&self, unit: &str) -> bool {
        matches!(self.get(unit), Some(entry) if entry.state == WorkState::Completed)
    }
}

fn lock_err<T>(_: std::sync::PoisonError<T>) -> SarError {
    SarError::Processing("status store lock poisoned".to_string())
}

/// In-memory store, used when no status file is configured
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    entries: Mutex<BTreeMap<String, StatusEntry>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusStore for MemoryStatusStore {
    fn get(&self, unit: &str) -> Option<StatusEntry> {
        self.entries.lock().ok()?.get(unit).cloned()
    }

    fn set(&self, unit: &str, state: WorkState, detail: Option<String>) -> SarResult<()> {
        let entry = StatusEntry { state, updated: Utc::now(), detail };
        self.entries.lock().map_err(lock_err)?.insert(unit.to_string(), entry);
        Ok(())
    }

    fn entries(&self) -> BTreeMap<String, StatusEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

/// JSON file store; every update rewrites the file through a temporary
/// sibling that is renamed over the old one
#[derive(Debug)]
pub struct JsonStatusStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, StatusEntry>>,
}

impl JsonStatusStore {
    /// Open an existing status file or start an empty one
    pub fn open<P: AsRef<Path>>(path: P) -> SarResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            BTreeMap::new()
        };

        log::debug!(
            "Status store {} opened with {} entries",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, StatusEntry>) -> SarResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, entries)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| SarError::Io(e.error))?;
        Ok(())
    }
}

impl StatusStore for JsonStatusStore {
    fn get(&self, unit: &str) -> Option<StatusEntry> {
        self.entries.lock().ok()?.get(unit).cloned()
    }

    fn set(&self, unit: &str, state: WorkState, detail: Option<String>) -> SarResult<()> {
        let mut entries = self.entries.lock().map_err(lock_err)?;
        entries.insert(
            unit.to_string(),
            StatusEntry { state, updated: Utc::now(), detail },
        );
        // Held across the write so concurrent updates land in order
        self.persist(&entries)
    }

    fn entries(&self) -> BTreeMap<String, StatusEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}
