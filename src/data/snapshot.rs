use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use super::shared_booking::StatusSnapshot;
use crate::error::StorageError;

/// File-backed store for the last resolved [`StatusSnapshot`].
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// reader sees either the previous snapshot or the new one. Every load and
/// save holds the store's lock.
pub struct SnapshotStore {
    path: PathBuf,
    lock: Mutex<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotStats {
    pub total_slots: usize,
    pub available_slots: usize,
    pub reserved_slots: usize,
    pub last_updated: Option<String>,
    pub file_size: u64,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Returns the stored snapshot, or an empty one when nothing has been
    /// written yet. An unparseable file is moved aside and treated as empty.
    pub fn load(&self) -> Result<StatusSnapshot, StorageError> {
        let _guard = self.guard();
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("no snapshot at {:?}, starting empty", self.path);
                return Ok(StatusSnapshot::new());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<StatusSnapshot>(&contents) {
            Ok(snapshot) => {
                log::debug!("loaded snapshot with {} slots", snapshot.len());
                Ok(snapshot)
            }
            Err(e) => {
                log::error!("snapshot {:?} is corrupted: {}", self.path, e);
                self.quarantine()?;
                Ok(StatusSnapshot::new())
            }
        }
    }

    pub fn save(&self, snapshot: &StatusSnapshot) -> Result<(), StorageError> {
        let _guard = self.guard();
        let json = serde_json::to_string_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.temp_path();
        let written = write_synced(&tmp_path, json.as_bytes())
            .and_then(|_| fs::rename(&tmp_path, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        log::debug!("saved snapshot with {} slots to {:?}", snapshot.len(), self.path);
        Ok(())
    }

    pub fn stats(&self) -> Result<SnapshotStats, StorageError> {
        let snapshot = self.load()?;
        let file_size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(SnapshotStats {
            total_slots: snapshot.len(),
            available_slots: snapshot.available_count(),
            reserved_slots: snapshot.reserved_count(),
            last_updated: snapshot.last_updated,
            file_size,
        })
    }

    fn quarantine(&self) -> Result<PathBuf, StorageError> {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
        let backup = self.path.with_file_name(name);
        fs::rename(&self.path, &backup)?;
        log::warn!("moved corrupted snapshot to {:?}", backup);
        Ok(backup)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
