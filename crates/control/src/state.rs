//! Persisted whole-update state.
//!
//! The update state is a single enum value on disk. Every transition is
//! written to a temp file, renamed over the live file, and fsynced (file
//! and directory) before control returns to the caller; a crash between
//! operations always finds the last completed transition.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// State of the whole-device update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    /// No update in progress.
    #[default]
    None,
    /// `begin_update` ran; snapshots may be created.
    Initiated,
    /// Snapshot writes are sealed but the new slot has not booted yet.
    Unverified,
    /// Background merge in progress.
    Merging,
    /// Merge teardown blocked by an open holder; retried after reboot.
    MergeNeedsReboot,
    /// Every partition fully merged and torn down.
    MergeCompleted,
    /// Merge hit unrecoverable corruption.
    MergeFailed,
    /// Update abandoned; snapshots must not be mounted or merged.
    Cancelled,
}

/// Bookkeeping recorded once per update, alongside the state value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Slot that was active when the update was written.
    pub source_slot: u32,
    /// Partition-table digest of the target slot, recorded at
    /// `finished_snapshot_writes`. A mismatch later means the super
    /// partition was reflashed underneath the update.
    pub target_digest: Option<String>,
}

/// Write `bytes` to `path` atomically and durably.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// The on-disk state file plus the per-update record.
pub struct StateFile {
    state_path: PathBuf,
    record_path: PathBuf,
}

impl StateFile {
    /// State lives at `<dir>/state`, the update record at `<dir>/update`.
    pub fn new(dir: &Path) -> StateFile {
        StateFile {
            state_path: dir.join("state"),
            record_path: dir.join("update"),
        }
    }

    /// Load the current state; a missing file reads as `None`.
    pub fn load(&self) -> Result<UpdateState> {
        match fs::read(&self.state_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UpdateState::None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a transition durably before returning.
    pub fn store(&self, state: UpdateState) -> Result<()> {
        tracing::info!(state = ?state, "update state transition");
        atomic_write(&self.state_path, &serde_json::to_vec(&state)?)
    }

    /// Load the update record; missing file reads as the default record.
    pub fn load_record(&self) -> Result<UpdateRecord> {
        match fs::read(&self.record_path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UpdateRecord::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the update record.
    pub fn store_record(&self, record: &UpdateRecord) -> Result<()> {
        atomic_write(&self.record_path, &serde_json::to_vec_pretty(record)?)
    }

    /// Remove both files; missing files are not an error.
    pub fn clear(&self) -> Result<()> {
        for path in [&self.state_path, &self.record_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_state_reads_as_none() {
        let dir = tempdir().unwrap();
        let file = StateFile::new(dir.path());
        assert_eq!(file.load().unwrap(), UpdateState::None);
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempdir().unwrap();
        let file = StateFile::new(dir.path());

        for state in [
            UpdateState::Initiated,
            UpdateState::Unverified,
            UpdateState::Merging,
            UpdateState::MergeNeedsReboot,
            UpdateState::MergeCompleted,
            UpdateState::MergeFailed,
            UpdateState::Cancelled,
        ] {
            file.store(state).unwrap();
            assert_eq!(file.load().unwrap(), state);
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let dir = tempdir().unwrap();
        let file = StateFile::new(dir.path());
        assert_eq!(file.load_record().unwrap(), UpdateRecord::default());

        let record = UpdateRecord {
            source_slot: 0,
            target_digest: Some("a1b2c3".to_string()),
        };
        file.store_record(&record).unwrap();
        assert_eq!(file.load_record().unwrap(), record);
    }

    #[test]
    fn test_clear_removes_both_files() {
        let dir = tempdir().unwrap();
        let file = StateFile::new(dir.path());
        file.store(UpdateState::Initiated).unwrap();
        file.store_record(&UpdateRecord::default()).unwrap();

        file.clear().unwrap();
        assert_eq!(file.load().unwrap(), UpdateState::None);
        // Clearing twice is fine.
        file.clear().unwrap();
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let file = StateFile::new(dir.path());
        file.store(UpdateState::Merging).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
