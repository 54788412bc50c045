//! Per-partition snapshot status records.
//!
//! One JSON file per partition per update, read by first-stage recovery
//! and the polling loop. Deleted when the snapshot is deleted or fully
//! merged.

use crate::error::Result;
use crate::state::atomic_write;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Lifecycle of one partition's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    /// Snapshot allocated; writes may still be in flight.
    Created,
    /// Background merge running for this partition.
    Merging,
    /// Every op merged; teardown may still be pending.
    MergeCompleted,
}

/// Persisted status of one partition's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    /// Partition name (target-slot suffixed).
    pub name: String,
    /// Lifecycle state.
    pub state: SnapshotState,
    /// Size of the base partition in bytes.
    pub device_size: u64,
    /// Size of the snapshot device in bytes.
    pub snapshot_size: u64,
    /// Bytes allocated to the COW in a backing image file.
    pub cow_file_size: u64,
    /// Bytes allocated to the COW in partition-table free space.
    pub cow_partition_size: u64,
}

impl SnapshotStatus {
    fn path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.status"))
    }

    /// Persist this record under `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        atomic_write(&Self::path(dir, &self.name), &serde_json::to_vec_pretty(self)?)
    }

    /// Load a record; `None` when no status file exists for `name`.
    pub fn read_from(dir: &Path, name: &str) -> Result<Option<SnapshotStatus>> {
        match fs::read(Self::path(dir, name)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the record; a missing file is not an error.
    pub fn delete(dir: &Path, name: &str) -> Result<()> {
        match fs::remove_file(Self::path(dir, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of every partition with a status record under `dir`.
    pub fn list(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let file_name = entry?.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(name) = file_name.strip_suffix(".status") {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
