//! Update snapshot lifecycle management.
//!
//! `SnapshotManager` drives the whole-update state machine over persisted
//! state, delegating platform work to the collaborator traits and the
//! per-partition merge daemons. Every state transition is durable before
//! the triggering call returns.
//!
//! ```text
//! None ─ begin_update ─> Initiated ─ finished_snapshot_writes ─> Unverified
//!   ^                                                                │
//!   │                                              (reboot into new slot)
//!   └─ cancel_update ──  Cancelled / MergeFailed                     │
//!                              ^                    initiate_merge   v
//!          MergeCompleted <─ process_update_state ─────────────── Merging
//!                                       │
//!                                       └─> MergeNeedsReboot (holder)
//! ```

use crate::deps::{BootControl, DeviceMapper, DeviceMapperError, DeviceSpec, PartitionBackend};
use crate::error::{ControlError, Result};
use crate::state::{StateFile, UpdateRecord, UpdateState};
use crate::status::{SnapshotState, SnapshotStatus};
use snapmerge_cow::CowReader;
use snapmerge_daemon::{DaemonConfig, MergeTransition, SnapshotHandler};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Per-partition snapshot request.
#[derive(Debug, Clone)]
pub struct SnapshotParams {
    /// Target partition name (slot suffixed).
    pub name: String,
    /// Base partition size in bytes.
    pub device_size: u64,
    /// COW space to allocate in bytes.
    pub cow_size: u64,
}

/// Control plane for A/B update snapshots.
pub struct SnapshotManager<P, D, B> {
    metadata_dir: PathBuf,
    cow_dir: PathBuf,
    backend: P,
    dm: D,
    boot: B,
    state_file: StateFile,
}

impl<P: PartitionBackend, D: DeviceMapper, B: BootControl> SnapshotManager<P, D, B> {
    /// Build a manager rooted at `metadata_dir` (state and status records)
    /// and `cow_dir` (backing image files).
    pub fn new(
        metadata_dir: impl Into<PathBuf>,
        cow_dir: impl Into<PathBuf>,
        backend: P,
        dm: D,
        boot: B,
    ) -> Result<Self> {
        let metadata_dir = metadata_dir.into();
        let cow_dir = cow_dir.into();
        fs::create_dir_all(&metadata_dir)?;
        fs::create_dir_all(&cow_dir)?;
        let state_file = StateFile::new(&metadata_dir);
        Ok(SnapshotManager {
            metadata_dir,
            cow_dir,
            backend,
            dm,
            boot,
            state_file,
        })
    }

    /// Current persisted update state.
    pub fn update_state(&self) -> Result<UpdateState> {
        self.state_file.load()
    }

    fn cow_name(name: &str) -> String {
        format!("{name}-cow")
    }

    fn cow_image_path(&self, name: &str) -> PathBuf {
        self.cow_dir.join(format!("{name}.cow"))
    }

    /// Path of a snapshot's COW backing store, wherever it was allocated.
    pub fn snapshot_cow_path(&self, name: &str) -> Result<PathBuf> {
        let status = SnapshotStatus::read_from(&self.metadata_dir, name)?
            .ok_or_else(|| ControlError::UnknownSnapshot(name.to_string()))?;
        if status.cow_partition_size > 0 {
            Ok(self.backend.partition_device_path(&Self::cow_name(name))?)
        } else {
            Ok(self.cow_image_path(name))
        }
    }

    fn expect_state(&self, op: &'static str, expected: UpdateState) -> Result<()> {
        let state = self.state_file.load()?;
        if state != expected {
            return Err(ControlError::InvalidState { op, state });
        }
        Ok(())
    }

    /// Start a new update. Refused while any previous update is
    /// unresolved, including Cancelled/MergeFailed awaiting an explicit
    /// `cancel_update`.
    pub fn begin_update(&mut self) -> Result<()> {
        self.expect_state("begin_update", UpdateState::None)?;
        self.state_file.store_record(&UpdateRecord {
            source_slot: self.boot.current_slot(),
            target_digest: None,
        })?;
        self.state_file.store(UpdateState::Initiated)
    }

    /// Allocate one partition's snapshot: COW space from partition-table
    /// free space when it fits, otherwise a backing image file. A failure
    /// leaves previously created snapshots untouched for retry.
    pub fn create_snapshot(&mut self, params: &SnapshotParams) -> Result<()> {
        self.expect_state("create_snapshot", UpdateState::Initiated)?;
        if SnapshotStatus::read_from(&self.metadata_dir, &params.name)?.is_some() {
            return Err(ControlError::Core(snapmerge_core::Error::InvalidOperation(
                format!("snapshot {} already exists", params.name),
            )));
        }

        // The target partition itself, if this update introduces it.
        if self.backend.partition_device_path(&params.name).is_err() {
            self.backend.add_partition(&params.name, params.device_size)?;
        }

        let cow_name = Self::cow_name(&params.name);
        let (cow_file_size, cow_partition_size) =
            if self.backend.free_space() >= params.cow_size {
                let extent = self.backend.add_partition(&cow_name, params.cow_size)?;
                let source_slot = self.state_file.load_record()?.source_slot;
                let overlap = self
                    .backend
                    .source_slot_regions(source_slot)
                    .iter()
                    .any(|region| extent.overlaps(region));
                if overlap {
                    self.backend.delete_partition(&cow_name)?;
                    return Err(ControlError::Core(snapmerge_core::Error::Corruption(
                        format!("COW allocation for {} overlaps the source slot", params.name),
                    )));
                }
                (0, params.cow_size)
            } else {
                File::create(self.cow_image_path(&params.name))?;
                (params.cow_size, 0)
            };

        tracing::info!(
            partition = %params.name,
            cow_file_size,
            cow_partition_size,
            "created snapshot"
        );
        SnapshotStatus {
            name: params.name.clone(),
            state: SnapshotState::Created,
            device_size: params.device_size,
            snapshot_size: params.device_size,
            cow_file_size,
            cow_partition_size,
        }
        .write_to(&self.metadata_dir)
    }

    /// Allocate every snapshot in the manifest. Aborts on the first
    /// failure, leaving earlier snapshots in place.
    pub fn create_update_snapshots(&mut self, manifest: &[SnapshotParams]) -> Result<()> {
        for params in manifest {
            self.create_snapshot(params)?;
        }
        Ok(())
    }

    /// Map a snapshot device for update writes, returning its node path.
    pub fn map_update_snapshot(&mut self, name: &str) -> Result<PathBuf> {
        if SnapshotStatus::read_from(&self.metadata_dir, name)?.is_none() {
            return Err(ControlError::UnknownSnapshot(name.to_string()));
        }
        let spec = DeviceSpec {
            base: self.backend.partition_device_path(name)?,
            cow: self.snapshot_cow_path(name)?,
        };
        Ok(self.dm.create_device(name, &spec)?)
    }

    /// Seal snapshot writes and record the target slot's table digest.
    pub fn finished_snapshot_writes(&mut self) -> Result<()> {
        self.expect_state("finished_snapshot_writes", UpdateState::Initiated)?;
        let mut record = self.state_file.load_record()?;
        let target_slot = 1 - record.source_slot;
        record.target_digest = Some(self.backend.table_digest(target_slot));
        self.state_file.store_record(&record)?;
        self.state_file.store(UpdateState::Unverified)
    }

    fn digest_matches(&self, record: &UpdateRecord) -> bool {
        match &record.target_digest {
            None => false,
            Some(digest) => *digest == self.backend.table_digest(self.boot.current_slot()),
        }
    }

    /// Start merging. Refused unless the device has booted the new slot;
    /// a reflashed partition table cancels the update instead of merging
    /// stale overlays.
    pub fn initiate_merge(&mut self) -> Result<()> {
        self.expect_state("initiate_merge", UpdateState::Unverified)?;
        let record = self.state_file.load_record()?;
        if self.boot.current_slot() == record.source_slot {
            return Err(ControlError::Core(snapmerge_core::Error::InvalidOperation(
                "still booted on the source slot".to_string(),
            )));
        }
        if !self.digest_matches(&record) {
            tracing::warn!("target metadata digest mismatch, cancelling update");
            return self.state_file.store(UpdateState::Cancelled);
        }

        for name in SnapshotStatus::list(&self.metadata_dir)? {
            if let Some(mut status) = SnapshotStatus::read_from(&self.metadata_dir, &name)? {
                status.state = SnapshotState::Merging;
                status.write_to(&self.metadata_dir)?;
            }
        }
        self.state_file.store(UpdateState::Merging)
    }

    /// Poll merge progress and drive teardown. Idempotent once the update
    /// reaches a terminal state.
    pub fn process_update_state(&mut self) -> Result<UpdateState> {
        let state = self.state_file.load()?;
        if !matches!(state, UpdateState::Merging | UpdateState::MergeNeedsReboot) {
            return Ok(state);
        }

        let record = self.state_file.load_record()?;
        if self.boot.current_slot() != record.source_slot && !self.digest_matches(&record) {
            tracing::warn!("target metadata digest mismatch during merge polling");
            self.state_file.store(UpdateState::Cancelled)?;
            return Ok(UpdateState::Cancelled);
        }

        let mut incomplete = false;
        let mut blocked = false;
        for name in SnapshotStatus::list(&self.metadata_dir)? {
            let cow_path = self.snapshot_cow_path(&name)?;
            let reader = match CowReader::parse(File::open(&cow_path)?) {
                Ok(reader) => reader,
                Err(e) => {
                    tracing::error!(partition = %name, error = %e, "overlay corrupt");
                    self.state_file.store(UpdateState::MergeFailed)?;
                    return Ok(UpdateState::MergeFailed);
                }
            };
            if reader.header().num_merge_ops < reader.num_total_data_ops() {
                incomplete = true;
                continue;
            }

            match self.dm.delete_device_if_exists(&name) {
                Ok(()) => {
                    self.delete_cow(&name)?;
                    SnapshotStatus::delete(&self.metadata_dir, &name)?;
                    tracing::info!(partition = %name, "merge complete, snapshot removed");
                }
                Err(DeviceMapperError::Busy(_)) => {
                    tracing::info!(partition = %name, "teardown blocked by holder");
                    // The overlay is fully merged; only the device node
                    // outlives it until the holder goes away.
                    if let Some(mut status) = SnapshotStatus::read_from(&self.metadata_dir, &name)?
                    {
                        if status.state != SnapshotState::MergeCompleted {
                            status.state = SnapshotState::MergeCompleted;
                            status.write_to(&self.metadata_dir)?;
                        }
                    }
                    blocked = true;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let next = if incomplete {
            UpdateState::Merging
        } else if blocked {
            UpdateState::MergeNeedsReboot
        } else {
            UpdateState::MergeCompleted
        };
        if next != state {
            self.state_file.store(next)?;
        }
        Ok(next)
    }

    /// Initiate the merge and drive every partition's daemon to
    /// completion, then run one teardown poll.
    pub fn initiate_merge_and_wait(&mut self) -> Result<UpdateState> {
        self.initiate_merge()?;
        let state = self.state_file.load()?;
        if state != UpdateState::Merging {
            return Ok(state);
        }

        for name in SnapshotStatus::list(&self.metadata_dir)? {
            let config = DaemonConfig::new(
                self.backend.partition_device_path(&name)?,
                self.snapshot_cow_path(&name)?,
            );
            let mut handler = SnapshotHandler::new(config)?;
            handler.spawn(Vec::<File>::new())?;
            handler.initiate_merge();
            let result = handler.wait_merge_result();
            handler.stop();
            handler.join()?;
            if result != MergeTransition::MergeComplete {
                tracing::error!(partition = %name, result = ?result, "merge did not complete");
                self.state_file.store(UpdateState::MergeFailed)?;
                return Ok(UpdateState::MergeFailed);
            }
        }
        self.process_update_state()
    }

    fn delete_cow(&mut self, name: &str) -> Result<()> {
        let status = SnapshotStatus::read_from(&self.metadata_dir, name)?
            .ok_or_else(|| ControlError::UnknownSnapshot(name.to_string()))?;
        if status.cow_partition_size > 0 {
            self.backend.delete_partition(&Self::cow_name(name))?;
        } else {
            let path = self.cow_image_path(name);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Abandon the update: tear down devices, delete COW space and status
    /// records, return to `None`. Refused while a merge is actively
    /// running.
    pub fn cancel_update(&mut self) -> Result<()> {
        let state = self.state_file.load()?;
        if state == UpdateState::Merging {
            return Err(ControlError::InvalidState {
                op: "cancel_update",
                state,
            });
        }

        for name in SnapshotStatus::list(&self.metadata_dir)? {
            self.dm.delete_device_if_exists(&name)?;
            self.delete_cow(&name)?;
            SnapshotStatus::delete(&self.metadata_dir, &name)?;
        }
        tracing::info!("update cancelled");
        self.state_file.clear()
    }

    /// First-stage boot recovery: when booted into the new slot with an
    /// update pending, (re)create every snapshot device before root
    /// mounts. A digest mismatch cancels the update; stale overlays are
    /// never mounted.
    pub fn create_snapshot_devices_at_boot(&mut self) -> Result<Vec<PathBuf>> {
        let state = self.state_file.load()?;
        if !matches!(
            state,
            UpdateState::Unverified | UpdateState::Merging | UpdateState::MergeNeedsReboot
        ) {
            return Ok(Vec::new());
        }
        let record = self.state_file.load_record()?;
        if self.boot.current_slot() == record.source_slot {
            return Ok(Vec::new());
        }
        if !self.digest_matches(&record) {
            tracing::warn!("digest mismatch at boot, cancelling update");
            self.state_file.store(UpdateState::Cancelled)?;
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for name in SnapshotStatus::list(&self.metadata_dir)? {
            let spec = DeviceSpec {
                base: self.backend.partition_device_path(&name)?,
                cow: self.snapshot_cow_path(&name)?,
            };
            paths.push(self.dm.create_device(&name, &spec)?);
        }
        tracing::info!(devices = paths.len(), "snapshot devices created at boot");
        Ok(paths)
    }

    /// Metadata directory holding state and status records.
    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    /// Collaborating partition backend.
    pub fn backend(&self) -> &P {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::Extent;
    use crate::testing::{FakeBootControl, FakeDeviceMapper, FakePartitionBackend};
    use tempfile::tempdir;

    type FakeManager = SnapshotManager<FakePartitionBackend, FakeDeviceMapper, FakeBootControl>;

    fn manager(dir: &Path, total_space: u64) -> (FakeManager, FakePartitionBackend) {
        let backend = FakePartitionBackend::new(dir, total_space);
        let dm = FakeDeviceMapper::new(dir);
        let boot = FakeBootControl::new(0);
        let manager = SnapshotManager::new(
            dir.join("metadata"),
            dir.join("cow"),
            backend.clone(),
            dm,
            boot,
        )
        .unwrap();
        (manager, backend)
    }

    fn params(name: &str) -> SnapshotParams {
        SnapshotParams {
            name: name.to_string(),
            device_size: 1 << 20,
            cow_size: 1 << 16,
        }
    }

    #[test]
    fn test_begin_update_refused_twice() {
        let dir = tempdir().unwrap();
        let (mut manager, _) = manager(dir.path(), 1 << 30);

        manager.begin_update().unwrap();
        assert_eq!(manager.update_state().unwrap(), UpdateState::Initiated);

        let err = manager.begin_update().unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidState {
                op: "begin_update",
                ..
            }
        ));
    }

    #[test]
    fn test_create_snapshot_prefers_partition_space() {
        let dir = tempdir().unwrap();
        let (mut manager, _) = manager(dir.path(), 1 << 30);

        manager.begin_update().unwrap();
        manager.create_snapshot(&params("system_b")).unwrap();

        let status = SnapshotStatus::read_from(manager.metadata_dir(), "system_b")
            .unwrap()
            .unwrap();
        assert_eq!(status.cow_partition_size, 1 << 16);
        assert_eq!(status.cow_file_size, 0);
        assert!(manager.backend().has_partition("system_b-cow"));
    }

    #[test]
    fn test_create_snapshot_falls_back_to_image_file() {
        let dir = tempdir().unwrap();
        // Enough for the target partition but not for the COW.
        let (mut manager, _) = manager(dir.path(), (1 << 20) + 100);

        manager.begin_update().unwrap();
        manager.create_snapshot(&params("system_b")).unwrap();

        let status = SnapshotStatus::read_from(manager.metadata_dir(), "system_b")
            .unwrap()
            .unwrap();
        assert_eq!(status.cow_partition_size, 0);
        assert_eq!(status.cow_file_size, 1 << 16);
        assert!(manager.snapshot_cow_path("system_b").unwrap().exists());
    }

    #[test]
    fn test_overlapping_allocation_is_rejected() {
        let dir = tempdir().unwrap();
        let (mut manager, backend) = manager(dir.path(), 1 << 30);

        // Every byte of the table belongs to the source slot.
        backend.set_source_regions(
            0,
            vec![Extent {
                start: 0,
                len: 1 << 30,
            }],
        );

        manager.begin_update().unwrap();
        let err = manager.create_snapshot(&params("system_b")).unwrap_err();
        assert!(matches!(
            err,
            ControlError::Core(snapmerge_core::Error::Corruption(_))
        ));
        // The failed allocation was rolled back.
        assert!(!backend.has_partition("system_b-cow"));
    }

    #[test]
    fn test_initiate_merge_requires_slot_change() {
        let dir = tempdir().unwrap();
        let (mut manager, _) = manager(dir.path(), 1 << 30);

        manager.begin_update().unwrap();
        manager.create_snapshot(&params("system_b")).unwrap();
        manager.finished_snapshot_writes().unwrap();

        // Still on the source slot.
        let err = manager.initiate_merge().unwrap_err();
        assert!(matches!(err, ControlError::Core(_)));
        assert_eq!(manager.update_state().unwrap(), UpdateState::Unverified);
    }

    #[test]
    fn test_cancel_update_clears_everything() {
        let dir = tempdir().unwrap();
        let (mut manager, backend) = manager(dir.path(), 1 << 30);

        manager.begin_update().unwrap();
        manager.create_snapshot(&params("system_b")).unwrap();
        manager.map_update_snapshot("system_b").unwrap();

        manager.cancel_update().unwrap();
        assert_eq!(manager.update_state().unwrap(), UpdateState::None);
        assert!(
            SnapshotStatus::read_from(manager.metadata_dir(), "system_b")
                .unwrap()
                .is_none()
        );
        assert!(!backend.has_partition("system_b-cow"));

        // A fresh update can start.
        manager.begin_update().unwrap();
    }
}
