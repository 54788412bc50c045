//! In-memory fakes of the collaborator interfaces.
//!
//! Each fake is a clonable handle over shared state so a test can keep a
//! handle while the manager owns another: flip the boot slot, add a device
//! holder, or reflash the fake partition table mid-scenario.

use crate::deps::{
    BootControl, DeviceMapper, DeviceMapperError, DeviceSpec, DeviceState, Extent,
    PartitionBackend,
};
use parking_lot::Mutex;
use snapmerge_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct BackendInner {
    dir: PathBuf,
    total: u64,
    next_offset: u64,
    partitions: HashMap<String, Extent>,
    slot_regions: HashMap<u32, Vec<Extent>>,
    digest_overrides: HashMap<u32, String>,
    reflash_count: u64,
}

/// Bump-allocating fake of the super-partition table. Partition devices
/// are backed by plain files under the fake's directory.
#[derive(Clone)]
pub struct FakePartitionBackend {
    inner: Arc<Mutex<BackendInner>>,
}

impl FakePartitionBackend {
    /// A fake table with `total` allocatable bytes, backed by `dir`.
    pub fn new(dir: &Path, total: u64) -> Self {
        FakePartitionBackend {
            inner: Arc::new(Mutex::new(BackendInner {
                dir: dir.to_path_buf(),
                total,
                next_offset: 0,
                partitions: HashMap::new(),
                slot_regions: HashMap::new(),
                digest_overrides: HashMap::new(),
                reflash_count: 0,
            })),
        }
    }

    /// Declare the extents owned by a slot's partitions.
    pub fn set_source_regions(&self, slot: u32, regions: Vec<Extent>) {
        self.inner.lock().slot_regions.insert(slot, regions);
    }

    /// Pin a slot's digest to a fixed value.
    pub fn set_digest(&self, slot: u32, digest: &str) {
        self.inner
            .lock()
            .digest_overrides
            .insert(slot, digest.to_string());
    }

    /// Simulate a reflash: every slot digest changes.
    pub fn reflash(&self) {
        let mut inner = self.inner.lock();
        inner.reflash_count += 1;
        inner.digest_overrides.clear();
    }

    /// Whether a partition currently exists.
    pub fn has_partition(&self, name: &str) -> bool {
        self.inner.lock().partitions.contains_key(name)
    }

    fn backing_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.img"))
    }
}

impl PartitionBackend for FakePartitionBackend {
    fn add_partition(&mut self, name: &str, size: u64) -> Result<Extent> {
        let mut inner = self.inner.lock();
        let used: u64 = inner.partitions.values().map(|e| e.len).sum();
        if used + size > inner.total {
            return Err(Error::InsufficientSpace {
                requested: size,
                available: inner.total - used,
            });
        }
        let extent = Extent {
            start: inner.next_offset,
            len: size,
        };
        inner.next_offset += size;
        let file = File::create(Self::backing_path(&inner.dir, name))?;
        file.set_len(size)?;
        file.sync_all()?;
        inner.partitions.insert(name.to_string(), extent);
        Ok(extent)
    }

    fn resize_partition(&mut self, name: &str, size: u64) -> Result<Extent> {
        let mut inner = self.inner.lock();
        let Some(extent) = inner.partitions.get(name).copied() else {
            return Err(Error::InvalidOperation(format!("no partition {name}")));
        };
        let resized = Extent {
            start: extent.start,
            len: size,
        };
        File::options()
            .write(true)
            .open(Self::backing_path(&inner.dir, name))?
            .set_len(size)?;
        inner.partitions.insert(name.to_string(), resized);
        Ok(resized)
    }

    fn delete_partition(&mut self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.partitions.remove(name).is_some() {
            let path = Self::backing_path(&inner.dir, name);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn free_space(&self) -> u64 {
        let inner = self.inner.lock();
        let used: u64 = inner.partitions.values().map(|e| e.len).sum();
        inner.total - used
    }

    fn source_slot_regions(&self, slot: u32) -> Vec<Extent> {
        self.inner
            .lock()
            .slot_regions
            .get(&slot)
            .cloned()
            .unwrap_or_default()
    }

    fn partition_device_path(&self, name: &str) -> Result<PathBuf> {
        let inner = self.inner.lock();
        if !inner.partitions.contains_key(name) {
            return Err(Error::InvalidOperation(format!("no partition {name}")));
        }
        Ok(Self::backing_path(&inner.dir, name))
    }

    fn export(&self, slot: u32) -> Vec<u8> {
        let inner = self.inner.lock();
        let mut names: Vec<_> = inner.partitions.keys().cloned().collect();
        names.sort();
        format!("slot={slot};partitions={}", names.join(",")).into_bytes()
    }

    fn table_digest(&self, slot: u32) -> String {
        let inner = self.inner.lock();
        if let Some(digest) = inner.digest_overrides.get(&slot) {
            return digest.clone();
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        slot.hash(&mut hasher);
        inner.reflash_count.hash(&mut hasher);
        let mut entries: Vec<_> = inner.partitions.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (name, extent) in entries {
            name.hash(&mut hasher);
            extent.start.hash(&mut hasher);
            extent.len.hash(&mut hasher);
        }
        format!("{:016x}", hasher.finish())
    }
}

struct DmInner {
    dir: PathBuf,
    devices: HashMap<String, DeviceSpec>,
    holders: HashSet<String>,
}

/// Fake device mapper with holder tracking.
#[derive(Clone)]
pub struct FakeDeviceMapper {
    inner: Arc<Mutex<DmInner>>,
}

impl FakeDeviceMapper {
    /// Device nodes are plain files under `dir`.
    pub fn new(dir: &Path) -> Self {
        FakeDeviceMapper {
            inner: Arc::new(Mutex::new(DmInner {
                dir: dir.to_path_buf(),
                devices: HashMap::new(),
                holders: HashSet::new(),
            })),
        }
    }

    /// Register an open holder on a device; deletes will report Busy.
    pub fn add_holder(&self, name: &str) {
        self.inner.lock().holders.insert(name.to_string());
    }

    /// Drop the holder again.
    pub fn remove_holder(&self, name: &str) {
        self.inner.lock().holders.remove(name);
    }

    /// Whether a device is currently mapped.
    pub fn is_mapped(&self, name: &str) -> bool {
        self.inner.lock().devices.contains_key(name)
    }

    fn node_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("dm-{name}"))
    }
}

impl DeviceMapper for FakeDeviceMapper {
    fn create_device(
        &mut self,
        name: &str,
        spec: &DeviceSpec,
    ) -> std::result::Result<PathBuf, DeviceMapperError> {
        let mut inner = self.inner.lock();
        let path = Self::node_path(&inner.dir, name);
        File::create(&path).map_err(|e| DeviceMapperError::Failed(e.to_string()))?;
        inner.devices.insert(name.to_string(), spec.clone());
        Ok(path)
    }

    fn delete_device_if_exists(
        &mut self,
        name: &str,
    ) -> std::result::Result<(), DeviceMapperError> {
        let mut inner = self.inner.lock();
        if !inner.devices.contains_key(name) {
            return Ok(());
        }
        if inner.holders.contains(name) {
            return Err(DeviceMapperError::Busy(name.to_string()));
        }
        inner.devices.remove(name);
        let path = Self::node_path(&inner.dir, name);
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| DeviceMapperError::Failed(e.to_string()))?;
        }
        Ok(())
    }

    fn device_state(&self, name: &str) -> Option<DeviceState> {
        self.inner
            .lock()
            .devices
            .contains_key(name)
            .then_some(DeviceState::Active)
    }
}

/// Fake A/B slot switch.
#[derive(Clone)]
pub struct FakeBootControl {
    slot: Arc<AtomicU32>,
}

impl FakeBootControl {
    /// Start on `slot`.
    pub fn new(slot: u32) -> Self {
        FakeBootControl {
            slot: Arc::new(AtomicU32::new(slot)),
        }
    }

    /// Simulate a reboot into `slot`.
    pub fn set_slot(&self, slot: u32) {
        self.slot.store(slot, Ordering::Release);
    }
}

impl BootControl for FakeBootControl {
    fn current_slot(&self) -> u32 {
        self.slot.load(Ordering::Acquire)
    }

    fn slot_suffix(&self, slot: u32) -> String {
        if slot == 0 {
            "_a".to_string()
        } else {
            "_b".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_backend_allocates_and_tracks_space() {
        let dir = tempdir().unwrap();
        let mut backend = FakePartitionBackend::new(dir.path(), 1000);

        let extent = backend.add_partition("system_b-cow", 600).unwrap();
        assert_eq!(extent.len, 600);
        assert_eq!(backend.free_space(), 400);
        assert!(backend.partition_device_path("system_b-cow").is_ok());

        let err = backend.add_partition("vendor_b-cow", 500).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { .. }));

        backend.delete_partition("system_b-cow").unwrap();
        assert_eq!(backend.free_space(), 1000);
    }

    #[test]
    fn test_digest_changes_on_reflash() {
        let dir = tempdir().unwrap();
        let backend = FakePartitionBackend::new(dir.path(), 1000);
        let before = backend.table_digest(1);
        backend.reflash();
        assert_ne!(backend.table_digest(1), before);
    }

    #[test]
    fn test_device_mapper_holder_tracking() {
        let dir = tempdir().unwrap();
        let mut dm = FakeDeviceMapper::new(dir.path());
        let spec = DeviceSpec {
            base: dir.path().join("base"),
            cow: dir.path().join("cow"),
        };

        dm.create_device("system_b", &spec).unwrap();
        assert_eq!(dm.device_state("system_b"), Some(DeviceState::Active));

        dm.add_holder("system_b");
        let err = dm.delete_device_if_exists("system_b").unwrap_err();
        assert!(matches!(err, DeviceMapperError::Busy(_)));
        assert!(dm.is_mapped("system_b"));

        dm.remove_holder("system_b");
        dm.delete_device_if_exists("system_b").unwrap();
        assert!(!dm.is_mapped("system_b"));
        // Deleting a device that is gone succeeds.
        dm.delete_device_if_exists("system_b").unwrap();
    }

    #[test]
    fn test_boot_control_slots() {
        let boot = FakeBootControl::new(0);
        assert_eq!(boot.current_slot(), 0);
        assert_eq!(boot.slot_suffix(0), "_a");
        assert_eq!(boot.slot_suffix(1), "_b");

        let handle = boot.clone();
        handle.set_slot(1);
        assert_eq!(boot.current_slot(), 1);
    }
}
