//! Collaborator interfaces consumed by the snapshot manager.
//!
//! The manager never implements these itself: the partition allocator,
//! device mapper, and boot controller are platform services. The traits
//! pin down exactly what the manager needs from them; in-memory fakes live
//! in [`crate::testing`].

use snapmerge_core::Result;
use std::path::PathBuf;

/// A byte region of the shared super partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Start offset in bytes.
    pub start: u64,
    /// Length in bytes.
    pub len: u64,
}

impl Extent {
    /// Whether two extents share any byte.
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start < other.start + other.len && other.start < self.start + self.len
    }
}

/// Partition-table allocator for the shared super partition.
pub trait PartitionBackend {
    /// Allocate a partition, returning the extent it landed on.
    fn add_partition(&mut self, name: &str, size: u64) -> Result<Extent>;

    /// Grow or shrink an existing partition.
    fn resize_partition(&mut self, name: &str, size: u64) -> Result<Extent>;

    /// Remove a partition; unknown names are not an error.
    fn delete_partition(&mut self, name: &str) -> Result<()>;

    /// Unallocated bytes in the partition table.
    fn free_space(&self) -> u64;

    /// Extents owned by the given slot's partitions. COW allocations must
    /// never overlap the source slot's extents.
    fn source_slot_regions(&self, slot: u32) -> Vec<Extent>;

    /// Filesystem path backing a partition's block device.
    fn partition_device_path(&self, name: &str) -> Result<PathBuf>;

    /// Serialized partition metadata for a slot.
    fn export(&self, slot: u32) -> Vec<u8>;

    /// Digest of a slot's partition table. Changes whenever the table is
    /// rewritten (reflash detection).
    fn table_digest(&self, slot: u32) -> String;
}

/// Device-mapper failures. `Busy` is transient: a holder keeps the device
/// open and the operation is retried after the holder is gone.
#[derive(Debug, thiserror::Error)]
pub enum DeviceMapperError {
    /// A holder keeps the device open
    #[error("Device {0} is busy")]
    Busy(String),

    /// Any other device-mapper failure
    #[error("Device mapper operation failed: {0}")]
    Failed(String),
}

/// Observed state of a mapped device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Mapped and serving I/O.
    Active,
    /// Mapped but suspended.
    Suspended,
}

/// Mapping table for a snapshot device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Base partition device.
    pub base: PathBuf,
    /// COW overlay backing the snapshot.
    pub cow: PathBuf,
}

/// Kernel device-mapper control.
pub trait DeviceMapper {
    /// Create (or replace) a mapped device, returning its node path.
    fn create_device(
        &mut self,
        name: &str,
        spec: &DeviceSpec,
    ) -> std::result::Result<PathBuf, DeviceMapperError>;

    /// Tear a device down. Succeeds when the device does not exist;
    /// `Busy` when a holder blocks removal.
    fn delete_device_if_exists(&mut self, name: &str)
        -> std::result::Result<(), DeviceMapperError>;

    /// State of a mapped device; `None` when not mapped.
    fn device_state(&self, name: &str) -> Option<DeviceState>;
}

/// A/B slot control.
pub trait BootControl {
    /// Currently booted slot (0 or 1).
    fn current_slot(&self) -> u32;

    /// Partition-name suffix for a slot ("_a"/"_b").
    fn slot_suffix(&self, slot: u32) -> String;
}
