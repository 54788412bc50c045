//! snapmerge - crash-consistent COW snapshots with background merge
//!
//! An A/B update writes its changes into per-partition copy-on-write
//! overlays instead of the live partitions. After the device boots the new
//! slot, a daemon serves snapshot reads while folding the overlay into the
//! base partition in the background; a crash at any point resumes from a
//! single durable checkpoint.
//!
//! # Quick Start
//!
//! ```ignore
//! use snapmerge::{SnapshotManager, SnapshotParams, UpdateState};
//!
//! let mut manager = SnapshotManager::new(metadata_dir, cow_dir, backend, dm, boot)?;
//! manager.begin_update()?;
//! manager.create_update_snapshots(&manifest)?;
//! // ... write the update through map_update_snapshot() devices ...
//! manager.finished_snapshot_writes()?;
//! // after rebooting into the new slot:
//! assert_eq!(manager.initiate_merge_and_wait()?, UpdateState::MergeCompleted);
//! ```
//!
//! # Architecture
//!
//! The workspace splits along the data path: `snapmerge-cow` owns the
//! overlay format and exception tables, `snapmerge-daemon` the per-device
//! merge/read workers, `snapmerge-control` the persisted update state
//! machine. This facade re-exports the public surface of each.

pub use snapmerge_core::{
    chunk_to_sector, sector_to_chunk, Chunk, Error, KernelDiskHeader, Result, Sector, BLOCK_SIZE,
    CHUNK_SIZE, KERNEL_SNAP_MAGIC, SECTOR_SIZE,
};

pub use snapmerge_cow::{
    ChunkSlot, CowFooter, CowHeader, CowOpKind, CowOperation, CowParseError, CowReader, CowWriter,
    CowWriterOptions, ExceptionTable, ExceptionTableBuilder,
};

pub use snapmerge_daemon::{
    DaemonConfig, IoWorker, MergeError, MergeTransition, MergeWorker, MessageHeader,
    ProgressHandles, ProgressReader, ProgressStore, ProgressWriter, ProtocolError,
    SnapshotHandler, TransitionMachine, HEADER_SIZE, KIND_MAP_READ, PAYLOAD_SIZE, REPLY_ERROR,
    REPLY_OK,
};

pub use snapmerge_control::{
    BootControl, ControlError, DeviceMapper, DeviceMapperError, DeviceSpec, Extent,
    PartitionBackend, SnapshotManager, SnapshotParams, SnapshotState, SnapshotStatus, StateFile,
    UpdateRecord, UpdateState,
};

/// Test fakes of the platform collaborators.
pub use snapmerge_control::testing;
