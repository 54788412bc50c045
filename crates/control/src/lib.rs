//! Update snapshot control plane.
//!
//! Owns the persisted whole-update state machine and per-partition
//! snapshot bookkeeping, and drives the merge daemons. Platform services
//! (partition allocation, device mapper, boot control) are consumed
//! through traits; in-memory fakes live in [`testing`].

#![warn(missing_docs)]

pub mod deps;
pub mod error;
pub mod manager;
pub mod state;
pub mod status;
pub mod testing;

pub use deps::{
    BootControl, DeviceMapper, DeviceMapperError, DeviceSpec, DeviceState, Extent,
    PartitionBackend,
};
pub use error::{ControlError, Result};
pub use manager::{SnapshotManager, SnapshotParams};
pub use state::{StateFile, UpdateRecord, UpdateState};
pub use status::{SnapshotState, SnapshotStatus};
