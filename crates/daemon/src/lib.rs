//! Snapshot merge/read daemon.
//!
//! Serves snapshot reads over the kernel control channel while merging the
//! COW overlay into the base device in the background. Crash consistency
//! rests on a single durable checkpoint, the overlay header's
//! `num_merge_ops` field, advanced only by `ProgressWriter::commit`.
//!
//! ```text
//!                    ┌──────────────────┐
//!  control channel ──┤ IoWorker pool    ├── COW reader / base device
//!                    ├──────────────────┤
//!                    │ MergeWorker      ├── base device (write)
//!                    ├──────────────────┤
//!                    │ ReadAheadWorker  ├── scratch region staging
//!                    └──────────────────┘
//!                      SnapshotHandler
//! ```

#![warn(missing_docs)]

pub mod handler;
pub mod merge;
pub mod progress;
pub mod protocol;
#[cfg(feature = "read-ahead")]
pub mod readahead;
pub mod worker;

pub use handler::{DaemonConfig, MergeTransition, SnapshotHandler, TransitionMachine};
pub use merge::{MergeError, MergeWorker};
pub use progress::{ProgressHandles, ProgressReader, ProgressStore, ProgressWriter, RaWriter};
pub use protocol::{
    MessageHeader, ProtocolError, HEADER_SIZE, KIND_MAP_READ, KIND_MAP_WRITE, PAYLOAD_SIZE,
    REPLY_ERROR, REPLY_OK,
};
#[cfg(feature = "read-ahead")]
pub use readahead::ReadAheadWorker;
pub use worker::IoWorker;
