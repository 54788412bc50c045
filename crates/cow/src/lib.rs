//! COW overlay format for crash-consistent snapshot merges.
//!
//! One overlay file per partition records the update's pending writes as a
//! log of block operations. This crate owns the binary format, the
//! validating reader, the install-time writer, and the kernel exception
//! tables derived from a parsed overlay.

#![warn(missing_docs)]

pub mod format;
pub mod reader;
pub mod table;
pub mod writer;

pub use format::{
    CowFooter, CowHeader, CowOpKind, CowOperation, COW_FOOTER_SIZE, COW_HEADER_SIZE, COW_MAGIC,
    COW_OP_SIZE, COW_VERSION_MAJOR, COW_VERSION_MINOR, READ_AHEAD_DONE, READ_AHEAD_IN_PROGRESS,
    READ_AHEAD_PENDING, SCRATCH_REGION_DEFAULT_SIZE,
};
pub use reader::{CowParseError, CowReader};
pub use table::{ChunkSlot, ExceptionTable, ExceptionTableBuilder};
pub use writer::{CowWriter, CowWriterOptions};
