//! Shared types and constants for snapmerge
//!
//! This crate defines the units of the kernel snapshot-remapping contract
//! (blocks, sectors, chunks, disk exceptions), the synthesized kernel
//! header block, and the error taxonomy used by every other crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    chunk_to_sector, is_block_aligned, sector_to_chunk, Chunk, KernelDiskHeader, Sector,
    BLOCK_SHIFT, BLOCK_SIZE, CHUNK_SHIFT, CHUNK_SIZE, DISK_EXCEPTION_SIZE, EXCEPTIONS_PER_PAGE,
    KERNEL_SNAPSHOT_DISK_VERSION, KERNEL_SNAPSHOT_VALID, KERNEL_SNAP_MAGIC,
    NUM_SNAPSHOT_HEADER_CHUNKS, SECTOR_SHIFT, SECTOR_SIZE,
};
