//! Block, sector and chunk units of the kernel snapshot contract.
//!
//! The kernel block-remapping consumer addresses the snapshot in chunks.
//! One chunk is `CHUNK_SIZE` sectors, which this system pins to one 4 KiB
//! block. Sector numbers arrive on the control channel; everything internal
//! works in chunks/blocks.

/// Size of one data block in bytes.
pub const BLOCK_SIZE: u64 = 4096;

/// log2(BLOCK_SIZE).
pub const BLOCK_SHIFT: u32 = 12;

/// Size of one sector in bytes (fixed by the block layer).
pub const SECTOR_SIZE: u64 = 512;

/// log2(SECTOR_SIZE).
pub const SECTOR_SHIFT: u32 = 9;

/// Sectors per chunk. One chunk is exactly one block.
pub const CHUNK_SIZE: u64 = BLOCK_SIZE / SECTOR_SIZE;

/// log2(CHUNK_SIZE): shift converting a sector number to a chunk id.
pub const CHUNK_SHIFT: u32 = BLOCK_SHIFT - SECTOR_SHIFT;

/// Chunk 0 carries the synthesized kernel snapshot header.
pub const NUM_SNAPSHOT_HEADER_CHUNKS: u64 = 1;

/// Size of one on-wire disk exception record (old_chunk u64 + new_chunk u64).
pub const DISK_EXCEPTION_SIZE: u64 = 16;

/// Disk exceptions packed into one metadata page (one block).
pub const EXCEPTIONS_PER_PAGE: u64 = BLOCK_SIZE / DISK_EXCEPTION_SIZE;

/// Kernel-visible chunk id.
pub type Chunk = u64;

/// 512-byte sector number.
pub type Sector = u64;

/// Convert a sector number to the chunk id covering it.
#[inline]
pub fn sector_to_chunk(sector: Sector) -> Chunk {
    sector >> CHUNK_SHIFT
}

/// Convert a chunk id to its first sector.
#[inline]
pub fn chunk_to_sector(chunk: Chunk) -> Sector {
    chunk << CHUNK_SHIFT
}

/// Whether a byte count is block aligned.
#[inline]
pub fn is_block_aligned(size: u64) -> bool {
    size & (BLOCK_SIZE - 1) == 0
}

/// Magic value of the synthesized kernel snapshot header block.
pub const KERNEL_SNAP_MAGIC: u32 = 0x7041_6e53;

/// "Valid" flag value in the kernel snapshot header.
pub const KERNEL_SNAPSHOT_VALID: u32 = 1;

/// Kernel snapshot disk format version this daemon synthesizes.
pub const KERNEL_SNAPSHOT_DISK_VERSION: u32 = 1;

/// The kernel-format snapshot header served for chunk 0.
///
/// The kernel requests this block exactly once, when the snapshot device is
/// created. It is synthesized in memory, never read from the COW file. The
/// remainder of the 4 KiB block is zero-filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelDiskHeader {
    /// Magic: KERNEL_SNAP_MAGIC.
    pub magic: u32,
    /// KERNEL_SNAPSHOT_VALID for a usable snapshot.
    pub valid: u32,
    /// Kernel snapshot disk format version.
    pub version: u32,
    /// Chunk size in sectors.
    pub chunk_size: u32,
}

impl KernelDiskHeader {
    /// Header for a valid snapshot with this crate's chunk geometry.
    pub fn new() -> Self {
        KernelDiskHeader {
            magic: KERNEL_SNAP_MAGIC,
            valid: KERNEL_SNAPSHOT_VALID,
            version: KERNEL_SNAPSHOT_DISK_VERSION,
            chunk_size: CHUNK_SIZE as u32,
        }
    }

    /// Serialize into a zero-filled block-sized buffer.
    pub fn write_block(&self, block: &mut [u8]) {
        debug_assert!(block.len() >= BLOCK_SIZE as usize);
        block[..BLOCK_SIZE as usize].fill(0);
        block[0..4].copy_from_slice(&self.magic.to_le_bytes());
        block[4..8].copy_from_slice(&self.valid.to_le_bytes());
        block[8..12].copy_from_slice(&self.version.to_le_bytes());
        block[12..16].copy_from_slice(&self.chunk_size.to_le_bytes());
    }
}

impl Default for KernelDiskHeader {
    fn default() -> Self {
        Self::new()
    }
}
