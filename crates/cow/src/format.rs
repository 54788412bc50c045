//! On-disk COW overlay format.
//!
//! The overlay records pending writes for one partition as a log of
//! operations rather than a full image. All fields are little-endian.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ CowHeader (64 bytes)               │
//! ├────────────────────────────────────┤
//! │ Scratch region (buffer_size bytes) │  read-ahead staging, optional
//! ├────────────────────────────────────┤
//! │ Operation records (num_ops * 32)   │
//! ├────────────────────────────────────┤
//! │ Data region (replace/xor payloads) │
//! ├────────────────────────────────────┤
//! │ CowFooter (24 bytes)               │
//! └────────────────────────────────────┘
//! ```
//!
//! The header's `num_merge_ops` field is the single durable merge
//! checkpoint: the merge daemon maps the header page and rewrites this field
//! in place, flushing synchronously on every commit. Everything else in the
//! file is immutable once `CowWriter::finalize` has run.

use crc32fast::Hasher;
use snapmerge_core::BLOCK_SIZE;

/// Magic bytes identifying a COW overlay file ("SNAP!WOC" little-endian).
pub const COW_MAGIC: u64 = 0x434f_5721_534e_4150;

/// Major format version. Readers reject any other major.
pub const COW_VERSION_MAJOR: u16 = 2;

/// Minor format version. Minor evolution is signaled by header fields.
pub const COW_VERSION_MINOR: u16 = 0;

/// Size of the fixed header in bytes.
pub const COW_HEADER_SIZE: usize = 64;

/// Size of one encoded operation record in bytes.
pub const COW_OP_SIZE: usize = 32;

/// Size of the footer in bytes.
pub const COW_FOOTER_SIZE: usize = 24;

/// Default size of the read-ahead scratch region (2 MiB).
pub const SCRATCH_REGION_DEFAULT_SIZE: u32 = 1 << 21;

/// Read-ahead buffer has no staged data.
pub const READ_AHEAD_PENDING: u8 = 0;
/// Read-ahead fill is in flight; staged contents are undefined.
pub const READ_AHEAD_IN_PROGRESS: u8 = 1;
/// Staged data is durable and may be consumed.
pub const READ_AHEAD_DONE: u8 = 2;

/// Fixed COW file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowHeader {
    /// Magic: COW_MAGIC.
    pub magic: u64,
    /// Major version; unknown majors are rejected.
    pub major_version: u16,
    /// Minor version.
    pub minor_version: u16,
    /// Size of this header in bytes.
    pub header_size: u16,
    /// Size of one operation record in bytes.
    pub op_size: u16,
    /// Block size the overlay was written with.
    pub block_size: u32,
    /// Number of operation records.
    pub num_ops: u64,
    /// Byte offset of the first operation record.
    pub ops_offset: u64,
    /// Total size of the operation region in bytes.
    pub ops_size: u64,
    /// Count of operations durably incorporated into the base device.
    pub num_merge_ops: u64,
    /// Size of the read-ahead scratch region; 0 when the feature is absent.
    pub buffer_size: u32,
}

impl CowHeader {
    /// Serialize to the fixed 64-byte layout.
    pub fn to_bytes(&self) -> [u8; COW_HEADER_SIZE] {
        let mut bytes = [0u8; COW_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.magic.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.major_version.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.minor_version.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.header_size.to_le_bytes());
        bytes[14..16].copy_from_slice(&self.op_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.block_size.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.num_ops.to_le_bytes());
        bytes[28..36].copy_from_slice(&self.ops_offset.to_le_bytes());
        bytes[36..44].copy_from_slice(&self.ops_size.to_le_bytes());
        bytes[44..52].copy_from_slice(&self.num_merge_ops.to_le_bytes());
        bytes[52..56].copy_from_slice(&self.buffer_size.to_le_bytes());
        bytes
    }

    /// Deserialize from the fixed layout. Only length is checked here;
    /// semantic validation (magic, version, block size) is the reader's job.
    pub fn from_bytes(bytes: &[u8; COW_HEADER_SIZE]) -> Self {
        CowHeader {
            magic: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            major_version: u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
            minor_version: u16::from_le_bytes(bytes[10..12].try_into().unwrap()),
            header_size: u16::from_le_bytes(bytes[12..14].try_into().unwrap()),
            op_size: u16::from_le_bytes(bytes[14..16].try_into().unwrap()),
            block_size: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            num_ops: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
            ops_offset: u64::from_le_bytes(bytes[28..36].try_into().unwrap()),
            ops_size: u64::from_le_bytes(bytes[36..44].try_into().unwrap()),
            num_merge_ops: u64::from_le_bytes(bytes[44..52].try_into().unwrap()),
            buffer_size: u32::from_le_bytes(bytes[52..56].try_into().unwrap()),
        }
    }

    /// Byte offset of the read-ahead state flag within the file.
    pub fn buffer_state_offset(&self) -> u64 {
        self.header_size as u64
    }

    /// Byte offset of the staging data within the scratch region.
    ///
    /// The first block of the scratch region is reserved for the
    /// `BufferState` flag and staging metadata; data follows.
    pub fn buffer_data_offset(&self) -> u64 {
        self.header_size as u64 + BLOCK_SIZE
    }

    /// Usable staging bytes in the scratch region.
    pub fn buffer_data_size(&self) -> u64 {
        (self.buffer_size as u64).saturating_sub(BLOCK_SIZE)
    }

    /// Whether this overlay carries a read-ahead scratch region.
    pub fn has_scratch_region(&self) -> bool {
        self.buffer_size > 0
    }
}

/// Footer at the tail of the file, written last by the writer.
///
/// A missing or inconsistent footer means writing was cut off; the file is
/// rejected outright rather than partially trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowFooter {
    /// Must equal the header's ops_size.
    pub ops_size: u64,
    /// Must equal the header's num_ops.
    pub num_ops: u64,
    /// CRC32 of the encoded operation records.
    pub ops_checksum: u32,
}

impl CowFooter {
    /// Serialize to the fixed 24-byte layout.
    pub fn to_bytes(&self) -> [u8; COW_FOOTER_SIZE] {
        let mut bytes = [0u8; COW_FOOTER_SIZE];
        bytes[0..8].copy_from_slice(&self.ops_size.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.num_ops.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.ops_checksum.to_le_bytes());
        bytes
    }

    /// Deserialize from the fixed layout.
    pub fn from_bytes(bytes: &[u8; COW_FOOTER_SIZE]) -> Self {
        CowFooter {
            ops_size: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            num_ops: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            ops_checksum: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        }
    }
}

/// Operation kind. Matched exhaustively everywhere an op is dispatched, so
/// the compiler flags every site when a kind is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CowOpKind {
    /// Copy one block from another location in the base device.
    Copy = 1,
    /// Replace the block with a payload from the COW data region.
    Replace = 2,
    /// Replace the block with zeroes.
    Zero = 3,
    /// XOR the block's old base contents with a payload from the data region.
    Xor = 6,
}

impl CowOpKind {
    /// Decode a wire kind byte. Unknown kinds are a format error.
    pub fn from_raw(raw: u8) -> Option<CowOpKind> {
        match raw {
            1 => Some(CowOpKind::Copy),
            2 => Some(CowOpKind::Replace),
            3 => Some(CowOpKind::Zero),
            6 => Some(CowOpKind::Xor),
            _ => None,
        }
    }

    /// Ordered ops read base-device locations that later merge writes will
    /// overwrite, so their replay order matters for merge adjacency.
    pub fn is_ordered(&self) -> bool {
        matches!(self, CowOpKind::Copy | CowOpKind::Xor)
    }
}

/// One immutable COW operation record.
///
/// `source` is a block number in the base device for Copy/Xor, an absolute
/// byte offset into the data region for Replace/Xor payloads, and unused
/// (zero) for Zero. Each operation covers exactly one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowOperation {
    /// Operation kind.
    pub kind: CowOpKind,
    /// Destination block in the base device's logical address space.
    pub new_block: u64,
    /// Kind-dependent source (see type docs).
    pub source: u64,
    /// Payload length for Replace/Xor; 0 otherwise.
    pub data_length: u16,
}

impl CowOperation {
    /// Serialize to the fixed 32-byte record layout.
    pub fn to_bytes(&self) -> [u8; COW_OP_SIZE] {
        let mut bytes = [0u8; COW_OP_SIZE];
        bytes[0] = self.kind as u8;
        bytes[2..4].copy_from_slice(&self.data_length.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.new_block.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.source.to_le_bytes());
        bytes
    }

    /// Deserialize one record; `None` for an unknown kind byte.
    pub fn from_bytes(bytes: &[u8; COW_OP_SIZE]) -> Option<Self> {
        let kind = CowOpKind::from_raw(bytes[0])?;
        Some(CowOperation {
            kind,
            data_length: u16::from_le_bytes(bytes[2..4].try_into().unwrap()),
            new_block: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            source: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        })
    }

    /// Whether this op's replay order matters for merge adjacency.
    pub fn is_ordered(&self) -> bool {
        self.kind.is_ordered()
    }
}

/// CRC32 over a slice of encoded op records.
pub fn ops_checksum(encoded_ops: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(encoded_ops);
    hasher.finalize()
}
