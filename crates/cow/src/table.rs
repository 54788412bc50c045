//! Kernel exception tables for the snapshot device.
//!
//! The kernel consumer resolves snapshot reads through exception pages:
//! fixed 4 KiB pages of `(old_chunk, new_chunk)` pairs it walks once at
//! device creation. Chunk ids are assigned here, in merge replay order, and
//! the same assignment doubles as the daemon's chunk index for serving data
//! requests.
//!
//! Id layout: chunk 0 is the synthesized kernel header, chunk 1 the first
//! metadata page. Data ids start at 2; after every `EXCEPTIONS_PER_PAGE`
//! assignments the next id is reserved for the following metadata page, so
//! every id congruent to 1 modulo `EXCEPTIONS_PER_PAGE + 1` is metadata.
//! A partial final page is zero padded: a zero `new_chunk` terminates the
//! kernel's walk.

use crate::reader::CowReader;
use snapmerge_core::{Chunk, BLOCK_SIZE, DISK_EXCEPTION_SIZE, EXCEPTIONS_PER_PAGE};
use std::collections::HashMap;

/// Stride between consecutive metadata chunk ids.
const METADATA_STRIDE: u64 = EXCEPTIONS_PER_PAGE + 1;

/// First data chunk id (after the kernel header and first metadata page).
const FIRST_DATA_CHUNK: u64 = 2;

/// What a chunk id resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSlot {
    /// No exception assigned to this id.
    Absent,
    /// The id is an exception-table metadata page.
    Metadata,
    /// The id maps to the operation at this arena index.
    Op(usize),
}

/// Immutable exception tables plus the daemon-side chunk index.
pub struct ExceptionTable {
    /// Encoded metadata pages in id order, each exactly one block.
    pages: Vec<Vec<u8>>,
    /// Chunk id -> slot. Index 0 is the kernel header (Absent here; the
    /// worker synthesizes it without consulting the table).
    chunk_index: Vec<ChunkSlot>,
    /// Destination block -> read-ahead window index, ordered ops only.
    block_windows: HashMap<u64, usize>,
    num_pairs: u64,
    num_ordered_ops: u64,
    window_ops: u64,
}

/// Builds exception tables from a parsed overlay.
pub struct ExceptionTableBuilder {
    window_ops: u64,
}

impl ExceptionTableBuilder {
    /// `scratch_data_bytes` is the usable staging capacity
    /// (`CowHeader::buffer_data_size`); 0 disables window tracking.
    pub fn new(scratch_data_bytes: u64) -> ExceptionTableBuilder {
        ExceptionTableBuilder {
            window_ops: scratch_data_bytes / BLOCK_SIZE,
        }
    }

    /// Assign chunk ids to every op in merge replay order and encode the
    /// metadata pages.
    pub fn build(&self, reader: &CowReader) -> ExceptionTable {
        let ops = reader.ops();
        let merge_order = reader.merge_order();

        let mut pages: Vec<Vec<u8>> = Vec::new();
        let mut current_page = vec![0u8; BLOCK_SIZE as usize];
        let mut page_fill: u64 = 0;

        let mut chunk_index = vec![ChunkSlot::Absent, ChunkSlot::Metadata];
        let mut next_chunk: Chunk = FIRST_DATA_CHUNK;

        let mut block_windows = HashMap::new();
        let mut num_ordered_ops: u64 = 0;

        for &arena_idx in merge_order {
            let op = &ops[arena_idx];

            let pair_offset = (page_fill * DISK_EXCEPTION_SIZE) as usize;
            current_page[pair_offset..pair_offset + 8]
                .copy_from_slice(&op.new_block.to_le_bytes());
            current_page[pair_offset + 8..pair_offset + 16]
                .copy_from_slice(&next_chunk.to_le_bytes());

            debug_assert_eq!(chunk_index.len() as u64, next_chunk);
            chunk_index.push(ChunkSlot::Op(arena_idx));

            if op.is_ordered() {
                if self.window_ops > 0 {
                    block_windows
                        .insert(op.new_block, (num_ordered_ops / self.window_ops) as usize);
                }
                num_ordered_ops += 1;
            }

            next_chunk += 1;
            page_fill += 1;
            if page_fill == EXCEPTIONS_PER_PAGE {
                pages.push(std::mem::replace(
                    &mut current_page,
                    vec![0u8; BLOCK_SIZE as usize],
                ));
                page_fill = 0;
                // Reserve the id following a full page for the next
                // metadata page, whether or not more ops follow.
                chunk_index.push(ChunkSlot::Metadata);
                next_chunk += 1;
            }
        }

        if page_fill > 0 {
            pages.push(current_page);
        }

        let num_pairs = merge_order.len() as u64;
        tracing::debug!(
            num_pairs,
            num_pages = pages.len(),
            num_ordered_ops,
            window_ops = self.window_ops,
            "built exception tables"
        );

        ExceptionTable {
            pages,
            chunk_index,
            block_windows,
            num_pairs,
            num_ordered_ops,
            window_ops: self.window_ops,
        }
    }
}

impl ExceptionTable {
    /// Resolve a chunk id.
    pub fn lookup(&self, chunk: Chunk) -> ChunkSlot {
        self.chunk_index
            .get(chunk as usize)
            .copied()
            .unwrap_or(ChunkSlot::Absent)
    }

    /// Whether a chunk id addresses a metadata page.
    pub fn is_metadata_chunk(chunk: Chunk) -> bool {
        chunk % METADATA_STRIDE == 1
    }

    /// The encoded metadata page for a metadata chunk id, if one exists.
    pub fn metadata_page(&self, chunk: Chunk) -> Option<&[u8]> {
        if !Self::is_metadata_chunk(chunk) {
            return None;
        }
        let page = (chunk / METADATA_STRIDE) as usize;
        self.pages.get(page).map(|p| p.as_slice())
    }

    /// Number of encoded metadata pages.
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Total exception pairs; always equal to the overlay's op count.
    pub fn num_pairs(&self) -> u64 {
        self.num_pairs
    }

    /// Count of ordered (copy/xor) ops.
    pub fn num_ordered_ops(&self) -> u64 {
        self.num_ordered_ops
    }

    /// Ordered ops per read-ahead window; 0 when read-ahead is disabled.
    pub fn window_ops(&self) -> u64 {
        self.window_ops
    }

    /// Read-ahead window covering an ordered op's destination block.
    pub fn window_of(&self, block: u64) -> Option<usize> {
        self.block_windows.get(&block).copied()
    }

    /// Number of read-ahead windows.
    pub fn num_windows(&self) -> usize {
        if self.window_ops == 0 || self.num_ordered_ops == 0 {
            0
        } else {
            (self.num_ordered_ops.div_ceil(self.window_ops)) as usize
        }
    }

    /// Decode all pages back into `(old_chunk, new_chunk)` pairs, stopping
    /// at the zero terminator of a partial page.
    pub fn decode_pairs(&self) -> Vec<(Chunk, Chunk)> {
        let mut pairs = Vec::with_capacity(self.num_pairs as usize);
        for page in &self.pages {
            for pair in page.chunks_exact(DISK_EXCEPTION_SIZE as usize) {
                let old_chunk = u64::from_le_bytes(pair[0..8].try_into().unwrap());
                let new_chunk = u64::from_le_bytes(pair[8..16].try_into().unwrap());
                if new_chunk == 0 {
                    return pairs;
                }
                pairs.push((old_chunk, new_chunk));
            }
        }
        pairs
    }
}
