//! COW overlay writer.
//!
//! An overlay is written exactly once, at update install time, and is
//! immutable afterwards (the daemon only rewrites the header's
//! `num_merge_ops` field in place). The writer buffers operations and
//! payloads, then lays the file out in a single `finalize` pass: header,
//! zeroed scratch region, operation records, data region, footer. The
//! footer is written last and the file is fsynced before `finalize`
//! returns, so a crash mid-write always leaves a file the reader rejects.

use crate::format::{
    ops_checksum, CowFooter, CowHeader, CowOpKind, CowOperation, COW_HEADER_SIZE, COW_MAGIC,
    COW_OP_SIZE, COW_VERSION_MAJOR, COW_VERSION_MINOR,
};
use snapmerge_core::{Error, Result, BLOCK_SIZE};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};

/// Writer configuration.
#[derive(Debug, Clone, Copy)]
pub struct CowWriterOptions {
    /// Size of the read-ahead scratch region in bytes; 0 disables it.
    /// Must be block aligned when nonzero.
    pub scratch_size: u32,
}

impl Default for CowWriterOptions {
    fn default() -> Self {
        CowWriterOptions {
            scratch_size: crate::format::SCRATCH_REGION_DEFAULT_SIZE,
        }
    }
}

/// Buffered operation; payload offsets into `data` are resolved to
/// absolute file offsets at finalize time.
struct PendingOp {
    kind: CowOpKind,
    new_block: u64,
    source: u64,
    data_offset: Option<u64>,
}

/// Append-only COW overlay writer.
pub struct CowWriter {
    file: File,
    options: CowWriterOptions,
    ops: Vec<PendingOp>,
    data: Vec<u8>,
    finalized: bool,
}

impl CowWriter {
    /// Create a writer over an empty file.
    pub fn new(file: File, options: CowWriterOptions) -> CowWriter {
        CowWriter {
            file,
            options,
            ops: Vec::new(),
            data: Vec::new(),
            finalized: false,
        }
    }

    fn check_payload(data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE as usize {
            return Err(Error::InvalidOperation(format!(
                "payload must be exactly one block, got {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    fn stage_payload(&mut self, data: &[u8]) -> u64 {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(data);
        offset
    }

    /// Record a copy of base block `source_block` into `new_block`.
    pub fn add_copy(&mut self, new_block: u64, source_block: u64) -> Result<()> {
        self.ops.push(PendingOp {
            kind: CowOpKind::Copy,
            new_block,
            source: source_block,
            data_offset: None,
        });
        Ok(())
    }

    /// Record a full-block replacement of `new_block` with `data`.
    pub fn add_replace(&mut self, new_block: u64, data: &[u8]) -> Result<()> {
        Self::check_payload(data)?;
        let data_offset = self.stage_payload(data);
        self.ops.push(PendingOp {
            kind: CowOpKind::Replace,
            new_block,
            source: 0,
            data_offset: Some(data_offset),
        });
        Ok(())
    }

    /// Record zeroing of `new_block`.
    pub fn add_zero(&mut self, new_block: u64) -> Result<()> {
        self.ops.push(PendingOp {
            kind: CowOpKind::Zero,
            new_block,
            source: 0,
            data_offset: None,
        });
        Ok(())
    }

    /// Record an XOR of `new_block`'s old base contents with `diff`.
    ///
    /// The record's source field resolves to the payload offset at layout
    /// time; the block being XORed is `new_block` itself.
    pub fn add_xor(&mut self, new_block: u64, diff: &[u8]) -> Result<()> {
        Self::check_payload(diff)?;
        let data_offset = self.stage_payload(diff);
        self.ops.push(PendingOp {
            kind: CowOpKind::Xor,
            new_block,
            source: 0,
            data_offset: Some(data_offset),
        });
        Ok(())
    }

    /// Number of operations recorded so far.
    pub fn num_ops(&self) -> u64 {
        self.ops.len() as u64
    }

    /// Lay out and durably write the overlay.
    pub fn finalize(mut self) -> Result<()> {
        if self.finalized {
            return Err(Error::InvalidOperation(
                "overlay already finalized".to_string(),
            ));
        }
        self.finalized = true;

        if self.options.scratch_size != 0
            && !snapmerge_core::is_block_aligned(self.options.scratch_size as u64)
        {
            return Err(Error::InvalidOperation(format!(
                "scratch size {} is not block aligned",
                self.options.scratch_size
            )));
        }

        let ops_offset = COW_HEADER_SIZE as u64 + self.options.scratch_size as u64;
        let ops_size = self.ops.len() as u64 * COW_OP_SIZE as u64;
        let data_region_start = ops_offset + ops_size;

        let header = CowHeader {
            magic: COW_MAGIC,
            major_version: COW_VERSION_MAJOR,
            minor_version: COW_VERSION_MINOR,
            header_size: COW_HEADER_SIZE as u16,
            op_size: COW_OP_SIZE as u16,
            block_size: BLOCK_SIZE as u32,
            num_ops: self.ops.len() as u64,
            ops_offset,
            ops_size,
            num_merge_ops: 0,
            buffer_size: self.options.scratch_size,
        };

        let mut encoded_ops = Vec::with_capacity(ops_size as usize);
        for pending in &self.ops {
            let (source, data_length) = match pending.data_offset {
                Some(offset) => (data_region_start + offset, BLOCK_SIZE as u16),
                None => (pending.source, 0),
            };
            let op = CowOperation {
                kind: pending.kind,
                new_block: pending.new_block,
                source,
                data_length,
            };
            encoded_ops.extend_from_slice(&op.to_bytes());
        }

        let footer = CowFooter {
            ops_size,
            num_ops: self.ops.len() as u64,
            ops_checksum: ops_checksum(&encoded_ops),
        };

        self.file.seek(SeekFrom::Start(0))?;
        let mut out = BufWriter::new(&self.file);
        out.write_all(&header.to_bytes())?;
        // Scratch region starts zeroed: read-ahead state Pending, no staged
        // data.
        if self.options.scratch_size > 0 {
            let zero_block = [0u8; BLOCK_SIZE as usize];
            let mut remaining = self.options.scratch_size as u64;
            while remaining > 0 {
                let n = remaining.min(BLOCK_SIZE) as usize;
                out.write_all(&zero_block[..n])?;
                remaining -= n as u64;
            }
        }
        out.write_all(&encoded_ops)?;
        out.write_all(&self.data)?;
        out.write_all(&footer.to_bytes())?;
        out.flush()?;
        drop(out);
        // The backing store may be pre-sized (partition-backed COW); the
        // footer must be the last bytes of the file.
        let final_len =
            data_region_start + self.data.len() as u64 + crate::format::COW_FOOTER_SIZE as u64;
        self.file.set_len(final_len)?;
        self.file.sync_all()?;

        tracing::debug!(
            num_ops = header.num_ops,
            data_bytes = self.data.len(),
            scratch = self.options.scratch_size,
            "finalized COW overlay"
        );
        Ok(())
    }
}
