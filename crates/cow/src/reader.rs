//! COW overlay reader.
//!
//! `CowReader::parse` validates the header and footer, decodes the full
//! operation region into an owned arena, and precomputes the merge replay
//! order. Parsing never guesses past a malformed file: a bad magic,
//! unknown major version, block-size mismatch, truncated op region or
//! checksum mismatch indicates a corrupt or foreign file and aborts
//! startup.

use crate::format::{
    ops_checksum, CowFooter, CowHeader, CowOperation, COW_FOOTER_SIZE, COW_HEADER_SIZE,
    COW_MAGIC, COW_OP_SIZE, COW_VERSION_MAJOR,
};
use snapmerge_core::BLOCK_SIZE;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;

/// COW parse and payload-read errors. All parse-time variants are fatal.
#[derive(Debug, thiserror::Error)]
pub enum CowParseError {
    /// I/O error while reading the overlay
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File does not start with the COW magic
    #[error("Invalid magic: {0:#018x}")]
    BadMagic(u64),

    /// Major version is newer than this reader understands
    #[error("Unsupported major version: {0}")]
    UnsupportedVersion(u16),

    /// Overlay was written with a different block size
    #[error("Block size mismatch: header says {found}, expected {expected}")]
    BlockSizeMismatch {
        /// Block size this system operates with
        expected: u32,
        /// Block size recorded in the header
        found: u32,
    },

    /// Header geometry is inconsistent with the file length
    #[error("Truncated operation region: {0}")]
    Truncated(String),

    /// Footer disagrees with the header
    #[error("Footer mismatch: {0}")]
    FooterMismatch(String),

    /// Operation stream checksum failure
    #[error("Ops checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Checksum recorded in the footer
        stored: u32,
        /// Checksum computed over the op region
        computed: u32,
    },

    /// An operation record carries an unknown kind byte
    #[error("Unknown operation kind {raw:#04x} at record {index}")]
    UnknownOpKind {
        /// Raw kind byte
        raw: u8,
        /// Record index within the op region
        index: u64,
    },

    /// A replace/xor op references data outside the data region
    #[error("Invalid data reference in record {index}: offset {offset}")]
    InvalidDataReference {
        /// Record index
        index: u64,
        /// Offending byte offset
        offset: u64,
    },
}

/// Parsed, validated COW overlay.
///
/// The operation arena and merge order are immutable after `parse`;
/// `num_merge_ops` progress is owned by the daemon's progress store, not by
/// this reader (the value captured here is the checkpoint as of parse time).
pub struct CowReader {
    file: File,
    header: CowHeader,
    ops: Vec<CowOperation>,
    /// Arena indices in merge replay order: ordered ops (stream order)
    /// followed by unordered ops (stream order).
    merge_order: Vec<usize>,
    data_region_start: u64,
    data_region_end: u64,
}

impl CowReader {
    /// Parse and validate an overlay file.
    pub fn parse(mut file: File) -> Result<CowReader, CowParseError> {
        let file_len = file.seek(SeekFrom::End(0))?;
        if file_len < (COW_HEADER_SIZE + COW_FOOTER_SIZE) as u64 {
            return Err(CowParseError::Truncated(format!(
                "file is {file_len} bytes, smaller than header + footer"
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = [0u8; COW_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = CowHeader::from_bytes(&header_bytes);

        if header.magic != COW_MAGIC {
            return Err(CowParseError::BadMagic(header.magic));
        }
        if header.major_version != COW_VERSION_MAJOR {
            return Err(CowParseError::UnsupportedVersion(header.major_version));
        }
        if header.block_size as u64 != BLOCK_SIZE {
            return Err(CowParseError::BlockSizeMismatch {
                expected: BLOCK_SIZE as u32,
                found: header.block_size,
            });
        }

        let ops_end = header
            .ops_offset
            .checked_add(header.ops_size)
            .ok_or_else(|| CowParseError::Truncated("ops region overflows".to_string()))?;
        let expected_ops_size = header
            .num_ops
            .checked_mul(COW_OP_SIZE as u64)
            .ok_or_else(|| {
                CowParseError::Truncated(format!(
                    "num_ops {} overflows the op region",
                    header.num_ops
                ))
            })?;
        if header.ops_size != expected_ops_size {
            return Err(CowParseError::Truncated(format!(
                "ops_size {} does not cover {} records",
                header.ops_size, header.num_ops
            )));
        }
        if ops_end > file_len - COW_FOOTER_SIZE as u64 {
            return Err(CowParseError::Truncated(format!(
                "ops region ends at {ops_end} but file data ends at {}",
                file_len - COW_FOOTER_SIZE as u64
            )));
        }

        let mut footer_bytes = [0u8; COW_FOOTER_SIZE];
        file.read_exact_at(&mut footer_bytes, file_len - COW_FOOTER_SIZE as u64)?;
        let footer = CowFooter::from_bytes(&footer_bytes);
        if footer.num_ops != header.num_ops || footer.ops_size != header.ops_size {
            return Err(CowParseError::FooterMismatch(format!(
                "footer ({} ops, {} bytes) vs header ({} ops, {} bytes)",
                footer.num_ops, footer.ops_size, header.num_ops, header.ops_size
            )));
        }

        let mut encoded_ops = vec![0u8; header.ops_size as usize];
        file.read_exact_at(&mut encoded_ops, header.ops_offset)?;

        let computed = ops_checksum(&encoded_ops);
        if computed != footer.ops_checksum {
            return Err(CowParseError::ChecksumMismatch {
                stored: footer.ops_checksum,
                computed,
            });
        }

        let data_region_start = ops_end;
        let data_region_end = file_len - COW_FOOTER_SIZE as u64;

        let mut ops = Vec::with_capacity(header.num_ops as usize);
        for (index, record) in encoded_ops.chunks_exact(COW_OP_SIZE).enumerate() {
            let record: &[u8; COW_OP_SIZE] = record.try_into().unwrap();
            let op = CowOperation::from_bytes(record).ok_or(CowParseError::UnknownOpKind {
                raw: record[0],
                index: index as u64,
            })?;

            if op.data_length > 0 {
                let payload_end = op.source.checked_add(op.data_length as u64);
                if op.source < data_region_start
                    || payload_end.map_or(true, |end| end > data_region_end)
                {
                    return Err(CowParseError::InvalidDataReference {
                        index: index as u64,
                        offset: op.source,
                    });
                }
            }

            ops.push(op);
        }

        // Merge replay order: ordered ops first, then replace/zero, each in
        // stream order. This is the one order used both for chunk-id
        // assignment and for merge application.
        let mut merge_order = Vec::with_capacity(ops.len());
        merge_order.extend(
            ops.iter()
                .enumerate()
                .filter(|(_, op)| op.is_ordered())
                .map(|(i, _)| i),
        );
        merge_order.extend(
            ops.iter()
                .enumerate()
                .filter(|(_, op)| !op.is_ordered())
                .map(|(i, _)| i),
        );

        tracing::debug!(
            num_ops = header.num_ops,
            num_merge_ops = header.num_merge_ops,
            buffer_size = header.buffer_size,
            "parsed COW overlay"
        );

        Ok(CowReader {
            file,
            header,
            ops,
            merge_order,
            data_region_start,
            data_region_end,
        })
    }

    /// The validated header, including the `num_merge_ops` checkpoint as of
    /// parse time.
    pub fn header(&self) -> &CowHeader {
        &self.header
    }

    /// Total number of data operations in the overlay.
    pub fn num_total_data_ops(&self) -> u64 {
        self.header.num_ops
    }

    /// The operation arena in stream (file) order.
    pub fn ops(&self) -> &[CowOperation] {
        &self.ops
    }

    /// Arena indices in merge replay order.
    pub fn merge_order(&self) -> &[usize] {
        &self.merge_order
    }

    /// Forward-only iterator in stream order, restartable from the start.
    pub fn op_iter(&self) -> impl Iterator<Item = &CowOperation> {
        self.ops.iter()
    }

    /// Forward-only iterator in merge replay order.
    pub fn merge_op_iter(&self) -> impl Iterator<Item = &CowOperation> {
        self.merge_order.iter().map(move |&i| &self.ops[i])
    }

    /// Read a replace/xor payload from the data region into `buf`.
    ///
    /// `buf` must be at least `op.data_length` bytes; for replace ops the
    /// payload is always one full block in this format revision.
    pub fn read_data(&self, op: &CowOperation, buf: &mut [u8]) -> Result<(), CowParseError> {
        let len = op.data_length as usize;
        debug_assert!(buf.len() >= len);
        debug_assert!(op.source >= self.data_region_start);
        debug_assert!(op.source + len as u64 <= self.data_region_end);
        self.file.read_exact_at(&mut buf[..len], op.source)?;
        Ok(())
    }

    /// Duplicate this reader for another worker thread.
    ///
    /// Re-opens the file handle; the parsed arena is cheap to clone relative
    /// to re-parsing and validation has already happened once.
    pub fn try_clone(&self) -> Result<CowReader, CowParseError> {
        Ok(CowReader {
            file: self.file.try_clone()?,
            header: self.header,
            ops: self.ops.clone(),
            merge_order: self.merge_order.clone(),
            data_region_start: self.data_region_start,
            data_region_end: self.data_region_end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::CowOpKind;
    use crate::writer::{CowWriter, CowWriterOptions};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::tempfile;

    fn block(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE as usize]
    }

    fn build_overlay(scratch: u32) -> File {
        let file = tempfile().unwrap();
        let mut writer = CowWriter::new(
            file.try_clone().unwrap(),
            CowWriterOptions {
                scratch_size: scratch,
            },
        );
        writer.add_replace(10, &block(0xAA)).unwrap();
        writer.add_copy(11, 4).unwrap();
        writer.add_zero(12).unwrap();
        writer.add_replace(13, &block(0xBB)).unwrap();
        writer.finalize().unwrap();
        file
    }

    #[test]
    fn test_parse_valid_overlay() {
        let file = build_overlay(0);
        let reader = CowReader::parse(file).unwrap();

        assert_eq!(reader.num_total_data_ops(), 4);
        assert_eq!(reader.header().num_merge_ops, 0);
        assert!(!reader.header().has_scratch_region());

        let kinds: Vec<_> = reader.op_iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CowOpKind::Replace,
                CowOpKind::Copy,
                CowOpKind::Zero,
                CowOpKind::Replace
            ]
        );
    }

    #[test]
    fn test_merge_order_puts_ordered_ops_first() {
        let file = build_overlay(0);
        let reader = CowReader::parse(file).unwrap();

        let order: Vec<_> = reader.merge_op_iter().map(|op| (op.kind, op.new_block)).collect();
        assert_eq!(
            order,
            vec![
                (CowOpKind::Copy, 11),
                (CowOpKind::Replace, 10),
                (CowOpKind::Zero, 12),
                (CowOpKind::Replace, 13),
            ]
        );
    }

    #[test]
    fn test_read_data_returns_payload() {
        let file = build_overlay(0);
        let reader = CowReader::parse(file).unwrap();

        let op = *reader.op_iter().next().unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        reader.read_data(&op, &mut buf).unwrap();
        assert_eq!(buf, block(0xAA));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut file = build_overlay(0);
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&[0u8; 8]).unwrap();

        let result = CowReader::parse(file);
        assert!(matches!(result, Err(CowParseError::BadMagic(_))));
    }

    #[test]
    fn test_unknown_major_version_rejected() {
        let mut file = build_overlay(0);
        file.seek(SeekFrom::Start(8)).unwrap();
        file.write_all(&99u16.to_le_bytes()).unwrap();

        let result = CowReader::parse(file);
        assert!(matches!(result, Err(CowParseError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_block_size_mismatch_rejected() {
        let mut file = build_overlay(0);
        file.seek(SeekFrom::Start(16)).unwrap();
        file.write_all(&8192u32.to_le_bytes()).unwrap();

        let result = CowReader::parse(file);
        assert!(matches!(
            result,
            Err(CowParseError::BlockSizeMismatch { found: 8192, .. })
        ));
    }

    #[test]
    fn test_truncated_ops_rejected() {
        let mut file = build_overlay(0);
        // Claim more ops than the file holds.
        file.seek(SeekFrom::Start(20)).unwrap();
        file.write_all(&10_000u64.to_le_bytes()).unwrap();
        file.seek(SeekFrom::Start(36)).unwrap();
        file.write_all(&(10_000u64 * COW_OP_SIZE as u64).to_le_bytes())
            .unwrap();

        let result = CowReader::parse(file);
        assert!(matches!(result, Err(CowParseError::Truncated(_))));
    }

    #[test]
    fn test_overflowing_num_ops_rejected() {
        let mut file = build_overlay(0);
        // An op count whose byte size overflows u64 must not panic.
        file.seek(SeekFrom::Start(20)).unwrap();
        file.write_all(&(1u64 << 60).to_le_bytes()).unwrap();

        let result = CowReader::parse(file);
        assert!(matches!(result, Err(CowParseError::Truncated(_))));
    }

    #[test]
    fn test_overflowing_data_reference_rejected() {
        let mut file = build_overlay(0);

        // Point the first record's payload near the end of the address
        // space, refreshing the checksum so only the bounds check trips.
        let reader = CowReader::parse(file.try_clone().unwrap()).unwrap();
        let header = *reader.header();
        drop(reader);

        let mut encoded = vec![0u8; header.ops_size as usize];
        file.read_exact_at(&mut encoded, header.ops_offset).unwrap();
        encoded[16..24].copy_from_slice(&(u64::MAX - 100).to_le_bytes());
        file.write_all_at(&encoded, header.ops_offset).unwrap();

        let file_len = file.metadata().unwrap().len();
        let checksum = ops_checksum(&encoded);
        file.write_all_at(
            &checksum.to_le_bytes(),
            file_len - COW_FOOTER_SIZE as u64 + 16,
        )
        .unwrap();

        let result = CowReader::parse(file);
        assert!(matches!(
            result,
            Err(CowParseError::InvalidDataReference { index: 0, .. })
        ));
    }

    #[test]
    fn test_corrupted_op_region_rejected() {
        let mut file = build_overlay(0);
        // Flip a byte inside the op region (past the 64-byte header).
        file.seek(SeekFrom::Start(COW_HEADER_SIZE as u64 + 9)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = CowReader::parse(file);
        assert!(matches!(result, Err(CowParseError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_scratch_region_shifts_ops_offset() {
        let file = build_overlay(crate::format::SCRATCH_REGION_DEFAULT_SIZE);
        let reader = CowReader::parse(file).unwrap();

        let header = reader.header();
        assert!(header.has_scratch_region());
        assert_eq!(
            header.ops_offset,
            COW_HEADER_SIZE as u64 + header.buffer_size as u64
        );
        // Payloads still resolve correctly with the shifted data region.
        let op = *reader.op_iter().next().unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        reader.read_data(&op, &mut buf).unwrap();
        assert_eq!(buf, block(0xAA));
    }
}
