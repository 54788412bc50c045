//! Durable merge progress over the mapped COW header.
//!
//! The header's `num_merge_ops` field is the single durable checkpoint of
//! the merge. This module maps the header plus the scratch region with
//! `memmap2` and splits access into three handles:
//!
//! - [`ProgressWriter`]: the only handle that can advance `num_merge_ops`.
//!   `commit` is the sole durability boundary of the merge.
//! - [`RaWriter`]: mutates only the read-ahead `BufferState` and staging
//!   bytes, following the transition table Pending -> InProgress -> Done.
//!   The Done -> Pending edge belongs to `commit`.
//! - [`ProgressReader`]: clonable read-only view for IoWorkers.
//!
//! Single-writer access is enforced by construction: `map` hands out each
//! writer handle exactly once and the handles are not clonable.
//!
//! Scratch layout (first scratch block, at `header_size`):
//!
//! ```text
//! offset 0    read_ahead_state: u8
//! offset 8    staged_count: u64
//! offset 16   staged block numbers: u64 per slot
//! ```
//!
//! Staged data blocks follow from the second scratch block onward, one
//! block per slot, indexed in merge order.

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Condvar, Mutex};
use snapmerge_core::{Error, Result, BLOCK_SIZE};
use snapmerge_cow::{
    CowHeader, READ_AHEAD_DONE, READ_AHEAD_IN_PROGRESS, READ_AHEAD_PENDING,
};
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Byte offset of `num_merge_ops` within the header.
const MERGE_OPS_OFFSET: usize = 44;

/// Offset of the staged-slot count within the first scratch block.
const STAGED_COUNT_OFFSET: usize = 8;

/// Offset of the staged block-number table within the first scratch block.
const STAGED_TABLE_OFFSET: usize = 16;

/// Slots representable in the block-number table.
const STAGED_TABLE_CAPACITY: u64 = (BLOCK_SIZE - STAGED_TABLE_OFFSET as u64) / 8;

struct Geometry {
    header_size: usize,
    state_offset: usize,
    data_offset: usize,
    buffer_size: usize,
    slot_capacity: u64,
    has_scratch: bool,
}

struct Shared {
    mmap: Mutex<MmapMut>,
    merged: AtomicU64,
    ra_state: Mutex<u8>,
    ra_cond: Condvar,
    geometry: Geometry,
}

impl Shared {
    fn write_state(&self, map: &mut MmapMut, state: u8) -> Result<()> {
        map[self.geometry.state_offset] = state;
        map.flush_range(self.geometry.state_offset, 1)?;
        *self.ra_state.lock() = state;
        self.ra_cond.notify_all();
        Ok(())
    }
}

/// Mapped progress region, split into its access handles.
pub struct ProgressHandles {
    /// Merge-thread checkpoint writer.
    pub writer: ProgressWriter,
    /// Read-ahead staging writer; `None` when the COW has no scratch region.
    pub ra: Option<RaWriter>,
    /// Read-only view for IoWorkers.
    pub reader: ProgressReader,
}

/// Maps the COW header (and scratch region) for in-place progress updates.
pub struct ProgressStore;

impl ProgressStore {
    /// Map the progress region of an overlay and split it into handles.
    ///
    /// A crash during a read-ahead fill leaves the state InProgress with
    /// undefined staging contents; mapping resets that to Pending.
    pub fn map(file: &File, header: &CowHeader) -> Result<ProgressHandles> {
        let geometry = Geometry {
            header_size: header.header_size as usize,
            state_offset: header.buffer_state_offset() as usize,
            data_offset: header.buffer_data_offset() as usize,
            buffer_size: header.buffer_size as usize,
            slot_capacity: (header.buffer_data_size() / BLOCK_SIZE).min(STAGED_TABLE_CAPACITY),
            has_scratch: header.has_scratch_region(),
        };
        let map_len = geometry.header_size + geometry.buffer_size;

        // Safety: the daemon is the only writer of this region; the format
        // guarantees the file extends past the mapped prefix.
        let mut mmap = unsafe { MmapOptions::new().len(map_len).map_mut(file)? };

        if geometry.has_scratch && mmap[geometry.state_offset] == READ_AHEAD_IN_PROGRESS {
            tracing::warn!("read-ahead fill was interrupted, resetting to pending");
            mmap[geometry.state_offset] = READ_AHEAD_PENDING;
            mmap.flush_range(geometry.state_offset, 1)?;
        }

        let initial_state = if geometry.has_scratch {
            mmap[geometry.state_offset]
        } else {
            READ_AHEAD_PENDING
        };
        let has_scratch = geometry.has_scratch;

        let shared = Arc::new(Shared {
            mmap: Mutex::new(mmap),
            merged: AtomicU64::new(header.num_merge_ops),
            ra_state: Mutex::new(initial_state),
            ra_cond: Condvar::new(),
            geometry,
        });

        Ok(ProgressHandles {
            writer: ProgressWriter {
                shared: shared.clone(),
            },
            ra: has_scratch.then(|| RaWriter {
                shared: shared.clone(),
            }),
            reader: ProgressReader { shared },
        })
    }
}

/// Sole mutator of the durable `num_merge_ops` checkpoint.
pub struct ProgressWriter {
    shared: Arc<Shared>,
}

impl ProgressWriter {
    /// Ops durably merged so far.
    pub fn merged(&self) -> u64 {
        self.shared.merged.load(Ordering::Acquire)
    }

    /// Advance the checkpoint by `n` ops and flush synchronously.
    ///
    /// Also releases the read-ahead buffer back to Pending; the staged
    /// window is consumed by exactly the batch being committed.
    pub fn commit(&mut self, n: u64) -> Result<u64> {
        let new_total = self.merged() + n;
        let geometry = &self.shared.geometry;

        let mut map = self.shared.mmap.lock();
        map[MERGE_OPS_OFFSET..MERGE_OPS_OFFSET + 8].copy_from_slice(&new_total.to_le_bytes());
        if geometry.has_scratch {
            map[geometry.state_offset] = READ_AHEAD_PENDING;
        }
        map.flush_range(0, geometry.header_size)?;
        if geometry.has_scratch {
            map.flush_range(geometry.state_offset, 1)?;
        }
        drop(map);

        self.shared.merged.store(new_total, Ordering::Release);
        *self.shared.ra_state.lock() = READ_AHEAD_PENDING;
        self.shared.ra_cond.notify_all();

        tracing::trace!(batch = n, merged = new_total, "committed merge batch");
        Ok(new_total)
    }
}

/// Sole mutator of the read-ahead staging region.
pub struct RaWriter {
    shared: Arc<Shared>,
}

impl RaWriter {
    /// Staging slots available per fill.
    pub fn slot_capacity(&self) -> u64 {
        self.shared.geometry.slot_capacity
    }

    fn expect_state(&self, map: &MmapMut, expected: u8, edge: &str) -> Result<()> {
        let current = map[self.shared.geometry.state_offset];
        if current != expected {
            return Err(Error::InvalidOperation(format!(
                "illegal read-ahead transition {edge}: state is {current}"
            )));
        }
        Ok(())
    }

    /// Pending -> InProgress. Staging contents are undefined until
    /// `finish_fill`.
    pub fn begin_fill(&mut self) -> Result<()> {
        let mut map = self.shared.mmap.lock();
        self.expect_state(&map, READ_AHEAD_PENDING, "begin_fill")?;
        self.shared.write_state(&mut map, READ_AHEAD_IN_PROGRESS)
    }

    /// Stage one block into `slot`, recording the destination block number.
    pub fn stage(&mut self, slot: u64, block: u64, data: &[u8]) -> Result<()> {
        let geometry = &self.shared.geometry;
        if slot >= geometry.slot_capacity {
            return Err(Error::InvalidOperation(format!(
                "staging slot {slot} exceeds capacity {}",
                geometry.slot_capacity
            )));
        }
        debug_assert_eq!(data.len(), BLOCK_SIZE as usize);

        let mut map = self.shared.mmap.lock();
        self.expect_state(&map, READ_AHEAD_IN_PROGRESS, "stage")?;

        let table_entry = geometry.state_offset + STAGED_TABLE_OFFSET + slot as usize * 8;
        map[table_entry..table_entry + 8].copy_from_slice(&block.to_le_bytes());
        let data_start = geometry.data_offset + (slot * BLOCK_SIZE) as usize;
        map[data_start..data_start + BLOCK_SIZE as usize].copy_from_slice(data);
        Ok(())
    }

    /// InProgress -> Done: record the slot count, flush the staged data,
    /// then flip the state. Data is durable before Done becomes visible.
    pub fn finish_fill(&mut self, count: u64) -> Result<()> {
        let geometry = &self.shared.geometry;
        let mut map = self.shared.mmap.lock();
        self.expect_state(&map, READ_AHEAD_IN_PROGRESS, "finish_fill")?;

        let count_offset = geometry.state_offset + STAGED_COUNT_OFFSET;
        map[count_offset..count_offset + 8].copy_from_slice(&count.to_le_bytes());
        map.flush_range(geometry.state_offset, geometry.buffer_size)?;
        self.shared.write_state(&mut map, READ_AHEAD_DONE)
    }
}

/// Clonable read-only view of merge progress and the staging buffer.
#[derive(Clone)]
pub struct ProgressReader {
    shared: Arc<Shared>,
}

impl ProgressReader {
    /// Ops durably merged so far.
    pub fn merged(&self) -> u64 {
        self.shared.merged.load(Ordering::Acquire)
    }

    /// Current read-ahead state; Pending when the COW has no scratch region.
    pub fn ra_state(&self) -> u8 {
        *self.shared.ra_state.lock()
    }

    /// Block until the read-ahead state equals `target` or `stop` is set.
    /// Returns `false` on stop.
    pub fn wait_ra_state(&self, target: u8, stop: &AtomicBool) -> bool {
        let mut state = self.shared.ra_state.lock();
        loop {
            if *state == target {
                return true;
            }
            if stop.load(Ordering::Acquire) {
                return false;
            }
            self.shared
                .ra_cond
                .wait_for(&mut state, Duration::from_millis(50));
        }
    }

    /// Number of slots staged by the last completed fill.
    pub fn staged_count(&self) -> u64 {
        let geometry = &self.shared.geometry;
        if !geometry.has_scratch {
            return 0;
        }
        let map = self.shared.mmap.lock();
        let offset = geometry.state_offset + STAGED_COUNT_OFFSET;
        u64::from_le_bytes(map[offset..offset + 8].try_into().unwrap())
            .min(geometry.slot_capacity)
    }

    /// Copy the staged block at `slot` out of the scratch region.
    pub fn staged_slot(&self, slot: u64) -> Option<Vec<u8>> {
        let geometry = &self.shared.geometry;
        if !geometry.has_scratch || slot >= self.staged_count() {
            return None;
        }
        let map = self.shared.mmap.lock();
        let data_start = geometry.data_offset + (slot * BLOCK_SIZE) as usize;
        Some(map[data_start..data_start + BLOCK_SIZE as usize].to_vec())
    }

    /// Find staged data for a destination block. Only meaningful while the
    /// state is Done; callers check that first.
    pub fn staged_lookup(&self, block: u64) -> Option<Vec<u8>> {
        let geometry = &self.shared.geometry;
        if !geometry.has_scratch {
            return None;
        }
        let count = self.staged_count();
        let map = self.shared.mmap.lock();
        for slot in 0..count {
            let entry = geometry.state_offset + STAGED_TABLE_OFFSET + slot as usize * 8;
            let staged_block = u64::from_le_bytes(map[entry..entry + 8].try_into().unwrap());
            if staged_block == block {
                let data_start = geometry.data_offset + (slot * BLOCK_SIZE) as usize;
                return Some(map[data_start..data_start + BLOCK_SIZE as usize].to_vec());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapmerge_cow::{CowReader, CowWriter, CowWriterOptions, SCRATCH_REGION_DEFAULT_SIZE};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::tempfile;

    fn overlay(scratch: u32) -> (File, CowHeader) {
        let file = tempfile().unwrap();
        let mut writer = CowWriter::new(
            file.try_clone().unwrap(),
            CowWriterOptions {
                scratch_size: scratch,
            },
        );
        let block = vec![0x5Au8; BLOCK_SIZE as usize];
        for i in 0..4 {
            writer.add_replace(100 + i, &block).unwrap();
        }
        writer.finalize().unwrap();
        let header = *CowReader::parse(file.try_clone().unwrap()).unwrap().header();
        (file, header)
    }

    #[test]
    fn test_commit_is_durable() {
        let (file, header) = overlay(0);
        let mut handles = ProgressStore::map(&file, &header).unwrap();

        assert_eq!(handles.writer.merged(), 0);
        handles.writer.commit(3).unwrap();
        assert_eq!(handles.writer.merged(), 3);
        assert_eq!(handles.reader.merged(), 3);

        // A fresh parse of the file sees the new checkpoint.
        let reparsed = CowReader::parse(file.try_clone().unwrap()).unwrap();
        assert_eq!(reparsed.header().num_merge_ops, 3);
    }

    #[test]
    fn test_no_scratch_means_no_ra_writer() {
        let (file, header) = overlay(0);
        let handles = ProgressStore::map(&file, &header).unwrap();
        assert!(handles.ra.is_none());
        assert_eq!(handles.reader.ra_state(), READ_AHEAD_PENDING);
        assert!(handles.reader.staged_lookup(100).is_none());
    }

    #[test]
    fn test_ra_fill_cycle() {
        let (file, header) = overlay(SCRATCH_REGION_DEFAULT_SIZE);
        let mut handles = ProgressStore::map(&file, &header).unwrap();
        let mut ra = handles.ra.take().unwrap();

        assert_eq!(handles.reader.ra_state(), READ_AHEAD_PENDING);
        ra.begin_fill().unwrap();
        assert_eq!(handles.reader.ra_state(), READ_AHEAD_IN_PROGRESS);

        let data = vec![0xA1u8; BLOCK_SIZE as usize];
        ra.stage(0, 777, &data).unwrap();
        ra.finish_fill(1).unwrap();
        assert_eq!(handles.reader.ra_state(), READ_AHEAD_DONE);

        assert_eq!(handles.reader.staged_count(), 1);
        assert_eq!(handles.reader.staged_lookup(777).unwrap(), data);
        assert_eq!(handles.reader.staged_slot(0).unwrap(), data);
        assert!(handles.reader.staged_lookup(778).is_none());

        // Commit consumes the window and releases the buffer.
        handles.writer.commit(1).unwrap();
        assert_eq!(handles.reader.ra_state(), READ_AHEAD_PENDING);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let (file, header) = overlay(SCRATCH_REGION_DEFAULT_SIZE);
        let mut handles = ProgressStore::map(&file, &header).unwrap();
        let mut ra = handles.ra.take().unwrap();

        // finish without begin
        let err = ra.finish_fill(0).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));

        // double begin
        ra.begin_fill().unwrap();
        let err = ra.begin_fill().unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));

        // stage past capacity
        let data = vec![0u8; BLOCK_SIZE as usize];
        let err = ra.stage(ra.slot_capacity(), 1, &data).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_interrupted_fill_resets_to_pending() {
        let (mut file, header) = overlay(SCRATCH_REGION_DEFAULT_SIZE);

        // Simulate a crash mid-fill by forcing the durable state byte.
        file.seek(SeekFrom::Start(header.buffer_state_offset()))
            .unwrap();
        file.write_all(&[READ_AHEAD_IN_PROGRESS]).unwrap();

        let handles = ProgressStore::map(&file, &header).unwrap();
        assert_eq!(handles.reader.ra_state(), READ_AHEAD_PENDING);
    }

    #[test]
    fn test_checkpoint_survives_remap() {
        let (file, header) = overlay(SCRATCH_REGION_DEFAULT_SIZE);
        {
            let mut handles = ProgressStore::map(&file, &header).unwrap();
            handles.writer.commit(2).unwrap();
        }
        let header = *CowReader::parse(file.try_clone().unwrap()).unwrap().header();
        let handles = ProgressStore::map(&file, &header).unwrap();
        assert_eq!(handles.reader.merged(), 2);
    }
}
