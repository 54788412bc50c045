//! Staged read-ahead of ordered-op source blocks.
//!
//! Runs in lock step with the merge thread through the buffer state:
//! whenever the buffer is Pending this worker stages the source data for
//! the next window of ordered ops into the COW scratch region, flushes it,
//! and marks the buffer Done. The merge consumes exactly that window in
//! one batch; its commit flips the buffer back to Pending.
//!
//! Staging reads every source before the merge overwrites anything in the
//! window, so copy sources that the window itself clobbers are still
//! served from their pre-merge contents.

use crate::handler::{MergeTransition, TransitionMachine};
use crate::merge::MergeError;
use crate::progress::{ProgressReader, RaWriter};
use snapmerge_core::BLOCK_SIZE;
use snapmerge_cow::{CowOpKind, CowReader, READ_AHEAD_PENDING};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fills the staging buffer one window ahead of the merge.
pub struct ReadAheadWorker {
    reader: CowReader,
    ra: RaWriter,
    progress: ProgressReader,
    base: File,
    transition: Arc<TransitionMachine>,
    stop: Arc<AtomicBool>,
    /// Ordered ops staged per window.
    quota: u64,
}

impl ReadAheadWorker {
    /// Build a read-ahead worker. `quota` is clamped to the staging slot
    /// capacity.
    pub fn new(
        reader: CowReader,
        ra: RaWriter,
        progress: ProgressReader,
        base: File,
        transition: Arc<TransitionMachine>,
        stop: Arc<AtomicBool>,
        quota: u64,
    ) -> Self {
        let quota = quota.min(ra.slot_capacity()).max(1);
        ReadAheadWorker {
            reader,
            ra,
            progress,
            base,
            transition,
            stop,
            quota,
        }
    }

    /// Stage windows until every ordered op is merged or the daemon stops.
    ///
    /// On a read failure the staged data cannot be trusted; the worker
    /// reports `ReadAheadFailure` and raises the stop flag so the merge
    /// aborts instead of waiting forever.
    pub fn run(mut self) -> Result<(), MergeError> {
        let num_ordered = self
            .reader
            .op_iter()
            .filter(|op| op.is_ordered())
            .count() as u64;

        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.progress.merged() >= num_ordered {
                tracing::debug!("all ordered ops merged, read-ahead done");
                return Ok(());
            }
            if !self.progress.wait_ra_state(READ_AHEAD_PENDING, &self.stop) {
                return Ok(());
            }

            // The commit that released the buffer advanced the checkpoint;
            // re-read it to find the next window.
            let start = self.progress.merged();
            if start >= num_ordered {
                return Ok(());
            }
            let end = (start + self.quota).min(num_ordered);

            if let Err(e) = self.fill_window(start, end) {
                tracing::error!(error = %e, start, end, "read-ahead fill failed");
                self.transition.set(MergeTransition::ReadAheadFailure);
                self.stop.store(true, Ordering::Release);
                return Err(e);
            }
        }
    }

    fn fill_window(&mut self, start: u64, end: u64) -> Result<(), MergeError> {
        self.ra.begin_fill()?;
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        for pos in start..end {
            let op = self.reader.ops()[self.reader.merge_order()[pos as usize]];
            let source = match op.kind {
                CowOpKind::Copy => op.source,
                CowOpKind::Xor => op.new_block,
                CowOpKind::Replace | CowOpKind::Zero => {
                    unreachable!("unordered op in the ordered region")
                }
            };
            self.base.read_exact_at(&mut buf, source * BLOCK_SIZE)?;
            self.ra.stage(pos - start, op.new_block, &buf)?;
        }
        self.ra.finish_fill(end - start)?;
        tracing::debug!(start, end, "staged read-ahead window");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeWorker;
    use crate::progress::ProgressStore;
    use snapmerge_cow::{CowWriter, CowWriterOptions, SCRATCH_REGION_DEFAULT_SIZE};
    use std::thread;
    use tempfile::tempfile;

    fn block(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE as usize]
    }

    fn base_device(num_blocks: u64) -> File {
        let file = tempfile().unwrap();
        for i in 0..num_blocks {
            file.write_all_at(&block(i as u8), i * BLOCK_SIZE).unwrap();
        }
        file
    }

    fn read_block(file: &File, index: u64) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        file.read_exact_at(&mut buf, index * BLOCK_SIZE).unwrap();
        buf
    }

    fn spawn_pair(
        cow: &File,
        base: &File,
        quota: u64,
    ) -> (
        thread::JoinHandle<Result<(), MergeError>>,
        thread::JoinHandle<Result<(), MergeError>>,
        Arc<TransitionMachine>,
    ) {
        let reader = CowReader::parse(cow.try_clone().unwrap()).unwrap();
        let mut handles = ProgressStore::map(cow, reader.header()).unwrap();
        let transition = Arc::new(TransitionMachine::new());
        let stop = Arc::new(AtomicBool::new(false));

        let ra_worker = ReadAheadWorker::new(
            reader.try_clone().unwrap(),
            handles.ra.take().unwrap(),
            handles.reader.clone(),
            base.try_clone().unwrap(),
            transition.clone(),
            stop.clone(),
            quota,
        );
        let merge_worker = MergeWorker::new(
            reader,
            base.try_clone().unwrap(),
            handles.writer,
            handles.reader,
            transition.clone(),
            stop,
            quota,
            true,
        );

        let ra_handle = thread::spawn(move || ra_worker.run());
        let merge_handle = thread::spawn(move || merge_worker.run());
        (ra_handle, merge_handle, transition)
    }

    #[test]
    fn test_lock_step_merge_with_read_ahead() {
        let cow = tempfile().unwrap();
        let mut writer = CowWriter::new(
            cow.try_clone().unwrap(),
            CowWriterOptions {
                scratch_size: SCRATCH_REGION_DEFAULT_SIZE,
            },
        );
        // Five copy windows of two ops each, plus an unordered tail.
        for i in 0..10u64 {
            writer.add_copy(30 + i, i).unwrap();
        }
        writer.add_replace(50, &block(0xEE)).unwrap();
        writer.finalize().unwrap();

        let base = base_device(64);
        let (ra_handle, merge_handle, transition) = spawn_pair(&cow, &base, 2);
        transition.set(MergeTransition::MergeBegin);

        merge_handle.join().unwrap().unwrap();
        ra_handle.join().unwrap().unwrap();
        assert_eq!(transition.current(), MergeTransition::MergeComplete);

        for i in 0..10u64 {
            assert_eq!(read_block(&base, 30 + i), block(i as u8), "block {}", 30 + i);
        }
        assert_eq!(read_block(&base, 50), block(0xEE));

        let reparsed = CowReader::parse(cow.try_clone().unwrap()).unwrap();
        assert_eq!(reparsed.header().num_merge_ops, 11);
    }

    #[test]
    fn test_read_failure_fails_the_merge() {
        let cow = tempfile().unwrap();
        let mut writer = CowWriter::new(
            cow.try_clone().unwrap(),
            CowWriterOptions {
                scratch_size: SCRATCH_REGION_DEFAULT_SIZE,
            },
        );
        // Source block far beyond the end of the base device.
        writer.add_copy(2, 1_000_000).unwrap();
        writer.finalize().unwrap();

        let base = base_device(8);
        let (ra_handle, merge_handle, transition) = spawn_pair(&cow, &base, 4);
        transition.set(MergeTransition::MergeBegin);

        assert!(ra_handle.join().unwrap().is_err());
        let merge_result = merge_handle.join().unwrap();
        assert!(matches!(merge_result, Err(MergeError::ReadAheadFailed)));
        assert_eq!(transition.current(), MergeTransition::MergeFailed);
    }
}
