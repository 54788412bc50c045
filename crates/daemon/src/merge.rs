//! Background merge of COW operations into the base device.
//!
//! The merge walks the overlay in merge replay order, skipping the first
//! `num_merge_ops` already-durable ops, and applies batches: write the
//! batch to the base device, fsync, then `ProgressWriter::commit`. A crash
//! loses at most the in-flight batch; re-applying a batch is idempotent
//! because every op writes a deterministic block.
//!
//! With read-ahead active the ordered phase runs in lock step with the
//! ReadAheadWorker: each batch is exactly one staged window, and the
//! commit that retires it releases the staging buffer for the next fill.

use crate::handler::{MergeTransition, TransitionMachine};
use crate::progress::{ProgressReader, ProgressWriter};
use snapmerge_cow::{CowOpKind, CowParseError, CowReader};
use snapmerge_core::BLOCK_SIZE;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "read-ahead")]
use snapmerge_cow::READ_AHEAD_DONE;

/// Merge failures. All of them leave the durable checkpoint intact;
/// restarting the daemon resumes from the last commit.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// Base device or COW I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Overlay payload read failure
    #[error("Overlay error: {0}")]
    Cow(#[from] CowParseError),

    /// Progress store failure
    #[error("Progress error: {0}")]
    Progress(#[from] snapmerge_core::Error),

    /// The read-ahead thread failed; staged data cannot be trusted
    #[error("Read-ahead failure aborted the merge")]
    ReadAheadFailed,

    /// An IoWorker terminated on a protocol violation
    #[error("Control channel failure: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),
}

/// Applies the overlay to the base device, one durable batch at a time.
pub struct MergeWorker {
    reader: CowReader,
    base: File,
    writer: ProgressWriter,
    progress: ProgressReader,
    transition: Arc<TransitionMachine>,
    stop: Arc<AtomicBool>,
    batch_ops: u64,
    /// True when a ReadAheadWorker is staging ordered windows.
    ra_active: bool,
}

impl MergeWorker {
    /// Build a merge worker. `base` must be opened read-write.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: CowReader,
        base: File,
        writer: ProgressWriter,
        progress: ProgressReader,
        transition: Arc<TransitionMachine>,
        stop: Arc<AtomicBool>,
        batch_ops: u64,
        ra_active: bool,
    ) -> Self {
        MergeWorker {
            reader,
            base,
            writer,
            progress,
            transition,
            stop,
            batch_ops,
            ra_active,
        }
    }

    /// Wait for the merge to be initiated, then drive it to a terminal
    /// transition. Returns without touching the device if the daemon is
    /// torn down first.
    pub fn run(mut self) -> Result<(), MergeError> {
        match self.transition.wait_merge_begin() {
            MergeTransition::MergeBegin => {}
            other => {
                tracing::debug!(state = ?other, "merge thread exiting before start");
                return Ok(());
            }
        }

        match self.merge_all() {
            Ok(true) => {
                self.transition.set(MergeTransition::MergeComplete);
                Ok(())
            }
            Ok(false) => {
                tracing::info!(merged = self.writer.merged(), "merge stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, merged = self.writer.merged(), "merge failed");
                self.transition.set(MergeTransition::MergeFailed);
                Err(e)
            }
        }
    }

    /// Apply every remaining op. Returns `Ok(false)` when stopped between
    /// batches.
    fn merge_all(&mut self) -> Result<bool, MergeError> {
        let total = self.reader.merge_order().len() as u64;
        let num_ordered = self
            .reader
            .op_iter()
            .filter(|op| op.is_ordered())
            .count() as u64;
        let mut pos = self.writer.merged();
        tracing::info!(resume_at = pos, total, num_ordered, "merge starting");

        while pos < total {
            if self.stop.load(Ordering::Acquire) {
                return Ok(false);
            }

            let (end, staged) = self.next_batch(pos, num_ordered, total)?;
            let Some(end) = end else {
                return Ok(false);
            };

            self.apply_batch(pos, end, staged)?;
            self.base.sync_all()?;
            self.writer.commit(end - pos)?;
            pos = end;
        }

        tracing::info!(total, "merge complete");
        Ok(true)
    }

    /// Pick the end of the next batch. Ordered batches never cross into
    /// the unordered region; a staged batch is exactly the staged window.
    fn next_batch(
        &self,
        pos: u64,
        num_ordered: u64,
        total: u64,
    ) -> Result<(Option<u64>, bool), MergeError> {
        if pos < num_ordered && self.ra_active {
            if !self.wait_window_staged() {
                if self.transition.current() == MergeTransition::ReadAheadFailure {
                    return Err(MergeError::ReadAheadFailed);
                }
                return Ok((None, false));
            }
            let staged = self.progress.staged_count().min(num_ordered - pos);
            Ok((Some(pos + staged), true))
        } else if pos < num_ordered {
            Ok((Some((pos + self.batch_ops).min(num_ordered)), false))
        } else {
            Ok((Some((pos + self.batch_ops).min(total)), false))
        }
    }

    #[cfg(feature = "read-ahead")]
    fn wait_window_staged(&self) -> bool {
        self.progress.wait_ra_state(READ_AHEAD_DONE, &self.stop)
    }

    #[cfg(not(feature = "read-ahead"))]
    fn wait_window_staged(&self) -> bool {
        unreachable!("read-ahead is never active without the feature")
    }

    fn apply_batch(&mut self, start: u64, end: u64, staged: bool) -> Result<(), MergeError> {
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        for pos in start..end {
            let op = self.reader.ops()[self.reader.merge_order()[pos as usize]];
            let target = op.new_block * BLOCK_SIZE;
            match op.kind {
                CowOpKind::Replace => {
                    self.reader.read_data(&op, &mut buf)?;
                    self.base.write_all_at(&buf, target)?;
                }
                CowOpKind::Zero => {
                    buf.fill(0);
                    self.base.write_all_at(&buf, target)?;
                }
                CowOpKind::Copy => {
                    match staged.then(|| self.progress.staged_slot(pos - start)).flatten() {
                        Some(data) => buf.copy_from_slice(&data),
                        None => self.base.read_exact_at(&mut buf, op.source * BLOCK_SIZE)?,
                    }
                    self.base.write_all_at(&buf, target)?;
                }
                CowOpKind::Xor => {
                    match staged.then(|| self.progress.staged_slot(pos - start)).flatten() {
                        Some(data) => buf.copy_from_slice(&data),
                        None => self.base.read_exact_at(&mut buf, target)?,
                    }
                    let mut diff = vec![0u8; op.data_length as usize];
                    self.reader.read_data(&op, &mut diff)?;
                    for (b, d) in buf.iter_mut().zip(diff.iter()) {
                        *b ^= d;
                    }
                    self.base.write_all_at(&buf, target)?;
                }
            }
        }
        tracing::debug!(start, end, "applied merge batch");
        Ok(())
    }
}
