//! Per-snapshot daemon context.
//!
//! One `SnapshotHandler` per mapped snapshot device. It owns the parsed
//! overlay, the progress mapping, the lazily built exception tables, and
//! the transition machine the worker threads coordinate through. There is
//! no ambient global state; every worker gets its handles from here.

use crate::merge::{MergeError, MergeWorker};
use crate::progress::{ProgressReader, ProgressStore, ProgressWriter, RaWriter};
use crate::protocol::{ProtocolError, PAYLOAD_SIZE};
use crate::worker::IoWorker;
use parking_lot::{Condvar, Mutex};
use snapmerge_cow::{CowReader, ExceptionTable};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

#[cfg(feature = "read-ahead")]
use crate::readahead::ReadAheadWorker;

/// Cross-thread merge lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTransition {
    /// Daemon is up; merge not yet initiated.
    MergeReady,
    /// Merge has been initiated and may be running.
    MergeBegin,
    /// Merge hit an unrecoverable error.
    MergeFailed,
    /// Every op is durably merged.
    MergeComplete,
    /// All control channels closed before a merge was initiated.
    IoTerminated,
    /// The read-ahead thread failed; the merge will abort.
    ReadAheadFailure,
}

impl MergeTransition {
    fn is_terminal(self) -> bool {
        !matches!(
            self,
            MergeTransition::MergeReady | MergeTransition::MergeBegin
        )
    }
}

/// Mutex + condvar wrapper the workers block on.
pub struct TransitionMachine {
    state: Mutex<MergeTransition>,
    cond: Condvar,
}

impl TransitionMachine {
    /// Start in `MergeReady`.
    pub fn new() -> Self {
        TransitionMachine {
            state: Mutex::new(MergeTransition::MergeReady),
            cond: Condvar::new(),
        }
    }

    /// Move to `next` and wake every waiter.
    pub fn set(&self, next: MergeTransition) {
        let mut state = self.state.lock();
        tracing::debug!(from = ?*state, to = ?next, "merge transition");
        *state = next;
        self.cond.notify_all();
    }

    /// Current state.
    pub fn current(&self) -> MergeTransition {
        *self.state.lock()
    }

    /// Block until the merge is initiated or the daemon winds down.
    pub fn wait_merge_begin(&self) -> MergeTransition {
        let mut state = self.state.lock();
        while *state == MergeTransition::MergeReady {
            self.cond.wait(&mut state);
        }
        *state
    }

    /// Block until a terminal state is reached.
    pub fn wait_terminal(&self) -> MergeTransition {
        let mut state = self.state.lock();
        while !state.is_terminal() {
            self.cond.wait(&mut state);
        }
        *state
    }

    /// The last channel closed. Only interrupts a daemon that never
    /// started merging; a terminal merge result is never overwritten.
    fn signal_io_terminated(&self) {
        let mut state = self.state.lock();
        if *state == MergeTransition::MergeReady {
            *state = MergeTransition::IoTerminated;
            self.cond.notify_all();
        }
    }
}

impl Default for TransitionMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Daemon configuration for one snapshot device.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Base block device the merge writes into.
    pub base_device: PathBuf,
    /// COW overlay file.
    pub cow_file: PathBuf,
    /// Control-channel endpoints served concurrently.
    pub num_io_workers: usize,
    /// Upper bound on ops per merge commit.
    pub merge_batch_ops: u64,
    /// Reply payload chunk cap in bytes.
    pub payload_size: usize,
}

impl DaemonConfig {
    /// Defaults: one IoWorker, 256-op batches, 64 KiB payload chunks.
    pub fn new(base_device: impl Into<PathBuf>, cow_file: impl Into<PathBuf>) -> Self {
        DaemonConfig {
            base_device: base_device.into(),
            cow_file: cow_file.into(),
            num_io_workers: 1,
            merge_batch_ops: 256,
            payload_size: PAYLOAD_SIZE,
        }
    }

    /// Set the IoWorker pool size.
    pub fn with_num_io_workers(mut self, n: usize) -> Self {
        self.num_io_workers = n;
        self
    }

    /// Set the merge batch bound.
    pub fn with_merge_batch_ops(mut self, n: u64) -> Self {
        self.merge_batch_ops = n;
        self
    }

    /// Set the reply payload chunk cap.
    pub fn with_payload_size(mut self, n: usize) -> Self {
        self.payload_size = n;
        self
    }
}

/// Context for one snapshot device's daemon instance.
pub struct SnapshotHandler {
    config: DaemonConfig,
    reader: CowReader,
    tables: Arc<OnceLock<ExceptionTable>>,
    transition: Arc<TransitionMachine>,
    stop: Arc<AtomicBool>,
    progress_reader: ProgressReader,
    progress_writer: Option<ProgressWriter>,
    ra_writer: Option<RaWriter>,
    scratch_data_bytes: u64,
    total_ops: u64,
    io_threads: Vec<JoinHandle<Result<(), ProtocolError>>>,
    merge_thread: Option<JoinHandle<Result<(), MergeError>>>,
    ra_thread: Option<JoinHandle<Result<(), MergeError>>>,
}

impl SnapshotHandler {
    /// Parse the overlay and map its progress region.
    pub fn new(config: DaemonConfig) -> Result<Self, MergeError> {
        let cow_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.cow_file)?;
        let reader = CowReader::parse(cow_file.try_clone()?)?;
        let handles = ProgressStore::map(&cow_file, reader.header())?;

        tracing::info!(
            cow = %config.cow_file.display(),
            num_ops = reader.num_total_data_ops(),
            merged = handles.reader.merged(),
            "snapshot handler ready"
        );

        let scratch_data_bytes = reader.header().buffer_data_size();
        let total_ops = reader.num_total_data_ops();
        Ok(SnapshotHandler {
            config,
            reader,
            tables: Arc::new(OnceLock::new()),
            transition: Arc::new(TransitionMachine::new()),
            stop: Arc::new(AtomicBool::new(false)),
            progress_reader: handles.reader,
            progress_writer: Some(handles.writer),
            ra_writer: handles.ra,
            scratch_data_bytes,
            total_ops,
            io_threads: Vec::new(),
            merge_thread: None,
            ra_thread: None,
        })
    }

    /// Start the worker threads: one IoWorker per channel endpoint, one
    /// MergeWorker, and (with staging available) one ReadAheadWorker.
    pub fn spawn<C>(&mut self, channels: Vec<C>) -> Result<(), MergeError>
    where
        C: Read + Write + Send + 'static,
    {
        let active = Arc::new(AtomicUsize::new(channels.len()));
        for channel in channels {
            let worker = IoWorker::new(
                channel,
                self.reader.try_clone()?,
                self.tables.clone(),
                self.scratch_data_bytes,
                self.progress_reader.clone(),
                File::open(&self.config.base_device)?,
                self.config.payload_size,
            );
            let active = active.clone();
            let transition = self.transition.clone();
            let stop = self.stop.clone();
            self.io_threads.push(thread::spawn(move || {
                let result = worker.run();
                if let Err(ref e) = result {
                    tracing::error!(error = %e, "io worker terminated");
                    stop.store(true, Ordering::Release);
                }
                if active.fetch_sub(1, Ordering::AcqRel) == 1 {
                    transition.signal_io_terminated();
                }
                result
            }));
        }

        let base = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.base_device)?;
        let writer = self
            .progress_writer
            .take()
            .ok_or_else(|| snapmerge_core::Error::InvalidOperation(
                "daemon already spawned".to_string(),
            ))?;
        let ra_active = cfg!(feature = "read-ahead") && self.ra_writer.is_some();
        let merge_worker = MergeWorker::new(
            self.reader.try_clone()?,
            base,
            writer,
            self.progress_reader.clone(),
            self.transition.clone(),
            self.stop.clone(),
            self.config.merge_batch_ops,
            ra_active,
        );
        self.merge_thread = Some(thread::spawn(move || merge_worker.run()));

        #[cfg(feature = "read-ahead")]
        if let Some(ra) = self.ra_writer.take() {
            let ra_worker = ReadAheadWorker::new(
                self.reader.try_clone()?,
                ra,
                self.progress_reader.clone(),
                File::open(&self.config.base_device)?,
                self.transition.clone(),
                self.stop.clone(),
                self.config.merge_batch_ops,
            );
            self.ra_thread = Some(thread::spawn(move || ra_worker.run()));
        }

        Ok(())
    }

    /// Release the merge thread.
    pub fn initiate_merge(&self) {
        tracing::info!("merge initiated");
        self.transition.set(MergeTransition::MergeBegin);
    }

    /// Merge completion in whole percent, derived from the mapped
    /// checkpoint.
    pub fn merge_percentage(&self) -> u32 {
        if self.total_ops == 0 {
            return 100;
        }
        (self.progress_reader.merged() * 100 / self.total_ops) as u32
    }

    /// Ops durably merged so far.
    pub fn merged_ops(&self) -> u64 {
        self.progress_reader.merged()
    }

    /// Block until the merge (or the daemon) reaches a terminal state.
    pub fn wait_merge_result(&self) -> MergeTransition {
        self.transition.wait_terminal()
    }

    /// Ask every worker to wind down at the next safe point.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.transition.signal_io_terminated();
    }

    /// Join all worker threads, surfacing the first failure.
    pub fn join(&mut self) -> Result<(), MergeError> {
        let mut first_error: Option<MergeError> = None;
        for handle in self.io_threads.drain(..) {
            match handle.join().expect("io worker panicked") {
                Ok(()) => {}
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }
        if let Some(handle) = self.ra_thread.take() {
            match handle.join().expect("read-ahead worker panicked") {
                Ok(()) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(handle) = self.merge_thread.take() {
            match handle.join().expect("merge worker panicked") {
                Ok(()) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
