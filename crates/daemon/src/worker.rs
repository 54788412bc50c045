//! Control-channel request servicing.
//!
//! One `IoWorker` per channel endpoint. Each worker owns its channel and a
//! clone of the parsed overlay; the exception tables are built once, on the
//! first sector-0 request, and shared across the pool.
//!
//! Requests address 512-byte sectors but the kernel only ever asks in whole
//! chunks; misaligned requests get an error reply. Large reads loop in
//! block steps and stream header+payload chunks with `io_in_progress` set
//! on all but the last.

use crate::progress::ProgressReader;
use crate::protocol::{
    MessageHeader, ProtocolError, KIND_MAP_READ, KIND_MAP_WRITE, REPLY_ERROR, REPLY_OK,
};
use snapmerge_core::{
    is_block_aligned, Chunk, KernelDiskHeader, BLOCK_SIZE, CHUNK_SHIFT, CHUNK_SIZE, SECTOR_SHIFT,
};
use snapmerge_cow::{ChunkSlot, CowOpKind, CowOperation, CowReader, ExceptionTable,
    ExceptionTableBuilder};
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::sync::{Arc, OnceLock};

#[cfg(feature = "read-ahead")]
use snapmerge_cow::READ_AHEAD_DONE;

/// Serves `MAP_READ` requests for one channel endpoint.
pub struct IoWorker<C> {
    channel: C,
    reader: CowReader,
    tables: Arc<OnceLock<ExceptionTable>>,
    scratch_data_bytes: u64,
    progress: ProgressReader,
    base: File,
    payload_size: usize,
}

impl<C: Read + Write> IoWorker<C> {
    /// Build a worker over one channel endpoint.
    pub fn new(
        channel: C,
        reader: CowReader,
        tables: Arc<OnceLock<ExceptionTable>>,
        scratch_data_bytes: u64,
        progress: ProgressReader,
        base: File,
        payload_size: usize,
    ) -> Self {
        IoWorker {
            channel,
            reader,
            tables,
            scratch_data_bytes,
            progress,
            base,
            payload_size,
        }
    }

    /// Service requests until the channel closes.
    ///
    /// A clean close returns `Ok`; a protocol violation or channel failure
    /// returns the error and terminates this daemon instance.
    pub fn run(mut self) -> Result<(), ProtocolError> {
        loop {
            let Some(request) = MessageHeader::read_from(&mut self.channel)? else {
                tracing::debug!("control channel closed");
                return Ok(());
            };
            match request.kind {
                KIND_MAP_READ => self.serve_read(&request)?,
                KIND_MAP_WRITE => {
                    tracing::error!(seq = request.seq, "MAP_WRITE on read-only channel");
                    return Err(ProtocolError::UnexpectedWrite { seq: request.seq });
                }
                kind => {
                    tracing::error!(seq = request.seq, kind, "unknown request kind");
                    return Err(ProtocolError::UnknownKind {
                        kind,
                        seq: request.seq,
                    });
                }
            }
        }
    }

    fn tables(&self) -> &ExceptionTable {
        self.tables.get_or_init(|| {
            tracing::info!(
                num_ops = self.reader.num_total_data_ops(),
                "building exception tables"
            );
            ExceptionTableBuilder::new(self.scratch_data_bytes).build(&self.reader)
        })
    }

    fn send_error(&mut self, request: &MessageHeader) -> Result<(), ProtocolError> {
        MessageHeader {
            seq: request.seq,
            kind: REPLY_ERROR,
            flags: request.flags,
            sector: request.sector,
            len: 0,
            io_in_progress: 0,
        }
        .write_to(&mut self.channel)
    }

    fn serve_read(&mut self, request: &MessageHeader) -> Result<(), ProtocolError> {
        if request.sector % CHUNK_SIZE != 0 || !is_block_aligned(request.len) || request.len == 0 {
            tracing::warn!(
                seq = request.seq,
                sector = request.sector,
                len = request.len,
                "misaligned read request"
            );
            return self.send_error(request);
        }

        let first_chunk: Chunk = request.sector >> CHUNK_SHIFT;
        let num_blocks = request.len / BLOCK_SIZE;

        let mut payload = Vec::with_capacity(self.payload_size);
        let mut sent: u64 = 0;
        for i in 0..num_blocks {
            let chunk = first_chunk + i;
            let mut block = vec![0u8; BLOCK_SIZE as usize];
            if let Err(e) = self.resolve_chunk(chunk, &mut block) {
                tracing::warn!(seq = request.seq, chunk, error = %e, "read resolution failed");
                return self.send_error(request);
            }
            payload.extend_from_slice(&block);

            let last_block = i + 1 == num_blocks;
            if payload.len() + BLOCK_SIZE as usize > self.payload_size || last_block {
                let header = MessageHeader {
                    seq: request.seq,
                    kind: REPLY_OK,
                    flags: request.flags,
                    sector: request.sector + (sent >> SECTOR_SHIFT),
                    len: payload.len() as u64,
                    io_in_progress: u64::from(!last_block),
                };
                header.write_to(&mut self.channel)?;
                self.channel.write_all(&payload)?;
                sent += payload.len() as u64;
                payload.clear();
            }
        }
        self.channel.flush()?;
        Ok(())
    }

    fn resolve_chunk(&self, chunk: Chunk, block: &mut [u8]) -> snapmerge_core::Result<()> {
        if chunk == 0 {
            // Metadata bootstrap: the kernel asks for this once, when the
            // snapshot device comes up. Table construction happens here.
            let _ = self.tables();
            KernelDiskHeader::new().write_block(block);
            return Ok(());
        }
        if ExceptionTable::is_metadata_chunk(chunk) {
            match self.tables().metadata_page(chunk) {
                // Past the last real page the kernel sees a zero terminator.
                None => block.fill(0),
                Some(page) => block.copy_from_slice(page),
            }
            return Ok(());
        }
        match self.tables().lookup(chunk) {
            ChunkSlot::Absent => Err(snapmerge_core::Error::InvalidOperation(format!(
                "chunk {chunk} is not mapped"
            ))),
            ChunkSlot::Metadata => unreachable!("metadata chunks handled above"),
            ChunkSlot::Op(idx) => {
                let op = self.reader.ops()[idx];
                self.resolve_op(&op, block)
            }
        }
    }

    fn resolve_op(&self, op: &CowOperation, block: &mut [u8]) -> snapmerge_core::Result<()> {
        match op.kind {
            CowOpKind::Zero => {
                block.fill(0);
                Ok(())
            }
            CowOpKind::Replace => {
                self.reader
                    .read_data(op, block)
                    .map_err(|e| snapmerge_core::Error::Corruption(e.to_string()))?;
                Ok(())
            }
            CowOpKind::Copy => {
                if self.serve_staged(op.new_block, block) {
                    return Ok(());
                }
                self.base
                    .read_exact_at(block, op.source * BLOCK_SIZE)?;
                Ok(())
            }
            CowOpKind::Xor => {
                if !self.serve_staged(op.new_block, block) {
                    self.base
                        .read_exact_at(block, op.new_block * BLOCK_SIZE)?;
                }
                let mut diff = vec![0u8; op.data_length as usize];
                self.reader
                    .read_data(op, &mut diff)
                    .map_err(|e| snapmerge_core::Error::Corruption(e.to_string()))?;
                for (b, d) in block.iter_mut().zip(diff.iter()) {
                    *b ^= d;
                }
                Ok(())
            }
        }
    }

    /// Serve an ordered op from the staging buffer when the current fill
    /// covers its block. Returns false when the base device must be read.
    #[cfg(feature = "read-ahead")]
    fn serve_staged(&self, new_block: u64, block: &mut [u8]) -> bool {
        if self.progress.ra_state() != READ_AHEAD_DONE {
            return false;
        }
        if self.tables().window_of(new_block).is_none() {
            return false;
        }
        match self.progress.staged_lookup(new_block) {
            Some(data) => {
                block.copy_from_slice(&data);
                true
            }
            None => false,
        }
    }

    #[cfg(not(feature = "read-ahead"))]
    fn serve_staged(&self, _new_block: u64, _block: &mut [u8]) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressStore;
    use snapmerge_cow::{CowWriter, CowWriterOptions};
    use std::io::Cursor;
    use tempfile::tempfile;

    struct Channel {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Channel {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Channel {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn block(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE as usize]
    }

    fn base_device(blocks: &[(u64, u8)]) -> File {
        let file = tempfile().unwrap();
        for &(index, byte) in blocks {
            file.write_all_at(&block(byte), index * BLOCK_SIZE).unwrap();
        }
        file
    }

    fn worker_for(requests: Vec<MessageHeader>, cow: File, base: File) -> IoWorker<Channel> {
        let mut input = Vec::new();
        for request in requests {
            input.extend_from_slice(&request.to_bytes());
        }
        let reader = CowReader::parse(cow.try_clone().unwrap()).unwrap();
        let handles = ProgressStore::map(&cow, reader.header()).unwrap();
        let scratch = reader.header().buffer_data_size();
        IoWorker::new(
            Channel {
                input: Cursor::new(input),
                output: Vec::new(),
            },
            reader,
            Arc::new(OnceLock::new()),
            scratch,
            handles.reader,
            base,
            crate::protocol::PAYLOAD_SIZE,
        )
    }

    fn read_request(seq: u64, sector: u64, len: u64) -> MessageHeader {
        MessageHeader {
            seq,
            kind: KIND_MAP_READ,
            flags: 0,
            sector,
            len,
            io_in_progress: 0,
        }
    }

    fn replies(output: &[u8]) -> Vec<(MessageHeader, Vec<u8>)> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < output.len() {
            let header = MessageHeader::from_bytes(
                output[offset..offset + crate::protocol::HEADER_SIZE]
                    .try_into()
                    .unwrap(),
            );
            offset += crate::protocol::HEADER_SIZE;
            let payload = output[offset..offset + header.len as usize].to_vec();
            offset += header.len as usize;
            out.push((header, payload));
        }
        out
    }

    fn small_overlay() -> File {
        let file = tempfile().unwrap();
        let mut writer = CowWriter::new(
            file.try_clone().unwrap(),
            CowWriterOptions { scratch_size: 0 },
        );
        writer.add_replace(50, &block(0xAA)).unwrap();
        writer.add_copy(51, 7).unwrap();
        writer.add_zero(52).unwrap();
        writer.finalize().unwrap();
        file
    }

    #[test]
    fn test_sector_zero_serves_kernel_header() {
        let mut worker = worker_for(
            vec![read_request(1, 0, BLOCK_SIZE)],
            small_overlay(),
            base_device(&[]),
        );
        worker.run_collect();

        let replies = replies(&worker.channel.output);
        assert_eq!(replies.len(), 1);
        let (header, payload) = &replies[0];
        assert_eq!(header.kind, REPLY_OK);
        assert_eq!(header.io_in_progress, 0);
        assert_eq!(payload.len(), BLOCK_SIZE as usize);
        assert_eq!(
            &payload[0..4],
            &snapmerge_core::KERNEL_SNAP_MAGIC.to_le_bytes()
        );
        assert!(payload[16..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_data_chunk_dispatch() {
        // Chunk ids: copy gets 2 (ordered first), replace 3, zero 4.
        let requests = vec![
            read_request(1, 2 * CHUNK_SIZE, BLOCK_SIZE),
            read_request(2, 3 * CHUNK_SIZE, BLOCK_SIZE),
            read_request(3, 4 * CHUNK_SIZE, BLOCK_SIZE),
        ];
        let mut worker = worker_for(requests, small_overlay(), base_device(&[(7, 0x77)]));
        worker.run_collect();
        let replies = replies(&worker.channel.output);

        assert_eq!(replies[0].1, block(0x77));
        assert_eq!(replies[1].1, block(0xAA));
        assert_eq!(replies[2].1, block(0x00));
    }

    #[test]
    fn test_metadata_chunk_serves_exception_page() {
        let mut worker = worker_for(
            vec![read_request(1, CHUNK_SIZE, BLOCK_SIZE)],
            small_overlay(),
            base_device(&[]),
        );
        worker.run_collect();
        let replies = replies(&worker.channel.output);

        let page = &replies[0].1;
        // First pair: ordered copy op, old_chunk 51 -> new_chunk 2.
        assert_eq!(u64::from_le_bytes(page[0..8].try_into().unwrap()), 51);
        assert_eq!(u64::from_le_bytes(page[8..16].try_into().unwrap()), 2);
        // Fourth pair slot is the zero terminator.
        assert_eq!(u64::from_le_bytes(page[56..64].try_into().unwrap()), 0);
    }

    #[test]
    fn test_map_write_is_fatal() {
        let request = MessageHeader {
            seq: 5,
            kind: KIND_MAP_WRITE,
            flags: 0,
            sector: 16,
            len: BLOCK_SIZE,
            io_in_progress: 0,
        };
        let worker = worker_for(vec![request], small_overlay(), base_device(&[]));
        let result = worker.run();
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedWrite { seq: 5 })
        ));
    }

    #[test]
    fn test_misaligned_request_gets_error_reply() {
        let mut worker = worker_for(
            vec![read_request(6, 3, BLOCK_SIZE)],
            small_overlay(),
            base_device(&[]),
        );
        worker.run_collect();
        let replies = replies(&worker.channel.output);
        assert_eq!(replies[0].0.kind, REPLY_ERROR);
        assert!(replies[0].1.is_empty());
    }

    #[test]
    fn test_unmapped_chunk_gets_error_reply() {
        let mut worker = worker_for(
            vec![read_request(7, 100 * CHUNK_SIZE, BLOCK_SIZE)],
            small_overlay(),
            base_device(&[]),
        );
        worker.run_collect();
        let replies = replies(&worker.channel.output);
        assert_eq!(replies[0].0.kind, REPLY_ERROR);
    }

    #[test]
    fn test_large_read_streams_chunks() {
        let cow = small_overlay();
        let base = base_device(&[(7, 0x77)]);
        let reader = CowReader::parse(cow.try_clone().unwrap()).unwrap();
        let handles = ProgressStore::map(&cow, reader.header()).unwrap();

        // Chunks 2..=4 in one request, with a two-block payload cap.
        let request = read_request(8, 2 * CHUNK_SIZE, 3 * BLOCK_SIZE);
        let mut worker = IoWorker::new(
            Channel {
                input: Cursor::new(request.to_bytes().to_vec()),
                output: Vec::new(),
            },
            reader,
            Arc::new(OnceLock::new()),
            0,
            handles.reader,
            base,
            2 * BLOCK_SIZE as usize,
        );
        worker.run_collect();

        let replies = replies(&worker.channel.output);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0.io_in_progress, 1);
        assert_eq!(replies[0].0.len, 2 * BLOCK_SIZE);
        assert_eq!(replies[1].0.io_in_progress, 0);
        assert_eq!(replies[1].0.len, BLOCK_SIZE);
        // Second chunk resumes at the right sector.
        assert_eq!(replies[1].0.sector, 2 * CHUNK_SIZE + 2 * CHUNK_SIZE);
        assert_eq!(replies[1].1, block(0x00));
    }

    impl IoWorker<Channel> {
        /// Run to completion in place so the test can inspect the output.
        fn run_collect(&mut self) {
            loop {
                let Some(request) = MessageHeader::read_from(&mut self.channel).unwrap() else {
                    return;
                };
                assert_eq!(request.kind, KIND_MAP_READ);
                self.serve_read(&request).unwrap();
            }
        }
    }
}
