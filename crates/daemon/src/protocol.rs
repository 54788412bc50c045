//! Kernel control-channel wire protocol.
//!
//! Requests and replies share one 48-byte little-endian header. The channel
//! itself is any blocking `Read + Write` stream: the kernel character
//! device in production, an in-process pipe in tests. The wire shape is
//! fixed by the kernel consumer and reproduced bit-exact here.
//!
//! A multi-chunk reply is expressed as repeated header+payload writes with
//! `io_in_progress = 1` on every chunk but the last.

use std::io::{ErrorKind, Read, Write};

/// Size of the request/reply header in bytes.
pub const HEADER_SIZE: usize = 48;

/// Largest payload carried by one reply chunk.
pub const PAYLOAD_SIZE: usize = 64 * 1024;

/// Request kind: read mapped data.
pub const KIND_MAP_READ: u64 = 0;

/// Request kind: write mapped data. Never valid on this channel.
pub const KIND_MAP_WRITE: u64 = 1;

/// Reply kind: success.
pub const REPLY_OK: u64 = 0;

/// Reply kind: error.
pub const REPLY_ERROR: u64 = 1;

/// Control-channel protocol errors. `UnexpectedWrite` and `UnknownKind`
/// are violations that terminate the daemon instance.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Channel I/O failure
    #[error("Channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The kernel is never expected to push writes through this channel
    #[error("Unexpected MAP_WRITE request (seq {seq})")]
    UnexpectedWrite {
        /// Sequence id of the offending request
        seq: u64,
    },

    /// Request kind outside the protocol
    #[error("Unknown request kind {kind} (seq {seq})")]
    UnknownKind {
        /// Raw kind value
        kind: u64,
        /// Sequence id of the offending request
        seq: u64,
    },
}

/// The shared request/reply header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Request sequence id, echoed in every reply chunk.
    pub seq: u64,
    /// Request: `KIND_MAP_READ`/`KIND_MAP_WRITE`. Reply: `REPLY_OK`/`REPLY_ERROR`.
    pub kind: u64,
    /// Reserved flag bits, echoed verbatim.
    pub flags: u64,
    /// Starting 512-byte sector of the transfer.
    pub sector: u64,
    /// Request: total bytes requested. Reply: bytes in this chunk.
    pub len: u64,
    /// 1 on every reply chunk except the final one.
    pub io_in_progress: u64,
}

impl MessageHeader {
    /// Encode to the fixed wire layout.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.seq.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.kind.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.flags.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.sector.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.len.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.io_in_progress.to_le_bytes());
        bytes
    }

    /// Decode from the fixed wire layout.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        MessageHeader {
            seq: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            kind: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            flags: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            sector: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            len: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            io_in_progress: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
        }
    }

    /// Read one header from the channel. `Ok(None)` means the channel was
    /// closed cleanly between requests.
    pub fn read_from(channel: &mut impl Read) -> Result<Option<MessageHeader>, ProtocolError> {
        let mut bytes = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match channel.read(&mut bytes[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(ProtocolError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "channel closed mid-header",
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtocolError::Io(e)),
            }
        }
        Ok(Some(MessageHeader::from_bytes(&bytes)))
    }

    /// Write this header to the channel.
    pub fn write_to(&self, channel: &mut impl Write) -> Result<(), ProtocolError> {
        channel.write_all(&self.to_bytes())?;
        Ok(())
    }
}
