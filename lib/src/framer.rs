//! ESP3 frame synchronization and validation.
//!
//! The framer pulls byte chunks from a [`ByteSource`], hunts for the 0x55
//! sync byte and validates the header and body CRCs before handing out a
//! packet. Corruption is recovered from by discarding a single byte and
//! rescanning, so a flipped bit can never swallow the following frame.

use deku::prelude::*;
use thiserror::Error;

use crate::esp3::{CRC8_ESP3, Esp3Packet, FrameHeader, PacketType, SYNC_BYTE};
use crate::transport::TransportError;

// sync byte + 4 header bytes + header CRC
const HEADER_LEN: usize = 6;
const READ_CHUNK: usize = 512;

/// Byte-stream source the framer pulls from. A read returning zero bytes
/// means "nothing available this tick", not end of stream; end of stream is
/// a [`TransportError`].
#[allow(async_fn_in_trait)]
pub trait ByteSource {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

#[derive(Debug, Error)]
pub enum FramerError {
    #[error("header CRC mismatch (expected {expected:#04x}, got {got:#04x})")]
    HeaderCrc { expected: u8, got: u8 },
    #[error("data CRC mismatch (expected {expected:#04x}, got {got:#04x})")]
    DataCrc { expected: u8, got: u8 },
    #[error("unknown packet type {0:#04x}")]
    UnknownPacketType(u8),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl FramerError {
    /// Whether the stream survives this error and reading can continue.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FramerError::Transport(_))
    }
}

#[derive(Default)]
pub struct Framer {
    buf: Vec<u8>,
    discarded: u64,
}

impl Framer {
    pub fn new() -> Self {
        Framer::default()
    }

    /// Forget any partially accumulated frame, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Bytes dropped while scanning for sync, for observability.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Try to produce one packet within a single read budget.
    ///
    /// `Ok(None)` means the source had nothing more this tick; any
    /// partially received frame is dropped, since the gateway sends each
    /// frame in a single burst and will not resume it later. Recoverable
    /// corruption is reported as an error after resynchronizing; callers
    /// log it and read again.
    pub async fn read_packet<S: ByteSource>(
        &mut self,
        source: &mut S,
    ) -> Result<Option<Esp3Packet>, FramerError> {
        loop {
            if let Some(result) = self.scan() {
                return result;
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = source.read_chunk(&mut chunk).await?;
            if n == 0 {
                self.buf.clear();
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Scan the accumulated bytes for one frame. `None` means more input is
    /// needed before a verdict is possible.
    fn scan(&mut self) -> Option<Result<Option<Esp3Packet>, FramerError>> {
        // drop everything up to the next candidate sync byte
        let skip = self
            .buf
            .iter()
            .position(|&b| b == SYNC_BYTE)
            .unwrap_or(self.buf.len());
        if skip > 0 {
            self.buf.drain(..skip);
            self.discarded += skip as u64;
        }
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let (_, header) = FrameHeader::from_bytes((&self.buf[1..HEADER_LEN], 0))
            .expect("a five-byte header slice always parses");
        let expected = CRC8_ESP3.checksum(&self.buf[1..HEADER_LEN - 1]);
        if expected != header.crc8h {
            self.resync();
            return Some(Err(FramerError::HeaderCrc {
                expected,
                got: header.crc8h,
            }));
        }

        let data_len = header.data_len as usize;
        let total = HEADER_LEN + data_len + header.opt_len as usize + 1;
        if self.buf.len() < total {
            return None;
        }

        let expected = CRC8_ESP3.checksum(&self.buf[HEADER_LEN..total - 1]);
        let got = self.buf[total - 1];
        if expected != got {
            self.resync();
            return Some(Err(FramerError::DataCrc { expected, got }));
        }

        let Ok(packet_type) = PacketType::try_from(header.packet_type) else {
            // structurally sound frame of a foreign type: consume it whole
            self.buf.drain(..total);
            return Some(Err(FramerError::UnknownPacketType(header.packet_type)));
        };

        let data = self.buf[HEADER_LEN..HEADER_LEN + data_len].to_vec();
        let optional = self.buf[HEADER_LEN + data_len..total - 1].to_vec();
        self.buf.drain(..total);
        Some(Ok(Some(Esp3Packet::new(packet_type, data, optional))))
    }

    /// Drop just the sync byte so scanning resumes at the following byte.
    fn resync(&mut self) {
        self.buf.drain(..1);
        self.discarded += 1;
    }
}
