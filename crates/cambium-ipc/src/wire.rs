//! Message framing.
//!
//! Every message on a stream is one frame:
//!
//! ```text
//! +-----------+-----------+------------------+
//! | magic u32 | len u32   | payload (len B)  |
//! +-----------+-----------+------------------+
//!   little-endian header, 8 bytes
//! ```
//!
//! The magic number identifies the protocol family, so a connection from
//! something that is not a peer is dropped before any payload is delivered.
//! [`FrameCodec`] plugs into `tokio_util`'s `FramedRead` / `FramedWrite`.

use crate::config::IpcConfig;
use crate::error::{IpcError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Magic number used unless configured otherwise.
pub const DEFAULT_MAGIC: u32 = 0x0CA3_B1A0;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Magic + length framing for one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameCodec {
    magic: u32,
    max_len: usize,
}

impl FrameCodec {
    pub fn new(magic: u32, max_len: usize) -> Self {
        Self { magic, max_len }
    }

    pub fn from_config(config: &IpcConfig) -> Self {
        Self::new(config.magic, config.max_message_size)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = IpcError;

    /// A wrong magic number or an oversized length is an error, raised as
    /// soon as the header is complete and before any payload is buffered.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let found = header.get_u32_le();
        if found != self.magic {
            return Err(IpcError::BadMagic {
                expected: self.magic,
                found,
            });
        }

        let length = header.get_u32_le() as usize;
        if length > self.max_len {
            return Err(IpcError::MessageTooLarge {
                length,
                limit: self.max_len,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame").into()),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        let length = u32::try_from(payload.len()).map_err(|_| IpcError::MessageTooLarge {
            length: payload.len(),
            limit: u32::MAX as usize,
        })?;

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32_le(self.magic);
        dst.put_u32_le(length);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
