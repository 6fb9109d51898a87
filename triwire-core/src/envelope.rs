//! Message envelope framing.
//!
//! All three protocols frame streaming messages (and gRPC / gRPC-Web unary
//! messages) the same way:
//!
//! ```text
//! [flags:1][length:4, big-endian][payload:length]
//! ```
//!
//! Only the flag bits differ per protocol: bit 0 marks a compressed
//! payload everywhere; Connect streaming marks its end-stream frame with
//! `0x02` while gRPC-Web marks its trailer frame with `0x80`.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::code::Code;
use crate::compression::{CompressionPool, RequestCompression};
use crate::error::ConnectError;

/// Envelope flag bits.
pub mod envelope_flags {
    /// Payload is compressed with the negotiated encoding.
    pub const COMPRESSED: u8 = 0x01;
    /// Connect streaming end-of-stream frame.
    pub const END_STREAM: u8 = 0x02;
    /// gRPC-Web trailer frame.
    pub const TRAILERS: u8 = 0x80;
}

/// Envelope header size (flags + length).
pub const ENVELOPE_HEADER_SIZE: usize = 5;

/// Whether an envelope's payload is compressed.
pub fn is_compressed(flags: u8) -> bool {
    flags & envelope_flags::COMPRESSED != 0
}

/// Whether an envelope is a Connect streaming end-of-stream frame.
pub fn is_end_stream(flags: u8) -> bool {
    flags & envelope_flags::END_STREAM != 0
}

/// Whether an envelope is a gRPC-Web trailer frame.
pub fn is_trailers(flags: u8) -> bool {
    flags & envelope_flags::TRAILERS != 0
}

/// An unpacked envelope: the raw flag byte and the (decompressed) payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopedMessage {
    pub flags: u8,
    pub payload: Bytes,
}

/// Framing errors, converted to [`ConnectError`] at the protocol layer.
#[derive(Clone, Debug, Error)]
pub enum EnvelopeError {
    #[error("incomplete envelope header: expected {expected} bytes, got {actual}")]
    IncompleteHeader { expected: usize, actual: usize },

    #[error("received compressed envelope without a compression pool")]
    MissingPool,

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("compression failed: {0}")]
    Compression(String),
}

impl From<EnvelopeError> for ConnectError {
    fn from(err: EnvelopeError) -> Self {
        ConnectError::new(Code::Internal, err.to_string()).with_source(err)
    }
}

/// Frame a payload into an envelope.
///
/// If `compression` is configured and the payload meets its size
/// threshold, the payload is compressed and flag bit 0 is set.
pub fn pack(
    payload: &[u8],
    compression: Option<&RequestCompression>,
) -> Result<Bytes, EnvelopeError> {
    let (body, flags) = match compression {
        Some(c) if c.should_compress(payload.len()) => {
            let compressed = c
                .pool
                .compress(payload)
                .map_err(|e| EnvelopeError::Compression(e.to_string()))?;
            (compressed, envelope_flags::COMPRESSED)
        }
        _ => (Bytes::copy_from_slice(payload), 0),
    };

    let mut frame = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + body.len());
    frame.extend_from_slice(&[flags]);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Unpack a complete envelope, decompressing the payload when flag bit 0
/// is set.
///
/// A compressed envelope without a matching pool is a protocol error.
pub fn unpack_with_header_byte(
    frame: &Bytes,
    pool: Option<&dyn CompressionPool>,
) -> Result<EnvelopedMessage, EnvelopeError> {
    if frame.len() < ENVELOPE_HEADER_SIZE {
        return Err(EnvelopeError::IncompleteHeader {
            expected: ENVELOPE_HEADER_SIZE,
            actual: frame.len(),
        });
    }

    let flags = frame[0];
    let payload = frame.slice(ENVELOPE_HEADER_SIZE..);

    let payload = if is_compressed(flags) {
        let pool = pool.ok_or(EnvelopeError::MissingPool)?;
        pool.decompress(&payload)
            .map_err(|e| EnvelopeError::Decompression(e.to_string()))?
    } else {
        payload
    };

    Ok(EnvelopedMessage { flags, payload })
}

/// Accumulates raw transport chunks and yields complete envelope frames.
///
/// The transport delivers bytes at whatever granularity the connection
/// produces them; a frame may span chunks and a chunk may hold several
/// frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete frame (header included), if one is buffered.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < ENVELOPE_HEADER_SIZE {
            return None;
        }
        let length = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        let frame_size = ENVELOPE_HEADER_SIZE + length;
        if self.buffer.len() < frame_size {
            return None;
        }
        Some(self.buffer.split_to(frame_size).freeze())
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
