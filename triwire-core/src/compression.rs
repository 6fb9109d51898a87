//! Named compression pools for request and response bodies.
//!
//! A pool is a symmetric compressor identified by its HTTP encoding name
//! (`gzip`, `br`, ...). Clients advertise the pools they accept, pick the
//! pool matching the server's chosen encoding on receive, and apply
//! [`RequestCompression`] on send once a message crosses the configured
//! size threshold.

use std::io;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::Compression as GzipLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// A named compressor with symmetric encode/decode over byte buffers.
///
/// Implement this to register additional algorithms on a client; `gzip`
/// ships in the box. Identity (no compression) is represented by the
/// absence of a pool, not by a pool named "identity".
pub trait CompressionPool: Send + Sync + 'static {
    /// The encoding name used in HTTP headers (e.g. "gzip").
    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> io::Result<Bytes>;

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes>;
}

impl std::fmt::Debug for dyn CompressionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionPool").field("name", &self.name()).finish()
    }
}

/// Gzip pool backed by flate2.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressionPool {
    /// Compression level (0-9). Default is 6.
    pub level: u32,
}

impl Default for GzipCompressionPool {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl GzipCompressionPool {
    /// Create a pool with the specified compression level, clamped to 0-9.
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl CompressionPool for GzipCompressionPool {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::new(), GzipLevel::new(self.level));
        encoder.write_all(data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(Bytes::from(decompressed))
    }
}

/// Outbound compression policy: which pool to use and the minimum message
/// size at which it kicks in. Smaller messages are sent uncompressed.
#[derive(Clone)]
pub struct RequestCompression {
    pub min_bytes: usize,
    pub pool: Arc<dyn CompressionPool>,
}

impl RequestCompression {
    pub fn new(min_bytes: usize, pool: Arc<dyn CompressionPool>) -> Self {
        Self { min_bytes, pool }
    }

    /// Whether a payload of `len` bytes should be compressed.
    pub fn should_compress(&self, len: usize) -> bool {
        len >= self.min_bytes
    }
}

impl std::fmt::Debug for RequestCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCompression")
            .field("min_bytes", &self.min_bytes)
            .field("pool", &self.pool.name())
            .finish()
    }
}
