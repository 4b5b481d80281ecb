//! Per-message compression.
//!
//! - [`Compressor`]: Trait implemented by every compression algorithm
//! - [`CompressionEncoding`]: Supported encodings, used for header negotiation
//! - [`CompressionConfig`]: Send-side compression policy

use bytes::Bytes;
use std::io::{self, Read};

#[cfg(feature = "compression-gzip")]
use std::io::Write;

use crate::error::EnvelopeError;

/// Compression algorithm applied to individual messages.
///
/// # Example
///
/// ```ignore
/// use connectrpc_duplex_core::Compressor;
/// use bytes::Bytes;
/// use std::io;
///
/// struct Lz4Compressor;
///
/// impl Compressor for Lz4Compressor {
///     fn name(&self) -> &'static str { "lz4" }
///
///     fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
///         // ... lz4 compression
///     }
///
///     fn decompress(&self, data: &[u8], max_len: Option<usize>) -> io::Result<Bytes> {
///         // ... lz4 decompression
///     }
/// }
/// ```
pub trait Compressor: Send + Sync + 'static {
    /// The encoding name used in headers (e.g., "gzip", "zstd").
    fn name(&self) -> &'static str;

    /// Compress data.
    fn compress(&self, data: &[u8]) -> io::Result<Bytes>;

    /// Decompress data, producing at most `max_len + 1` bytes when a limit is
    /// given so callers can detect oversized messages.
    fn decompress(&self, data: &[u8], max_len: Option<usize>) -> io::Result<Bytes>;
}

fn read_limited<R: Read>(mut reader: R, max_len: Option<usize>) -> io::Result<Bytes> {
    let mut out = Vec::new();
    match max_len {
        Some(limit) => {
            reader
                .take(limit as u64 + 1)
                .read_to_end(&mut out)?;
        }
        None => {
            reader.read_to_end(&mut out)?;
        }
    }
    Ok(Bytes::from(out))
}

/// Identity compressor (no compression).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decompress(&self, data: &[u8], max_len: Option<usize>) -> io::Result<Bytes> {
        read_limited(data, max_len)
    }
}

/// Gzip compressor using flate2.
///
/// Requires the `compression-gzip` feature.
#[cfg(feature = "compression-gzip")]
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    /// Compression level (0-9). Default is 6.
    pub level: u32,
}

#[cfg(feature = "compression-gzip")]
impl Default for GzipCompressor {
    fn default() -> Self {
        Self { level: 6 }
    }
}

#[cfg(feature = "compression-gzip")]
impl Compressor for GzipCompressor {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder.write_all(data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decompress(&self, data: &[u8], max_len: Option<usize>) -> io::Result<Bytes> {
        read_limited(flate2::read::GzDecoder::new(data), max_len)
    }
}

/// Zstd compressor.
///
/// Requires the `compression-zstd` feature.
#[cfg(feature = "compression-zstd")]
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    /// Compression level (1-22). Default is 3.
    pub level: i32,
}

#[cfg(feature = "compression-zstd")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self { level: 3 }
    }
}

#[cfg(feature = "compression-zstd")]
impl Compressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::from(zstd::stream::encode_all(data, self.level)?))
    }

    fn decompress(&self, data: &[u8], max_len: Option<usize>) -> io::Result<Bytes> {
        read_limited(zstd::stream::read::Decoder::new(data)?, max_len)
    }
}

#[cfg(feature = "compression-gzip")]
static GZIP: GzipCompressor = GzipCompressor { level: 6 };

#[cfg(feature = "compression-zstd")]
static ZSTD: ZstdCompressor = ZstdCompressor { level: 3 };

/// Supported compression encodings.
///
/// Use [`CompressionEncoding::compressor()`] to get the implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionEncoding {
    #[default]
    Identity,
    #[cfg(feature = "compression-gzip")]
    Gzip,
    #[cfg(feature = "compression-zstd")]
    Zstd,
}

impl CompressionEncoding {
    /// Parse an encoding header value.
    ///
    /// Returns `None` for unsupported encodings (callers answer Unimplemented).
    pub fn from_header(value: Option<&str>) -> Option<Self> {
        match value.map(str::trim) {
            None | Some("identity") | Some("") => Some(Self::Identity),
            #[cfg(feature = "compression-gzip")]
            Some("gzip") => Some(Self::Gzip),
            #[cfg(feature = "compression-zstd")]
            Some("zstd") => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Get the header value string for this encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            #[cfg(feature = "compression-gzip")]
            Self::Gzip => "gzip",
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => "zstd",
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// Returns `None` for identity.
    pub fn compressor(&self) -> Option<&'static dyn Compressor> {
        match self {
            Self::Identity => None,
            #[cfg(feature = "compression-gzip")]
            Self::Gzip => Some(&GZIP),
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => Some(&ZSTD),
        }
    }

    /// Value for an accept-encoding header listing every compiled-in
    /// encoding, or `None` when only identity is available.
    pub fn accept_header() -> Option<String> {
        let names: Vec<&str> = [
            #[cfg(feature = "compression-gzip")]
            "gzip",
            #[cfg(feature = "compression-zstd")]
            "zstd",
        ]
        .into_iter()
        .collect();
        if names.is_empty() {
            None
        } else {
            Some(names.join(","))
        }
    }

    /// Pick the encoding for a response: `preferred` when the peer accepts
    /// it, identity otherwise.
    pub fn negotiate(accept: Option<&str>, preferred: CompressionEncoding) -> Self {
        if preferred.is_identity() {
            return Self::Identity;
        }
        let accepted = accept
            .into_iter()
            .flat_map(|value| value.split(','))
            .any(|name| name.trim() == preferred.as_str());
        if accepted { preferred } else { Self::Identity }
    }
}

/// Send-side compression policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionConfig {
    pub encoding: CompressionEncoding,
    /// Messages smaller than this are sent uncompressed.
    pub min_bytes: usize,
}

impl CompressionConfig {
    pub fn new(encoding: CompressionEncoding) -> Self {
        Self {
            encoding,
            min_bytes: 0,
        }
    }

    pub fn min_bytes(mut self, min_bytes: usize) -> Self {
        self.min_bytes = min_bytes;
        self
    }

    /// Compress `payload` if the policy calls for it.
    ///
    /// Returns `(bytes, was_compressed)`.
    pub fn compress(&self, payload: Bytes) -> Result<(Bytes, bool), EnvelopeError> {
        let Some(compressor) = self.encoding.compressor() else {
            return Ok((payload, false));
        };
        if payload.len() < self.min_bytes {
            return Ok((payload, false));
        }
        let compressed = compressor
            .compress(&payload)
            .map_err(|e| EnvelopeError::Compression(e.to_string()))?;
        Ok((compressed, true))
    }
}

/// Decompress a payload received with `encoding`, enforcing `max_len` on the
/// decompressed size.
pub fn decompress_payload(
    payload: Bytes,
    encoding: CompressionEncoding,
    max_len: Option<usize>,
) -> Result<Bytes, EnvelopeError> {
    let Some(compressor) = encoding.compressor() else {
        return Err(EnvelopeError::Decompression(
            "received compressed message without a negotiated encoding".into(),
        ));
    };
    let decompressed = compressor
        .decompress(&payload, max_len)
        .map_err(|e| EnvelopeError::Decompression(e.to_string()))?;
    match max_len {
        Some(limit) if decompressed.len() > limit => Err(EnvelopeError::FrameTooLarge {
            size: decompressed.len(),
            limit,
        }),
        _ => Ok(decompressed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_header() {
        assert_eq!(
            CompressionEncoding::from_header(None),
            Some(CompressionEncoding::Identity)
        );
        assert_eq!(
            CompressionEncoding::from_header(Some("identity")),
            Some(CompressionEncoding::Identity)
        );
        assert_eq!(CompressionEncoding::from_header(Some("snappy")), None);
    }

    #[test]
    fn test_identity_config_never_compresses() {
        let config = CompressionConfig::default();
        let (bytes, compressed) = config.compress(Bytes::from_static(b"plain")).unwrap();
        assert!(!compressed);
        assert_eq!(&bytes[..], b"plain");
    }

    #[test]
    fn test_decompress_without_encoding_fails() {
        let err = decompress_payload(
            Bytes::from_static(b"x"),
            CompressionEncoding::Identity,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EnvelopeError::Decompression(_)));
    }

    #[test]
    fn test_negotiate_identity_preference() {
        assert_eq!(
            CompressionEncoding::negotiate(Some("gzip"), CompressionEncoding::Identity),
            CompressionEncoding::Identity
        );
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_gzip_respects_min_bytes() {
        let config = CompressionConfig::new(CompressionEncoding::Gzip).min_bytes(16);
        let (_, compressed) = config.compress(Bytes::from_static(b"short")).unwrap();
        assert!(!compressed);

        let payload = Bytes::from(vec![b'a'; 4096]);
        let (bytes, compressed) = config.compress(payload.clone()).unwrap();
        assert!(compressed);
        assert!(bytes.len() < payload.len());

        let restored = decompress_payload(bytes, CompressionEncoding::Gzip, Some(4096)).unwrap();
        assert_eq!(restored, payload);
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_gzip_decompression_limit() {
        let config = CompressionConfig::new(CompressionEncoding::Gzip);
        let (bytes, _) = config.compress(Bytes::from(vec![0u8; 10_000])).unwrap();

        let err = decompress_payload(bytes, CompressionEncoding::Gzip, Some(100)).unwrap_err();
        assert!(matches!(err, EnvelopeError::FrameTooLarge { limit: 100, .. }));
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_negotiate_checks_accept_list() {
        assert_eq!(
            CompressionEncoding::negotiate(Some("zstd, gzip"), CompressionEncoding::Gzip),
            CompressionEncoding::Gzip
        );
        assert_eq!(
            CompressionEncoding::negotiate(None, CompressionEncoding::Gzip),
            CompressionEncoding::Identity
        );
    }
}
