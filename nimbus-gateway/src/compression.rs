//! Streaming decompression of gateway transport frames.
//!
//! When a connection is opened with `compress=zlib-stream` or
//! `compress=zstd-stream`, every binary frame is a slice of one long
//! compressed stream, so the decoder state has to live as long as the
//! connection. Feeding a frame yields at most one complete JSON payload;
//! zlib signals completeness with a flush suffix while zstd produces output
//! frame by frame.

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

#[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
use flate2::{Decompress, FlushDecompress};

/// The "magic number" marking a complete zlib-stream message.
#[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Initial buffer size of 32 KiB for decompressed payloads.
#[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
const INTERNAL_BUFFER_SIZE: usize = 32 * 1024;

/// Transport compression negotiated through the connection URL.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CompressionAlgorithm {
    /// Shared zlib context over the whole connection.
    #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
    Zlib,
    /// Shared zstd context over the whole connection.
    #[cfg(feature = "zstd")]
    Zstd,
}

impl CompressionAlgorithm {
    /// Value of the `compress` query parameter for this algorithm.
    pub const fn query_value(self) -> &'static str {
        match self {
            #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
            Self::Zlib => "zlib-stream",
            #[cfg(feature = "zstd")]
            Self::Zstd => "zstd-stream",
        }
    }
}

impl Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.query_value())
    }
}

/// Stateful decompressor owned by one connection.
#[derive(Debug)]
pub struct Decompressor {
    inner: Inner,
}

enum Inner {
    #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
    Zlib(ZlibStream),
    #[cfg(feature = "zstd")]
    Zstd(zstd::stream::write::Decoder<'static, Vec<u8>>),
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
            Self::Zlib(_) => f.write_str("Inner::Zlib"),
            #[cfg(feature = "zstd")]
            Self::Zstd(_) => f.write_str("Inner::Zstd"),
        }
    }
}

impl Decompressor {
    /// Create a decompressor for the configured algorithm.
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        let inner = match algorithm {
            #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
            CompressionAlgorithm::Zlib => Inner::Zlib(ZlibStream::new()),
            #[cfg(feature = "zstd")]
            CompressionAlgorithm::Zstd => Inner::Zstd(
                zstd::stream::write::Decoder::new(Vec::new())
                    .expect("zstd decoder construction is infallible"),
            ),
        };

        Self { inner }
    }

    /// Feed one binary transport frame to the decoder.
    ///
    /// Returns the decompressed payload once the message it belongs to is
    /// complete, or `None` when more frames are needed.
    ///
    /// # Errors
    ///
    /// Returns a [`CompressionError`] if the stream is corrupt, which should
    /// be treated as a recoverable connection error.
    pub fn feed(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, CompressionError> {
        match &mut self.inner {
            #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
            Inner::Zlib(stream) => stream.feed(frame),
            #[cfg(feature = "zstd")]
            Inner::Zstd(decoder) => {
                use std::io::Write;
                use std::mem;

                decoder
                    .write_all(frame)
                    .and_then(|()| decoder.flush())
                    .map_err(|source| CompressionError {
                        kind: CompressionErrorType::Decompressing,
                        source: Some(Box::new(source)),
                    })?;

                let buffer = decoder.get_mut();

                if buffer.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(mem::take(buffer)))
                }
            }
        }
    }
}

/// Zlib decoding state shared across a connection's frames.
#[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
struct ZlibStream {
    /// Zlib decompression context with the connection's dictionary.
    decompress: Decompress,
    /// Compressed bytes awaiting a complete message suffix.
    compressed: Vec<u8>,
    /// Scratch buffer for one decompression call.
    internal: Vec<u8>,
    /// Accumulated decompressed payload.
    payload: Vec<u8>,
}

#[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
impl ZlibStream {
    fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            compressed: Vec::new(),
            internal: Vec::with_capacity(INTERNAL_BUFFER_SIZE),
            payload: Vec::with_capacity(INTERNAL_BUFFER_SIZE),
        }
    }

    fn feed(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, CompressionError> {
        self.compressed.extend_from_slice(frame);

        let length = self.compressed.len();

        if length < 4 || self.compressed[length - 4..] != ZLIB_SUFFIX {
            return Ok(None);
        }

        // Bytes the context had consumed before this message.
        let before = self.decompress.total_in();
        let mut offset = 0;

        loop {
            self.internal.clear();

            self.decompress
                .decompress_vec(
                    &self.compressed[offset..],
                    &mut self.internal,
                    FlushDecompress::Sync,
                )
                .map_err(|source| CompressionError {
                    kind: CompressionErrorType::Decompressing,
                    source: Some(Box::new(source)),
                })?;

            offset = usize::try_from(self.decompress.total_in() - before).unwrap_or_default();
            self.payload.extend_from_slice(&self.internal);

            let not_at_capacity = self.internal.len() < self.internal.capacity();

            if not_at_capacity || offset > self.compressed.len() {
                break;
            }
        }

        self.compressed.clear();

        Ok(Some(std::mem::take(&mut self.payload)))
    }
}

/// Decompressing a transport frame failed.
#[derive(Debug)]
pub struct CompressionError {
    pub(crate) kind: CompressionErrorType,
    pub(crate) source: Option<Box<dyn Error + Send + Sync>>,
}

impl CompressionError {
    /// Immutable reference to the type of error that occurred.
    #[must_use = "retrieving the type has no effect if left unused"]
    pub const fn kind(&self) -> &CompressionErrorType {
        &self.kind
    }
}

impl Display for CompressionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            CompressionErrorType::Decompressing => {
                f.write_str("the compressed stream couldn't be decoded")
            }
        }
    }
}

impl Error for CompressionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`CompressionError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum CompressionErrorType {
    /// The compressed stream couldn't be decoded.
    Decompressing,
}

#[cfg(test)]
mod tests {
    use super::{CompressionAlgorithm, Decompressor};
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(CompressionAlgorithm: Clone, Copy, Debug, Eq, PartialEq, Send, Sync);
    assert_impl_all!(Decompressor: Debug, Send, Sync);

    const PAYLOAD: &[u8] = br#"{"op":10,"d":{"heartbeat_interval":41250}}"#;

    /// Compress a payload the way the gateway frames zlib-stream messages:
    /// one sync-flushed chunk ending in the `00 00 ff ff` suffix.
    #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
    fn zlib_message(payload: &[u8]) -> Vec<u8> {
        use flate2::{Compress, Compression, FlushCompress};

        let mut compress = Compress::new(Compression::default(), true);
        let mut out = Vec::with_capacity(payload.len() + 64);
        compress
            .compress_vec(payload, &mut out, FlushCompress::Sync)
            .expect("compressing into a vec with spare capacity succeeds");

        assert_eq!([0x00, 0x00, 0xff, 0xff], out[out.len() - 4..]);

        out
    }

    #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
    #[test]
    fn zlib_whole_message() {
        let mut decompressor = Decompressor::new(CompressionAlgorithm::Zlib);
        let message = zlib_message(PAYLOAD);

        let decoded = decompressor.feed(&message).unwrap();
        assert_eq!(Some(PAYLOAD.to_vec()), decoded);
    }

    #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
    #[test]
    fn zlib_partial_frames() {
        let mut decompressor = Decompressor::new(CompressionAlgorithm::Zlib);
        let message = zlib_message(PAYLOAD);
        let (head, tail) = message.split_at(message.len() / 2);

        assert_eq!(None, decompressor.feed(head).unwrap());
        assert_eq!(Some(PAYLOAD.to_vec()), decompressor.feed(tail).unwrap());
    }

    #[cfg(any(feature = "zlib-stock", feature = "zlib-simd"))]
    #[test]
    fn zlib_context_survives_messages() {
        let mut decompressor = Decompressor::new(CompressionAlgorithm::Zlib);

        // Two messages through one context; the second depends on the shared
        // dictionary built by the first.
        use flate2::{Compress, Compression, FlushCompress};
        let mut compress = Compress::new(Compression::default(), true);

        for _ in 0..2 {
            let mut message = Vec::with_capacity(PAYLOAD.len() + 64);
            compress
                .compress_vec(PAYLOAD, &mut message, FlushCompress::Sync)
                .unwrap();

            let decoded = decompressor.feed(&message).unwrap();
            assert_eq!(Some(PAYLOAD.to_vec()), decoded);
        }
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_whole_frame() {
        let mut decompressor = Decompressor::new(CompressionAlgorithm::Zstd);
        let frame = zstd::stream::encode_all(PAYLOAD, 0).unwrap();

        let decoded = decompressor.feed(&frame).unwrap();
        assert_eq!(Some(PAYLOAD.to_vec()), decoded);
    }
}
