//! Compression kinds carried in the `Original-Encoding` header.

use std::fmt;
use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use lz4_flex::block::DecompressError;

use crate::error::{CodecError, CodecResult};

/// Over-allocation factor used by the LZ4 decoder when the original length is unknown.
pub const LZ4_DECOMPRESS_RATIO: usize = 5;

/// Upper bound on any decompressed payload, 64 MiB.
pub const MAX_DECOMPRESSED_LEN: usize = 64 << 20;

/// Supported compression kinds.
///
/// The discriminants are the wire values of the `Original-Encoding` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    #[default]
    None = 0,
    /// Gzip container.
    Gzip = 1,
    /// Zlib-wrapped deflate stream.
    Deflate = 2,
    /// Raw snappy block.
    Snappy = 3,
    /// Raw LZ4 block. The decoder needs the uncompressed size.
    Lz4 = 4,
}

impl Compression {
    /// Maps an `Original-Encoding` wire value to a kind.
    pub fn from_code(code: u8) -> Option<Compression> {
        match code {
            0 => Some(Compression::None),
            1 => Some(Compression::Gzip),
            2 => Some(Compression::Deflate),
            3 => Some(Compression::Snappy),
            4 => Some(Compression::Lz4),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_none(self) -> bool {
        self == Compression::None
    }

    /// Whether the decoder needs the pre-compression length to be supplied.
    pub fn needs_original_length(self) -> bool {
        self == Compression::Lz4
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Deflate => "deflate",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
        }
    }

    /// Compresses `data`. Empty input yields a valid empty-payload encoding.
    pub fn compress(self, data: &[u8]) -> CodecResult<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| CodecError::format(self, e))?;
                encoder.finish().map_err(|e| CodecError::format(self, e))
            }
            Compression::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| CodecError::format(self, e))?;
                encoder.finish().map_err(|e| CodecError::format(self, e))
            }
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| CodecError::format(self, e)),
            Compression::Lz4 => Ok(lz4_flex::block::compress(data)),
        }
    }

    /// Decompresses `data`.
    ///
    /// `original_length` is only consulted for LZ4. Without it the decoder
    /// allocates `data.len() * LZ4_DECOMPRESS_RATIO` bytes and fails with
    /// [`CodecError::Capacity`] when that is not enough. No kind produces more
    /// than [`MAX_DECOMPRESSED_LEN`] bytes; larger outputs fail with
    /// [`CodecError::TooLarge`] before the buffer is allocated.
    pub fn decompress(self, data: &[u8], original_length: Option<usize>) -> CodecResult<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => self.read_bounded(GzDecoder::new(data), data.len()),
            Compression::Deflate => self.read_bounded(ZlibDecoder::new(data), data.len()),
            Compression::Snappy => {
                let length =
                    snap::raw::decompress_len(data).map_err(|e| CodecError::format(self, e))?;
                check_length(length)?;
                snap::raw::Decoder::new()
                    .decompress_vec(data)
                    .map_err(|e| CodecError::format(self, e))
            }
            Compression::Lz4 => {
                let capacity = original_length
                    .unwrap_or_else(|| data.len().saturating_mul(LZ4_DECOMPRESS_RATIO));
                check_length(capacity)?;
                lz4_flex::block::decompress(data, capacity).map_err(|e| match e {
                    DecompressError::OutputTooSmall { .. } => CodecError::Capacity { capacity },
                    other => CodecError::format(self, other),
                })
            }
        }
    }

    /// Drains a streaming decoder, stopping one byte past the limit.
    fn read_bounded(self, decoder: impl Read, input_len: usize) -> CodecResult<Vec<u8>> {
        let mut out = Vec::with_capacity(input_len.saturating_mul(2).min(MAX_DECOMPRESSED_LEN));
        decoder
            .take(MAX_DECOMPRESSED_LEN as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::format(self, e))?;
        check_length(out.len())?;
        Ok(out)
    }
}

fn check_length(length: usize) -> CodecResult<()> {
    if length > MAX_DECOMPRESSED_LEN {
        return Err(CodecError::TooLarge {
            length,
            limit: MAX_DECOMPRESSED_LEN,
        });
    }
    Ok(())
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Compression; 5] = [
        Compression::None,
        Compression::Gzip,
        Compression::Deflate,
        Compression::Snappy,
        Compression::Lz4,
    ];

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ (i / 7) as u8).collect()
    }

    #[test]
    fn test_wire_codes() {
        for kind in ALL {
            assert_eq!(Compression::from_code(kind.code()), Some(kind));
        }
        assert_eq!(Compression::Lz4.code(), 4);
        assert_eq!(Compression::from_code(5), None);
    }

    /// Tests that every codec accepts empty input and restores it.
    #[test]
    fn test_empty_input() {
        for kind in ALL {
            let packed = kind.compress(&[]).unwrap();
            let unpacked = kind.decompress(&packed, Some(0)).unwrap();
            assert!(unpacked.is_empty(), "{kind} did not restore empty input");
        }
    }

    #[test]
    fn test_self_describing_kinds() {
        let data = sample(4096);
        for kind in [Compression::Gzip, Compression::Deflate, Compression::Snappy] {
            let packed = kind.compress(&data).unwrap();
            assert_eq!(kind.decompress(&packed, None).unwrap(), data);
        }
    }

    /// Tests that structurally invalid input is reported as a format error.
    #[test]
    fn test_malformed_input() {
        let garbage = b"definitely not compressed";
        for kind in [Compression::Gzip, Compression::Deflate, Compression::Snappy] {
            let err = kind.decompress(garbage, None).unwrap_err();
            assert!(matches!(err, CodecError::Format { .. }), "{kind}: {err}");
        }
    }

    /// Tests that LZ4 needs the original length once the ratio heuristic runs out.
    #[test]
    fn test_lz4_length_dependency() {
        let data = sample(1000);
        let packed = Compression::Lz4.compress(&data).unwrap();

        let err = Compression::Lz4.decompress(&packed, Some(10)).unwrap_err();
        assert!(matches!(err, CodecError::Capacity { capacity: 10 }));

        let unpacked = Compression::Lz4.decompress(&packed, Some(data.len())).unwrap();
        assert_eq!(unpacked, data);
    }

    /// Tests that an announced length past the limit fails before allocating.
    #[test]
    fn test_lz4_length_limit() {
        let packed = [0x10, b'a'];
        for length in [MAX_DECOMPRESSED_LEN + 1, 1_000_000_000_000, usize::MAX] {
            let err = Compression::Lz4.decompress(&packed, Some(length)).unwrap_err();
            assert!(
                matches!(err, CodecError::TooLarge { length: l, .. } if l == length),
                "{length}: {err}"
            );
        }
        assert_eq!(Compression::Lz4.decompress(&packed, Some(1)).unwrap(), b"a");
    }

    /// Tests that streaming decoders stop at the limit.
    #[test]
    fn test_decompression_bomb() {
        let zeros = vec![0u8; MAX_DECOMPRESSED_LEN + 1];
        for kind in [Compression::Gzip, Compression::Snappy] {
            let packed = kind.compress(&zeros).unwrap();
            let err = kind.decompress(&packed, None).unwrap_err();
            assert!(matches!(err, CodecError::TooLarge { .. }), "{kind}: {err}");
        }
    }

    #[test]
    fn test_lz4_ratio_heuristic() {
        let zeros = vec![0u8; 10_000];
        let packed = Compression::Lz4.compress(&zeros).unwrap();
        assert!(packed.len() * LZ4_DECOMPRESS_RATIO < zeros.len());

        let err = Compression::Lz4.decompress(&packed, None).unwrap_err();
        assert!(matches!(err, CodecError::Capacity { .. }));

        // Incompressible-ish data fits within the heuristic.
        let data = sample(300);
        let packed = Compression::Lz4.compress(&data).unwrap();
        assert_eq!(Compression::Lz4.decompress(&packed, None).unwrap(), data);
    }
}
