//! Payload compression for DATA objects.
//!
//! Reading understands every codec a file may carry. Writing goes through a
//! [`Compressor`] chosen when the file is configured; [`NoCompression`] stores
//! payloads verbatim.

use crate::error::{JournalError, Result};
use crate::file::header::IncompatibleFlag;

/// Upper bound for a single decompressed payload.
pub const DATA_SIZE_MAX: u64 = 768 * 1024 * 1024;

const OBJECT_COMPRESSED_XZ: u8 = 1 << 0;
const OBJECT_COMPRESSED_LZ4: u8 = 1 << 1;
const OBJECT_COMPRESSED_ZSTD: u8 = 1 << 2;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Xz,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn from_object_flags(flags: u8) -> Result<Self> {
        match flags & (OBJECT_COMPRESSED_XZ | OBJECT_COMPRESSED_LZ4 | OBJECT_COMPRESSED_ZSTD) {
            0 => Ok(Compression::None),
            OBJECT_COMPRESSED_XZ => Ok(Compression::Xz),
            OBJECT_COMPRESSED_LZ4 => Ok(Compression::Lz4),
            OBJECT_COMPRESSED_ZSTD => Ok(Compression::Zstd),
            _ => Err(JournalError::UnknownCompressionMethod),
        }
    }

    pub fn object_flag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Xz => OBJECT_COMPRESSED_XZ,
            Compression::Lz4 => OBJECT_COMPRESSED_LZ4,
            Compression::Zstd => OBJECT_COMPRESSED_ZSTD,
        }
    }

    /// The header flag a file must carry before objects may use this codec.
    pub fn header_flag(self) -> Option<IncompatibleFlag> {
        match self {
            Compression::None => None,
            Compression::Xz => Some(IncompatibleFlag::CompressedXz),
            Compression::Lz4 => Some(IncompatibleFlag::CompressedLz4),
            Compression::Zstd => Some(IncompatibleFlag::CompressedZstd),
        }
    }

    /// Decompresses `payload` into `buf`, returning the decompressed length.
    pub fn decompress(self, payload: &[u8], buf: &mut Vec<u8>) -> Result<usize> {
        self.decompress_bounded(payload, buf, DATA_SIZE_MAX)
    }

    /// Like [`Compression::decompress`], failing once the output would
    /// exceed `limit` bytes.
    pub fn decompress_bounded(
        self,
        payload: &[u8],
        buf: &mut Vec<u8>,
        limit: u64,
    ) -> Result<usize> {
        buf.clear();

        match self {
            Compression::None => {
                if payload.len() as u64 > limit {
                    return Err(JournalError::DecompressorError);
                }
                buf.extend_from_slice(payload);
                Ok(buf.len())
            }
            Compression::Zstd => {
                use ruzstd::decoding::StreamingDecoder;

                let decoder =
                    StreamingDecoder::new(payload).map_err(|_| JournalError::DecompressorError)?;
                read_bounded(decoder, buf, limit)
            }
            Compression::Lz4 => {
                let (size, block) = payload
                    .split_first_chunk::<8>()
                    .ok_or(JournalError::DecompressorError)?;
                let size = u64::from_le_bytes(*size);
                if size > limit {
                    return Err(JournalError::DecompressorError);
                }

                buf.resize(size as usize, 0);
                let n = lz4_flex::block::decompress_into(block, buf)
                    .map_err(|_| JournalError::DecompressorError)?;
                buf.truncate(n);
                Ok(n)
            }
            Compression::Xz => {
                let decoder = lzma_rust2::XzReader::new(payload, false);
                read_bounded(decoder, buf, limit)
            }
        }
    }
}

/// Reads `reader` to the end into `buf`, stopping one byte past `limit` so
/// an oversized stream is never fully inflated.
fn read_bounded(reader: impl std::io::Read, buf: &mut Vec<u8>, limit: u64) -> Result<usize> {
    use std::io::Read;

    let n = reader
        .take(limit.saturating_add(1))
        .read_to_end(buf)
        .map_err(|_| JournalError::DecompressorError)?;
    if n as u64 > limit {
        buf.clear();
        return Err(JournalError::DecompressorError);
    }
    Ok(n)
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Xz => "xz",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Compression {
    type Err = JournalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "no" | "off" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" | "yes" | "on" => Ok(Compression::Zstd),
            _ => Err(JournalError::UnknownCompressionMethod),
        }
    }
}

/// A codec used when writing DATA payloads.
pub trait Compressor: Send {
    fn compression(&self) -> Compression;

    /// Returns the compressed form, or `None` when the codec failed or
    /// produced nothing smaller than the input.
    fn compress(&self, data: &[u8]) -> Option<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.compression().decompress(data, &mut buf)?;
        Ok(buf)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compression(&self) -> Compression {
        Compression::None
    }

    fn compress(&self, _data: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compression(&self) -> Compression {
        Compression::Zstd
    }

    fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        use ruzstd::encoding::{CompressionLevel, compress_to_vec};

        let compressed = compress_to_vec(data, CompressionLevel::Fastest);
        (compressed.len() < data.len()).then_some(compressed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compression(&self) -> Compression {
        Compression::Lz4
    }

    fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        let block = lz4_flex::block::compress(data);

        let mut out = Vec::with_capacity(8 + block.len());
        out.extend_from_slice(&(data.len() as u64).to_le_bytes());
        out.extend_from_slice(&block);
        (out.len() < data.len()).then_some(out)
    }
}

/// Builds the writer-side codec for `compression`. Xz is read-only here, so
/// asking for it yields a pass-through compressor.
pub fn compressor_for(compression: Compression) -> Box<dyn Compressor> {
    match compression {
        Compression::Zstd => Box::new(ZstdCompressor),
        Compression::Lz4 => Box::new(Lz4Compressor),
        Compression::None | Compression::Xz => Box::new(NoCompression),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible() -> Vec<u8> {
        b"MESSAGE=".iter().chain(b"abcd".repeat(512).iter()).copied().collect()
    }

    #[test]
    fn zstd_shrinks_repetitive_payloads() {
        let data = compressible();
        let compressed = ZstdCompressor.compress(&data).expect("smaller output");
        assert!(compressed.len() < data.len());
        assert_eq!(ZstdCompressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn lz4_uses_a_size_prefix() {
        let data = compressible();
        let compressed = Lz4Compressor.compress(&data).expect("smaller output");
        assert_eq!(
            u64::from_le_bytes(compressed[..8].try_into().unwrap()),
            data.len() as u64
        );
        assert_eq!(Lz4Compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn incompressible_input_is_rejected() {
        let data = b"x=1";
        assert!(ZstdCompressor.compress(data).is_none());
        assert!(Lz4Compressor.compress(data).is_none());
        assert!(NoCompression.compress(&compressible()).is_none());
    }

    #[test]
    fn object_flags_round_trip() {
        for c in [
            Compression::None,
            Compression::Xz,
            Compression::Lz4,
            Compression::Zstd,
        ] {
            assert_eq!(Compression::from_object_flags(c.object_flag()).unwrap(), c);
        }
        assert!(Compression::from_object_flags(0b011).is_err());
    }

    #[test]
    fn output_beyond_the_limit_is_an_error() {
        let data = compressible();
        let limit = data.len() as u64 - 1;
        let mut buf = Vec::new();

        let zstd = ZstdCompressor.compress(&data).unwrap();
        assert!(Compression::Zstd.decompress_bounded(&zstd, &mut buf, limit).is_err());
        assert!(buf.is_empty());
        let n = Compression::Zstd.decompress_bounded(&zstd, &mut buf, limit + 1).unwrap();
        assert_eq!(n, data.len());

        let lz4 = Lz4Compressor.compress(&data).unwrap();
        assert!(Compression::Lz4.decompress_bounded(&lz4, &mut buf, limit).is_err());
        let n = Compression::Lz4.decompress_bounded(&lz4, &mut buf, limit + 1).unwrap();
        assert_eq!(n, data.len());

        assert!(Compression::None.decompress_bounded(&data, &mut buf, limit).is_err());
    }

    #[test]
    fn bounded_read_stops_past_the_limit() {
        let mut buf = Vec::new();
        assert!(read_bounded(&[7u8; 100][..], &mut buf, 99).is_err());
        assert!(buf.is_empty());
        assert_eq!(read_bounded(&[7u8; 100][..], &mut buf, 100).unwrap(), 100);
    }

    #[test]
    fn lz4_size_prefix_above_the_maximum_is_an_error() {
        let mut payload = (DATA_SIZE_MAX + 1).to_le_bytes().to_vec();
        payload.extend_from_slice(&[0x10, b'a']);
        let mut buf = Vec::new();
        assert!(Compression::Lz4.decompress(&payload, &mut buf).is_err());
        assert!(buf.capacity() < 1024);
    }

    #[test]
    fn truncated_lz4_payload_is_an_error() {
        let mut buf = Vec::new();
        assert!(Compression::Lz4.decompress(&[1, 2, 3], &mut buf).is_err());
    }
}
