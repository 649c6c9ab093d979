use crate::error::{ParloError, Result};
use flate2::bufread::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;

/// Size of the codec's working buffer. The codec benefits from a buffer
/// well above the maximum packet size when squeezing data through.
pub const COMPRESSION_BUFFER_SIZE: usize = 32 * 1024;

/// Seam for the payload compression algorithm. The engine only requires that
/// `decompress` accepts any stream `compress` produced; the wire carries no
/// codec identifier.
pub trait PayloadCodec: Send + Sync + 'static {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// The default codec: a zlib-wrapped DEFLATE stream at best compression.
pub struct DeflateCodec;

impl DeflateCodec {
    fn squeeze(mut reader: impl Read, what: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut scratch = vec![0u8; COMPRESSION_BUFFER_SIZE];

        loop {
            let n = reader
                .read(&mut scratch)
                .map_err(|e| ParloError::Codec(format!("{} failed: {}", what, e)))?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&scratch[..n]);
        }
    }
}

impl PayloadCodec for DeflateCodec {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(ParloError::InvalidArgument("cannot compress empty data"));
        }
        Self::squeeze(ZlibEncoder::new(data, Compression::best()), "compression")
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(ParloError::InvalidArgument("cannot decompress empty data"));
        }
        Self::squeeze(ZlibDecoder::new(data), "decompression")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::tiny(vec![1, 2, 3])]
    #[case::repetitive(vec![7u8; 4096])]
    #[case::counting((0..=255u8).cycle().take(10_000).collect())]
    fn test_roundtrip(#[case] data: Vec<u8>) {
        let codec = DeflateCodec;
        let compressed = codec.compress(&data).unwrap();
        let restored = codec.decompress(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_repetitive_data_shrinks() {
        let codec = DeflateCodec;
        let data = vec![0u8; 8192];
        let compressed = codec.compress(&data).unwrap();
        assert!(compressed.len() < data.len() / 10);
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let codec = DeflateCodec;
        assert!(matches!(codec.compress(&[]), Err(ParloError::InvalidArgument(_))));
        assert!(matches!(codec.decompress(&[]), Err(ParloError::InvalidArgument(_))));
    }

    #[test]
    fn test_garbage_fails_decompression() {
        let codec = DeflateCodec;
        assert!(matches!(
            codec.decompress(&[0xde, 0xad, 0xbe, 0xef]),
            Err(ParloError::Codec(_))
        ));
    }
}
