//! Extent decompression.
//!
//! Pure functions over the two supported on-disk algorithms. The expected
//! uncompressed length comes from the file-extent item (`ram_bytes`); a
//! stream that cannot fill it is a decompression failure, which restore
//! treats like an I/O error on the mirror it read from.

use flate2::read::ZlibDecoder;
use sfs_error::{Result, SfsError};
use sfs_types::{COMPRESS_LZO, COMPRESS_NONE, COMPRESS_ZLIB, COMPRESS_ZSTD};
use std::io::Read;

/// Decompress `input` with on-disk algorithm `algo` into exactly `out_len`
/// bytes.
pub fn decompress(algo: u8, input: &[u8], out_len: usize) -> Result<Vec<u8>> {
    match algo {
        COMPRESS_NONE => Ok(input[..out_len.min(input.len())].to_vec()),
        COMPRESS_ZLIB => {
            let mut out = vec![0_u8; out_len];
            let mut decoder = ZlibDecoder::new(input);
            decoder
                .read_exact(&mut out)
                .map_err(|err| SfsError::Decompress(format!("zlib: {err}")))?;
            Ok(out)
        }
        COMPRESS_ZSTD => {
            let mut out = vec![0_u8; out_len];
            let mut decoder = zstd::stream::Decoder::new(input)
                .map_err(|err| SfsError::Decompress(format!("zstd: {err}")))?;
            decoder
                .read_exact(&mut out)
                .map_err(|err| SfsError::Decompress(format!("zstd: {err}")))?;
            Ok(out)
        }
        COMPRESS_LZO => Err(SfsError::Unsupported(
            "lzo-compressed extents are not supported".into(),
        )),
        other => Err(SfsError::Decompress(format!(
            "unknown compression type {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn zlib_roundtrip() {
        let payload: Vec<u8> = (0..5000_u32).map(|i| (i % 251) as u8).collect();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).expect("compress");
        let compressed = encoder.finish().expect("finish");

        let out = decompress(COMPRESS_ZLIB, &compressed, payload.len()).expect("decompress");
        assert_eq!(out, payload);
    }

    #[test]
    fn zstd_roundtrip() {
        let payload = vec![0x42_u8; 8192];
        let compressed = zstd::stream::encode_all(payload.as_slice(), 3).expect("compress");
        let out = decompress(COMPRESS_ZSTD, &compressed, payload.len()).expect("decompress");
        assert_eq!(out, payload);
    }

    #[test]
    fn truncated_stream_fails() {
        let payload = vec![7_u8; 4096];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).expect("compress");
        let compressed = encoder.finish().expect("finish");

        let err = decompress(COMPRESS_ZLIB, &compressed[..compressed.len() / 2], 4096);
        assert!(matches!(err, Err(SfsError::Decompress(_))));
    }

    #[test]
    fn lzo_rejected() {
        assert!(matches!(
            decompress(COMPRESS_LZO, &[0_u8; 8], 16),
            Err(SfsError::Unsupported(_))
        ));
    }
}
