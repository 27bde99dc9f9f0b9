//! Frame payload compression.
//!
//! `plain`, `lz4`, and `deflate` are fully functional. `lzfse` is accepted as a tag so frames
//! written by a hypothetical LZFSE-capable peer still decode their metadata, but decoding the
//! payload returns `decoding_error` — no maintained pure-Rust LZFSE decoder exists in this
//! dependency stack (see DESIGN.md Open Question #1).

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::errors::WaxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalEncoding {
    Plain,
    Lz4,
    Deflate,
    Lzfse,
}

impl CanonicalEncoding {
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Plain => 0,
            Self::Lz4 => 1,
            Self::Deflate => 2,
            Self::Lzfse => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, WaxError> {
        match tag {
            0 => Ok(Self::Plain),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Deflate),
            3 => Ok(Self::Lzfse),
            other => Err(WaxError::decoding(format!("unknown canonical encoding tag {other}"))),
        }
    }
}

/// Compresses `data` under the given encoding. The caller records the uncompressed length
/// separately (frame metadata) since decompression is bounded by that expected length.
pub fn compress(encoding: CanonicalEncoding, data: &[u8]) -> Result<Vec<u8>, WaxError> {
    match encoding {
        CanonicalEncoding::Plain => Ok(data.to_vec()),
        CanonicalEncoding::Lz4 => Ok(lz4_flex::block::compress(data)),
        CanonicalEncoding::Deflate => {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            enc.write_all(data).map_err(|e| WaxError::encoding(e.to_string()))?;
            enc.finish().map_err(|e| WaxError::encoding(e.to_string()))
        }
        CanonicalEncoding::Lzfse => Err(WaxError::encoding("lzfse encoding is not supported by this build")),
    }
}

/// Decompresses `data` encoded under `encoding`, bounded by `uncompressed_len` (read from the
/// frame's recorded payload length) to avoid unbounded allocation on a corrupt length field.
pub fn decompress(encoding: CanonicalEncoding, data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>, WaxError> {
    match encoding {
        CanonicalEncoding::Plain => {
            if data.len() != uncompressed_len {
                return Err(WaxError::decoding(format!(
                    "plain payload length mismatch: expected {uncompressed_len}, got {}",
                    data.len()
                )));
            }
            Ok(data.to_vec())
        }
        CanonicalEncoding::Lz4 => lz4_flex::block::decompress(data, uncompressed_len)
            .map_err(|e| WaxError::decoding(format!("lz4 decode failed: {e}"))),
        CanonicalEncoding::Deflate => {
            let mut dec = DeflateDecoder::new(data);
            let mut out = Vec::with_capacity(uncompressed_len.min(64 * 1024 * 1024));
            dec.read_to_end(&mut out).map_err(|e| WaxError::decoding(format!("deflate decode failed: {e}")))?;
            if out.len() != uncompressed_len {
                return Err(WaxError::decoding(format!(
                    "deflate payload length mismatch: expected {uncompressed_len}, got {}",
                    out.len()
                )));
            }
            Ok(out)
        }
        CanonicalEncoding::Lzfse => {
            Err(WaxError::decoding("lzfse decoding is not supported by this build (no maintained pure-Rust decoder)"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_round_trips() {
        let data = b"hello world, this is a plain frame payload".to_vec();
        let c = compress(CanonicalEncoding::Plain, &data).unwrap();
        let d = decompress(CanonicalEncoding::Plain, &c, data.len()).unwrap();
        assert_eq!(d, data);
    }

    #[test]
    fn lz4_round_trips() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbb".to_vec();
        let c = compress(CanonicalEncoding::Lz4, &data).unwrap();
        assert!(c.len() < data.len());
        let d = decompress(CanonicalEncoding::Lz4, &c, data.len()).unwrap();
        assert_eq!(d, data);
    }

    #[test]
    fn deflate_round_trips() {
        let data = b"repetitive repetitive repetitive repetitive text payload".to_vec();
        let c = compress(CanonicalEncoding::Deflate, &data).unwrap();
        let d = decompress(CanonicalEncoding::Deflate, &c, data.len()).unwrap();
        assert_eq!(d, data);
    }

    #[test]
    fn lzfse_decode_is_rejected() {
        let err = decompress(CanonicalEncoding::Lzfse, b"whatever", 8).unwrap_err();
        assert!(matches!(err, WaxError::DecodingError(_)));
    }

    #[test]
    fn tag_round_trips() {
        for enc in [CanonicalEncoding::Plain, CanonicalEncoding::Lz4, CanonicalEncoding::Deflate, CanonicalEncoding::Lzfse] {
            assert_eq!(CanonicalEncoding::from_tag(enc.tag()).unwrap(), enc);
        }
    }
}
