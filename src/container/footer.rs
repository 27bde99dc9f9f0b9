//! The footer: the single source of truth for "what generation is durable". Written last in
//! the commit protocol, directly after the TOC it describes.
//!
//! Layout: `magic(4) | version(u16) | generation(u64) | toc_len(u64) | toc_hash(32) |
//! wal_committed_seq(u64)`.

use crate::checksum;
use crate::codec::{Decoder, Encoder};
use crate::errors::WaxError;

pub const FOOTER_MAGIC: [u8; 4] = *b"MV2F";
pub const FOOTER_FORMAT_VERSION: u16 = 1;
pub const FOOTER_LEN: usize = 4 + 2 + 8 + 8 + 32 + 8 + 32; // body + trailing checksum

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub version: u16,
    pub generation: u64,
    pub toc_len: u64,
    pub toc_hash: [u8; 32],
    pub wal_committed_seq: u64,
}

impl Footer {
    fn body_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(4 + 2 + 8 + 8 + 32 + 8);
        enc.put_bytes(&FOOTER_MAGIC)
            .put_u16(self.version)
            .put_u64(self.generation)
            .put_u64(self.toc_len)
            .put_bytes(&self.toc_hash)
            .put_u64(self.wal_committed_seq);
        enc.into_bytes()
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body_bytes();
        let checksum = checksum::digest(&body);
        let mut out = body;
        out.extend_from_slice(&checksum);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WaxError> {
        if bytes.len() != FOOTER_LEN {
            return Err(WaxError::InvalidFooter(format!("footer must be {FOOTER_LEN} bytes, got {}", bytes.len())));
        }
        let mut dec = Decoder::new(bytes);
        let magic = dec.get_bytes(4)?;
        if magic != FOOTER_MAGIC {
            return Err(WaxError::InvalidFooter("bad footer magic".into()));
        }
        let version = dec.get_u16()?;
        let generation = dec.get_u64()?;
        let toc_len = dec.get_u64()?;
        let toc_hash_bytes = dec.get_bytes(32)?;
        let mut toc_hash = [0u8; 32];
        toc_hash.copy_from_slice(toc_hash_bytes);
        let wal_committed_seq = dec.get_u64()?;
        let checksum_bytes = dec.get_bytes(32)?;
        let mut checksum_arr = [0u8; 32];
        checksum_arr.copy_from_slice(checksum_bytes);

        let footer = Self { version, generation, toc_len, toc_hash, wal_committed_seq };
        let expected = checksum::digest(&footer.body_bytes());
        if expected != checksum_arr {
            return Err(WaxError::ChecksumMismatch("footer".into()));
        }
        Ok(footer)
    }

    /// Validates that a just-read TOC blob matches this footer's recorded length and hash.
    pub fn verify_toc(&self, toc_bytes: &[u8]) -> Result<(), WaxError> {
        if toc_bytes.len() as u64 != self.toc_len {
            return Err(WaxError::InvalidToc(format!(
                "footer declares toc_len {} but read {} bytes",
                self.toc_len,
                toc_bytes.len()
            )));
        }
        let actual_hash = checksum::digest(toc_bytes);
        if actual_hash != self.toc_hash {
            return Err(WaxError::ChecksumMismatch("toc hash mismatch against footer".into()));
        }
        Ok(())
    }
}
