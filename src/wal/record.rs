//! WAL record header: the 48-byte envelope prefixing every record in the ring.
//!
//! Layout: `sequence(u64) | length(u32) | flags(u8) | padding(3) | checksum(32)` = 48 bytes.
//! `checksum` covers the header (with checksum field zeroed) followed by the record body.

use crate::checksum;
use crate::codec::{Decoder, Encoder};
use crate::errors::WaxError;

pub const RECORD_HEADER_LEN: usize = 48;
pub const FLAG_IS_PADDING: u8 = 0x01;

#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub sequence: u64,
    pub length: u32,
    pub flags: u8,
    pub checksum: [u8; 32],
}

impl RecordHeader {
    #[must_use]
    pub fn is_padding(&self) -> bool {
        self.flags & FLAG_IS_PADDING != 0
    }

    fn header_bytes_for_checksum(sequence: u64, length: u32, flags: u8) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(16);
        enc.put_u64(sequence).put_u32(length).put_u8(flags).put_bytes(&[0u8; 3]);
        enc.into_bytes()
    }

    /// Builds a header for `body`, computing the checksum over header-with-zeroed-checksum
    /// plus body bytes.
    #[must_use]
    pub fn for_body(sequence: u64, flags: u8, body: &[u8]) -> Self {
        let length = crate::utils::num::u128_to_u64_saturating(body.len() as u128) as u32;
        let header_bytes = Self::header_bytes_for_checksum(sequence, length, flags);
        let checksum = checksum::digest_parts(&header_bytes, body);
        Self { sequence, length, flags, checksum }
    }

    #[must_use]
    pub fn padding(sequence: u64, pad_len: u32) -> Self {
        let header_bytes = Self::header_bytes_for_checksum(sequence, pad_len, FLAG_IS_PADDING);
        let checksum = checksum::digest_parts(&header_bytes, &vec![0u8; pad_len as usize]);
        Self { sequence, length: pad_len, flags: FLAG_IS_PADDING, checksum }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(RECORD_HEADER_LEN);
        enc.put_u64(self.sequence).put_u32(self.length).put_u8(self.flags).put_bytes(&[0u8; 3]);
        enc.put_bytes(&self.checksum);
        let bytes = enc.into_bytes();
        debug_assert_eq!(bytes.len(), RECORD_HEADER_LEN);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WaxError> {
        if bytes.len() != RECORD_HEADER_LEN {
            return Err(WaxError::decoding(format!("wal record header must be {RECORD_HEADER_LEN} bytes")));
        }
        let mut dec = Decoder::new(bytes);
        let sequence = dec.get_u64()?;
        let length = dec.get_u32()?;
        let flags = dec.get_u8()?;
        let _padding = dec.get_bytes(3)?;
        let checksum_bytes = dec.get_bytes(32)?;
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(checksum_bytes);
        Ok(Self { sequence, length, flags, checksum })
    }

    /// Verifies the header's checksum against the supplied body bytes.
    pub fn verify(&self, body: &[u8]) -> Result<(), WaxError> {
        let header_bytes = Self::header_bytes_for_checksum(self.sequence, self.length, self.flags);
        let expected = checksum::digest_parts(&header_bytes, body);
        if expected != self.checksum {
            return Err(WaxError::ChecksumMismatch(format!("wal record sequence {}", self.sequence)));
        }
        Ok(())
    }
}
