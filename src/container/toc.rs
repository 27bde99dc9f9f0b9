//! The table of contents: a length-prefixed, checksummed blob listing every committed frame's
//! metadata. The footer records only the TOC's length and hash; the TOC itself lives just
//! before the footer at commit time. Grounded on `recovery/wasp/manifest.rs`'s pattern of a
//! small fixed header pointing at a variable-length payload validated by hash.

use crate::checksum;
use crate::codec::{Decoder, Encoder};
use crate::errors::WaxError;
use crate::frame::FrameMeta;

pub const TOC_MAGIC: [u8; 4] = *b"MV2T";
pub const TOC_FORMAT_VERSION: u16 = 1;

/// Serializes the committed frame metadata list into the on-disk TOC blob:
/// `magic(4) | version(u16) | count(u32) | bincode(Vec<FrameMeta>)`.
pub fn encode_toc(metas: &[FrameMeta]) -> Result<Vec<u8>, WaxError> {
    let body = bincode::serde::encode_to_vec(metas, bincode::config::standard())
        .map_err(|e| WaxError::encoding(format!("toc body: {e}")))?;
    let mut enc = Encoder::with_capacity(4 + 2 + 4 + body.len());
    enc.put_bytes(&TOC_MAGIC).put_u16(TOC_FORMAT_VERSION).put_u32(crate::utils::num::u128_to_u64_saturating(metas.len() as u128) as u32);
    enc.put_bytes(&body);
    Ok(enc.into_bytes())
}

pub fn decode_toc(bytes: &[u8]) -> Result<Vec<FrameMeta>, WaxError> {
    let mut dec = Decoder::new(bytes);
    let magic = dec.get_bytes(4)?;
    if magic != TOC_MAGIC {
        return Err(WaxError::InvalidToc("bad toc magic".into()));
    }
    let version = dec.get_u16()?;
    if version != TOC_FORMAT_VERSION {
        return Err(WaxError::InvalidToc(format!("unsupported toc version {version}")));
    }
    let count = dec.get_u32()?;
    let body = dec.get_bytes(dec.remaining())?;
    let (mut metas, _): (Vec<FrameMeta>, usize) = bincode::serde::decode_from_slice(body, bincode::config::standard())
        .map_err(|e| WaxError::decoding(format!("toc body: {e}")))?;
    if metas.len() != count as usize {
        return Err(WaxError::InvalidToc(format!("toc declares {count} frames but decoded {}", metas.len())));
    }
    for meta in &mut metas {
        meta.is_pending = false;
    }
    Ok(metas)
}

/// Hashes the encoded TOC bytes for inclusion in the footer.
#[must_use]
pub fn toc_hash(toc_bytes: &[u8]) -> [u8; 32] {
    checksum::digest(toc_bytes)
}
