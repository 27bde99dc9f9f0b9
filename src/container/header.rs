//! Header pages: two fixed-size, dual-buffered pages at the start of the container file.
//! Commit picks whichever has the higher valid generation; recovery falls back to the other
//! if one is corrupt. Grounded on `recovery/wasp/manifest.rs`'s `WaspFile` double-buffered
//! slot pattern (`manifest_offsets: [u64; 2]`, pick-highest-valid-`version`).

use crate::checksum;
use crate::codec::{Decoder, Encoder};
use crate::errors::WaxError;
use crate::fileio;

pub const HEADER_MAGIC: [u8; 4] = *b"MV2H";
pub const HEADER_PAGE_SIZE: usize = 4096;
pub const HEADER_FORMAT_VERSION: u16 = 1;
const HEADER_SLOT_OFFSETS: [u64; 2] = [0, HEADER_PAGE_SIZE as u64];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPage {
    pub version: u16,
    pub generation: u64,
    pub footer_offset: u64,
}

impl HeaderPage {
    fn body_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(4 + 2 + 8 + 8);
        enc.put_bytes(&HEADER_MAGIC).put_u16(self.version).put_u64(self.generation).put_u64(self.footer_offset);
        enc.into_bytes()
    }

    fn encode_page(&self) -> Vec<u8> {
        let body = self.body_bytes();
        let checksum = checksum::digest(&body);
        let mut page = body;
        page.extend_from_slice(&checksum);
        page.resize(HEADER_PAGE_SIZE, 0);
        page
    }

    fn decode_page(bytes: &[u8]) -> Result<Self, WaxError> {
        if bytes.len() < HEADER_PAGE_SIZE {
            return Err(WaxError::InvalidFooter("header page shorter than fixed size".into()));
        }
        let mut dec = Decoder::new(bytes);
        let magic = dec.get_bytes(4)?;
        if magic != HEADER_MAGIC {
            return Err(WaxError::InvalidFooter("bad header magic".into()));
        }
        let version = dec.get_u16()?;
        let generation = dec.get_u64()?;
        let footer_offset = dec.get_u64()?;
        let checksum_bytes = dec.get_bytes(32)?;
        let mut checksum_arr = [0u8; 32];
        checksum_arr.copy_from_slice(checksum_bytes);

        let page = Self { version, generation, footer_offset };
        let expected = checksum::digest(&page.body_bytes());
        if expected != checksum_arr {
            return Err(WaxError::ChecksumMismatch("header page".into()));
        }
        Ok(page)
    }
}

/// Reads both header slots, returning the one with the higher valid generation. Falls back to
/// the lone valid slot if one is corrupt; errors only if both are corrupt or missing.
pub fn read_valid_header(file: &mut std::fs::File) -> Result<(usize, HeaderPage), WaxError> {
    let mut best: Option<(usize, HeaderPage)> = None;
    let mut slot_errors: Vec<(usize, String)> = Vec::new();
    for (slot, &offset) in HEADER_SLOT_OFFSETS.iter().enumerate() {
        let decoded = fileio::pread(file, offset, HEADER_PAGE_SIZE)
            .map_err(|e| e.to_string())
            .and_then(|bytes| HeaderPage::decode_page(&bytes).map_err(|e| e.to_string()));
        match decoded {
            Ok(page) => match &best {
                Some((_, b)) if b.generation >= page.generation => {}
                _ => best = Some((slot, page)),
            },
            Err(e) => slot_errors.push((slot, e)),
        }
    }

    if best.is_some() && !slot_errors.is_empty() {
        for (slot, err) in &slot_errors {
            let winner = best.as_ref().map(|(s, _)| *s).unwrap_or(0);
            crate::errors::Diagnostics::new(format!("header slot {slot} read"), format!("surviving slot {winner}"))
                .with_source(err)
                .emit();
        }
    }

    best.ok_or_else(|| WaxError::InvalidFooter("no valid header page found in either slot".into()))
}

/// Writes `page` into the *other* slot from `current_slot` (or slot 0 if this is the first
/// commit), implementing the dual-header swap: the new generation lands in the inactive slot
/// first, is fsynced, and only then becomes the "current" slot for subsequent readers.
pub fn write_header_to_other_slot(
    file: &mut std::fs::File,
    current_slot: Option<usize>,
    page: &HeaderPage,
) -> Result<usize, WaxError> {
    let target_slot = match current_slot {
        Some(0) => 1,
        Some(_) => 0,
        None => 0,
    };
    let offset = HEADER_SLOT_OFFSETS[target_slot];
    let bytes = page.encode_page();
    fileio::pwrite(file, offset, &bytes)?;
    fileio::fdatasync(file)?;
    Ok(target_slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_and_reads_back_highest_generation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mv2s");
        let mut file = fileio::open_rw(&path).unwrap();
        file.set_len(2 * HEADER_PAGE_SIZE as u64).unwrap();

        let gen1 = HeaderPage { version: HEADER_FORMAT_VERSION, generation: 1, footer_offset: 1000 };
        let slot1 = write_header_to_other_slot(&mut file, None, &gen1).unwrap();
        assert_eq!(slot1, 0);

        let gen2 = HeaderPage { version: HEADER_FORMAT_VERSION, generation: 2, footer_offset: 2000 };
        let slot2 = write_header_to_other_slot(&mut file, Some(slot1), &gen2).unwrap();
        assert_eq!(slot2, 1);

        let (slot, page) = read_valid_header(&mut file).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(page.generation, 2);
        assert_eq!(page.footer_offset, 2000);
    }

    #[test]
    fn falls_back_to_lone_valid_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mv2s");
        let mut file = fileio::open_rw(&path).unwrap();
        file.set_len(2 * HEADER_PAGE_SIZE as u64).unwrap();

        let gen1 = HeaderPage { version: HEADER_FORMAT_VERSION, generation: 1, footer_offset: 1000 };
        write_header_to_other_slot(&mut file, None, &gen1).unwrap();

        let _guard = crate::utils::devlog::enable_thread_sink();
        // Corrupt slot 1 (never written, all zero) is naturally invalid; slot 0 should win.
        let (slot, page) = read_valid_header(&mut file).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(page.generation, 1);

        let snap = crate::utils::devlog::snapshot();
        assert!(snap.iter().any(|s| s.contains("header slot 1 read") && s.contains("surviving slot 0")));
    }
}
