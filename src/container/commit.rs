//! The four-step commit protocol binding WAL, payload region, TOC, and footer together into one
//! atomic generation bump. Grounded on `recovery/wasp/wasp_engine.rs`'s checkpoint sequence
//! (flush pending writes, write new state to a fresh location, fsync, then atomically swap the
//! pointer to it) adapted from "rename a tmp file" to "flip the inactive header slot" since Wax
//! is one container file, not a directory of files.
//!
//! Steps: (1) WAL records for this commit are already durable (appended and fsynced by
//! `session.rs` before calling `commit`); (2) append staged payload bytes to the payload
//! region and fsync; (3) encode the merged TOC and footer, write them past the payload region,
//! fsync; (4) write the new header page to the inactive slot and fsync — this step is the
//! atomic commit point, since readers always trust the higher-generation valid header.

use std::fs::File;

use crate::container::footer::{FOOTER_FORMAT_VERSION, Footer};
use crate::container::header::{HEADER_FORMAT_VERSION, HeaderPage, write_header_to_other_slot};
use crate::container::toc::{encode_toc, toc_hash};
use crate::errors::WaxError;
use crate::fileio;
use crate::frame::FrameStore;
use crate::wal::WalRing;

/// Fixed offset where the payload region begins: two 4096-byte header slots, then the WAL ring.
#[must_use]
pub fn payload_region_start(wal_capacity: u64) -> u64 {
    2 * crate::container::header::HEADER_PAGE_SIZE as u64 + wal_capacity
}

pub struct CommitOutcome {
    pub header_slot: usize,
    pub generation: u64,
    pub payload_end: u64,
    pub footer_offset: u64,
}

/// Runs one full commit: flushes staged frame payloads, writes a fresh TOC + footer, and flips
/// the header slot. `payload_region_start` is the absolute file offset where logical payload
/// offset 0 lives. Returns the new durable state on success; on any error, the file retains the
/// previously-committed generation since the header slot is only overwritten at the very end.
pub fn commit(
    file: &mut File,
    wal: &mut WalRing,
    frame_store: &mut FrameStore,
    current_header_slot: Option<usize>,
    current_generation: u64,
    payload_region_start: u64,
    current_payload_end: u64,
) -> Result<CommitOutcome, WaxError> {
    let pending_ids: Vec<u64> = frame_store.pending.keys().copied().collect();
    let mut payload_end = current_payload_end;
    for id in pending_ids {
        if let Some(bytes) = frame_store.take_pending_payload(id) {
            let meta = frame_store.pending.get(&id).expect("pending meta exists for staged payload");
            let absolute_offset = payload_region_start + meta.payload_offset;
            fileio::pwrite(file, absolute_offset, &bytes)?;
            payload_end = payload_end.max(absolute_offset + bytes.len() as u64);
        }
    }
    fileio::fdatasync(file)?;

    let merged_metas = frame_store.frame_metas();
    let toc_bytes = encode_toc(&merged_metas)?;
    let toc_offset = payload_end;
    fileio::pwrite(file, toc_offset, &toc_bytes)?;

    let generation = current_generation + 1;
    let footer = Footer {
        version: FOOTER_FORMAT_VERSION,
        generation,
        toc_len: toc_bytes.len() as u64,
        toc_hash: toc_hash(&toc_bytes),
        wal_committed_seq: wal.last_sequence,
    };
    let footer_bytes = footer.encode();
    let footer_offset = toc_offset + toc_bytes.len() as u64;
    fileio::pwrite(file, footer_offset, &footer_bytes)?;
    fileio::fdatasync(file)?;

    let header_page = HeaderPage { version: HEADER_FORMAT_VERSION, generation, footer_offset };
    let new_slot = write_header_to_other_slot(file, current_header_slot, &header_page)?;

    wal.checkpoint(wal.write_pos);
    frame_store.mark_all_committed();

    Ok(CommitOutcome { header_slot: new_slot, generation, payload_end, footer_offset })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::CanonicalEncoding;
    use crate::frame::{FrameRole, NewFrame};
    use crate::wal::FsyncPolicy;
    use tempfile::tempdir;

    #[test]
    fn commit_writes_payload_toc_footer_and_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mv2s");
        let mut file = fileio::open_rw(&path).unwrap();
        let wal_capacity = 4096u64;
        let region_start = payload_region_start(wal_capacity);
        file.set_len(region_start + 65536).unwrap();

        let mut wal = WalRing::new(2 * crate::container::header::HEADER_PAGE_SIZE as u64, wal_capacity, FsyncPolicy::Always);
        let mut frame_store = FrameStore::new(0);
        let id = frame_store.put(NewFrame {
            timestamp_ms: 1,
            role: FrameRole::Document,
            kind: "note".to_string(),
            parent_id: None,
            chunk_index: 0,
            chunk_count: 1,
            canonical_encoding: CanonicalEncoding::Plain,
            content: b"hello wax".to_vec(),
            uncompressed_length: 9,
            search_text: Some("hello wax".into()),
            labels: vec![],
            tags: vec![],
            metadata: serde_json::json!({}),
        });
        wal.append(&mut file, b"fake wal record for this mutation").unwrap();

        let outcome = commit(&mut file, &mut wal, &mut frame_store, None, 0, region_start, region_start).unwrap();
        assert_eq!(outcome.generation, 1);
        assert_eq!(outcome.header_slot, 0);

        let (slot, header) = crate::container::header::read_valid_header(&mut file).unwrap();
        assert_eq!(slot, outcome.header_slot);
        assert_eq!(header.generation, 1);

        let footer_bytes = fileio::pread(&mut file, header.footer_offset, crate::container::footer::FOOTER_LEN).unwrap();
        let footer = Footer::decode(&footer_bytes).unwrap();
        let toc_offset = header.footer_offset - footer.toc_len;
        let toc_bytes = fileio::pread(&mut file, toc_offset, footer.toc_len as usize).unwrap();
        footer.verify_toc(&toc_bytes).unwrap();
        let metas = crate::container::toc::decode_toc(&toc_bytes).unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].id, id);
        assert!(frame_store.pending.is_empty());
    }
}
