//! Frames: the atomic unit of stored memory. `FrameStore` tracks frame metadata in two maps —
//! `committed` (durable as of the last successful commit) and `pending` (written to the WAL,
//! not yet folded into a footer/TOC) — mirroring the "committed ∪ pending" description of
//! `frame_metas()`.
//!
//! Grounded on `collection/ops.rs`'s persist-to-storage-first-then-apply-to-cache-and-indexes
//! ordering (here: append to WAL first, then insert into `pending`), and `collection/core.rs`'s
//! struct shape, narrowed to Wax's frame fields (u64 monotonic ids, not BSON `Document`/`Uuid`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checksum::{self, CHECKSUM_LEN};
use crate::compressor::CanonicalEncoding;
use crate::errors::WaxError;

/// A frame's place in the document/chunk hierarchy, not its author. `Document` frames are
/// whole ingested units; `Chunk` frames are a document's pieces (`parent_id` points back to the
/// document); `System` frames are store-internal bookkeeping (e.g. access-stats snapshots).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRole {
    Document,
    Chunk,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameStatus {
    Active,
    Superseded,
    Deleted,
}

/// Durable, addressable metadata for one frame. Payload bytes live in the container's payload
/// region; this struct is the index entry pointing at them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMeta {
    pub id: u64,
    pub timestamp_ms: u64,
    pub role: FrameRole,
    /// A short free-form tag, not a closed enum: `"handoff"`, `"surrogate"`,
    /// `"wax.internal.access_stats"`, or any caller-defined label.
    pub kind: String,
    pub parent_id: Option<u64>,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub status: FrameStatus,
    pub superseded_by: Option<u64>,
    #[serde(with = "encoding_serde")]
    pub canonical_encoding: CanonicalEncoding,
    pub payload_offset: u64,
    pub payload_length: u64,
    pub uncompressed_length: u64,
    #[serde(with = "serde_bytes")]
    pub payload_hash: Vec<u8>,
    pub search_text: Option<String>,
    pub labels: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    /// Not persisted to the TOC; set by `frame_metas()` to distinguish pending-not-yet-
    /// committed entries from durable ones.
    #[serde(skip, default)]
    pub is_pending: bool,
}

impl FrameMeta {
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.timestamp_ms
    }
}

mod encoding_serde {
    use super::CanonicalEncoding;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &CanonicalEncoding, s: S) -> Result<S::Ok, S::Error> {
        v.tag().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<CanonicalEncoding, D::Error> {
        let tag = u8::deserialize(d)?;
        CanonicalEncoding::from_tag(tag).map_err(serde::de::Error::custom)
    }
}

/// Arguments for inserting a new frame, grouped to keep `put`'s signature manageable.
pub struct NewFrame {
    pub timestamp_ms: u64,
    pub role: FrameRole,
    pub kind: String,
    pub parent_id: Option<u64>,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub canonical_encoding: CanonicalEncoding,
    pub content: Vec<u8>,
    pub uncompressed_length: u64,
    pub search_text: Option<String>,
    pub labels: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}

/// In-memory frame metadata index plus the staged payload bytes awaiting commit.
pub struct FrameStore {
    pub committed: BTreeMap<u64, FrameMeta>,
    pub pending: BTreeMap<u64, FrameMeta>,
    pending_payloads: BTreeMap<u64, Vec<u8>>,
    next_id: u64,
    next_payload_offset: u64,
}

impl FrameStore {
    #[must_use]
    pub fn new(next_payload_offset: u64) -> Self {
        Self {
            committed: BTreeMap::new(),
            pending: BTreeMap::new(),
            pending_payloads: BTreeMap::new(),
            next_id: 1,
            next_payload_offset,
        }
    }

    /// Rehydrates a store from a recovered TOC (all frames start committed, none pending).
    #[must_use]
    pub fn from_committed(committed: BTreeMap<u64, FrameMeta>, next_payload_offset: u64) -> Self {
        let next_id = committed.keys().next_back().map_or(1, |id| id + 1);
        Self { committed, pending: BTreeMap::new(), pending_payloads: BTreeMap::new(), next_id, next_payload_offset }
    }

    /// Stages a new frame: allocates an id, records its position in the payload region, and
    /// holds the compressed bytes pending until commit flushes them to disk.
    pub fn put(&mut self, new_frame: NewFrame) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let payload_offset = self.next_payload_offset;
        let payload_length = new_frame.content.len() as u64;
        self.next_payload_offset += payload_length;
        let payload_hash = checksum::digest(&new_frame.content).to_vec();

        let meta = FrameMeta {
            id,
            timestamp_ms: new_frame.timestamp_ms,
            role: new_frame.role,
            kind: new_frame.kind,
            parent_id: new_frame.parent_id,
            chunk_index: new_frame.chunk_index,
            chunk_count: new_frame.chunk_count,
            status: FrameStatus::Active,
            superseded_by: None,
            canonical_encoding: new_frame.canonical_encoding,
            payload_offset,
            payload_length,
            uncompressed_length: new_frame.uncompressed_length,
            payload_hash,
            search_text: new_frame.search_text,
            labels: new_frame.labels,
            tags: new_frame.tags,
            metadata: new_frame.metadata,
            is_pending: true,
        };
        self.pending_payloads.insert(id, new_frame.content);
        self.pending.insert(id, meta);
        id
    }

    /// Marks `old_id` as superseded by a newly-inserted frame. Both the supersede marker and
    /// the new frame are WAL-ordered together by the caller (`session.rs`) before this call.
    pub fn supersede(&mut self, old_id: u64, new_id: u64) -> Result<(), WaxError> {
        if let Some(meta) = self.pending.get_mut(&old_id) {
            meta.status = FrameStatus::Superseded;
            meta.superseded_by = Some(new_id);
            return Ok(());
        }
        let mut meta = self.committed.get(&old_id).cloned().ok_or(WaxError::FrameNotFound(old_id))?;
        meta.status = FrameStatus::Superseded;
        meta.superseded_by = Some(new_id);
        meta.is_pending = true;
        self.pending.insert(old_id, meta);
        Ok(())
    }

    pub fn delete(&mut self, id: u64) -> Result<(), WaxError> {
        if let Some(meta) = self.pending.get_mut(&id) {
            meta.status = FrameStatus::Deleted;
            return Ok(());
        }
        let mut meta = self.committed.get(&id).cloned().ok_or(WaxError::FrameNotFound(id))?;
        meta.status = FrameStatus::Deleted;
        meta.is_pending = true;
        self.pending.insert(id, meta);
        Ok(())
    }

    /// Returns the staged content bytes for a still-pending frame, consumed by `commit.rs`
    /// when flushing the payload region.
    #[must_use]
    pub fn take_pending_payload(&mut self, id: u64) -> Option<Vec<u8>> {
        self.pending_payloads.remove(&id)
    }

    /// Folds all pending metadata into committed state after a successful commit.
    pub fn mark_all_committed(&mut self) {
        for (id, meta) in self.pending.iter_mut() {
            meta.is_pending = false;
            self.committed.insert(*id, meta.clone());
        }
        self.pending.clear();
        self.pending_payloads.clear();
    }

    /// The frame's compressed content bytes, whether still staged or already durable. Callers
    /// decompress via `compressor::decompress` using the meta's `canonical_encoding` and
    /// `uncompressed_length`.
    #[must_use]
    pub fn frame_content_bytes<'a>(&'a self, id: u64, durable_payload: &'a [u8]) -> Option<&'a [u8]> {
        if let Some(bytes) = self.pending_payloads.get(&id) {
            return Some(bytes.as_slice());
        }
        self.committed.get(&id).map(|meta| {
            let start = 0usize;
            let end = meta.payload_length as usize;
            &durable_payload[start..end.min(durable_payload.len())]
        })
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<&FrameMeta> {
        self.pending.get(&id).or_else(|| self.committed.get(&id))
    }

    /// All frame metadata, committed ∪ pending, pending entries shadowing committed ones with
    /// the same id.
    #[must_use]
    pub fn frame_metas(&self) -> Vec<FrameMeta> {
        let mut merged: BTreeMap<u64, FrameMeta> = self.committed.clone();
        for (id, meta) in &self.pending {
            merged.insert(*id, meta.clone());
        }
        merged.into_values().collect()
    }

    #[must_use]
    pub fn next_payload_offset(&self) -> u64 {
        self.next_payload_offset
    }

    #[must_use]
    pub fn checksum_of(&self, content: &[u8]) -> [u8; CHECKSUM_LEN] {
        checksum::digest(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(content: &str) -> NewFrame {
        NewFrame {
            timestamp_ms: 1000,
            role: FrameRole::Document,
            kind: "note".to_string(),
            parent_id: None,
            chunk_index: 0,
            chunk_count: 1,
            canonical_encoding: CanonicalEncoding::Plain,
            content: content.as_bytes().to_vec(),
            uncompressed_length: content.len() as u64,
            search_text: Some(content.to_string()),
            labels: vec![],
            tags: vec![],
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn put_assigns_monotonic_ids_and_advances_payload_offset() {
        let mut store = FrameStore::new(0);
        let id1 = store.put(sample("hello"));
        let id2 = store.put(sample("world!"));
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(store.next_payload_offset(), 11);
    }

    #[test]
    fn supersede_marks_old_frame_and_links_new() {
        let mut store = FrameStore::new(0);
        let old = store.put(sample("draft"));
        store.mark_all_committed();
        let new = store.put(sample("final"));
        store.supersede(old, new).unwrap();
        let meta = store.get(old).unwrap();
        assert_eq!(meta.status, FrameStatus::Superseded);
        assert_eq!(meta.superseded_by, Some(new));
    }

    #[test]
    fn frame_metas_merges_committed_and_pending() {
        let mut store = FrameStore::new(0);
        let id1 = store.put(sample("one"));
        store.mark_all_committed();
        let id2 = store.put(sample("two"));
        let metas = store.frame_metas();
        assert_eq!(metas.len(), 2);
        assert!(metas.iter().any(|m| m.id == id1 && !m.is_pending));
        assert!(metas.iter().any(|m| m.id == id2 && m.is_pending));
    }

    #[test]
    fn delete_missing_frame_errors() {
        let mut store = FrameStore::new(0);
        assert!(matches!(store.delete(999), Err(WaxError::FrameNotFound(999))));
    }
}
