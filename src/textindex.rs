//! A hand-rolled BM25 inverted index over frame `search_text`. No crate in the corpus indexes
//! text, so this is built from scratch following the shape of the other from-scratch indexes
//! in this crate (staged mutations applied at commit, committed state persisted as one blob).
//!
//! BM25 parameters `k1 = 1.2`, `b = 0.75` are the standard defaults used across the literature
//! and are not exposed as configuration.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::errors::WaxError;

const K1: f32 = 1.2;
const B: f32 = 0.75;

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PostingList {
    /// frame id -> term frequency within that frame's search_text.
    postings: BTreeMap<u64, u32>,
}

/// Persisted shape of the committed index: postings plus the doc-length table needed for BM25's
/// length-normalization term.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextIndexSnapshot {
    pub version: u32,
    pub doc_count: u64,
    pub total_doc_length: u64,
    postings: BTreeMap<String, PostingList>,
    doc_lengths: BTreeMap<u64, u32>,
}

pub const TEXT_INDEX_FORMAT_VERSION: u32 = 1;

pub struct TextIndex {
    committed: TextIndexSnapshot,
    staged_upserts: HashMap<u64, Vec<String>>,
    staged_removals: HashSet<u64>,
}

impl TextIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            committed: TextIndexSnapshot { version: TEXT_INDEX_FORMAT_VERSION, ..Default::default() },
            staged_upserts: HashMap::new(),
            staged_removals: HashSet::new(),
        }
    }

    #[must_use]
    pub fn from_snapshot(snapshot: TextIndexSnapshot) -> Self {
        Self { committed: snapshot, staged_upserts: HashMap::new(), staged_removals: HashSet::new() }
    }

    /// Stages a frame's searchable text for indexing at the next commit. Re-indexing an id
    /// already staged or committed replaces its terms entirely.
    pub fn upsert(&mut self, frame_id: u64, search_text: &str) {
        self.staged_removals.remove(&frame_id);
        self.staged_upserts.insert(frame_id, tokenize(search_text));
    }

    pub fn remove(&mut self, frame_id: u64) {
        self.staged_upserts.remove(&frame_id);
        self.staged_removals.insert(frame_id);
    }

    /// Folds staged mutations into the committed snapshot. Called by the same commit step that
    /// flushes frame payloads, keeping the text index generation-aligned with the container.
    pub fn commit(&mut self) {
        let removals: Vec<u64> = self.staged_removals.drain().collect();
        for id in removals {
            self.remove_committed(id);
        }
        let upserts = std::mem::take(&mut self.staged_upserts);
        for (id, tokens) in upserts {
            self.remove_committed(id);
            let mut counts: BTreeMap<String, u32> = BTreeMap::new();
            for t in &tokens {
                *counts.entry(t.clone()).or_insert(0) += 1;
            }
            for (term, tf) in counts {
                self.committed.postings.entry(term).or_default().postings.insert(id, tf);
            }
            self.committed.doc_lengths.insert(id, tokens.len() as u32);
            self.committed.total_doc_length += tokens.len() as u64;
            self.committed.doc_count += 1;
        }
    }

    fn remove_committed(&mut self, id: u64) {
        if let Some(len) = self.committed.doc_lengths.remove(&id) {
            self.committed.total_doc_length = self.committed.total_doc_length.saturating_sub(u64::from(len));
            self.committed.doc_count = self.committed.doc_count.saturating_sub(1);
        }
        for list in self.committed.postings.values_mut() {
            list.postings.remove(&id);
        }
    }

    fn avg_doc_length(&self) -> f32 {
        if self.committed.doc_count == 0 {
            return 0.0;
        }
        self.committed.total_doc_length as f32 / self.committed.doc_count as f32
    }

    /// Scores `query` against every committed document containing at least one query term,
    /// returning `(frame_id, bm25_score)` pairs sorted by descending score.
    #[must_use]
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(u64, f32)> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.committed.doc_count == 0 {
            return Vec::new();
        }
        let avgdl = self.avg_doc_length();
        let n = self.committed.doc_count as f32;
        let mut scores: HashMap<u64, f32> = HashMap::new();

        let mut seen_terms = HashSet::new();
        for term in &query_terms {
            if !seen_terms.insert(term.clone()) {
                continue;
            }
            let Some(list) = self.committed.postings.get(term) else { continue };
            let df = list.postings.len() as f32;
            if df == 0.0 {
                continue;
            }
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (&doc_id, &tf) in &list.postings {
                let doc_len = self.committed.doc_lengths.get(&doc_id).copied().unwrap_or(0) as f32;
                let tf = tf as f32;
                let denom = tf + K1 * (1.0 - B + B * doc_len / avgdl.max(1.0));
                let score = idf * (tf * (K1 + 1.0)) / denom.max(f32::EPSILON);
                *scores.entry(doc_id).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(u64, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top_k);
        ranked
    }

    #[must_use]
    pub fn snapshot(&self) -> &TextIndexSnapshot {
        &self.committed
    }

    pub fn encode(&self) -> Result<Vec<u8>, WaxError> {
        bincode::serde::encode_to_vec(&self.committed, bincode::config::standard())
            .map_err(|e| WaxError::encoding(format!("text index snapshot: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WaxError> {
        let (snapshot, _): (TextIndexSnapshot, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| WaxError::decoding(format!("text index snapshot: {e}")))?;
        Ok(Self::from_snapshot(snapshot))
    }
}

impl Default for TextIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_exact_term_matches_above_unrelated_docs() {
        let mut idx = TextIndex::new();
        idx.upsert(1, "the quick brown fox jumps over the lazy dog");
        idx.upsert(2, "completely unrelated content about gardening");
        idx.commit();
        let results = idx.search("fox dog", 10);
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn remove_drops_document_from_future_searches() {
        let mut idx = TextIndex::new();
        idx.upsert(1, "alpha beta gamma");
        idx.commit();
        idx.remove(1);
        idx.commit();
        assert!(idx.search("alpha", 10).is_empty());
    }

    #[test]
    fn reindexing_same_id_replaces_terms() {
        let mut idx = TextIndex::new();
        idx.upsert(1, "original terms here");
        idx.commit();
        idx.upsert(1, "replaced content entirely");
        idx.commit();
        assert!(idx.search("original", 10).is_empty());
        assert!(!idx.search("replaced", 10).is_empty());
    }

    #[test]
    fn snapshot_round_trips_through_encode_decode() {
        let mut idx = TextIndex::new();
        idx.upsert(1, "hello world");
        idx.commit();
        let bytes = idx.encode().unwrap();
        let restored = TextIndex::decode(&bytes).unwrap();
        assert_eq!(restored.search("hello", 10).len(), 1);
    }
}
