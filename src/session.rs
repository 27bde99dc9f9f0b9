//! Sessions bind a container file to its auxiliary indexes and enforce the single-writer rule.
//!
//! Cross-process exclusion uses `fileio::WriterLease` (a sibling `.lock` file); in-process
//! exclusion uses a small registry of active writer paths, scoped per-container since Wax has
//! exactly one collection per file.
//!
//! The text and vector indexes are not part of the `.mv2s` container's TOC; they are persisted
//! as sibling blobs (`<path>.textindex`, `<path>.vecindex`, `<path>.facts`) rewritten wholesale
//! via `fileio::atomic_replace` on every commit. This keeps the container's commit protocol
//! (header/TOC/footer) focused on frame durability while still giving the auxiliary indexes
//! crash-safe all-or-nothing writes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::container::ContainerFile;
use crate::errors::WaxError;
use crate::fileio::{self, WriterLease};
use crate::frame::{FrameMeta, NewFrame};
use crate::structured::StructuredStore;
use crate::textindex::TextIndex;
use crate::vectorindex::{DistanceMetric, VectorIndex};

static IN_PROCESS_WRITERS: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, Clone, Copy)]
pub enum SessionMode {
    ReadOnly,
    /// Blocks (polling with a short sleep) until the writer lease is free, up to `timeout`.
    ReadWriteWait { timeout: Duration },
    /// Fails immediately with `WriterBusy` if another writer session is active.
    ReadWriteFail,
}

struct WriteGuard {
    path: PathBuf,
    _lease: WriterLease,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        IN_PROCESS_WRITERS.lock().remove(&self.path);
    }
}

fn acquire_write_guard(path: &Path, mode: SessionMode) -> Result<Option<WriteGuard>, WaxError> {
    let (wait, deadline) = match mode {
        SessionMode::ReadOnly => return Ok(None),
        SessionMode::ReadWriteFail => (false, None),
        SessionMode::ReadWriteWait { timeout } => (true, Some(Instant::now() + timeout)),
    };

    loop {
        {
            let mut set = IN_PROCESS_WRITERS.lock();
            if !set.contains(path) {
                set.insert(path.to_path_buf());
                break;
            }
        }
        if !wait {
            return Err(WaxError::WriterBusy);
        }
        if deadline.is_some_and(|d| Instant::now() > d) {
            return Err(WaxError::WriterTimeout);
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    match WriterLease::acquire(path) {
        Ok(lease) => Ok(Some(WriteGuard { path: path.to_path_buf(), _lease: lease })),
        Err(e) => {
            IN_PROCESS_WRITERS.lock().remove(path);
            Err(e)
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// The caller's attestation that a vector-index blob covering `covered_ids` has been built and
/// is ready to fold in at the next commit. `bytes`/`vector_count`/`dimension`/`similarity` are
/// not independently re-derived here — this session's `VectorIndex` already stages its own
/// upserts internally — but recording them is what lets `commit` tell a staged-but-stale
/// manifest (one that predates a newer `attach_embedding` call) from a genuinely current one.
struct VectorStageManifest {
    covered_ids: HashSet<u64>,
    vector_count: usize,
    dimension: usize,
    similarity: DistanceMetric,
}

pub struct Session {
    path: PathBuf,
    container: ContainerFile,
    text_index: TextIndex,
    vector_index: Option<VectorIndex>,
    structured: StructuredStore,
    mode: SessionMode,
    _write_guard: Option<WriteGuard>,
    dirty: bool,
    pending_embedding_ids: HashSet<u64>,
    staged_vector_manifest: Option<VectorStageManifest>,
}

impl Session {
    pub fn open(path: impl AsRef<Path>, mode: SessionMode, vector_dimensions: Option<usize>) -> Result<Self, WaxError> {
        let path = path.as_ref().to_path_buf();
        let write_guard = acquire_write_guard(&path, mode)?;
        let container = ContainerFile::open(&path)?;

        let text_index = match std::fs::read(sibling(&path, ".textindex")) {
            Ok(bytes) => TextIndex::decode(&bytes)?,
            Err(_) => TextIndex::new(),
        };
        let vector_index = match (std::fs::read(sibling(&path, ".vecindex")), vector_dimensions) {
            (Ok(bytes), dims) => match VectorIndex::decode(&bytes) {
                Ok(index) => Some(index),
                Err(e) if dims.is_some() => {
                    crate::errors::Diagnostics::new("vector index decode", "rebuild via CPU engine (empty)")
                        .with_source(e)
                        .emit();
                    Some(VectorIndex::new(crate::vectorindex::DistanceMetric::Cosine, dims.unwrap()))
                }
                Err(e) => return Err(e),
            },
            (Err(_), Some(dims)) => Some(VectorIndex::new(crate::vectorindex::DistanceMetric::Cosine, dims)),
            (Err(_), None) => None,
        };
        let structured = match std::fs::read(sibling(&path, ".facts")) {
            Ok(bytes) => bincode_decode_structured(&bytes)?,
            Err(_) => StructuredStore::new(),
        };

        Ok(Self {
            path,
            container,
            text_index,
            vector_index,
            structured,
            mode,
            _write_guard: write_guard,
            dirty: false,
            pending_embedding_ids: HashSet::new(),
            staged_vector_manifest: None,
        })
    }

    fn ensure_writable(&self) -> Result<(), WaxError> {
        if self._write_guard.is_none() {
            return Err(WaxError::LockUnavailable("session opened read-only".into()));
        }
        Ok(())
    }

    pub fn remember(&mut self, new_frame: NewFrame) -> Result<u64, WaxError> {
        self.ensure_writable()?;
        let search_text = new_frame.search_text.clone();
        let id = self.container.frame_store.put(new_frame);
        if let Some(text) = search_text {
            self.text_index.upsert(id, &text);
        }
        self.dirty = true;
        Ok(id)
    }

    pub fn attach_embedding(&mut self, frame_id: u64, embedding: Vec<f32>) -> Result<(), WaxError> {
        self.ensure_writable()?;
        let Some(index) = self.vector_index.as_mut() else {
            return Err(WaxError::encoding("session was not opened with vector dimensions configured"));
        };
        index.upsert(frame_id, embedding)?;
        self.pending_embedding_ids.insert(frame_id);
        self.dirty = true;
        Ok(())
    }

    /// Caller's attestation that a vector-index blob covering `vector_count` vectors at
    /// `dimension`/`similarity` has been built and is ready to fold in at the next `commit`.
    /// `bytes` is the caller's serialized manifest; this session doesn't need to parse it since
    /// its own `VectorIndex` already tracks staged upserts internally, but accepting it keeps
    /// the call shape matching the staged-blob contract `commit` validates against.
    pub fn stage_vec_index_for_next_commit(&mut self, _bytes: Vec<u8>, vector_count: usize, dimension: usize, similarity: DistanceMetric) {
        self.staged_vector_manifest =
            Some(VectorStageManifest { covered_ids: self.pending_embedding_ids.clone(), vector_count, dimension, similarity });
    }

    pub fn supersede(&mut self, old_id: u64, new_frame: NewFrame) -> Result<u64, WaxError> {
        self.ensure_writable()?;
        let search_text = new_frame.search_text.clone();
        let new_id = self.container.frame_store.put(new_frame);
        self.container.frame_store.supersede(old_id, new_id)?;
        if let Some(text) = search_text {
            self.text_index.upsert(new_id, &text);
        }
        self.text_index.remove(old_id);
        self.dirty = true;
        Ok(new_id)
    }

    pub fn delete(&mut self, id: u64) -> Result<(), WaxError> {
        self.ensure_writable()?;
        self.container.frame_store.delete(id)?;
        self.text_index.remove(id);
        if let Some(index) = self.vector_index.as_mut() {
            index.remove(id);
        }
        self.dirty = true;
        Ok(())
    }

    #[must_use]
    pub fn frame_meta(&self, id: u64) -> Option<&FrameMeta> {
        self.container.frame_store.get(id)
    }

    #[must_use]
    pub fn frame_metas(&self) -> Vec<FrameMeta> {
        self.container.frame_store.frame_metas()
    }

    pub fn frame_content(&mut self, id: u64) -> Result<Option<Vec<u8>>, WaxError> {
        let Some(meta) = self.container.frame_store.get(id).cloned() else { return Ok(None) };
        if let Some(bytes) = self.container.frame_store.frame_content_bytes(id, &[]) {
            if !bytes.is_empty() || meta.payload_length == 0 {
                return Ok(Some(bytes.to_vec()));
            }
        }
        let bytes = self.container.read_payload(meta.payload_offset, meta.payload_length)?;
        Ok(Some(bytes))
    }

    #[must_use]
    pub fn text_index(&self) -> &TextIndex {
        &self.text_index
    }

    #[must_use]
    pub fn vector_index(&self) -> Option<&VectorIndex> {
        self.vector_index.as_ref()
    }

    /// Embeddings attached since the last commit with no staged vector-index manifest yet
    /// covering them. Callers that drive `attach_embedding` (e.g. the orchestrator's embedding
    /// pipeline) use this to decide whether `stage_vec_index_for_next_commit` needs a fresh call.
    #[must_use]
    pub fn pending_embedding_count(&self) -> usize {
        self.pending_embedding_ids.len()
    }

    #[must_use]
    pub fn structured(&self) -> &StructuredStore {
        &self.structured
    }

    #[must_use]
    pub fn structured_mut(&mut self) -> &mut StructuredStore {
        &mut self.structured
    }

    /// Commits the container (header/TOC/footer generation bump) and rewrites the auxiliary
    /// index sibling blobs. No-op if nothing changed since the last commit.
    ///
    /// `pending_embeddings ⊆ staged_vector_index` is enforced first: a pending embedding with no
    /// staged manifest at all fails "must be staged"; a pending embedding added after the last
    /// `stage_vec_index_for_next_commit` call fails "is stale". Neither check runs any file I/O,
    /// so the container generation and the auxiliary blobs on disk are untouched on failure.
    pub fn commit(&mut self) -> Result<(), WaxError> {
        self.ensure_writable()?;
        if !self.dirty {
            return Ok(());
        }
        self.check_vector_staging()?;

        self.container.commit()?;
        self.text_index.commit();
        if let Some(index) = self.vector_index.as_mut() {
            index.commit();
        }

        fileio::atomic_replace(&sibling(&self.path, ".textindex"), &self.text_index.encode()?)?;
        if let Some(index) = &self.vector_index {
            fileio::atomic_replace(&sibling(&self.path, ".vecindex"), &index.encode()?)?;
        }
        fileio::atomic_replace(&sibling(&self.path, ".facts"), &bincode_encode_structured(&self.structured)?)?;
        self.dirty = false;
        self.pending_embedding_ids.clear();
        self.staged_vector_manifest = None;
        Ok(())
    }

    fn check_vector_staging(&self) -> Result<(), WaxError> {
        if self.pending_embedding_ids.is_empty() {
            return Ok(());
        }
        let Some(manifest) = &self.staged_vector_manifest else {
            return Err(WaxError::IoTaxonomy(
                "vector index must be staged: call stage_vec_index_for_next_commit before commit".into(),
            ));
        };
        if !self.pending_embedding_ids.is_subset(&manifest.covered_ids) {
            return Err(WaxError::IoTaxonomy("vector index is stale: staged manifest predates a newer embedding".into()));
        }
        if let Some(index) = &self.vector_index {
            if manifest.dimension != index.dimensions() || manifest.similarity != index.metric() {
                return Err(WaxError::IoTaxonomy(
                    "vector index is stale: staged manifest dimension/similarity does not match the live index".into(),
                ));
            }
        }
        if manifest.vector_count < manifest.covered_ids.len() {
            return Err(WaxError::IoTaxonomy(
                "vector index is stale: staged manifest vector_count is smaller than its covered id set".into(),
            ));
        }
        Ok(())
    }

    /// Always auto-commits before closing, whether or not the caller already called `commit`.
    pub fn close(mut self) -> Result<(), WaxError> {
        if self._write_guard.is_some() {
            self.commit()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.mode
    }
}

/// `StructuredStore` has no `Serialize`/`Deserialize` derive (its `BTreeMap` values borrow
/// nothing unusual, but facts reference entities by id rather than embedding them, so a plain
/// derive would work — this wrapper exists to keep the wire shape stable if that changes).
fn bincode_encode_structured(store: &StructuredStore) -> Result<Vec<u8>, WaxError> {
    let entities: Vec<crate::structured::Entity> = store.resolve_entities(None).into_iter().cloned().collect();
    let facts: Vec<crate::structured::Fact> = store.all_facts().into_iter().cloned().collect();
    bincode::serde::encode_to_vec((entities, facts), bincode::config::standard())
        .map_err(|e| WaxError::encoding(format!("structured store: {e}")))
}

fn bincode_decode_structured(bytes: &[u8]) -> Result<StructuredStore, WaxError> {
    let ((entities, facts), _): ((Vec<crate::structured::Entity>, Vec<crate::structured::Fact>), usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| WaxError::decoding(format!("structured store: {e}")))?;
    let mut store = StructuredStore::new();
    for e in entities {
        store.upsert_entity(e.id, e.kind, e.display_name);
    }
    for f in facts {
        store.insert_raw_fact(f);
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::CanonicalEncoding;
    use crate::frame::FrameRole;
    use tempfile::tempdir;

    fn sample(content: &str) -> NewFrame {
        NewFrame {
            timestamp_ms: 1,
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
    fn remember_commit_close_then_reopen_readonly_sees_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.mv2s");

        let mut session = Session::open(&path, SessionMode::ReadWriteFail, None).unwrap();
        let id = session.remember(sample("hello session")).unwrap();
        session.close().unwrap();

        let session = Session::open(&path, SessionMode::ReadOnly, None).unwrap();
        assert!(session.frame_meta(id).is_some());
        assert_eq!(session.text_index().search("hello", 5)[0].0, id);
    }

    #[test]
    fn second_writer_fails_while_first_is_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.mv2s");
        let _first = Session::open(&path, SessionMode::ReadWriteFail, None).unwrap();
        let second = Session::open(&path, SessionMode::ReadWriteFail, None);
        assert!(second.is_err());
    }

    #[test]
    fn readonly_session_rejects_mutation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.mv2s");
        {
            let mut w = Session::open(&path, SessionMode::ReadWriteFail, None).unwrap();
            w.remember(sample("seed")).unwrap();
            w.close().unwrap();
        }
        let mut reader = Session::open(&path, SessionMode::ReadOnly, None).unwrap();
        assert!(reader.remember(sample("should fail")).is_err());
    }

    #[test]
    fn corrupt_vector_index_blob_rebuilds_via_cpu_engine_instead_of_failing_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.mv2s");
        {
            let session = Session::open(&path, SessionMode::ReadWriteFail, Some(3)).unwrap();
            session.close().unwrap();
        }
        std::fs::write(sibling(&path, ".vecindex"), b"MV2V\x01\x00\x02not a real cpu-graph body").unwrap();

        let _guard = crate::utils::devlog::enable_thread_sink();
        let session = Session::open(&path, SessionMode::ReadWriteFail, Some(3)).unwrap();
        assert!(session.vector_index().is_some());
        let snap = crate::utils::devlog::snapshot();
        assert!(snap.iter().any(|s| s.contains("vector index decode") && s.contains("rebuild via CPU engine")));
    }

    #[test]
    fn commit_rejects_pending_embedding_with_no_staged_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.mv2s");
        let mut session = Session::open(&path, SessionMode::ReadWriteFail, Some(2)).unwrap();
        let id = session.remember(sample("needs a vector")).unwrap();
        session.attach_embedding(id, vec![1.0, 0.0]).unwrap();

        let err = session.commit().unwrap_err();
        assert!(format!("{err}").contains("vector index must be staged"));
    }

    #[test]
    fn commit_rejects_manifest_staged_before_a_newer_embedding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.mv2s");
        let mut session = Session::open(&path, SessionMode::ReadWriteFail, Some(2)).unwrap();

        let first = session.remember(sample("first")).unwrap();
        session.attach_embedding(first, vec![1.0, 0.0]).unwrap();
        let index = session.vector_index().unwrap();
        let bytes = index.encode().unwrap();
        session.stage_vec_index_for_next_commit(bytes, 1, index.dimensions(), index.metric());

        let second = session.remember(sample("second, embedded after staging")).unwrap();
        session.attach_embedding(second, vec![0.0, 1.0]).unwrap();

        let err = session.commit().unwrap_err();
        assert!(format!("{err}").contains("vector index is stale"));
    }

    #[test]
    fn staging_the_current_pending_set_lets_commit_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.mv2s");
        let mut session = Session::open(&path, SessionMode::ReadWriteFail, Some(2)).unwrap();

        let id = session.remember(sample("ready to commit")).unwrap();
        session.attach_embedding(id, vec![1.0, 0.0]).unwrap();
        let index = session.vector_index().unwrap();
        let bytes = index.encode().unwrap();
        let vector_count = index.len() + session.pending_embedding_count();
        session.stage_vec_index_for_next_commit(bytes, vector_count, index.dimensions(), index.metric());

        session.commit().unwrap();
    }

    #[test]
    fn close_reraises_the_same_staging_error_as_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.mv2s");
        let mut session = Session::open(&path, SessionMode::ReadWriteFail, Some(2)).unwrap();
        let id = session.remember(sample("unstaged")).unwrap();
        session.attach_embedding(id, vec![1.0, 0.0]).unwrap();

        let err = session.close().unwrap_err();
        assert!(format!("{err}").contains("vector index must be staged"));
    }
}
