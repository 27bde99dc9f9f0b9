//! End-to-end scenarios driving the public surface (`Orchestrator`, `Session`, `search`)
//! the way a real caller would: open a container, mutate it, reopen it, and check what
//! survives.

use std::io::{Seek, SeekFrom, Write};

use wax::compressor::CanonicalEncoding;
use wax::frame::{FrameRole, FrameStatus, NewFrame};
use wax::orchestrator::Orchestrator;
use wax::rag::RagConfig;
use wax::search::SearchRequest;
use wax::session::{Session, SessionMode};
use wax::structured::FactValue;

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
fn remember_recall_flush_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.mv2s");

    {
        let orchestrator = Orchestrator::open(&path, SessionMode::ReadWriteFail, None).unwrap();
        orchestrator.remember("the launch window opens Tuesday", FrameRole::Document, "note").unwrap();
        orchestrator.remember("unrelated chatter about lunch", FrameRole::Document, "note").unwrap();
        orchestrator.flush().unwrap();
        let response = orchestrator.recall(SearchRequest::text_only("launch window", 5));
        assert_eq!(response.results[0].frame_id, 1);
    }

    let orchestrator = Orchestrator::open(&path, SessionMode::ReadOnly, None).unwrap();
    assert_eq!(orchestrator.frame_metas().len(), 2);
    let response = orchestrator.recall(SearchRequest::text_only("launch window", 5));
    assert_eq!(response.results[0].frame_id, 1);
}

/// Scenario: dual-header corruption fallback. Two commits land in alternating header slots
/// (the active slot flips each commit); corrupting the now-stale slot must not affect the
/// surviving, still-valid generation.
#[test]
fn dual_header_corruption_falls_back_to_surviving_slot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.mv2s");

    {
        let mut session = Session::open(&path, SessionMode::ReadWriteFail, None).unwrap();
        session.remember(sample("first generation")).unwrap();
        session.commit().unwrap();
        session.remember(sample("second generation")).unwrap();
        session.commit().unwrap();
        session.close().unwrap();
    }

    // The first commit wrote header slot 1 (the flip target from the initial slot 0); the
    // second commit flipped back to slot 0, leaving slot 1's page stale. Zero it out to
    // simulate that page being torn or corrupted after it stopped being the active slot.
    let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(4096)).unwrap();
    file.write_all(&[0u8; 4096]).unwrap();
    drop(file);

    let session = Session::open(&path, SessionMode::ReadOnly, None).unwrap();
    let metas = session.frame_metas();
    assert_eq!(metas.len(), 2);
    assert!(metas.iter().all(|m| m.status == FrameStatus::Active));
}

#[test]
fn hybrid_search_degrades_to_text_only_when_embedding_missing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.mv2s");
    let orchestrator = Orchestrator::open(&path, SessionMode::ReadWriteFail, None).unwrap();
    orchestrator.remember("hybrid search fallback text", FrameRole::Document, "note").unwrap();
    orchestrator.flush().unwrap();

    // No vector index was configured (vector_dimensions: None) and no query_embedding is
    // supplied; hybrid mode must degrade to text-only rather than erroring.
    let req = SearchRequest { mode: wax::search::SearchMode::Hybrid { alpha: 0.5 }, ..SearchRequest::text_only("fallback", 5) };
    let response = orchestrator.recall(req);
    assert_eq!(response.results.len(), 1);
    assert!(!response.lanes_queried.contains(&wax::search::Lane::Vector));
}

#[test]
fn structured_facts_are_bitemporal_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.mv2s");

    {
        let orchestrator = Orchestrator::open(&path, SessionMode::ReadWriteFail, None).unwrap();
        orchestrator.upsert_entity("agent:alice", "agent", "Alice");
        orchestrator.assert_fact("agent:alice", "status", FactValue::Text("onboarding".into()), 100, None).unwrap();
        orchestrator.assert_fact("agent:alice", "status", FactValue::Text("active".into()), 200, None).unwrap();
        orchestrator.flush().unwrap();
    }

    let orchestrator = Orchestrator::open(&path, SessionMode::ReadOnly, None).unwrap();
    let past = orchestrator.facts("agent:alice", Some("status".into()), Some(150));
    assert_eq!(past[0].value, FactValue::Text("onboarding".into()));
    let current = orchestrator.facts("agent:alice", Some("status".into()), None);
    assert_eq!(current[0].value, FactValue::Text("active".into()));
}

#[test]
fn rag_context_stays_within_token_budget() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.mv2s");
    let orchestrator = Orchestrator::open(&path, SessionMode::ReadWriteFail, None).unwrap();
    for i in 0..20 {
        orchestrator.remember(format!("note number {i} about the quarterly roadmap"), FrameRole::Document, "note").unwrap();
    }
    orchestrator.flush().unwrap();

    let config = RagConfig { max_context_tokens: 64, ..RagConfig::default() };
    let req = SearchRequest::text_only("roadmap", 20);
    let context = orchestrator.recall_context(req, config).unwrap();
    assert!(context.total_tokens_estimate <= 64);
    assert!(!context.items.is_empty());
}

/// A writer lease held by one `Orchestrator` must block a second writer on the same path.
#[test]
fn second_writer_is_rejected_while_first_session_is_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.mv2s");
    let _first = Orchestrator::open(&path, SessionMode::ReadWriteFail, None).unwrap();
    let second = Orchestrator::open(&path, SessionMode::ReadWriteFail, None);
    assert!(second.is_err());
}
