//! Unified search: dispatches a query across up to four lanes (text, vector, timeline,
//! structured) in parallel, fuses the ranked lists with Reciprocal Rank Fusion, then runs an
//! answer-focused rerank pass over the head of the fused list before building previews.
//!
//! Generalized from "one index per query" to "every applicable index queried concurrently,
//! fused into one ranking" via `std::thread::scope` for bounded concurrent work.

use std::collections::{HashMap, HashSet};

use crate::frame::FrameMeta;
use crate::session::Session;

/// RRF's `k` constant: the standard choice from the original Cormack/Clarke/Buettcher paper,
/// large enough that rank 1 and rank 2 in a single lane don't dominate the fused score. Used
/// whenever a request doesn't override it via `rrf_k`.
const DEFAULT_RRF_K: f64 = 60.0;

/// Phrases that tend to belong to stale planning artifacts rather than settled answers; a preview
/// containing one of these has its post-rerank score multiplied down rather than dropped outright.
const DISTRACTOR_TERMS: [&str; 6] = ["tentative", "draft", "placeholder", "weekly report", "checklist", "signoff"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Text,
    Vector,
    Timeline,
    Structured,
}

/// Which lanes a request is willing to query. `Hybrid` without a usable `query_embedding`
/// degrades to `TextOnly` in [`search`] rather than erroring, per the unified search's
/// constraint-only/embedding-optional contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchMode {
    TextOnly,
    VectorOnly,
    Hybrid { alpha: f64 },
    Timeline,
}

/// Per-lane RRF weight override. When absent, weights are derived from `SearchRequest::mode`.
#[derive(Debug, Clone, Copy)]
pub struct LaneWeights {
    pub text: f64,
    pub vector: f64,
    pub timeline: f64,
    pub structured: f64,
}

/// Bounds a timeline-lane query; either side left `None` is unbounded on that side.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimelineFilter {
    pub since_ms: Option<u64>,
    pub until_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query_text: Option<String>,
    pub query_embedding: Option<Vec<f32>>,
    pub mode: SearchMode,
    pub top_k: usize,
    /// Overrides [`DEFAULT_RRF_K`] when set; clamped to `>= 0` during fusion.
    pub rrf_k: Option<f64>,
    /// Overrides the mode-derived per-lane weights entirely when set.
    pub weights: Option<LaneWeights>,
    /// Restricts fused results to this id set, applied after fusion and before the rerank window.
    pub frame_filter: Option<Vec<u64>>,
    /// Caps each result's `preview_text` to this many characters.
    pub preview_max_bytes: usize,
    /// Result counts at or below this threshold load each frame's metadata on demand; above it,
    /// metadata for the whole result set is prefetched into a map in one pass.
    pub metadata_loading_threshold: usize,
    /// Restricts the structured lane to facts about this entity/subject.
    pub structured_filter: Option<String>,
    pub timeline_filter: Option<TimelineFilter>,
    /// Runs the answer-focused rerank pass (term/entity/year/date bonuses, distractor penalty)
    /// over the head of the fused list. On by default; RAG context assembly can disable it when
    /// its own config says not to rerank.
    pub enable_answer_focused_ranking: bool,
    /// How many of the top fused results the rerank pass rescoring touches.
    pub answer_rerank_window: usize,
    /// Multiplicative penalty applied to a reranked result whose preview contains a distractor term.
    pub answer_distractor_penalty: f64,
}

impl SearchRequest {
    #[must_use]
    pub fn text_only(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query_text: Some(query.into()),
            query_embedding: None,
            mode: SearchMode::TextOnly,
            top_k,
            rrf_k: None,
            weights: None,
            frame_filter: None,
            preview_max_bytes: 240,
            metadata_loading_threshold: 50,
            structured_filter: None,
            timeline_filter: None,
            enable_answer_focused_ranking: true,
            answer_rerank_window: 20,
            answer_distractor_penalty: 0.70,
        }
    }

    /// Clamps `alpha` into `[0, 1]` and returns the per-lane RRF weights
    /// `(text_weight, vector_weight)` for the request's mode: text-only/vector-only/timeline
    /// modes weight their one lane at 1.0 and every other lane at 0.0; `Hybrid{alpha}` splits
    /// weight between text and vector as `(alpha, 1 - alpha)`. A `Hybrid` request with no
    /// `query_embedding` degrades to `TextOnly` weights rather than querying an empty vector lane.
    fn lane_weights_from_mode(&self) -> (f64, f64) {
        match self.mode {
            SearchMode::TextOnly => (1.0, 0.0),
            SearchMode::VectorOnly => (0.0, 1.0),
            SearchMode::Timeline => (0.0, 0.0),
            SearchMode::Hybrid { .. } if self.query_embedding.is_none() => (1.0, 0.0),
            SearchMode::Hybrid { alpha } => {
                let alpha = alpha.clamp(0.0, 1.0);
                (alpha, 1.0 - alpha)
            }
        }
    }

    /// Resolves the full four-lane weight set: an explicit `weights` override wins outright,
    /// otherwise text/vector come from the mode and timeline/structured default to 1.0.
    fn effective_weights(&self) -> LaneWeights {
        if let Some(w) = self.weights {
            return w;
        }
        let (text, vector) = self.lane_weights_from_mode();
        LaneWeights { text, vector, timeline: 1.0, structured: 1.0 }
    }

    fn since_ms(&self) -> Option<u64> {
        self.timeline_filter.and_then(|t| t.since_ms)
    }

    fn until_ms(&self) -> Option<u64> {
        self.timeline_filter.and_then(|t| t.until_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ScoredFrame {
    pub frame_id: u64,
    pub rrf_score: f64,
    pub lane_ranks: Vec<(Lane, usize)>,
    /// Lanes this frame was ranked by, deduplicated; the literal `{text, vector, timeline,
    /// structured}` source set a caller can show alongside the result.
    pub sources: Vec<Lane>,
    /// De-highlighted, length-capped preview text built from the frame's search text, used both
    /// for the rerank pass and for display.
    pub preview_text: String,
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub results: Vec<ScoredFrame>,
    pub lanes_queried: Vec<Lane>,
}

fn text_lane(session: &Session, req: &SearchRequest) -> Vec<u64> {
    let Some(query) = &req.query_text else { return Vec::new() };
    session.text_index().search(query, req.top_k * 4).into_iter().map(|(id, _)| id).collect()
}

fn vector_lane(session: &Session, req: &SearchRequest) -> Vec<u64> {
    let (Some(index), Some(embedding)) = (session.vector_index(), &req.query_embedding) else { return Vec::new() };
    index.search(embedding, req.top_k * 4).into_iter().map(|(id, _)| id).collect()
}

/// Reverse-chronological frame ids within `[since_ms, until_ms]`. Called only when the caller
/// has already established timeline eligibility (explicit `Timeline` mode, or a constraint-only
/// query); an absent bound means "unbounded on that side", not "lane disabled".
fn timeline_lane(session: &Session, req: &SearchRequest) -> Vec<u64> {
    let (since, until) = (req.since_ms(), req.until_ms());
    let mut metas: Vec<FrameMeta> = session
        .frame_metas()
        .into_iter()
        .filter(|m| since.is_none_or(|s| m.timestamp_ms >= s))
        .filter(|m| until.is_none_or(|u| m.timestamp_ms <= u))
        .collect();
    metas.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms).then_with(|| a.id.cmp(&b.id)));
    metas.truncate(req.top_k * 4);
    metas.into_iter().map(|m| m.id).collect()
}

fn structured_lane(session: &Session, req: &SearchRequest) -> Vec<u64> {
    let Some(entity) = &req.structured_filter else { return Vec::new() };
    let facts = session.structured().facts(entity, None, None);
    facts.iter().filter_map(|f| f.source_frame_id).collect()
}

fn lane_weight(lane: Lane, weights: LaneWeights) -> f64 {
    match lane {
        Lane::Text => weights.text,
        Lane::Vector => weights.vector,
        Lane::Timeline => weights.timeline,
        Lane::Structured => weights.structured,
    }
}

/// Adds `weight_L / (rrf_k + rank)` to each frame's fused score for every lane it appears in,
/// where `rank` is 1-based position within that lane's ranked list. A lane with zero weight is
/// dropped before scoring rather than contributing a zero term, so it never appears in
/// `lane_ranks`. Ties in the final ranking break by ascending frame id for determinism.
fn fuse(lanes: &[(Lane, Vec<u64>)], weights: LaneWeights, rrf_k: f64) -> Vec<ScoredFrame> {
    let mut scores: HashMap<u64, (f64, Vec<(Lane, usize)>)> = HashMap::new();
    for (lane, ids) in lanes {
        let weight = lane_weight(*lane, weights);
        if weight <= 0.0 {
            continue;
        }
        for (idx, &id) in ids.iter().enumerate() {
            let rank = idx + 1;
            let entry = scores.entry(id).or_insert((0.0, Vec::new()));
            entry.0 += weight / (rrf_k + rank as f64);
            entry.1.push((*lane, rank));
        }
    }
    let mut fused: Vec<ScoredFrame> = scores
        .into_iter()
        .map(|(frame_id, (rrf_score, lane_ranks))| {
            let mut sources: Vec<Lane> = lane_ranks.iter().map(|(l, _)| *l).collect();
            sources.sort_by_key(lane_order);
            sources.dedup();
            ScoredFrame { frame_id, rrf_score, lane_ranks, sources, preview_text: String::new() }
        })
        .collect();
    fused.sort_by(|a, b| b.rrf_score.partial_cmp(&a.rrf_score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.frame_id.cmp(&b.frame_id)));
    fused
}

fn lane_order(lane: &Lane) -> u8 {
    match lane {
        Lane::Text => 0,
        Lane::Vector => 1,
        Lane::Timeline => 2,
        Lane::Structured => 3,
    }
}

/// Strips `[`/`]` highlight markers before the rerank pass matches query terms against preview
/// text, so a previously-highlighted snippet doesn't get double credit for its own markup.
fn strip_highlight_markers(text: &str) -> String {
    text.chars().filter(|&c| c != '[' && c != ']').collect()
}

fn lowercase_terms(text: &str) -> Vec<String> {
    text.split_whitespace().map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase()).filter(|t| !t.is_empty()).collect()
}

fn term_recall_and_precision(query_terms: &[String], preview_terms: &[String]) -> (f64, f64) {
    if query_terms.is_empty() || preview_terms.is_empty() {
        return (0.0, 0.0);
    }
    let preview_set: HashSet<&str> = preview_terms.iter().map(String::as_str).collect();
    let query_set: HashSet<&str> = query_terms.iter().map(String::as_str).collect();
    let recall_hits = query_terms.iter().filter(|t| preview_set.contains(t.as_str())).count();
    let precision_hits = preview_terms.iter().filter(|t| query_set.contains(t.as_str())).count();
    (recall_hits as f64 / query_terms.len() as f64, precision_hits as f64 / preview_terms.len() as f64)
}

/// Fraction of the query's capitalized tokens (a cheap stand-in for named entities; this crate
/// has no NER model) that appear verbatim in the preview.
fn entity_coverage(query: &str, preview: &str) -> f64 {
    let entities: Vec<&str> = query.split_whitespace().filter(|t| t.chars().next().is_some_and(char::is_uppercase)).collect();
    if entities.is_empty() {
        return 0.0;
    }
    let hits = entities.iter().filter(|e| preview.contains(*e)).count();
    hits as f64 / entities.len() as f64
}

fn year_token(s: &str) -> Option<&str> {
    s.split(|c: char| !c.is_alphanumeric()).find(|tok| tok.len() == 4 && tok.chars().all(|c| c.is_ascii_digit()))
}

/// A bare `YYYY-MM-DD` token, matched verbatim between query and preview.
fn date_literal_token(s: &str) -> Option<&str> {
    s.split_whitespace().map(|tok| tok.trim_matches(|c: char| !c.is_alphanumeric() && c != '-')).find(|t| {
        t.len() == 10
            && t.as_bytes()[4] == b'-'
            && t.as_bytes()[7] == b'-'
            && t.bytes().enumerate().all(|(i, b)| if i == 4 || i == 7 { b == b'-' } else { b.is_ascii_digit() })
    })
}

/// Rescores the top `req.answer_rerank_window` fused results with answer-focused bonuses (term
/// recall/precision, entity coverage, year and date-literal matches) and a distractor penalty,
/// then re-sorts. A no-op when the request carries no query text, since every bonus needs one to
/// match against.
fn rerank_for_answer(results: &mut [ScoredFrame], query_text: Option<&str>, distractor_penalty: f64, window: usize) {
    let Some(query) = query_text else { return };
    let query_terms = lowercase_terms(query);
    let window = window.min(results.len());
    for scored in &mut results[..window] {
        let preview_terms = lowercase_terms(&scored.preview_text);
        let (recall, precision) = term_recall_and_precision(&query_terms, &preview_terms);
        let vector_influenced = scored.lane_ranks.iter().any(|(l, _)| *l == Lane::Vector);
        let entity_weight = if vector_influenced { 1.25 } else { 0.90 };
        let coverage = entity_coverage(query, &scored.preview_text);
        let year_match = matches!((year_token(query), year_token(&scored.preview_text)), (Some(a), Some(b)) if a == b);
        let date_match = matches!((date_literal_token(query), date_literal_token(&scored.preview_text)), (Some(a), Some(b)) if a == b);

        scored.rrf_score += recall * 0.80 + precision * 0.40 + coverage * entity_weight + f64::from(year_match) * 1.35 + f64::from(date_match) * 1.15;

        let lowered = scored.preview_text.to_lowercase();
        if DISTRACTOR_TERMS.iter().any(|d| lowered.contains(d)) {
            scored.rrf_score *= distractor_penalty;
        }
    }
    results.sort_by(|a, b| b.rrf_score.partial_cmp(&a.rrf_score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.frame_id.cmp(&b.frame_id)));
}

/// Builds each result's `preview_text` from the frame's indexed search text, de-highlighted and
/// capped to `preview_max_bytes` characters. Below `metadata_loading_threshold` results, each
/// frame's metadata is loaded with its own lookup; above it, metadata for the whole result set is
/// prefetched into a map in one pass over `frame_metas()` to avoid one lookup per result.
fn attach_previews(session: &Session, results: &mut [ScoredFrame], preview_max_bytes: usize, metadata_loading_threshold: usize) {
    let build_preview = |meta: Option<&FrameMeta>| -> String {
        let raw = meta.and_then(|m| m.search_text.clone()).unwrap_or_default();
        strip_highlight_markers(&raw).chars().take(preview_max_bytes).collect()
    };
    if results.len() <= metadata_loading_threshold {
        for scored in results.iter_mut() {
            scored.preview_text = build_preview(session.frame_meta(scored.frame_id));
        }
    } else {
        let prefetched: HashMap<u64, FrameMeta> = session.frame_metas().into_iter().map(|m| (m.id, m)).collect();
        for scored in results.iter_mut() {
            scored.preview_text = build_preview(prefetched.get(&scored.frame_id));
        }
    }
}

/// Runs every applicable lane concurrently, fuses the results, restricts to `frame_filter` when
/// set, builds previews, and runs the answer-focused rerank pass over the head of the list.
/// `req.mode` gates which lanes are eligible to run at all; within that, a lane with no query
/// input (e.g. no `query_embedding`) is skipped rather than run empty. `Hybrid` with no
/// `query_embedding` degrades to text-only weighting instead of erroring.
pub fn search(session: &Session, req: &SearchRequest) -> SearchResponse {
    let weights = req.effective_weights();
    if matches!(req.mode, SearchMode::Hybrid { .. }) && req.query_embedding.is_none() {
        crate::errors::Diagnostics::new("hybrid search", "text_only (no query_embedding supplied)").emit();
    }

    let text_eligible = weights.text > 0.0 && req.query_text.is_some();
    let vector_eligible = weights.vector > 0.0 && req.query_embedding.is_some() && session.vector_index().is_some();
    let constraint_only = req.query_text.is_none() && req.query_embedding.is_none();
    let timeline_eligible = matches!(req.mode, SearchMode::Timeline)
        || ((req.since_ms().is_some() || req.until_ms().is_some() || req.structured_filter.is_some())
            && constraint_only
            && !crate::utils::feature_flags::is_enabled("allow_timeline_fallback_override"));

    let mut lanes_queried = Vec::new();
    let mut lane_results: Vec<(Lane, Vec<u64>)> = Vec::new();

    std::thread::scope(|scope| {
        let text_handle = text_eligible.then(|| scope.spawn(|| text_lane(session, req)));
        let vector_handle = vector_eligible.then(|| scope.spawn(|| vector_lane(session, req)));
        let timeline_handle = timeline_eligible.then(|| scope.spawn(|| timeline_lane(session, req)));
        let structured_handle = req.structured_filter.is_some().then(|| scope.spawn(|| structured_lane(session, req)));

        if let Some(h) = text_handle {
            lane_results.push((Lane::Text, h.join().unwrap_or_default()));
            lanes_queried.push(Lane::Text);
        }
        if let Some(h) = vector_handle {
            lane_results.push((Lane::Vector, h.join().unwrap_or_default()));
            lanes_queried.push(Lane::Vector);
        }
        if let Some(h) = timeline_handle {
            lane_results.push((Lane::Timeline, h.join().unwrap_or_default()));
            lanes_queried.push(Lane::Timeline);
        }
        if let Some(h) = structured_handle {
            lane_results.push((Lane::Structured, h.join().unwrap_or_default()));
            lanes_queried.push(Lane::Structured);
        }
    });

    let rrf_k = req.rrf_k.map_or(DEFAULT_RRF_K, |k| k.max(0.0));
    let mut results = fuse(&lane_results, weights, rrf_k);
    if let Some(filter) = &req.frame_filter {
        let allowed: HashSet<u64> = filter.iter().copied().collect();
        results.retain(|r| allowed.contains(&r.frame_id));
    }
    // Rerank over a pool at least as wide as the window so a result outside the top_k can bubble
    // up into it on the strength of its answer-focused bonuses, not just its RRF score.
    results.truncate(req.top_k.max(req.answer_rerank_window));

    attach_previews(session, &mut results, req.preview_max_bytes, req.metadata_loading_threshold);
    if req.enable_answer_focused_ranking {
        rerank_for_answer(&mut results, req.query_text.as_deref(), req.answer_distractor_penalty, req.answer_rerank_window);
    }
    results.truncate(req.top_k);

    SearchResponse { results, lanes_queried }
}
