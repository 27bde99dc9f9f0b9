//! Token-budgeted RAG context assembly on top of unified search: rerank, expand the top result
//! in full, fold in tiered surrogates for follow-up results, then fill remaining budget with
//! previews-as-snippets, assembled in a deterministic order within `max_context_tokens`.

use crate::frame::{FrameMeta, FrameStatus};
use crate::search::{LaneWeights, SearchMode, SearchRequest, SearchResponse, search};
use crate::session::Session;

/// `fast` skips the surrogate tier entirely; `dense_cached` also fills it for follow-up results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RagMode {
    Fast,
    DenseCached,
}

/// How a surrogate's tier (full/gist/micro) is chosen from its source frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierPolicy {
    /// Every surrogate gets the `Full` tier.
    Disabled,
    /// Tier falls off with frame age.
    AgeOnly,
    /// Tier follows the frame's `access_score` metadata field.
    Importance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SurrogateTier {
    Micro,
    Gist,
    Full,
}

impl SurrogateTier {
    fn upgraded(self) -> Self {
        match self {
            Self::Micro => Self::Gist,
            Self::Gist | Self::Full => Self::Full,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Full => "surrogate:full",
            Self::Gist => "surrogate:gist",
            Self::Micro => "surrogate:micro",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub mode: RagMode,
    /// Hard upper bound on the assembled context's total estimated tokens.
    pub max_context_tokens: usize,
    /// Token budget for the first-result expansion.
    pub expansion_max_tokens: usize,
    /// Byte cap on the expansion payload; whichever of this or `expansion_max_tokens` binds first wins.
    pub expansion_max_bytes: usize,
    /// Per-snippet token cap.
    pub snippet_max_tokens: usize,
    /// Snippet count cap.
    pub max_snippets: usize,
    /// Per-surrogate token cap (at the `Full` tier; lower tiers scale down from it).
    pub surrogate_max_tokens: usize,
    /// Surrogate count cap, only consulted in `DenseCached` mode.
    pub max_surrogates: usize,
    /// Candidates to fetch from unified search.
    pub search_top_k: usize,
    /// Fed through to the unified search request.
    pub search_mode: SearchMode,
    /// RRF constant fed through to unified search; clamped to `>= 0`.
    pub rrf_k: f64,
    pub enable_answer_focused_ranking: bool,
    pub answer_rerank_window: usize,
    pub answer_distractor_penalty: f64,
    pub tier_policy: TierPolicy,
    /// Bumps a surrogate up one tier when the query contains a quoted phrase or capitalized
    /// token matching its content.
    pub enable_query_aware_tier_selection: bool,
    /// Overrides the wall clock for age-based tiering and for test determinism.
    pub deterministic_now_ms: Option<u64>,
    /// Characters used when extracting preview text for snippets.
    pub preview_max_bytes: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            mode: RagMode::Fast,
            max_context_tokens: 2000,
            expansion_max_tokens: 800,
            expansion_max_bytes: 4000,
            snippet_max_tokens: 120,
            max_snippets: 8,
            surrogate_max_tokens: 300,
            max_surrogates: 4,
            search_top_k: 40,
            search_mode: SearchMode::TextOnly,
            rrf_k: 60.0,
            enable_answer_focused_ranking: true,
            answer_rerank_window: 20,
            answer_distractor_penalty: 0.70,
            tier_policy: TierPolicy::AgeOnly,
            enable_query_aware_tier_selection: true,
            deterministic_now_ms: None,
            preview_max_bytes: 240,
        }
    }
}

impl RagConfig {
    /// Clamps into sane ranges rather than rejecting outright: `max_context_tokens` of 0 would
    /// silently produce an empty context, so it's floored; `expansion_max_tokens` can't exceed
    /// the overall budget; `rrf_k` and `answer_distractor_penalty` can't go negative.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.max_context_tokens = self.max_context_tokens.max(64);
        self.expansion_max_tokens = self.expansion_max_tokens.min(self.max_context_tokens);
        self.expansion_max_bytes = self.expansion_max_bytes.max(16);
        self.snippet_max_tokens = self.snippet_max_tokens.max(8);
        self.surrogate_max_tokens = self.surrogate_max_tokens.max(8);
        self.search_top_k = self.search_top_k.clamp(1, 500);
        self.rrf_k = self.rrf_k.max(0.0);
        self.answer_distractor_penalty = self.answer_distractor_penalty.max(0.0);
        self.preview_max_bytes = self.preview_max_bytes.max(16);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RagContextItem {
    pub kind: String,
    pub frame_id: u64,
    pub score: f64,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct RagContext {
    pub items: Vec<RagContextItem>,
    pub total_tokens_estimate: usize,
    pub truncated: bool,
}

fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4).max(1)
}

fn now_ms(config: &RagConfig) -> u64 {
    config.deterministic_now_ms.unwrap_or_else(|| {
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    })
}

/// A query counts as carrying a specific signal when it has a quoted phrase or a capitalized
/// token, the two query-aware tier-upgrade triggers named in the surrogate tiering rules.
fn query_specific_tokens(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut in_quote = false;
    let mut current = String::new();
    for c in query.chars() {
        if c == '"' {
            if in_quote && !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            in_quote = !in_quote;
        } else if in_quote {
            current.push(c);
        }
    }
    tokens.extend(query.split_whitespace().filter(|t| t.chars().next().is_some_and(char::is_uppercase)).map(str::to_string));
    tokens
}

fn access_score(meta: &FrameMeta) -> f64 {
    meta.metadata.get("access_score").and_then(serde_json::Value::as_f64).unwrap_or(0.0)
}

fn tier_for_surrogate(config: &RagConfig, meta: &FrameMeta, now: u64) -> SurrogateTier {
    match config.tier_policy {
        TierPolicy::Disabled => SurrogateTier::Full,
        TierPolicy::AgeOnly => {
            let age_ms = now.saturating_sub(meta.timestamp_ms);
            if age_ms < 7 * 86_400_000 {
                SurrogateTier::Full
            } else if age_ms < 30 * 86_400_000 {
                SurrogateTier::Gist
            } else {
                SurrogateTier::Micro
            }
        }
        TierPolicy::Importance => {
            let score = access_score(meta);
            if score > 0.6 {
                SurrogateTier::Full
            } else if score > 0.3 {
                SurrogateTier::Gist
            } else {
                SurrogateTier::Micro
            }
        }
    }
}

fn tier_text(content: &str, tier: SurrogateTier, surrogate_max_tokens: usize) -> String {
    let char_budget = match tier {
        SurrogateTier::Full => surrogate_max_tokens * 4,
        SurrogateTier::Gist => (surrogate_max_tokens * 4) / 2,
        SurrogateTier::Micro => (surrogate_max_tokens * 4) / 6,
    };
    content.chars().take(char_budget.max(16)).collect()
}

/// Follows a frame's `superseded_by` chain to the latest still-active version, since stale
/// superseded content should never be surfaced as current context.
fn resolve_to_latest(session: &Session, mut meta: FrameMeta) -> FrameMeta {
    let mut hops = 0;
    while meta.status == FrameStatus::Superseded {
        let Some(next_id) = meta.superseded_by else { break };
        let Some(next) = session.frame_meta(next_id) else { break };
        meta = next.clone();
        hops += 1;
        if hops > 64 {
            break; // guards against a malformed cycle; well-formed chains never loop.
        }
    }
    meta
}

/// "Where"/"when"/"who owns" style queries: when the preview looks like it holds the answer,
/// the snippet tier upgrades to full content rather than staying preview-only.
fn has_location_date_or_ownership_intent(query: &str) -> bool {
    let lowered = query.to_lowercase();
    ["where", "when", "who owns", "owned by", "location", "date"].iter().any(|kw| lowered.contains(kw))
}

fn search_request_for_rag(caller: &SearchRequest, config: &RagConfig) -> SearchRequest {
    SearchRequest {
        mode: config.search_mode,
        top_k: config.search_top_k,
        rrf_k: Some(config.rrf_k),
        weights: caller.weights.or(Some(LaneWeights {
            text: if matches!(config.search_mode, SearchMode::TextOnly) { 1.0 } else { 0.5 },
            vector: if matches!(config.search_mode, SearchMode::VectorOnly) { 1.0 } else { 0.5 },
            timeline: 1.0,
            structured: 1.0,
        })),
        enable_answer_focused_ranking: config.enable_answer_focused_ranking,
        answer_rerank_window: config.answer_rerank_window,
        answer_distractor_penalty: config.answer_distractor_penalty,
        preview_max_bytes: config.preview_max_bytes,
        ..caller.clone()
    }
}

pub fn assemble_context(session: &mut Session, req: &SearchRequest, config: &RagConfig) -> Result<RagContext, crate::errors::WaxError> {
    let config = config.clone().clamped();
    let now = now_ms(&config);
    let query = req.query_text.clone();

    let search_req = search_request_for_rag(req, &config);
    let response: SearchResponse = search(session, &search_req);

    let mut candidates: Vec<(FrameMeta, f64, String)> = Vec::new();
    for scored in &response.results {
        let Some(meta) = session.frame_meta(scored.frame_id).cloned() else { continue };
        let meta = resolve_to_latest(session, meta);
        if meta.status == FrameStatus::Deleted {
            continue;
        }
        candidates.push((meta, scored.rrf_score, scored.preview_text.clone()));
    }
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.id.cmp(&b.0.id)));
    candidates.dedup_by_key(|(meta, ..)| meta.id);

    let mut items = Vec::new();
    let mut total_tokens = 0usize;
    let mut truncated = false;
    let mut used_ids: std::collections::HashSet<u64> = std::collections::HashSet::new();

    let push_item = |items: &mut Vec<RagContextItem>, total_tokens: &mut usize, truncated: &mut bool, item: RagContextItem| -> bool {
        let tokens = estimate_tokens(&item.text);
        if *total_tokens + tokens > config.max_context_tokens {
            *truncated = true;
            return false;
        }
        *total_tokens += tokens;
        items.push(item);
        true
    };

    // Expansion: the highest-ranked candidate, full content, capped by whichever of
    // expansion_max_tokens/expansion_max_bytes binds first.
    let mut rest = candidates.into_iter();
    if let Some((meta, score, _)) = rest.next() {
        if let Some(bytes) = session.frame_content(meta.id)? {
            let text_full = String::from_utf8_lossy(&bytes).to_string();
            let token_char_budget = config.expansion_max_tokens * 4;
            let char_budget = token_char_budget.min(config.expansion_max_bytes);
            let text: String = text_full.chars().take(char_budget).collect();
            used_ids.insert(meta.id);
            push_item(&mut items, &mut total_tokens, &mut truncated, RagContextItem { kind: "expansion".into(), frame_id: meta.id, score, text });
        }
    }
    let remaining: Vec<(FrameMeta, f64, String)> = rest.collect();

    // Surrogates: dense_cached only, up to max_surrogates follow-up results, tiered by policy
    // and optionally bumped a tier by the query-aware check.
    let mut surrogate_budget = config.max_surrogates;
    let query_tokens = query.as_deref().map(query_specific_tokens).unwrap_or_default();
    let mut surrogate_ids: std::collections::HashSet<u64> = std::collections::HashSet::new();
    if config.mode == RagMode::DenseCached {
        for (meta, score, _preview) in &remaining {
            if surrogate_budget == 0 {
                truncated = true;
                break;
            }
            let Some(bytes) = session.frame_content(meta.id)? else { continue };
            let content = String::from_utf8_lossy(&bytes).to_string();
            let mut tier = tier_for_surrogate(&config, meta, now);
            if config.enable_query_aware_tier_selection && query_tokens.iter().any(|t| content.contains(t.as_str())) {
                tier = tier.upgraded();
            }
            let text = tier_text(&content, tier, config.surrogate_max_tokens);
            let item = RagContextItem { kind: tier.label().into(), frame_id: meta.id, score: *score, text };
            if !push_item(&mut items, &mut total_tokens, &mut truncated, item) {
                break;
            }
            used_ids.insert(meta.id);
            surrogate_ids.insert(meta.id);
            surrogate_budget -= 1;
        }
    }

    // Snippets: remaining budget, preview-based, excluding expansion/surrogate frame ids;
    // location/date/ownership-intent queries upgrade a snippet to full content.
    let intent_upgrade = query.as_deref().is_some_and(has_location_date_or_ownership_intent);
    let mut snippet_budget = config.max_snippets;
    for (meta, score, preview) in &remaining {
        if used_ids.contains(&meta.id) || surrogate_ids.contains(&meta.id) {
            continue;
        }
        if snippet_budget == 0 {
            truncated = true;
            break;
        }
        let source_text = if intent_upgrade {
            session.frame_content(meta.id)?.map(|b| String::from_utf8_lossy(&b).to_string()).unwrap_or_else(|| preview.clone())
        } else {
            preview.clone()
        };
        let char_budget = config.snippet_max_tokens * 4;
        let text: String = source_text.chars().take(char_budget).collect();
        let item = RagContextItem { kind: "snippet".into(), frame_id: meta.id, score: *score, text };
        if !push_item(&mut items, &mut total_tokens, &mut truncated, item) {
            break;
        }
        used_ids.insert(meta.id);
        snippet_budget -= 1;
    }
    Ok(RagContext { items, total_tokens_estimate: total_tokens, truncated })
}
