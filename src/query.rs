//! Query engine: coarse anchor search, member expansion, scoring, rerank.
//!
//! ```text
//! query ──embed──► q ──graph──► C anchors ──expand──► members (store ∪ segment)
//!                                                   │ metadata filters
//!                                                   ▼
//!                           reconstruct anchor + PQ residual, score
//!                                                   │ sort (score desc, id asc)
//!                                                   ▼
//!                                       optional rerank ──► top_k
//! ```
//!
//! `C = max(candidate_multiplier × top_k, min_candidate_anchors)`. Reconstruction is the
//! expensive part and runs in parallel, in chunks, so a deadline can cut it
//! short and still return what was scored.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collab::{GuardedEmbedder, GuardedReranker};
use crate::config::TimeoutPolicy;
use crate::error::{LeannError, Result};
use crate::handle::IndexHandle;
use crate::types::{DeltaRecord, ItemId, ItemMetadata};

const SCORE_CHUNK: usize = 1024;

/// What to search for.
#[derive(Debug, Clone)]
pub enum QueryInput {
    Text(String),
    Vector(Vec<f32>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryMode {
    #[default]
    Retrieve,
    Rerank,
}

/// Metadata filters, applied before reconstruction. Empty lists match all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    pub languages: Vec<String>,
    pub kinds: Vec<String>,
    /// Glob patterns; a path must match at least one.
    pub include_patterns: Vec<String>,
    /// Glob patterns (or literal paths) to drop.
    pub exclude_paths: Vec<String>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
            && self.kinds.is_empty()
            && self.include_patterns.is_empty()
            && self.exclude_paths.is_empty()
    }
}

/// One query. Unset options fall back to the generation's [`QueryConfig`].
///
/// [`QueryConfig`]: crate::config::QueryConfig
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub input: QueryInput,
    pub top_k: Option<usize>,
    pub filters: QueryFilters,
    pub mode: QueryMode,
    pub ef_search: Option<usize>,
    pub candidate_multiplier: Option<usize>,
    pub timeout: Option<Duration>,
    pub on_timeout: Option<TimeoutPolicy>,
}

impl QueryRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self::from_input(QueryInput::Text(text.into()))
    }

    pub fn vector(vector: Vec<f32>) -> Self {
        Self::from_input(QueryInput::Vector(vector))
    }

    fn from_input(input: QueryInput) -> Self {
        Self {
            input,
            top_k: None,
            filters: QueryFilters::default(),
            mode: QueryMode::Retrieve,
            ef_search: None,
            candidate_multiplier: None,
            timeout: None,
            on_timeout: None,
        }
    }

    #[must_use]
    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    #[must_use]
    pub fn filters(mut self, filters: QueryFilters) -> Self {
        self.filters = filters;
        self
    }

    #[must_use]
    pub fn rerank(mut self) -> Self {
        self.mode = QueryMode::Rerank;
        self
    }

    #[must_use]
    pub fn ef_search(mut self, ef: usize) -> Self {
        self.ef_search = Some(ef);
        self
    }

    #[must_use]
    pub fn candidate_multiplier(mut self, multiplier: usize) -> Self {
        self.candidate_multiplier = Some(multiplier);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration, policy: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self.on_timeout = Some(policy);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    pub id: ItemId,
    pub path: String,
    /// Similarity of the query to the reconstructed embedding.
    pub score: f32,
    pub rerank_score: Option<f32>,
}

/// Why a response is empty or incomplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryDiagnostic {
    /// No active generation, or it has no anchors.
    EmptyIndex,
    /// Candidates existed but the filters removed all of them.
    FilteredOut { candidates: usize },
    /// The deadline passed during `stage`; results are partial.
    TimedOut { stage: &'static str },
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub items: Vec<QueryHit>,
    pub latency: Duration,
    /// Version of the generation that answered; 0 when none was active.
    pub generation: u64,
    pub partial: bool,
    pub diagnostics: Vec<QueryDiagnostic>,
}

impl QueryResponse {
    fn empty(generation: u64, start: Instant, diagnostic: QueryDiagnostic) -> Self {
        Self {
            items: Vec::new(),
            latency: start.elapsed(),
            generation,
            partial: false,
            diagnostics: vec![diagnostic],
        }
    }

    pub fn ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|h| h.id).collect()
    }
}

struct CompiledFilter<'a> {
    languages: &'a [String],
    kinds: &'a [String],
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

fn compile_globs(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| LeannError::query(format!("invalid glob {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| LeannError::query(format!("invalid glob set: {e}")))
}

impl<'a> CompiledFilter<'a> {
    fn new(filters: &'a QueryFilters) -> Result<Self> {
        Ok(Self {
            languages: &filters.languages,
            kinds: &filters.kinds,
            include: compile_globs(&filters.include_patterns)?,
            exclude: compile_globs(&filters.exclude_paths)?,
        })
    }

    fn matches(&self, meta: &ItemMetadata) -> bool {
        fn listed(list: &[String], value: Option<&String>) -> bool {
            list.is_empty() || value.is_some_and(|v| list.iter().any(|l| l == v))
        }
        listed(self.languages, meta.language.as_ref())
            && listed(self.kinds, meta.kind.as_ref())
            && self
                .include
                .as_ref()
                .map_or(true, |set| set.is_match(&meta.path))
            && !self
                .exclude
                .as_ref()
                .is_some_and(|set| set.is_match(&meta.path))
    }
}

struct Candidate {
    id: ItemId,
    path: String,
    text: Option<String>,
    score: f32,
}

fn by_score_then_id(a: (f32, ItemId), b: (f32, ItemId)) -> Ordering {
    b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
}

/// Serves queries against whatever generation the handle points at.
#[derive(Debug, Clone)]
pub struct QueryEngine {
    handle: IndexHandle,
    embedder: Option<GuardedEmbedder>,
    reranker: Option<GuardedReranker>,
}

impl QueryEngine {
    pub fn new(handle: IndexHandle) -> Self {
        Self {
            handle,
            embedder: None,
            reranker: None,
        }
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: GuardedEmbedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: GuardedReranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn handle(&self) -> &IndexHandle {
        &self.handle
    }

    pub fn search(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let start = Instant::now();
        let Some(generation) = self.handle.snapshot() else {
            warn!("query against an empty index");
            return Ok(QueryResponse::empty(0, start, QueryDiagnostic::EmptyIndex));
        };
        let version = generation.version();
        let defaults = &generation.config().query;

        let top_k = request.top_k.unwrap_or(defaults.top_k);
        if top_k == 0 {
            return Err(LeannError::query("top_k must be at least 1"));
        }
        let multiplier = request
            .candidate_multiplier
            .unwrap_or(defaults.candidate_multiplier)
            .max(1);
        let policy = request.on_timeout.unwrap_or(defaults.on_timeout);
        let deadline = request
            .timeout
            .or(defaults.timeout_ms.map(Duration::from_millis))
            .map(|t| start + t);
        let expired = || deadline.is_some_and(|d| Instant::now() >= d);

        let filter = CompiledFilter::new(&request.filters)?;
        let rerank = request.mode == QueryMode::Rerank;
        let reranker = match (rerank, &self.reranker) {
            (false, _) => None,
            (true, Some(r)) => Some(r),
            (true, None) => return Err(LeannError::query("rerank requested without a reranker")),
        };

        if generation.anchors().is_empty() {
            warn!(version, "query against a generation with no anchors");
            return Ok(QueryResponse::empty(version, start, QueryDiagnostic::EmptyIndex));
        }

        let (raw, query_text) = match &request.input {
            QueryInput::Text(text) => {
                let embedder = self.embedder.as_ref().ok_or_else(|| {
                    LeannError::query("text query needs an embedding collaborator")
                })?;
                (embedder.embed_one(text)?, Some(text.as_str()))
            }
            QueryInput::Vector(v) => (v.clone(), None),
        };
        if reranker.is_some() && query_text.is_none() {
            return Err(LeannError::query("rerank needs a text query"));
        }
        let query = generation.prepare(raw)?;

        // 1) Coarse
        let searched = multiplier.saturating_mul(top_k).max(defaults.min_candidate_anchors);
        let ef = request
            .ef_search
            .unwrap_or_else(|| generation.config().graph.default_ef())
            .max(searched);
        let coarse = generation.search_anchors(&query, searched, ef)?;

        // 2) Expand + score
        let metric = generation.metric();
        let mut timed_out: Option<&'static str> = None;
        let mut seen = 0usize;
        let keep = if rerank {
            multiplier.saturating_mul(top_k)
        } else {
            top_k
        };

        let candidates: Vec<Candidate> = {
            let view = generation.segment().view();
            let mut members: Vec<&DeltaRecord> = Vec::new();
            let mut scored: Vec<(f32, &DeltaRecord)> = Vec::new();
            // Past the deadline, a partial query still expands until it has
            // something to score.
            let best_effort = policy == TimeoutPolicy::Partial;
            for &(anchor, _) in &coarse {
                if expired() && (!best_effort || !members.is_empty()) {
                    timed_out = Some("expand");
                    break;
                }
                let main = generation
                    .store()
                    .members(anchor)
                    .filter(|r| !view.touches(r.item_id));
                for record in main.chain(view.live_members(anchor)) {
                    seen += 1;
                    if filter.matches(&record.metadata) {
                        members.push(record);
                    }
                }
            }

            if timed_out.is_none() || best_effort {
                for (i, chunk) in members.chunks(SCORE_CHUNK).enumerate() {
                    if expired() && (!best_effort || i > 0) {
                        timed_out.get_or_insert("score");
                        break;
                    }
                    let part = chunk
                        .par_iter()
                        .map(|&r| -> Result<(f32, &DeltaRecord)> {
                            let approx = generation.reconstruct(r)?;
                            Ok((metric.similarity(&query, &approx), r))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    scored.extend(part);
                }
            }

            scored.sort_by(|a, b| by_score_then_id((a.0, a.1.item_id), (b.0, b.1.item_id)));
            scored.truncate(keep);
            scored
                .iter()
                .map(|&(score, r)| Candidate {
                    id: r.item_id,
                    path: r.metadata.path.clone(),
                    text: r.metadata.text.clone(),
                    score,
                })
                .collect()
        };

        let mut diagnostics = Vec::new();
        if candidates.is_empty() && seen > 0 && !request.filters.is_empty() && timed_out.is_none() {
            debug!(version, candidates = seen, "filters removed every candidate");
            diagnostics.push(QueryDiagnostic::FilteredOut { candidates: seen });
        }
        if let Some(stage) = timed_out {
            if policy == TimeoutPolicy::Fail {
                return Err(LeannError::Timeout {
                    operation: "query",
                    elapsed: start.elapsed(),
                });
            }
            warn!(version, stage, "query deadline passed, returning partial results");
        }

        // 3) Rerank
        let mut rerank_scores: Option<Vec<f32>> = None;
        if let (Some(reranker), Some(text), None) = (reranker, query_text, timed_out) {
            if expired() {
                if policy == TimeoutPolicy::Fail {
                    return Err(LeannError::Timeout {
                        operation: "query",
                        elapsed: start.elapsed(),
                    });
                }
                timed_out = Some("rerank");
            } else if !candidates.is_empty() {
                let docs: Vec<String> = candidates
                    .iter()
                    .map(|c| c.text.clone().unwrap_or_else(|| c.path.clone()))
                    .collect();
                match reranker.score_all(text, docs) {
                    Ok(scores) => rerank_scores = Some(scores),
                    Err(LeannError::Timeout { .. }) if policy == TimeoutPolicy::Partial => {
                        warn!(version, "rerank timed out, keeping approximate order");
                        timed_out = Some("rerank");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let mut items: Vec<QueryHit> = match rerank_scores {
            Some(scores) => {
                let mut hits: Vec<QueryHit> = candidates
                    .into_iter()
                    .zip(scores)
                    .map(|(c, r)| QueryHit {
                        id: c.id,
                        path: c.path,
                        score: c.score,
                        rerank_score: Some(r),
                    })
                    .collect();
                hits.sort_by(|a, b| {
                    let ra = a.rerank_score.unwrap_or(f32::MIN);
                    let rb = b.rerank_score.unwrap_or(f32::MIN);
                    rb.total_cmp(&ra)
                        .then_with(|| by_score_then_id((a.score, a.id), (b.score, b.id)))
                });
                hits
            }
            None => candidates
                .into_iter()
                .map(|c| QueryHit {
                    id: c.id,
                    path: c.path,
                    score: c.score,
                    rerank_score: None,
                })
                .collect(),
        };
        items.truncate(top_k);

        if let Some(stage) = timed_out {
            diagnostics.push(QueryDiagnostic::TimedOut { stage });
        }
        let latency = start.elapsed();
        debug!(
            version,
            anchors_searched = coarse.len(),
            candidates = seen,
            results = items.len(),
            latency_us = latency.as_micros() as u64,
            "query served"
        );

        Ok(QueryResponse {
            items,
            latency,
            generation: version,
            partial: timed_out.is_some(),
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &str, lang: &str) -> ItemMetadata {
        ItemMetadata::with_path(path).language(lang)
    }

    #[test]
    fn filters_combine_with_and() {
        let filters = QueryFilters {
            languages: vec!["rust".into()],
            include_patterns: vec!["src/**/*.rs".into()],
            exclude_paths: vec!["src/gen/**".into()],
            ..QueryFilters::default()
        };
        let f = CompiledFilter::new(&filters).unwrap();
        assert!(f.matches(&meta("src/lib.rs", "rust")));
        assert!(!f.matches(&meta("src/lib.rs", "python")));
        assert!(!f.matches(&meta("tests/a.rs", "rust")));
        assert!(!f.matches(&meta("src/gen/out.rs", "rust")));
    }

    #[test]
    fn missing_metadata_fails_listed_filters() {
        let filters = QueryFilters {
            kinds: vec!["function".into()],
            ..QueryFilters::default()
        };
        let f = CompiledFilter::new(&filters).unwrap();
        assert!(!f.matches(&ItemMetadata::with_path("a.rs")));
        assert!(f.matches(&ItemMetadata::with_path("a.rs").kind("function")));
    }

    #[test]
    fn malformed_glob_is_a_query_error() {
        let filters = QueryFilters {
            include_patterns: vec!["src/[".into()],
            ..QueryFilters::default()
        };
        assert!(matches!(
            CompiledFilter::new(&filters),
            Err(LeannError::Query(_))
        ));
    }

    #[test]
    fn empty_handle_reports_empty_index() {
        let engine = QueryEngine::new(IndexHandle::empty());
        let response = engine.search(&QueryRequest::vector(vec![1.0, 0.0])).unwrap();
        assert!(response.items.is_empty());
        assert_eq!(response.diagnostics, vec![QueryDiagnostic::EmptyIndex]);
        assert_eq!(response.generation, 0);
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let mut v = [(0.5f32, 9u64), (0.7, 3), (0.5, 2)];
        v.sort_by(|a, b| by_score_then_id(*a, *b));
        assert_eq!(v.iter().map(|x| x.1).collect::<Vec<_>>(), vec![3, 2, 9]);
    }
}
