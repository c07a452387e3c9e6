//! Context assembly — the core algorithm.
//!
//! Given a query and a token budget, selects and orders chunks and summaries
//! into a bounded, provenance-tagged bundle:
//!
//! 1. Embed the query with the same model used for indexing
//! 2. Retrieve up to `top_k` candidate chunks scoped to the project
//! 3. Score each candidate: similarity + recency + hot-path + conversation
//! 4. Greedy selection in priority order; a candidate larger than the whole
//!    budget is skipped, and the first one past the *remaining* budget ends
//!    selection with its largest whole-line prefix kept, so a larger budget
//!    only ever extends the selection
//! 5. Backfill remaining budget with summaries, file → directory → project
//! 6. Trim the last backfilled piece at a line boundary, never mid-token
//!
//! Assembly is deterministic: an identical candidate set, budget and
//! hot-path list always produces an identical ordered bundle. The assembler
//! never mutates chunk, summary, or embedding state.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};

use crate::cache::{CachedPiece, HotWindowCache};
use crate::config::Config;
use crate::db::Db;
use crate::db::chunks::fingerprint;
use crate::db::index::IndexFilter;
use crate::db::models::{ChunkKind, SummaryLevel};
use crate::embedder::Embedder;
use crate::error::{EngineError, Result};
use crate::session::SessionRegistry;
use crate::tokenizer::TokenizerRegistry;

/// Warning set when the budget cannot fit even the smallest candidate.
pub const WARN_BUDGET_TOO_SMALL: &str = "token budget below smallest available chunk";
/// Warning set when a hot-window entry failed fingerprint revalidation.
pub const WARN_CACHE_INVALIDATED: &str = "hot-window entry invalidated after fingerprint mismatch";

/// One unit placed into an assembled bundle.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPiece {
    pub uid: String,
    pub source_path: String,
    pub token_count: usize,
    pub score: f64,
    pub rank: usize,
    pub kind: PieceKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PieceKind {
    Chunk,
    Summary,
}

/// The request-scoped assembled result, immutable once returned.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub session_id: Option<String>,
    pub project_id: String,
    pub token_budget: usize,
    pub tokens_used: usize,
    pub pieces: Vec<ContextPiece>,
    pub warnings: Vec<String>,
    /// How many pieces were revalidated out of the hot window.
    pub cache_hits: usize,
    pub created_at: DateTime<Utc>,
}

impl ContextBundle {
    /// Uids of every piece, in rank order. Feeds provenance records.
    #[must_use]
    pub fn piece_uids(&self) -> Vec<String> {
        self.pieces.iter().map(|p| p.uid.clone()).collect()
    }

    /// The bundle rendered as prompt context, pieces in rank order.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for piece in &self.pieces {
            out.push_str(&format!("=== {} ===\n", piece.source_path));
            out.push_str(&piece.text);
            if !piece.text.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// Parameters for one assembly call.
#[derive(Debug, Clone)]
pub struct AssembleParams<'a> {
    pub query: &'a str,
    pub project_id: &'a str,
    pub token_budget: usize,
    pub hot_paths: &'a [String],
    pub session_id: Option<&'a str>,
    /// Candidate pool override; `None` uses the configured top-k (500).
    pub top_k: Option<usize>,
    /// Which summary levels to backfill with, in order.
    pub summary_levels: &'a [SummaryLevel],
}

/// Default backfill order.
pub const ALL_SUMMARY_LEVELS: [SummaryLevel; 3] = [
    SummaryLevel::File,
    SummaryLevel::Directory,
    SummaryLevel::Project,
];

struct Candidate {
    uid: String,
    source_path: String,
    token_count: usize,
    score: f64,
    created_at: DateTime<Utc>,
    text: String,
}

/// Read-mostly, stateless assembler; safe to share across concurrent
/// requests against the same project.
pub struct Assembler {
    db: Arc<TokioMutex<Db>>,
    embedder: Arc<dyn Embedder>,
    tokenizers: Arc<TokenizerRegistry>,
    sessions: Arc<SessionRegistry>,
    cache: Arc<HotWindowCache>,
    config: Arc<Config>,
}

impl Assembler {
    pub fn new(
        db: Arc<TokioMutex<Db>>,
        embedder: Arc<dyn Embedder>,
        tokenizers: Arc<TokenizerRegistry>,
        sessions: Arc<SessionRegistry>,
        cache: Arc<HotWindowCache>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            embedder,
            tokenizers,
            sessions,
            cache,
            config,
        }
    }

    /// Assemble a context bundle for `params.query`.
    ///
    /// An empty corpus yields a bundle with zero pieces; a budget smaller
    /// than the smallest candidate yields zero pieces plus a warning flag.
    /// Neither is an error.
    pub async fn assemble(&self, params: &AssembleParams<'_>) -> Result<ContextBundle> {
        let cfg = &self.config.assembly;
        let effective_budget = params.token_budget.saturating_sub(cfg.safety_margin);
        let now = Utc::now();

        let mut warnings = Vec::new();
        let mut cache_hits = 0usize;

        // Conversation boost inputs from the session, when one is supplied
        let conversation_uids: HashSet<String> = match params.session_id {
            Some(id) => self
                .sessions
                .get(id)?
                .recent_chunk_uids()
                .into_iter()
                .collect(),
            None => HashSet::new(),
        };

        let mut cached_pieces: HashMap<String, CachedPiece> = HashMap::new();
        if let Some(session_id) = params.session_id {
            if let Some(window) = self.cache.lookup(session_id, params.project_id) {
                for piece in &window.pieces {
                    cached_pieces.insert(piece.uid.clone(), piece.clone());
                }
            }
        }

        let query_vector = self
            .embedder
            .embed(params.query)
            .map_err(|e| EngineError::Embedder(e.to_string()))?;

        let hot_paths: HashSet<&str> = params.hot_paths.iter().map(String::as_str).collect();
        let top_k = params.top_k.unwrap_or(cfg.top_k);

        let mut candidates = Vec::new();
        let mut smallest_candidate: Option<usize> = None;

        {
            let db = self.db.lock().await;
            let hits = db.knn_query(
                &query_vector,
                params.project_id,
                top_k,
                IndexFilter {
                    kind: None,
                    exclude_kind: Some(ChunkKind::Summary.as_str()),
                },
            )?;

            for hit in hits {
                // Irrelevant chunks stay out even when budget would allow them
                if hit.score < cfg.min_similarity {
                    continue;
                }
                let record = match db.get_chunk(&hit.item_uid) {
                    Ok(record) => record,
                    // Index can briefly lead the chunk store during
                    // concurrent re-ingestion; a missing row is a skip
                    Err(EngineError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                let Some(content) = record.content else {
                    continue; // binary artifacts are excluded from retrieval
                };

                let (text, from_cache) = match cached_pieces.get(&record.chunk_uid) {
                    Some(cached) if cached.fingerprint == record.fingerprint => {
                        (cached.text.clone(), true)
                    }
                    Some(_) => {
                        // Stale hot window: self-heal by invalidation
                        let inconsistency =
                            EngineError::CacheInconsistency(record.chunk_uid.clone());
                        warn!(
                            "{inconsistency} in project {}; invalidating the window",
                            params.project_id
                        );
                        if let Some(session_id) = params.session_id {
                            self.cache.invalidate(session_id, params.project_id);
                        }
                        cached_pieces.clear();
                        if !warnings.iter().any(|w| w == WARN_CACHE_INVALIDATED) {
                            warnings.push(WARN_CACHE_INVALIDATED.to_string());
                        }
                        (content, false)
                    }
                    None => (content, false),
                };
                if from_cache {
                    cache_hits += 1;
                }

                let age_secs = (now - record.created_at).num_seconds().max(0);
                let recency = if cfg.recency_window_secs > 0 {
                    (1.0 - age_secs as f64 / cfg.recency_window_secs as f64).max(0.0)
                } else {
                    0.0
                };
                let hot = if hot_paths.contains(record.source_path.as_str()) {
                    1.0
                } else {
                    0.0
                };
                let conversation = if conversation_uids.contains(&record.chunk_uid) {
                    1.0
                } else {
                    0.0
                };

                let score = cfg.similarity_weight * hit.score
                    + cfg.recency_weight * recency
                    + cfg.hot_path_weight * hot
                    + cfg.conversation_weight * conversation;

                smallest_candidate = Some(match smallest_candidate {
                    Some(min) => min.min(record.token_count),
                    None => record.token_count,
                });

                candidates.push(Candidate {
                    uid: record.chunk_uid,
                    source_path: record.source_path,
                    token_count: record.token_count,
                    score,
                    created_at: record.created_at,
                    text,
                });
            }
        }

        // Deterministic priority order: score, then recency, then uid
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.uid.cmp(&b.uid))
        });

        // Greedy selection. A candidate too large for the whole budget is
        // skipped and the scan continues; the first candidate past the
        // *remaining* budget ends chunk selection, keeping its largest
        // whole-line prefix. Growing the budget can therefore only extend
        // the selection, never swap it.
        let mut pieces = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut tokens_used = 0usize;
        let mut trimmed_chunk: Option<String> = None;

        for candidate in candidates {
            if seen.contains(&candidate.uid) {
                continue;
            }
            if candidate.token_count > effective_budget {
                continue;
            }
            let remaining = effective_budget - tokens_used;
            if candidate.token_count > remaining {
                if let Some((trimmed, trimmed_tokens)) =
                    self.trim_to_fit(&candidate.text, remaining)?
                {
                    tokens_used += trimmed_tokens;
                    seen.insert(candidate.uid.clone());
                    trimmed_chunk = Some(candidate.uid.clone());
                    pieces.push(ContextPiece {
                        uid: candidate.uid,
                        source_path: candidate.source_path,
                        token_count: trimmed_tokens,
                        score: candidate.score,
                        rank: 0,
                        kind: PieceKind::Chunk,
                        text: trimmed,
                    });
                }
                break;
            }
            tokens_used += candidate.token_count;
            seen.insert(candidate.uid.clone());
            pieces.push(ContextPiece {
                uid: candidate.uid,
                source_path: candidate.source_path,
                token_count: candidate.token_count,
                score: candidate.score,
                rank: 0,
                kind: PieceKind::Chunk,
                text: candidate.text,
            });
        }

        if pieces.is_empty() {
            if let Some(smallest) = smallest_candidate {
                if effective_budget < smallest {
                    warnings.push(WARN_BUDGET_TOO_SMALL.to_string());
                }
            }
        }

        // Backfill with summaries until the budget is met or levels exhaust
        self.backfill_summaries(
            params,
            effective_budget,
            &mut pieces,
            &mut seen,
            &mut tokens_used,
        )
        .await?;

        for (rank, piece) in pieces.iter_mut().enumerate() {
            piece.rank = rank;
        }

        if let Some(session_id) = params.session_id {
            // Only whole chunk pieces are revalidatable on a later lookup;
            // summaries re-enter through backfill and a trimmed chunk's
            // fingerprint no longer matches its store row
            let cached: Vec<CachedPiece> = pieces
                .iter()
                .filter(|p| {
                    p.kind == PieceKind::Chunk
                        && trimmed_chunk.as_deref() != Some(p.uid.as_str())
                })
                .map(|p| CachedPiece {
                    uid: p.uid.clone(),
                    fingerprint: fingerprint(&p.text),
                    text: p.text.clone(),
                    token_count: p.token_count,
                })
                .collect();
            self.cache.store(session_id, params.project_id, cached);
        }

        debug_assert!(tokens_used <= effective_budget);
        debug!(
            "Assembled {} pieces ({tokens_used} tokens) for project {}",
            pieces.len(),
            params.project_id
        );

        Ok(ContextBundle {
            session_id: params.session_id.map(str::to_string),
            project_id: params.project_id.to_string(),
            token_budget: params.token_budget,
            tokens_used,
            pieces,
            warnings,
            cache_hits,
            created_at: now,
        })
    }

    async fn backfill_summaries(
        &self,
        params: &AssembleParams<'_>,
        effective_budget: usize,
        pieces: &mut Vec<ContextPiece>,
        seen: &mut HashSet<String>,
        tokens_used: &mut usize,
    ) -> Result<()> {
        let db = self.db.lock().await;
        for level in params.summary_levels {
            let summaries = db.latest_summaries(params.project_id, *level)?;
            for summary in summaries {
                if seen.contains(&summary.summary_uid) {
                    continue;
                }
                let remaining = effective_budget.saturating_sub(*tokens_used);
                if remaining == 0 {
                    return Ok(());
                }

                if summary.token_count <= remaining {
                    *tokens_used += summary.token_count;
                    seen.insert(summary.summary_uid.clone());
                    pieces.push(ContextPiece {
                        uid: summary.summary_uid,
                        source_path: summary.scope_path,
                        token_count: summary.token_count,
                        score: 0.0,
                        rank: 0,
                        kind: PieceKind::Summary,
                        text: summary.content,
                    });
                    continue;
                }

                // The last piece that only partially fits is trimmed at a
                // line boundary, never mid-token
                if let Some((trimmed, trimmed_tokens)) =
                    self.trim_to_fit(&summary.content, remaining)?
                {
                    *tokens_used += trimmed_tokens;
                    seen.insert(summary.summary_uid.clone());
                    pieces.push(ContextPiece {
                        uid: summary.summary_uid,
                        source_path: summary.scope_path,
                        token_count: trimmed_tokens,
                        score: 0.0,
                        rank: 0,
                        kind: PieceKind::Summary,
                        text: trimmed,
                    });
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Largest whole-line prefix of `text` that fits in `max_tokens`.
    fn trim_to_fit(&self, text: &str, max_tokens: usize) -> Result<Option<(String, usize)>> {
        let model_id = &self.config.model.name;
        let mut kept = String::new();
        let mut tokens = 0usize;
        for line in text.split_inclusive('\n') {
            let line_tokens = self.tokenizers.count_tokens(line, model_id)?;
            if tokens + line_tokens > max_tokens {
                break;
            }
            kept.push_str(line);
            tokens += line_tokens;
        }
        if kept.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some((kept, tokens)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewChunk, NewSummary};
    use crate::embedder::EmbedderError;

    /// Embeds text onto a fixed axis per keyword so similarity is exact and
    /// controllable in tests.
    struct KeywordEmbedder;

    const KEYWORDS: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

    impl Embedder for KeywordEmbedder {
        fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedderError> {
            let mut v = vec![0.0f32; 8];
            for (axis, kw) in KEYWORDS.iter().enumerate() {
                if text.contains(kw) {
                    v[axis] = 1.0;
                }
            }
            if v.iter().all(|x| *x == 0.0) {
                v[7] = 1.0;
            }
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            Ok(v.into_iter().map(|x| x / norm).collect())
        }

        fn embed_batch(&self, texts: &[&str]) -> std::result::Result<Vec<Vec<f32>>, EmbedderError> {
            texts.iter().map(|t| self.embed(t)).collect()
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    struct Fixture {
        assembler: Assembler,
        db: Arc<TokioMutex<Db>>,
        sessions: Arc<SessionRegistry>,
        cache: Arc<HotWindowCache>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(Config::default());
        let db = Arc::new(TokioMutex::new(Db::open_in_memory(8).unwrap()));
        let sessions = Arc::new(SessionRegistry::new(3_600));
        let cache = Arc::new(HotWindowCache::new(8, 3_600));
        let assembler = Assembler::new(
            db.clone(),
            Arc::new(KeywordEmbedder),
            Arc::new(TokenizerRegistry::with_builtin_families()),
            sessions.clone(),
            cache.clone(),
            config,
        );
        Fixture {
            assembler,
            db,
            sessions,
            cache,
        }
    }

    /// Insert a chunk with a forced token count and index its embedding.
    async fn seed_chunk(
        db: &Arc<TokioMutex<Db>>,
        project: &str,
        path: &str,
        offset: usize,
        text: &str,
        tokens: usize,
    ) -> String {
        let mut db = db.lock().await;
        let record = db
            .put_chunk(
                &NewChunk {
                    project_id: project,
                    source_path: path,
                    byte_offset: offset,
                    token_count: tokens,
                    kind: ChunkKind::Code,
                    content: Some(text),
                },
                8_000,
            )
            .unwrap();
        let vector = KeywordEmbedder.embed(text).unwrap();
        db.index_vector(&record.chunk_uid, &vector, project, "code")
            .unwrap();
        record.chunk_uid
    }

    async fn seed_summary(
        db: &Arc<TokioMutex<Db>>,
        project: &str,
        scope: &str,
        level: SummaryLevel,
        text: &str,
        tokens: usize,
    ) -> String {
        let mut db = db.lock().await;
        let record = db
            .insert_summary(&NewSummary {
                project_id: project,
                scope_path: scope,
                level,
                content: text,
                token_count: tokens,
                source_chunk_uids: &[],
            })
            .unwrap();
        record.summary_uid
    }

    fn params<'a>(query: &'a str, budget: usize, hot: &'a [String]) -> AssembleParams<'a> {
        AssembleParams {
            query,
            project_id: "proj-1",
            token_budget: budget,
            hot_paths: hot,
            session_id: None,
            top_k: None,
            summary_levels: &ALL_SUMMARY_LEVELS,
        }
    }

    #[tokio::test]
    async fn test_empty_corpus_yields_empty_bundle() {
        let fx = fixture();
        let bundle = fx
            .assembler
            .assemble(&params("alpha query", 10_000, &[]))
            .await
            .unwrap();
        assert!(bundle.pieces.is_empty());
        assert_eq!(bundle.tokens_used, 0);
        assert!(bundle.warnings.is_empty(), "empty corpus is not a warning");
    }

    #[tokio::test]
    async fn test_budget_invariant_and_relevance_order() {
        let fx = fixture();
        seed_chunk(&fx.db, "proj-1", "a.rs", 0, "alpha one", 400).await;
        seed_chunk(&fx.db, "proj-1", "a.rs", 400, "alpha two", 400).await;
        seed_chunk(&fx.db, "proj-1", "b.rs", 0, "beta one", 400).await;

        let bundle = fx
            .assembler
            .assemble(&params("alpha", 3_000, &[]))
            .await
            .unwrap();

        assert!(bundle.tokens_used <= 3_000 - 2_000);
        // The beta chunk is below the similarity cutoff; the two alpha
        // chunks fill the 1,000 effective budget
        assert_eq!(bundle.pieces.len(), 2);
        for piece in &bundle.pieces {
            assert_eq!(piece.source_path, "a.rs");
        }
    }

    #[tokio::test]
    async fn test_oversized_candidate_skipped_not_fatal() {
        let fx = fixture();
        // Highest-relevance chunk is too large for the effective budget
        seed_chunk(&fx.db, "proj-1", "big.rs", 0, "alpha alpha alpha big", 5_000).await;
        seed_chunk(&fx.db, "proj-1", "small.rs", 0, "alpha small", 300).await;

        let bundle = fx
            .assembler
            .assemble(&params("alpha", 3_000, &[]))
            .await
            .unwrap();

        assert_eq!(bundle.pieces.len(), 1, "scan continues past the oversized chunk");
        assert_eq!(bundle.pieces[0].source_path, "small.rs");
    }

    #[tokio::test]
    async fn test_budget_below_smallest_chunk_warns() {
        let fx = fixture();
        seed_chunk(&fx.db, "proj-1", "a.rs", 0, "alpha", 500).await;

        // Budget 100 with margin 2,000 leaves zero effective budget
        let bundle = fx
            .assembler
            .assemble(&params("alpha", 100, &[]))
            .await
            .unwrap();

        assert!(bundle.pieces.is_empty());
        assert!(bundle.warnings.iter().any(|w| w == WARN_BUDGET_TOO_SMALL));
    }

    #[tokio::test]
    async fn test_determinism() {
        let fx = fixture();
        for i in 0..6 {
            seed_chunk(
                &fx.db,
                "proj-1",
                &format!("f{i}.rs"),
                0,
                &format!("alpha text variant {i}"),
                300,
            )
            .await;
        }

        let hot = vec!["f3.rs".to_string()];
        let a = fx.assembler.assemble(&params("alpha", 4_000, &hot)).await.unwrap();
        let b = fx.assembler.assemble(&params("alpha", 4_000, &hot)).await.unwrap();

        assert_eq!(a.piece_uids(), b.piece_uids());
        assert_eq!(a.tokens_used, b.tokens_used);
    }

    #[tokio::test]
    async fn test_no_duplicate_pieces() {
        let fx = fixture();
        seed_chunk(&fx.db, "proj-1", "a.rs", 0, "alpha repeated", 200).await;
        seed_chunk(&fx.db, "proj-1", "b.rs", 0, "alpha other", 200).await;

        let bundle = fx
            .assembler
            .assemble(&params("alpha", 10_000, &[]))
            .await
            .unwrap();

        let mut uids = bundle.piece_uids();
        let before = uids.len();
        uids.sort();
        uids.dedup();
        assert_eq!(uids.len(), before);
    }

    #[tokio::test]
    async fn test_hot_path_boost_reorders() {
        let fx = fixture();
        // Both equally similar to the query; only hot-path separates them
        seed_chunk(&fx.db, "proj-1", "cold.rs", 0, "alpha cold variant", 200).await;
        seed_chunk(&fx.db, "proj-1", "hot.rs", 0, "alpha hot variant", 200).await;

        let hot = vec!["hot.rs".to_string()];
        let bundle = fx
            .assembler
            .assemble(&params("alpha", 10_000, &hot))
            .await
            .unwrap();

        assert_eq!(bundle.pieces[0].source_path, "hot.rs");
    }

    #[tokio::test]
    async fn test_conversation_boost() {
        let fx = fixture();
        let boosted =
            seed_chunk(&fx.db, "proj-1", "one.rs", 0, "alpha same similarity", 200).await;
        seed_chunk(&fx.db, "proj-1", "two.rs", 0, "alpha same relevance", 200).await;

        let session_id = fx.sessions.create("proj-1");
        fx.sessions.note_turn(&session_id, &[boosted.clone()]).unwrap();

        let mut p = params("alpha", 10_000, &[]);
        p.session_id = Some(&session_id);
        let bundle = fx.assembler.assemble(&p).await.unwrap();

        assert_eq!(bundle.pieces[0].uid, boosted);
    }

    #[tokio::test]
    async fn test_summary_backfill_order() {
        let fx = fixture();
        seed_chunk(&fx.db, "proj-1", "a.rs", 0, "alpha code", 300).await;
        let file_sm =
            seed_summary(&fx.db, "proj-1", "a.rs", SummaryLevel::File, "File view.", 50).await;
        let dir_sm =
            seed_summary(&fx.db, "proj-1", "src", SummaryLevel::Directory, "Dir view.", 50).await;
        let proj_sm =
            seed_summary(&fx.db, "proj-1", ".", SummaryLevel::Project, "Project view.", 50).await;

        let bundle = fx
            .assembler
            .assemble(&params("alpha", 10_000, &[]))
            .await
            .unwrap();

        let uids = bundle.piece_uids();
        let pos = |uid: &str| uids.iter().position(|u| u == uid).unwrap();
        assert!(pos(&file_sm) < pos(&dir_sm));
        assert!(pos(&dir_sm) < pos(&proj_sm));
        assert_eq!(bundle.pieces[0].kind, PieceKind::Chunk, "chunks come first");
    }

    #[tokio::test]
    async fn test_last_summary_trimmed_at_line_boundary() {
        let fx = fixture();
        seed_chunk(&fx.db, "proj-1", "a.rs", 0, "alpha code", 900).await;
        // 10 lines of 10 tokens each; only a prefix fits the leftover budget
        let long_summary: String = (0..10)
            .map(|i| format!("summary line {i} {}\n", "word ".repeat(7)))
            .collect();
        seed_summary(
            &fx.db,
            "proj-1",
            "a.rs",
            SummaryLevel::File,
            &long_summary,
            200,
        )
        .await;

        let bundle = fx
            .assembler
            .assemble(&params("alpha", 3_000, &[]))
            .await
            .unwrap();

        assert!(bundle.tokens_used <= 1_000);
        let summary_piece = bundle
            .pieces
            .iter()
            .find(|p| p.kind == PieceKind::Summary)
            .expect("trimmed summary included");
        assert!(summary_piece.text.len() < long_summary.len());
        assert!(
            summary_piece.text.ends_with('\n'),
            "trim must land on a line boundary"
        );
    }

    #[tokio::test]
    async fn test_monotonic_backfill() {
        let fx = fixture();
        for i in 0..5 {
            seed_chunk(
                &fx.db,
                "proj-1",
                &format!("f{i}.rs"),
                0,
                &format!("alpha content {i}"),
                400,
            )
            .await;
        }

        let small = fx.assembler.assemble(&params("alpha", 3_200, &[])).await.unwrap();
        let large = fx.assembler.assemble(&params("alpha", 4_000, &[])).await.unwrap();

        let small_chunks: HashSet<String> = small
            .pieces
            .iter()
            .filter(|p| p.kind == PieceKind::Chunk)
            .map(|p| p.uid.clone())
            .collect();
        let large_chunks: HashSet<String> = large
            .pieces
            .iter()
            .filter(|p| p.kind == PieceKind::Chunk)
            .map(|p| p.uid.clone())
            .collect();

        assert!(
            small_chunks.is_subset(&large_chunks),
            "a larger budget must only add chunk pieces, never swap them"
        );
        assert!(large_chunks.len() > small_chunks.len());
    }

    #[tokio::test]
    async fn test_monotonic_selection_with_mixed_chunk_sizes() {
        let fx = fixture();
        let big_text: String = (0..100)
            .map(|i| format!("alpha big line {i} {}\n", "word ".repeat(5)))
            .collect();
        let small_text: String = (0..60)
            .map(|i| format!("alpha small line {i} {}\n", "word ".repeat(5)))
            .collect();
        let big = seed_chunk(&fx.db, "proj-1", "big.rs", 0, &big_text, 1_000).await;
        let small = seed_chunk(&fx.db, "proj-1", "small.rs", 0, &small_text, 600).await;

        // Hot-path boost ranks the big chunk first at both budgets
        let hot = vec!["big.rs".to_string()];
        let narrow = fx.assembler.assemble(&params("alpha", 2_600, &hot)).await.unwrap();
        let wide = fx.assembler.assemble(&params("alpha", 3_400, &hot)).await.unwrap();

        let chunk_uids = |bundle: &ContextBundle| -> HashSet<String> {
            bundle
                .pieces
                .iter()
                .filter(|p| p.kind == PieceKind::Chunk)
                .map(|p| p.uid.clone())
                .collect()
        };

        // 600 effective tokens only admit the smaller chunk
        assert_eq!(chunk_uids(&narrow), HashSet::from([small.clone()]));

        // 1,400 admit the big chunk and keep the small one, trimmed to
        // the leftover budget rather than dropped
        let wide_uids = chunk_uids(&wide);
        assert!(wide_uids.contains(&big));
        assert!(
            wide_uids.contains(&small),
            "raising the budget must never evict a previously selected chunk"
        );
        let trimmed = wide.pieces.iter().find(|p| p.uid == small).unwrap();
        assert!(trimmed.token_count < 600);
        assert!(
            trimmed.text.ends_with('\n'),
            "trim must land on a line boundary"
        );
    }

    #[tokio::test]
    async fn test_hot_window_holds_only_whole_chunk_pieces() {
        let fx = fixture();
        let uid = seed_chunk(&fx.db, "proj-1", "a.rs", 0, "alpha cached code", 300).await;
        seed_summary(&fx.db, "proj-1", "a.rs", SummaryLevel::File, "File view.", 50).await;

        let session_id = fx.sessions.create("proj-1");
        let mut p = params("alpha", 10_000, &[]);
        p.session_id = Some(&session_id);
        let bundle = fx.assembler.assemble(&p).await.unwrap();
        assert!(bundle.pieces.iter().any(|p| p.kind == PieceKind::Summary));

        // The summary piece is backfilled each time, never cached
        let window = fx.cache.lookup(&session_id, "proj-1").unwrap();
        let cached_uids: Vec<&str> = window.pieces.iter().map(|c| c.uid.as_str()).collect();
        assert_eq!(cached_uids, vec![uid.as_str()]);
    }

    #[tokio::test]
    async fn test_cache_hit_and_self_heal() {
        let fx = fixture();
        let uid = seed_chunk(&fx.db, "proj-1", "a.rs", 0, "alpha cached", 200).await;
        let session_id = fx.sessions.create("proj-1");

        let mut p = params("alpha", 10_000, &[]);
        p.session_id = Some(&session_id);

        // First assembly populates the hot window; second revalidates it
        let first = fx.assembler.assemble(&p).await.unwrap();
        assert_eq!(first.cache_hits, 0);
        let second = fx.assembler.assemble(&p).await.unwrap();
        assert_eq!(second.cache_hits, 1);
        assert_eq!(first.piece_uids(), second.piece_uids());

        // Corrupt the cached fingerprint: assembly must invalidate and warn,
        // not propagate an error
        fx.cache.store(
            &session_id,
            "proj-1",
            vec![CachedPiece {
                uid: uid.clone(),
                fingerprint: "fp-stale".to_string(),
                text: "stale text".to_string(),
                token_count: 200,
            }],
        );
        let healed = fx.assembler.assemble(&p).await.unwrap();
        assert!(healed.warnings.iter().any(|w| w == WARN_CACHE_INVALIDATED));
        assert_eq!(healed.piece_uids(), first.piece_uids());
    }

    #[tokio::test]
    async fn test_render_orders_pieces() {
        let fx = fixture();
        seed_chunk(&fx.db, "proj-1", "a.rs", 0, "alpha body", 100).await;
        let bundle = fx
            .assembler
            .assemble(&params("alpha", 10_000, &[]))
            .await
            .unwrap();
        let rendered = bundle.render();
        assert!(rendered.contains("=== a.rs ==="));
        assert!(rendered.contains("alpha body"));
    }
}
