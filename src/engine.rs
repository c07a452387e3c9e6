//! Engine facade: wires the store, index, assembler, summarizer and
//! orchestrator together and exposes the operations an API layer consumes.
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assembler::{ALL_SUMMARY_LEVELS, AssembleParams, Assembler};
use crate::cache::HotWindowCache;
use crate::config::Config;
use crate::db::Db;
use crate::db::models::{ChunkKind, ModelCallRecord};
use crate::embedder::Embedder;
use crate::error::Result;
use crate::ingest::{IngestReport, Ingestor};
use crate::model::ModelClient;
use crate::orchestrator::{GenerateRequest, GenerationOutcome, Orchestrator};
use crate::sandbox::Sandbox;
use crate::session::SessionRegistry;
use crate::summarizer::Summarizer;
use crate::tokenizer::TokenizerRegistry;

/// Characters of piece text shown in assembly responses.
const PREVIEW_CHARS: usize = 160;

/// One piece as reported to the API layer: provenance plus a short preview,
/// not the full text.
#[derive(Debug, Clone, Serialize)]
pub struct PieceInfo {
    pub id: String,
    pub token_count: usize,
    pub source_path: String,
    pub score: f64,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembleResponse {
    pub pieces: Vec<PieceInfo>,
    pub tokens_used: usize,
    pub warnings: Vec<String>,
}

pub struct Engine {
    config: Arc<Config>,
    db: Arc<TokioMutex<Db>>,
    sessions: Arc<SessionRegistry>,
    assembler: Arc<Assembler>,
    ingestor: Ingestor,
    summarizer: Summarizer,
    orchestrator: Orchestrator,
}

impl Engine {
    /// Wire an engine from its collaborators. The embedder, model client and
    /// sandbox are injected so tests and deployments choose their backends.
    pub fn new(
        config: Config,
        db: Db,
        embedder: Arc<dyn Embedder>,
        tokenizers: TokenizerRegistry,
        model: Arc<dyn ModelClient>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        let config = Arc::new(config);
        let db = Arc::new(TokioMutex::new(db));
        let tokenizers = Arc::new(tokenizers);
        let sessions = Arc::new(SessionRegistry::new(config.cache.session_ttl_secs));
        let cache = Arc::new(HotWindowCache::new(
            config.cache.capacity,
            config.cache.session_ttl_secs,
        ));

        let assembler = Arc::new(Assembler::new(
            db.clone(),
            embedder.clone(),
            tokenizers.clone(),
            sessions.clone(),
            cache,
            config.clone(),
        ));
        let ingestor = Ingestor::new(
            db.clone(),
            embedder.clone(),
            tokenizers.clone(),
            config.clone(),
        );
        let summarizer = Summarizer::new(
            db.clone(),
            embedder,
            tokenizers,
            model.clone(),
            config.clone(),
        );
        let orchestrator = Orchestrator::new(
            db.clone(),
            assembler.clone(),
            model,
            sandbox,
            sessions.clone(),
            config.clone(),
        );

        Self {
            config,
            db,
            sessions,
            assembler,
            ingestor,
            summarizer,
            orchestrator,
        }
    }

    /// Ingest one artifact and refresh the summaries above it.
    ///
    /// Summarization needs the model; if it is unavailable the chunks are
    /// still stored and indexed, and the summary refresh is retried on the
    /// next ingest of the same path.
    pub async fn ingest(
        &self,
        project_id: &str,
        path: &str,
        raw_text: &str,
        kind: ChunkKind,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let report = self.ingestor.ingest(project_id, path, raw_text, kind).await?;

        if report.added > 0 || report.removed > 0 {
            if let Err(e) = self
                .summarizer
                .refresh_for_paths(project_id, &[path.to_string()], cancel)
                .await
            {
                warn!("Summary refresh for {path} failed: {e}");
            }
        }
        Ok(report)
    }

    /// Record a binary artifact: metadata only.
    pub async fn ingest_binary(
        &self,
        project_id: &str,
        path: &str,
        kind: ChunkKind,
    ) -> Result<IngestReport> {
        self.ingestor.ingest_binary(project_id, path, kind).await
    }

    /// Assemble a context bundle and report it with previews.
    pub async fn assemble(
        &self,
        project_id: &str,
        prompt: &str,
        token_budget: Option<usize>,
        hot_paths: &[String],
        session_id: Option<&str>,
    ) -> Result<AssembleResponse> {
        let token_budget = token_budget.unwrap_or(self.config.assembly.default_token_budget);
        let bundle = self
            .assembler
            .assemble(&AssembleParams {
                query: prompt,
                project_id,
                token_budget,
                hot_paths,
                session_id,
                top_k: None,
                summary_levels: &ALL_SUMMARY_LEVELS,
            })
            .await?;

        Ok(AssembleResponse {
            tokens_used: bundle.tokens_used,
            warnings: bundle.warnings.clone(),
            pieces: bundle
                .pieces
                .iter()
                .map(|p| PieceInfo {
                    id: p.uid.clone(),
                    token_count: p.token_count,
                    source_path: p.source_path.clone(),
                    score: p.score,
                    preview: preview(&p.text),
                })
                .collect(),
        })
    }

    /// Run a full generation request through the orchestrator.
    pub async fn generate(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        info!(
            "Generation request {} for project {}",
            request.request_id, request.project_id
        );
        self.orchestrator.generate(request, cancel).await
    }

    /// Create a session for a project and return its id.
    pub fn create_session(&self, project_id: &str) -> String {
        self.sessions.create(project_id)
    }

    /// Explicitly end a session and drop whatever it cached.
    pub fn expire_session(&self, session_id: &str) {
        self.sessions.expire(session_id);
    }

    /// Drop sessions idle past their TTL.
    pub fn sweep_sessions(&self) -> usize {
        self.sessions.sweep()
    }

    /// Provenance record for one model call.
    pub async fn provenance(&self, call_id: &str) -> Result<ModelCallRecord> {
        self.db.lock().await.get_provenance(call_id)
    }

    /// All provenance records for a session, oldest first.
    pub async fn session_calls(&self, session_id: &str) -> Result<Vec<ModelCallRecord>> {
        self.db.lock().await.list_calls_for_session(session_id)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Char-boundary-safe preview of a piece's text, newlines flattened.
fn preview(text: &str) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .take(PREVIEW_CHARS)
        .collect();
    let mut preview = flat.trim_end().to_string();
    if text.chars().count() > PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short_text_unchanged() {
        assert_eq!(preview("fn main() {}"), "fn main() {}");
    }

    #[test]
    fn test_preview_flattens_newlines_and_truncates() {
        let text = format!("line one\nline two\n{}", "x".repeat(300));
        let p = preview(&text);
        assert!(p.starts_with("line one line two"));
        assert!(p.ends_with('…'));
        assert!(p.chars().count() <= PREVIEW_CHARS + 1);
    }

    #[test]
    fn test_preview_multibyte_boundary() {
        let text = "é".repeat(200);
        let p = preview(&text);
        assert!(p.chars().count() <= PREVIEW_CHARS + 1);
    }
}
