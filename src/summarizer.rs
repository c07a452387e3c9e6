//! Hierarchical summarization: file, directory, and project levels.
//!
//! File summaries are generated from a file's live chunks, directory
//! summaries from the file summaries under that directory, and the single
//! project summary from the directory summaries. Regeneration supersedes
//! rather than mutates, and every summary is embedded and indexed under the
//! `summary` kind so retrieval can exclude or target it.
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::db::models::{ChunkKind, NewSummary, SummaryLevel, SummaryRecord};
use crate::embedder::Embedder;
use crate::error::{EngineError, Result};
use crate::model::{ModelClient, ModelRequest, complete_with_retry};
use crate::tokenizer::TokenizerRegistry;

const FILE_SYSTEM_PROMPT: &str = "You summarize source files. Reply with a dense plain-text \
summary of the file's responsibilities, key types, and entry points. No preamble.";
const DIRECTORY_SYSTEM_PROMPT: &str = "You summarize directories of source files from their \
per-file summaries. Reply with a dense plain-text summary of the directory's role. No preamble.";
const PROJECT_SYSTEM_PROMPT: &str = "You summarize whole projects from their per-directory \
summaries. Reply with a dense plain-text overview of the project. No preamble.";

/// Scope path used for the single project-level summary.
pub const PROJECT_SCOPE: &str = ".";

pub struct Summarizer {
    db: Arc<TokioMutex<Db>>,
    embedder: Arc<dyn Embedder>,
    tokenizers: Arc<TokenizerRegistry>,
    model: Arc<dyn ModelClient>,
    config: Arc<Config>,
    /// Last project-summary refresh per project, for debouncing bursts of
    /// ingests.
    last_project_refresh: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Summarizer {
    pub fn new(
        db: Arc<TokioMutex<Db>>,
        embedder: Arc<dyn Embedder>,
        tokenizers: Arc<TokenizerRegistry>,
        model: Arc<dyn ModelClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            embedder,
            tokenizers,
            model,
            config,
            last_project_refresh: Mutex::new(HashMap::new()),
        }
    }

    /// Regenerate the summary tree above a set of freshly ingested files:
    /// each file, then each affected directory, then the project summary
    /// (debounced). Returns the uids of the summaries written.
    pub async fn refresh_for_paths(
        &self,
        project_id: &str,
        paths: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut written = Vec::new();
        let mut directories = BTreeSet::new();

        for path in paths {
            let record = self.summarize_file(project_id, path, cancel).await?;
            directories.insert(parent_dir(path));
            written.push(record.summary_uid);
        }
        for dir in directories {
            let record = self.summarize_directory(project_id, &dir, cancel).await?;
            written.push(record.summary_uid);
        }
        if let Some(record) = self.refresh_project(project_id, cancel).await? {
            written.push(record.summary_uid);
        }
        Ok(written)
    }

    /// Generate and store a file-level summary from the file's live chunks.
    pub async fn summarize_file(
        &self,
        project_id: &str,
        source_path: &str,
        cancel: &CancellationToken,
    ) -> Result<SummaryRecord> {
        let (body, source_uids) = {
            let db = self.db.lock().await;
            let chunks = db.list_chunks_for_path(project_id, source_path)?;
            if chunks.is_empty() {
                return Err(EngineError::NotFound(format!(
                    "no chunks for {source_path} in project {project_id}"
                )));
            }
            let mut body = String::new();
            let mut uids = Vec::new();
            for chunk in chunks {
                if let Some(content) = chunk.content {
                    body.push_str(&content);
                    if !body.ends_with('\n') {
                        body.push('\n');
                    }
                }
                uids.push(chunk.chunk_uid);
            }
            (body, uids)
        };

        let prompt = format!("File `{source_path}`:\n\n{body}");
        let text = self.complete(FILE_SYSTEM_PROMPT, &prompt, cancel).await?;
        self.store(
            project_id,
            source_path,
            SummaryLevel::File,
            &text,
            &source_uids,
        )
        .await
    }

    /// Generate and store a directory-level summary from the current file
    /// summaries directly under `dir`.
    pub async fn summarize_directory(
        &self,
        project_id: &str,
        dir: &str,
        cancel: &CancellationToken,
    ) -> Result<SummaryRecord> {
        let inputs = {
            let db = self.db.lock().await;
            let all = db.latest_summaries(project_id, SummaryLevel::File)?;
            all.into_iter()
                .filter(|s| parent_dir(&s.scope_path) == dir)
                .collect::<Vec<_>>()
        };
        if inputs.is_empty() {
            return Err(EngineError::NotFound(format!(
                "no file summaries under {dir} in project {project_id}"
            )));
        }

        let mut prompt = format!("Directory `{dir}` contains:\n");
        let mut source_uids = Vec::new();
        for summary in &inputs {
            prompt.push_str(&format!("\n## {}\n{}\n", summary.scope_path, summary.content));
            source_uids.push(summary.summary_uid.clone());
        }

        let text = self
            .complete(DIRECTORY_SYSTEM_PROMPT, &prompt, cancel)
            .await?;
        self.store(project_id, dir, SummaryLevel::Directory, &text, &source_uids)
            .await
    }

    /// Regenerate the project summary from the current directory summaries,
    /// unless one was regenerated within the debounce window. Returns `None`
    /// when debounced or when the project has no directory summaries yet.
    pub async fn refresh_project(
        &self,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<SummaryRecord>> {
        let debounce = Duration::from_secs(self.config.summarizer.project_summary_debounce_secs);
        {
            let last = self.last_project_refresh.lock().unwrap();
            if let Some(at) = last.get(project_id) {
                let age = (Utc::now() - *at).to_std().unwrap_or_default();
                if age < debounce {
                    debug!("Project summary for {project_id} debounced ({age:?} old)");
                    return Ok(None);
                }
            }
        }

        let inputs = {
            let db = self.db.lock().await;
            db.latest_summaries(project_id, SummaryLevel::Directory)?
        };
        if inputs.is_empty() {
            return Ok(None);
        }

        let mut prompt = format!("Project `{project_id}` directories:\n");
        let mut source_uids = Vec::new();
        for summary in &inputs {
            prompt.push_str(&format!("\n## {}\n{}\n", summary.scope_path, summary.content));
            source_uids.push(summary.summary_uid.clone());
        }

        let text = self.complete(PROJECT_SYSTEM_PROMPT, &prompt, cancel).await?;
        let record = self
            .store(
                project_id,
                PROJECT_SCOPE,
                SummaryLevel::Project,
                &text,
                &source_uids,
            )
            .await?;

        self.last_project_refresh
            .lock()
            .unwrap()
            .insert(project_id.to_string(), Utc::now());
        info!("Refreshed project summary for {project_id}");
        Ok(Some(record))
    }

    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let request = ModelRequest {
            model: self.config.model.name.clone(),
            system: system.to_string(),
            prompt: prompt.to_string(),
            max_tokens: None,
        };
        let timeout = Duration::from_secs(self.config.model.request_timeout_secs);
        let response = complete_with_retry(self.model.as_ref(), request, timeout, cancel)
            .await
            .map_err(|e| EngineError::Generation(format!("summarization: {e}")))?;
        Ok(response.text)
    }

    /// Insert the summary (superseding its predecessor) and index its
    /// embedding under the `summary` kind.
    async fn store(
        &self,
        project_id: &str,
        scope_path: &str,
        level: SummaryLevel,
        text: &str,
        source_uids: &[String],
    ) -> Result<SummaryRecord> {
        let token_count = self
            .tokenizers
            .count_tokens(text, &self.config.model.name)?;
        let vector = self
            .embedder
            .embed(text)
            .map_err(|e| EngineError::Embedder(e.to_string()))?;

        let mut db = self.db.lock().await;
        let record = db.insert_summary(&NewSummary {
            project_id,
            scope_path,
            level,
            content: text,
            token_count,
            source_chunk_uids: source_uids,
        })?;
        if let Err(e) = db.index_vector(
            &record.summary_uid,
            &vector,
            project_id,
            ChunkKind::Summary.as_str(),
        ) {
            // Retrieval degrades to backfill-only for this summary; the
            // stored row is still authoritative
            warn!("Failed to index summary {}: {e}", record.summary_uid);
        }
        debug!(
            "Stored {} summary for {scope_path} ({token_count} tokens)",
            level.as_str()
        );
        Ok(record)
    }
}

/// Parent directory of a relative path, `.` at the root.
fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => PROJECT_SCOPE.to_string(),
    }
}
