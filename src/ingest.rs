//! Ingestion pipeline: split an artifact into overlapping token windows,
//! store the chunks content-addressed, and index their embeddings.
//!
//! Windows of the same artifact overlap by `overlap_tokens` so an answer
//! spanning a window boundary remains findable from either neighbor.
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use crate::config::Config;
use crate::db::Db;
use crate::db::chunks;
use crate::db::models::{ChunkKind, NewChunk};
use crate::embedder::Embedder;
use crate::error::{EngineError, Result};
use crate::tokenizer::TokenizerRegistry;

/// One window produced by splitting an artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub text: String,
    pub byte_offset: usize,
    pub token_count: usize,
}

/// Outcome of ingesting one artifact.
#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    /// Uids of all chunks now backing the artifact, in byte order.
    pub chunk_uids: Vec<String>,
    pub added: usize,
    pub deduplicated: usize,
    /// Chunks of a previous version of the artifact that were retired.
    pub removed: usize,
}

/// Split text into windows of roughly `target_chunk_tokens` tokens along line
/// boundaries, with a trailing overlap carried into the next window.
///
/// Deterministic: the same text, model and config always produce the same
/// windows. A single line larger than the target is hard-split on char
/// boundaries so no window can exceed the chunk cap.
pub fn split_into_windows(
    text: &str,
    model_id: &str,
    tokenizers: &TokenizerRegistry,
    config: &Config,
) -> Result<Vec<Window>> {
    let target = config.chunking.target_chunk_tokens;
    let overlap = config.chunking.overlap_tokens;

    let mut lines: Vec<(usize, &str)> = Vec::new(); // (byte offset, line incl. newline)
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }
    if let Some(rest) = text.get(offset..) {
        if !rest.is_empty() {
            lines.push((offset, rest));
        }
    }

    // Hard-split any single line that alone exceeds the target window
    let mut pieces: Vec<(usize, String)> = Vec::new();
    for (line_offset, line) in lines {
        let line_tokens = tokenizers.count_tokens(line, model_id)?;
        if line_tokens <= target {
            pieces.push((line_offset, line.to_string()));
            continue;
        }
        let max_chars = target.saturating_mul(3).max(1);
        let mut start_byte = 0;
        let mut current = String::new();
        let mut current_chars = 0usize;
        for ch in line.chars() {
            current.push(ch);
            current_chars += 1;
            if current_chars >= max_chars {
                let piece_len = current.len();
                pieces.push((line_offset + start_byte, std::mem::take(&mut current)));
                start_byte += piece_len;
                current_chars = 0;
            }
        }
        if !current.is_empty() {
            pieces.push((line_offset + start_byte, current));
        }
    }

    let counts: Vec<usize> = pieces
        .iter()
        .map(|(_, p)| tokenizers.count_tokens(p, model_id))
        .collect::<Result<_>>()?;

    let mut windows = Vec::new();
    let mut start = 0usize;
    while start < pieces.len() {
        let mut end = start;
        let mut tokens = 0usize;
        while end < pieces.len() {
            // Always take at least one piece per window
            if end > start && tokens + counts[end] > target {
                break;
            }
            tokens += counts[end];
            end += 1;
        }

        let window_text: String = pieces[start..end].iter().map(|(_, p)| p.as_str()).collect();
        if !window_text.trim().is_empty() {
            windows.push(Window {
                text: window_text,
                byte_offset: pieces[start].0,
                token_count: tokens,
            });
        }

        if end >= pieces.len() {
            break;
        }

        // Walk back from the window end to find where the overlap begins
        let mut next_start = end;
        let mut overlap_tokens = 0usize;
        while next_start > start + 1 && overlap_tokens < overlap {
            overlap_tokens += counts[next_start - 1];
            next_start -= 1;
        }
        start = next_start.max(start + 1);
    }

    Ok(windows)
}

/// Runs the ingestion flow against the shared store.
///
/// Writes to one artifact's chunk set are serialized through the Db mutex so
/// a directory summary never references a file summary older than its latest
/// chunk.
pub struct Ingestor {
    db: Arc<TokioMutex<Db>>,
    embedder: Arc<dyn Embedder>,
    tokenizers: Arc<TokenizerRegistry>,
    config: Arc<Config>,
}

impl Ingestor {
    pub fn new(
        db: Arc<TokioMutex<Db>>,
        embedder: Arc<dyn Embedder>,
        tokenizers: Arc<TokenizerRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            embedder,
            tokenizers,
            config,
        }
    }

    /// Ingest one text artifact: split, store, embed, index.
    ///
    /// Idempotent: re-ingesting identical bytes resolves to the existing
    /// chunk uids and does not duplicate storage. Chunks of a previous
    /// version that no longer appear are retired from the index.
    pub async fn ingest(
        &self,
        project_id: &str,
        path: &str,
        raw_text: &str,
        kind: ChunkKind,
    ) -> Result<IngestReport> {
        let model_id = &self.config.model.name;
        let windows = split_into_windows(raw_text, model_id, &self.tokenizers, &self.config)?;

        let mut report = IngestReport::default();
        let mut new_chunks = Vec::new(); // (uid, text) needing embedding

        {
            let mut db = self.db.lock().await;

            let previous: Vec<String> = db
                .list_chunks_for_path(project_id, path)?
                .into_iter()
                .map(|c| c.chunk_uid)
                .collect();

            for window in &windows {
                let fp = chunks::fingerprint(&window.text);
                let uid = chunks::chunk_uid(project_id, &fp);
                let existed = previous.contains(&uid) || report.chunk_uids.contains(&uid);

                let record = db.put_chunk(
                    &NewChunk {
                        project_id,
                        source_path: path,
                        byte_offset: window.byte_offset,
                        token_count: window.token_count,
                        kind,
                        content: Some(&window.text),
                    },
                    self.config.chunking.max_chunk_tokens,
                )?;

                if existed {
                    report.deduplicated += 1;
                } else {
                    report.added += 1;
                    new_chunks.push((record.chunk_uid.clone(), window.text.clone()));
                }
                if !report.chunk_uids.contains(&record.chunk_uid) {
                    report.chunk_uids.push(record.chunk_uid);
                }
            }

            // Retire chunks of the superseded version of this artifact
            for old_uid in previous {
                if !report.chunk_uids.contains(&old_uid) {
                    db.remove_chunk(&old_uid)?;
                    report.removed += 1;
                }
            }
        }

        if !new_chunks.is_empty() {
            let texts: Vec<&str> = new_chunks.iter().map(|(_, t)| t.as_str()).collect();
            let vectors = self
                .embedder
                .embed_batch(&texts)
                .map_err(|e| EngineError::Embedder(e.to_string()))?;

            let mut db = self.db.lock().await;
            for ((uid, _), vector) in new_chunks.iter().zip(vectors.iter()) {
                db.index_vector(uid, vector, project_id, kind.as_str())?;
            }
        }

        debug!(
            "Ingested {path}: {} added, {} deduplicated, {} removed",
            report.added, report.deduplicated, report.removed
        );
        Ok(report)
    }

    /// Record a binary or non-text artifact: metadata only, never raw bytes,
    /// excluded from retrieval.
    pub async fn ingest_binary(
        &self,
        project_id: &str,
        path: &str,
        kind: ChunkKind,
    ) -> Result<IngestReport> {
        let mut db = self.db.lock().await;
        let record = db.put_chunk(
            &NewChunk {
                project_id,
                source_path: path,
                byte_offset: 0,
                token_count: 0,
                kind,
                content: None,
            },
            self.config.chunking.max_chunk_tokens,
        )?;
        Ok(IngestReport {
            chunk_uids: vec![record.chunk_uid],
            added: 1,
            ..Default::default()
        })
    }
}
