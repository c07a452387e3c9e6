//! Chunk store: immutable, content-addressed storage of corpus fragments.
//!
//! Re-ingesting an identical byte range resolves to the existing row, so
//! storage is deduplicated and `chunk_uid`s are stable across re-imports.
use super::{Db, models::*};
use crate::error::{EngineError, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of the raw chunk text.
#[must_use]
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Content-derived chunk identifier, scoped per project so identical text in
/// two projects never aliases across project boundaries.
#[must_use]
pub fn chunk_uid(project_id: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update(b":");
    hasher.update(fingerprint.as_bytes());
    let digest = hex_encode(&hasher.finalize());
    format!("ch-{}", &digest[..32])
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn map_chunk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let kind_str: String = row.get(7)?;
    Ok(ChunkRecord {
        id: row.get(0)?,
        chunk_uid: row.get(1)?,
        project_id: row.get(2)?,
        source_path: row.get(3)?,
        byte_offset: row.get::<_, i64>(4)? as usize,
        token_count: row.get::<_, i64>(5)? as usize,
        fingerprint: row.get(6)?,
        kind: ChunkKind::parse(&kind_str).unwrap_or(ChunkKind::Code),
        content: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const CHUNK_COLUMNS: &str =
    "id, chunk_uid, project_id, source_path, byte_offset, token_count, fingerprint, kind, content, created_at";

impl Db {
    /// Insert a chunk, deduplicating on content.
    ///
    /// If a chunk with the same fingerprint already exists in the project the
    /// existing record is returned unchanged (idempotent). Fails with
    /// [`EngineError::ChunkTooLarge`] when the caller did not pre-split;
    /// `max_tokens` is the configured cap (8,000 by default).
    pub fn put_chunk(&mut self, new: &NewChunk<'_>, max_tokens: usize) -> Result<ChunkRecord> {
        if new.token_count > max_tokens {
            return Err(EngineError::ChunkTooLarge {
                got: new.token_count,
                max: max_tokens,
            });
        }

        // Binary artifacts carry no content; their identity hashes the path
        // so repeated imports of the same artifact stay idempotent too.
        let fp = match new.content {
            Some(text) => fingerprint(text),
            None => fingerprint(new.source_path),
        };
        let uid = chunk_uid(new.project_id, &fp);

        let tx = self.conn.transaction()?;

        let existing = tx
            .query_row(
                &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_uid = ?"),
                params![uid],
                map_chunk_row,
            )
            .optional()?;

        if let Some(record) = existing {
            tx.commit()?;
            return Ok(record);
        }

        tx.execute(
            r#"
            INSERT INTO chunks
                (chunk_uid, project_id, source_path, byte_offset, token_count, fingerprint, kind, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                uid,
                new.project_id,
                new.source_path,
                new.byte_offset as i64,
                new.token_count as i64,
                fp,
                new.kind.as_str(),
                new.content,
                Utc::now(),
            ],
        )?;

        let record = tx.query_row(
            &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_uid = ?"),
            params![uid],
            map_chunk_row,
        )?;

        tx.commit()?;
        Ok(record)
    }

    /// Fetch a chunk by its content-derived identifier.
    pub fn get_chunk(&self, uid: &str) -> Result<ChunkRecord> {
        self.conn
            .query_row(
                &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_uid = ?"),
                params![uid],
                map_chunk_row,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("chunk {uid}")))
    }

    /// All chunks of one artifact, ordered by byte offset. Used for
    /// re-ingestion diffing and summary regeneration.
    pub fn list_chunks_for_path(&self, project_id: &str, path: &str) -> Result<Vec<ChunkRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = ? AND source_path = ? ORDER BY byte_offset ASC"
        ))?;
        let rows = stmt.query_map(params![project_id, path], map_chunk_row)?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    /// Distinct source paths of a project's retrievable (non-binary) chunks.
    pub fn list_paths(&self, project_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT source_path FROM chunks WHERE project_id = ? AND content IS NOT NULL ORDER BY source_path ASC",
        )?;
        let rows = stmt.query_map(params![project_id], |row| row.get(0))?;

        let mut paths = Vec::new();
        for row in rows {
            paths.push(row?);
        }
        Ok(paths)
    }

    /// Retire one chunk: drop its row and any indexed vector. Called when a
    /// re-ingested artifact no longer contains the chunk's byte range.
    pub fn remove_chunk(&mut self, uid: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM vec_items WHERE rowid IN (SELECT id FROM embeddings WHERE item_uid = ?)",
            params![uid],
        )?;
        tx.execute("DELETE FROM embeddings WHERE item_uid = ?", params![uid])?;
        tx.execute("DELETE FROM chunks WHERE chunk_uid = ?", params![uid])?;
        tx.commit()?;
        Ok(())
    }

    /// Delete every row belonging to a project (chunks, summaries, vectors).
    /// Provenance records are retention-policy territory and are kept.
    pub fn delete_project(&mut self, project_id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM vec_items WHERE rowid IN (SELECT id FROM embeddings WHERE project_id = ?)",
            params![project_id],
        )?;
        tx.execute("DELETE FROM embeddings WHERE project_id = ?", params![project_id])?;
        tx.execute("DELETE FROM chunks WHERE project_id = ?", params![project_id])?;
        tx.execute("DELETE FROM summaries WHERE project_id = ?", params![project_id])?;
        tx.commit()?;
        Ok(())
    }
}
