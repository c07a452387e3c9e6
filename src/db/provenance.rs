//! Provenance/audit log: append-only record of which chunks and summaries
//! fed each model call. Logging failures never block the generation path.
use super::{Db, models::*};
use crate::error::{EngineError, Result};
use rusqlite::{OptionalExtension, params};
use tracing::warn;

fn map_call_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelCallRecord> {
    let status_str: String = row.get(3)?;
    let uids_json: String = row.get(7)?;
    Ok(ModelCallRecord {
        call_id: row.get(0)?,
        session_id: row.get(1)?,
        model: row.get(2)?,
        status: CallStatus::parse(&status_str).unwrap_or(CallStatus::Failed),
        phase: row.get(4)?,
        prompt_tokens: row.get::<_, i64>(5)? as usize,
        completion_tokens: row.get::<_, i64>(6)? as usize,
        chunk_uids: serde_json::from_str(&uids_json).unwrap_or_default(),
        created_at: row.get(8)?,
    })
}

const CALL_COLUMNS: &str =
    "call_id, session_id, model, status, phase, prompt_tokens, completion_tokens, chunk_uids, created_at";

impl Db {
    fn insert_call(&self, record: &ModelCallRecord) -> Result<()> {
        let uids_json = serde_json::to_string(&record.chunk_uids)
            .map_err(|e| EngineError::Generation(format!("serialize chunk uids: {e}")))?;
        self.conn.execute(
            &format!(
                "INSERT INTO model_calls ({CALL_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                record.call_id,
                record.session_id,
                record.model,
                record.status.as_str(),
                record.phase,
                record.prompt_tokens as i64,
                record.completion_tokens as i64,
                uids_json,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    /// Append a provenance record. Never fails the caller: a failed write is
    /// reported via `warn!` and swallowed so generation keeps moving.
    pub fn record_call(&self, record: &ModelCallRecord) {
        if let Err(e) = self.insert_call(record) {
            warn!("Failed to record provenance for call {}: {e}", record.call_id);
        }
    }

    /// Fetch the provenance record for one model call.
    pub fn get_provenance(&self, call_id: &str) -> Result<ModelCallRecord> {
        self.conn
            .query_row(
                &format!("SELECT {CALL_COLUMNS} FROM model_calls WHERE call_id = ?"),
                params![call_id],
                map_call_row,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("call {call_id}")))
    }

    /// All records for a session, oldest first. Used for cost accounting.
    pub fn list_calls_for_session(&self, session_id: &str) -> Result<Vec<ModelCallRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CALL_COLUMNS} FROM model_calls WHERE session_id = ? ORDER BY created_at ASC, call_id ASC"
        ))?;
        let rows = stmt.query_map(params![session_id], map_call_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}
