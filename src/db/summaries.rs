//! Summary storage. Regeneration inserts a new row and marks the previous
//! one superseded inside the same transaction; rows are never edited.
use super::{Db, models::*};
use crate::error::{EngineError, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

fn map_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRecord> {
    let level_str: String = row.get(4)?;
    let uids_json: String = row.get(7)?;
    Ok(SummaryRecord {
        id: row.get(0)?,
        summary_uid: row.get(1)?,
        project_id: row.get(2)?,
        scope_path: row.get(3)?,
        level: SummaryLevel::parse(&level_str).unwrap_or(SummaryLevel::File),
        content: row.get(5)?,
        token_count: row.get::<_, i64>(6)? as usize,
        source_chunk_uids: serde_json::from_str(&uids_json).unwrap_or_default(),
        superseded: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
    })
}

const SUMMARY_COLUMNS: &str =
    "id, summary_uid, project_id, scope_path, level, content, token_count, source_chunk_uids, superseded, created_at";

impl Db {
    /// Insert a freshly generated summary and supersede the previous one for
    /// the same `(project, scope_path, level)`. Returns the new record.
    pub fn insert_summary(&mut self, new: &NewSummary<'_>) -> Result<SummaryRecord> {
        let uid = format!("sm-{}", Uuid::new_v4().simple());
        let uids_json = serde_json::to_string(new.source_chunk_uids)
            .map_err(|e| EngineError::Generation(format!("serialize source ids: {e}")))?;

        let tx = self.conn.transaction()?;

        tx.execute(
            "UPDATE summaries SET superseded = 1 WHERE project_id = ? AND scope_path = ? AND level = ? AND superseded = 0",
            params![new.project_id, new.scope_path, new.level.as_str()],
        )?;

        tx.execute(
            r#"
            INSERT INTO summaries
                (summary_uid, project_id, scope_path, level, content, token_count, source_chunk_uids, superseded, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
            params![
                uid,
                new.project_id,
                new.scope_path,
                new.level.as_str(),
                new.content,
                new.token_count as i64,
                uids_json,
                Utc::now(),
            ],
        )?;

        let record = tx.query_row(
            &format!("SELECT {SUMMARY_COLUMNS} FROM summaries WHERE summary_uid = ?"),
            params![uid],
            map_summary_row,
        )?;

        tx.commit()?;
        Ok(record)
    }

    /// Fetch a summary by uid.
    pub fn get_summary(&self, uid: &str) -> Result<SummaryRecord> {
        self.conn
            .query_row(
                &format!("SELECT {SUMMARY_COLUMNS} FROM summaries WHERE summary_uid = ?"),
                params![uid],
                map_summary_row,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound(format!("summary {uid}")))
    }

    /// Current (non-superseded) summaries of one level, ordered by scope path
    /// for deterministic backfill.
    pub fn latest_summaries(
        &self,
        project_id: &str,
        level: SummaryLevel,
    ) -> Result<Vec<SummaryRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM summaries WHERE project_id = ? AND level = ? AND superseded = 0 ORDER BY scope_path ASC"
        ))?;
        let rows = stmt.query_map(params![project_id, level.as_str()], map_summary_row)?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    /// Current summary for one exact scope, if any.
    pub fn latest_summary_for_scope(
        &self,
        project_id: &str,
        scope_path: &str,
        level: SummaryLevel,
    ) -> Result<Option<SummaryRecord>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM summaries WHERE project_id = ? AND scope_path = ? AND level = ? AND superseded = 0"
                ),
                params![project_id, scope_path, level.as_str()],
                map_summary_row,
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_summary<'a>(scope: &'a str, content: &'a str, sources: &'a [String]) -> NewSummary<'a> {
        NewSummary {
            project_id: "proj-1",
            scope_path: scope,
            level: SummaryLevel::File,
            content,
            token_count: content.len() / 4,
            source_chunk_uids: sources,
        }
    }

    #[test]
    fn test_insert_and_get_summary() {
        let mut db = Db::open_in_memory(384).unwrap();
        let sources = vec!["ch-abc".to_string(), "ch-def".to_string()];
        let record = db
            .insert_summary(&sample_summary("src/lib.rs", "Parses widgets.", &sources))
            .unwrap();

        let fetched = db.get_summary(&record.summary_uid).unwrap();
        assert_eq!(fetched.content, "Parses widgets.");
        assert_eq!(fetched.source_chunk_uids, sources);
        assert!(!fetched.superseded);
    }

    #[test]
    fn test_regeneration_supersedes_previous() {
        let mut db = Db::open_in_memory(384).unwrap();
        let sources = vec!["ch-abc".to_string()];

        let old = db
            .insert_summary(&sample_summary("src/lib.rs", "Old view.", &sources))
            .unwrap();
        let new = db
            .insert_summary(&sample_summary("src/lib.rs", "New view.", &sources))
            .unwrap();

        assert_ne!(old.summary_uid, new.summary_uid, "new id per regeneration");

        // Old row is retained but marked superseded
        let old_again = db.get_summary(&old.summary_uid).unwrap();
        assert!(old_again.superseded);
        assert_eq!(old_again.content, "Old view.");

        let latest = db.latest_summaries("proj-1", SummaryLevel::File).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].content, "New view.");
    }

    #[test]
    fn test_latest_summaries_ordered_by_scope() {
        let mut db = Db::open_in_memory(384).unwrap();
        let sources: Vec<String> = Vec::new();
        db.insert_summary(&sample_summary("src/zeta.rs", "Z.", &sources))
            .unwrap();
        db.insert_summary(&sample_summary("src/alpha.rs", "A.", &sources))
            .unwrap();

        let latest = db.latest_summaries("proj-1", SummaryLevel::File).unwrap();
        assert_eq!(latest[0].scope_path, "src/alpha.rs");
        assert_eq!(latest[1].scope_path, "src/zeta.rs");
    }

    #[test]
    fn test_get_summary_not_found() {
        let db = Db::open_in_memory(384).unwrap();
        assert!(matches!(
            db.get_summary("sm-missing").unwrap_err(),
            EngineError::NotFound(_)
        ));
    }
}
