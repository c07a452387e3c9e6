//! Embedding index: cosine similarity search over chunk and summary vectors,
//! filterable by project and kind.
use super::{Db, serialize_vector};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use rusqlite::types::Value;

/// Optional constraints applied to an index query.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexFilter<'a> {
    /// Only items of this kind.
    pub kind: Option<&'a str>,
    /// Everything except this kind.
    pub exclude_kind: Option<&'a str>,
}

/// One nearest-neighbor hit.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub item_uid: String,
    /// Cosine similarity mapped to [0, 1].
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl Db {
    /// Upsert a vector for a chunk or summary.
    ///
    /// Re-indexing the same `item_uid` replaces the stored vector — used
    /// when embeddings are regenerated after a model upgrade.
    pub fn index_vector(
        &mut self,
        item_uid: &str,
        vector: &[f32],
        project_id: &str,
        kind: &str,
    ) -> Result<()> {
        debug_assert_eq!(vector.len(), self.dimensions);

        let tx = self.conn.transaction()?;

        let row_id: i64 = tx.query_row(
            r#"
            INSERT INTO embeddings (item_uid, project_id, kind, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(item_uid) DO UPDATE SET
                project_id = excluded.project_id,
                kind = excluded.kind
            RETURNING id
            "#,
            params![item_uid, project_id, kind, Utc::now()],
            |row| row.get(0),
        )?;

        // vec0 has no upsert; delete-then-insert keeps rowid stable
        tx.execute("DELETE FROM vec_items WHERE rowid = ?", params![row_id])?;
        tx.execute(
            "INSERT INTO vec_items (rowid, embedding) VALUES (?, ?)",
            params![row_id, serialize_vector(vector)],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Approximate nearest neighbors by cosine similarity, scoped to one
    /// project. Ties break by most-recent `created_at`, then by uid for
    /// determinism. An empty or unindexed project returns an empty Vec.
    pub fn knn_query(
        &self,
        vector: &[f32],
        project_id: &str,
        top_k: usize,
        filter: IndexFilter<'_>,
    ) -> Result<Vec<IndexHit>> {
        let mut query = String::from(
            r#"
            SELECT
                e.item_uid,
                vec_distance_cosine(v.embedding, ?) AS distance,
                e.created_at
            FROM vec_items v
            JOIN embeddings e ON v.rowid = e.id
            WHERE e.project_id = ?
            "#,
        );

        let mut params: Vec<Value> = vec![
            Value::Blob(serialize_vector(vector)),
            Value::Text(project_id.to_string()),
        ];

        if let Some(kind) = filter.kind {
            query.push_str(" AND e.kind = ?");
            params.push(Value::Text(kind.to_string()));
        }
        if let Some(kind) = filter.exclude_kind {
            query.push_str(" AND e.kind != ?");
            params.push(Value::Text(kind.to_string()));
        }

        query.push_str(" ORDER BY distance ASC, e.created_at DESC, e.item_uid ASC LIMIT ?");
        params.push(Value::Integer(top_k as i64));

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let distance: f64 = row.get(1)?;
            Ok(IndexHit {
                item_uid: row.get(0)?,
                score: 1.0 - (distance / 2.0),
                created_at: row.get(2)?,
            })
        })?;

        let mut hits = Vec::new();
        for row in rows {
            hits.push(row?);
        }
        Ok(hits)
    }
}
