//! Vector Index (C3): upsert text→embedding and nearest-neighbour
//! search over `sqlite-vec`'s `vec0` virtual table. Falls back to the
//! deterministic embedder on provider failure so the index never diverges
//! from the relational index in cardinality.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use rusqlite::params;
use serde_json::Value;
use tracing::warn;

use super::db::open_connection;
use super::error::EntityStoreError;
use crate::embedding::{DeterministicEmbedder, EmbeddingProvider};

static SQLITE_VEC_INIT: Once = Once::new();

fn vector_to_json(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|f| f.to_string()).collect();
    format!("[{}]", parts.join(","))
}

pub struct VectorIndex {
    db_path: PathBuf,
    provider: Arc<dyn EmbeddingProvider>,
    fallback: DeterministicEmbedder,
    vec_table: String,
}

impl VectorIndex {
    pub fn new(
        db_path: impl AsRef<Path>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, EntityStoreError> {
        SQLITE_VEC_INIT.call_once(|| unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        });

        let db_path = db_path.as_ref().to_path_buf();
        let fallback = DeterministicEmbedder::new();
        // Both embedding spaces may be in play over the index's lifetime (real
        // provider by default, deterministic fallback on failure), so the
        // vec0 table is sized to the larger of the two dimensions and shorter
        // vectors are zero-padded, see `pad_to_table_dimension`.
        let table_dimension = provider.dimension().max(fallback.dimension());

        let conn = open_connection(&db_path)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS vector_meta (
                rowid INTEGER PRIMARY KEY,
                entity_id TEXT NOT NULL UNIQUE,
                text TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}'
            )
            "#,
            [],
        )?;
        let vec_table = "vector_embeddings".to_string();
        conn.execute(
            &format!("CREATE VIRTUAL TABLE IF NOT EXISTS {vec_table} USING vec0(embedding float[{table_dimension}])"),
            [],
        )?;

        Ok(Self {
            db_path,
            provider,
            fallback,
            vec_table,
        })
    }

    fn table_dimension(&self) -> usize {
        self.provider.dimension().max(self.fallback.dimension())
    }

    fn pad_to_table_dimension(&self, mut vector: Vec<f32>) -> Vec<f32> {
        vector.resize(self.table_dimension(), 0.0);
        vector
    }

    async fn embed_one(&self, text: &str) -> Vec<f32> {
        match self.provider.embed(&[text]).await {
            Ok(mut vectors) if !vectors.is_empty() => self.pad_to_table_dimension(vectors.remove(0)),
            Ok(_) => {
                warn!("embedding provider returned no vectors, falling back to deterministic embedding");
                self.fallback_embed_one(text).await
            }
            Err(e) => {
                warn!(error = %e, "embedding provider failed, falling back to deterministic embedding");
                self.fallback_embed_one(text).await
            }
        }
    }

    async fn fallback_embed_one(&self, text: &str) -> Vec<f32> {
        let vector = self
            .fallback
            .embed(&[text])
            .await
            .expect("deterministic embedder never fails")
            .remove(0);
        self.pad_to_table_dimension(vector)
    }

    pub async fn upsert_embedding(
        &self,
        entity_id: String,
        text: String,
        metadata: Option<Value>,
    ) -> Result<(), EntityStoreError> {
        let vector = self.embed_one(&text).await;
        let vec_json = vector_to_json(&vector);
        let metadata_json = serde_json::to_string(&metadata.unwrap_or(Value::Object(Default::default())))?;
        let db_path = self.db_path.clone();
        let vec_table = self.vec_table.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT rowid FROM vector_meta WHERE entity_id = ?1",
                    params![entity_id],
                    |row| row.get(0),
                )
                .ok();

            let rowid = match existing {
                Some(rowid) => {
                    conn.execute(
                        &format!("DELETE FROM {vec_table} WHERE rowid = ?1"),
                        params![rowid],
                    )?;
                    conn.execute(
                        "UPDATE vector_meta SET text = ?1, metadata_json = ?2 WHERE rowid = ?3",
                        params![text, metadata_json, rowid],
                    )?;
                    rowid
                }
                None => {
                    conn.execute(
                        "INSERT INTO vector_meta (entity_id, text, metadata_json) VALUES (?1, ?2, ?3)",
                        params![entity_id, text, metadata_json],
                    )?;
                    conn.last_insert_rowid()
                }
            };

            conn.execute(
                &format!("INSERT INTO {vec_table} (rowid, embedding) VALUES (?1, ?2)"),
                params![rowid, vec_json],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn delete(&self, entity_id: String) -> Result<(), EntityStoreError> {
        let db_path = self.db_path.clone();
        let vec_table = self.vec_table.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let rowid: Option<i64> = conn
                .query_row(
                    "SELECT rowid FROM vector_meta WHERE entity_id = ?1",
                    params![entity_id],
                    |row| row.get(0),
                )
                .ok();
            if let Some(rowid) = rowid {
                conn.execute(&format!("DELETE FROM {vec_table} WHERE rowid = ?1"), params![rowid])?;
                conn.execute("DELETE FROM vector_meta WHERE rowid = ?1", params![rowid])?;
            }
            Ok(())
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    /// Ordered best-first by distance ascending (closest first).
    pub async fn semantic_search(
        &self,
        query: String,
        limit: usize,
    ) -> Result<Vec<String>, EntityStoreError> {
        let vector = self.embed_one(&query).await;
        let vec_json = vector_to_json(&vector);
        let db_path = self.db_path.clone();
        let vec_table = self.vec_table.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let sql =
                format!("SELECT rowid FROM {vec_table} WHERE embedding MATCH ?1 AND k = ?2 ORDER BY distance ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rowids: Vec<i64> = stmt
                .query_map(params![vec_json, limit as i64], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut entity_ids = Vec::with_capacity(rowids.len());
            for rowid in rowids {
                let entity_id: Option<String> = conn
                    .query_row(
                        "SELECT entity_id FROM vector_meta WHERE rowid = ?1",
                        params![rowid],
                        |row| row.get(0),
                    )
                    .ok();
                if let Some(id) = entity_id {
                    entity_ids.push(id);
                }
            }
            Ok(entity_ids)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn count(&self) -> Result<i64, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM vector_meta", [], |row| row.get(0))?;
            Ok(count)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn embed(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, crate::error::AgentError> {
            Err(crate::error::AgentError::other("provider unavailable"))
        }

        fn dimension(&self) -> usize {
            1536
        }
    }

    #[tokio::test]
    async fn upsert_and_search_round_trip_with_a_working_provider() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("vec.db"), Arc::new(DeterministicEmbedder::new()))
            .unwrap();
        index
            .upsert_embedding("e1".into(), "dragons guard the ancient library".into(), None)
            .await
            .unwrap();
        index
            .upsert_embedding("e2".into(), "quarterly tax filing instructions".into(), None)
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 2);

        let hits = index
            .semantic_search("dragons and libraries".into(), 2)
            .await
            .unwrap();
        assert_eq!(hits[0], "e1");
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_deterministic_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("vec.db"), Arc::new(FailingProvider)).unwrap();
        index
            .upsert_embedding("e1".into(), "the quick brown fox".into(), None)
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        let hits = index.semantic_search("quick fox".into(), 1).await.unwrap();
        assert_eq!(hits, vec!["e1".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_entry_from_both_tables() {
        let dir = tempfile::tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("vec.db"), Arc::new(DeterministicEmbedder::new()))
            .unwrap();
        index.upsert_embedding("e1".into(), "hello".into(), None).await.unwrap();
        index.delete("e1".into()).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
