//! Relational Index (C2): indexed, queryable mirror of current
//! entity state, plus sync-metadata for out-of-band filesystem change
//! detection and a relationships table for the general entity graph.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;

use super::db::{ensure_schema, open_connection};
use super::error::EntityStoreError;
use super::model::{Entity, Relationship};
use crate::ids;

pub struct RelationalIndex {
    db_path: PathBuf,
}

impl RelationalIndex {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, EntityStoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = open_connection(&db_path)?;
        ensure_schema(&conn)?;
        Ok(Self { db_path })
    }

    pub async fn upsert_entity(&self, entity: Entity) -> Result<(), EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            upsert_entity_tx(&conn, &entity)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn delete_entity(&self, id: String) -> Result<(), EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            delete_entity_tx(&conn, &id)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn get_entity_by_path(&self, path: String) -> Result<Option<Entity>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn.prepare(&format!("{SELECT_ENTITY_COLUMNS} WHERE yaml_path = ?1"))?;
            let mut rows = stmt.query(params![path])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_entity(row)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn get_entity(&self, id: String) -> Result<Option<Entity>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn.prepare(&format!("{SELECT_ENTITY_COLUMNS} WHERE id = ?1"))?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_entity(row)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    /// `filters` matches attribute key → required value against the
    /// deserialised attributes map (not a raw JSON string match).
    pub async fn query_entities(
        &self,
        entity_type: Option<String>,
        container_type: Option<String>,
        filters: Option<HashMap<String, Value>>,
    ) -> Result<Vec<Entity>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut sql = format!("{SELECT_ENTITY_COLUMNS} WHERE 1=1");
            let mut bind: Vec<String> = Vec::new();
            if let Some(t) = &entity_type {
                sql.push_str(" AND entity_type = ?");
                bind.push(t.clone());
            }
            if let Some(t) = &container_type {
                sql.push_str(" AND container_type = ?");
                bind.push(t.clone());
            }
            sql.push_str(" ORDER BY sort_order ASC, created_at ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(bind.iter()), row_to_entity)?;
            let mut entities = Vec::new();
            for row in rows {
                let entity = row?;
                if matches_filters(&entity, filters.as_ref()) {
                    entities.push(entity);
                }
            }
            Ok(entities)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn get_children(&self, parent_id: String) -> Result<Vec<Entity>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn.prepare(&format!(
                "{SELECT_ENTITY_COLUMNS} WHERE parent_id = ?1 ORDER BY sort_order ASC"
            ))?;
            let rows = stmt.query_map(params![parent_id], row_to_entity)?;
            let mut entities = Vec::new();
            for row in rows {
                entities.push(row?);
            }
            Ok(entities)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn get_roots(
        &self,
        entity_types: Option<Vec<String>>,
    ) -> Result<Vec<Entity>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut sql = format!("{SELECT_ENTITY_COLUMNS} WHERE parent_id IS NULL");
            if let Some(types) = &entity_types {
                if !types.is_empty() {
                    let placeholders = types.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                    sql.push_str(&format!(" AND entity_type IN ({placeholders})"));
                }
            }
            sql.push_str(" ORDER BY sort_order ASC");
            let mut stmt = conn.prepare(&sql)?;
            let binds: Vec<&str> = entity_types
                .as_ref()
                .map(|v| v.iter().map(String::as_str).collect())
                .unwrap_or_default();
            let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter()), row_to_entity)?;
            let mut entities = Vec::new();
            for row in rows {
                entities.push(row?);
            }
            Ok(entities)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn get_content_hash(&self, id: String) -> Result<Option<String>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.query_row(
                "SELECT content_hash FROM entities WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(EntityStoreError::from(other)),
            })
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn get_entity_count_by_type(&self) -> Result<HashMap<String, i64>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut stmt =
                conn.prepare("SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = HashMap::new();
            for row in rows {
                let (t, c) = row?;
                counts.insert(t, c);
            }
            Ok(counts)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn upsert_sync_metadata(
        &self,
        yaml_path: String,
        entity_id: String,
        entity_type: String,
        content_hash: String,
        mtime: f64,
        file_size: i64,
    ) -> Result<(), EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            upsert_sync_metadata_tx(
                &conn,
                &yaml_path,
                &entity_id,
                &entity_type,
                &content_hash,
                mtime,
                file_size,
            )
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn get_sync_metadata(
        &self,
        path: Option<String>,
    ) -> Result<Vec<SyncMetadata>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut sql =
                "SELECT yaml_path, entity_id, entity_type, content_hash, mtime, file_size FROM sync_metadata"
                    .to_string();
            if path.is_some() {
                sql.push_str(" WHERE yaml_path = ?1");
            }
            let mut stmt = conn.prepare(&sql)?;
            let to_row = |row: &rusqlite::Row| -> rusqlite::Result<SyncMetadata> {
                Ok(SyncMetadata {
                    yaml_path: row.get(0)?,
                    entity_id: row.get(1)?,
                    entity_type: row.get(2)?,
                    content_hash: row.get(3)?,
                    mtime: row.get(4)?,
                    file_size: row.get(5)?,
                })
            };
            let rows = if let Some(p) = &path {
                stmt.query_map(params![p], to_row)?
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                stmt.query_map([], to_row)?.collect::<Result<Vec<_>, _>>()?
            };
            Ok(rows)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn delete_sync_metadata(&self, path: String) -> Result<(), EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.execute("DELETE FROM sync_metadata WHERE yaml_path = ?1", params![path])?;
            Ok(())
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn add_relationship(
        &self,
        source_id: String,
        target_id: String,
        rel_type: String,
        metadata: Option<Value>,
    ) -> Result<(), EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.execute(
                "INSERT INTO relationships (id, source_id, target_id, rel_type, metadata_json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ids::new_id(),
                    source_id,
                    target_id,
                    rel_type,
                    serde_json::to_string(&metadata.unwrap_or(Value::Object(Default::default())))?,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn get_related(
        &self,
        container_id: String,
        rel_type: Option<String>,
    ) -> Result<Vec<Entity>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut sql =
                "SELECT target_id FROM relationships WHERE source_id = ?1".to_string();
            if rel_type.is_some() {
                sql.push_str(" AND rel_type = ?2");
            }
            let mut stmt = conn.prepare(&sql)?;
            let target_ids: Vec<String> = if let Some(rt) = &rel_type {
                stmt.query_map(params![container_id, rt], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                stmt.query_map(params![container_id], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?
            };
            let mut entities = Vec::new();
            for target_id in target_ids {
                let mut stmt = conn.prepare(&format!("{SELECT_ENTITY_COLUMNS} WHERE id = ?1"))?;
                let mut rows = stmt.query(params![target_id])?;
                if let Some(row) = rows.next()? {
                    entities.push(row_to_entity(row)?);
                }
            }
            Ok(entities)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    pub async fn get_all_relationships(&self) -> Result<Vec<Relationship>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn.prepare("SELECT target_id, rel_type, metadata_json FROM relationships")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut relationships = Vec::new();
            for row in rows {
                let (target_id, rel_type, metadata_json) = row?;
                relationships.push(Relationship {
                    target_id,
                    rel_type,
                    metadata: serde_json::from_str(&metadata_json)?,
                });
            }
            Ok(relationships)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    /// Same rows as [`get_all_relationships`](Self::get_all_relationships), but
    /// carrying each relationship's own `id` and `source_id`, needed to
    /// address a specific edge (e.g. the Knowledge Graph Service's unresolved
    /// thread lookups and `resolve_thread`).
    pub async fn get_all_relationships_with_source(
        &self,
    ) -> Result<Vec<(String, String, Relationship)>, EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut stmt =
                conn.prepare("SELECT id, source_id, target_id, rel_type, metadata_json FROM relationships")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, source_id, target_id, rel_type, metadata_json) = row?;
                out.push((
                    id,
                    source_id,
                    Relationship {
                        target_id,
                        rel_type,
                        metadata: serde_json::from_str(&metadata_json)?,
                    },
                ));
            }
            Ok(out)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }

    /// Flips a relationship's `resolved` metadata flag, recording the era it
    /// was resolved in when given.
    pub async fn set_relationship_resolved(
        &self,
        edge_id: String,
        resolved_in_era: Option<String>,
    ) -> Result<(), EntityStoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let metadata_json: String = conn.query_row(
                "SELECT metadata_json FROM relationships WHERE id = ?1",
                params![edge_id],
                |row| row.get(0),
            )?;
            let mut metadata: Value = serde_json::from_str(&metadata_json)?;
            if let Value::Object(map) = &mut metadata {
                map.insert("resolved".to_string(), Value::Bool(true));
                if let Some(era) = &resolved_in_era {
                    map.insert("resolved_in_era".to_string(), Value::String(era.clone()));
                }
            }
            conn.execute(
                "UPDATE relationships SET metadata_json = ?1 WHERE id = ?2",
                params![serde_json::to_string(&metadata)?, edge_id],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?
    }
}

#[derive(Clone, Debug)]
pub struct SyncMetadata {
    pub yaml_path: String,
    pub entity_id: String,
    pub entity_type: String,
    pub content_hash: String,
    pub mtime: f64,
    pub file_size: i64,
}

const SELECT_ENTITY_COLUMNS: &str = "SELECT id, entity_type, name, yaml_path, content_hash, attributes_json, created_at, updated_at, container_type, parent_id, sort_order, tags_json, relationships_json, era_id, parent_version_id, model_preference FROM entities";

fn row_to_entity(row: &rusqlite::Row) -> rusqlite::Result<Entity> {
    let attributes_json: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    let tags_json: String = row.get(11)?;
    let relationships_json: String = row.get(12)?;

    Ok(Entity {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        name: row.get(2)?,
        attributes: serde_json::from_str(&attributes_json).unwrap_or_default(),
        parent_id: row.get(9)?,
        sort_order: row.get(10)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        relationships: serde_json::from_str(&relationships_json).unwrap_or_default(),
        era_id: row.get(13)?,
        parent_version_id: row.get(14)?,
        model_preference: row.get(15)?,
        content_hash: row.get(4)?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn matches_filters(entity: &Entity, filters: Option<&HashMap<String, Value>>) -> bool {
    let Some(filters) = filters else { return true };
    filters
        .iter()
        .all(|(k, v)| entity.attributes.get(k) == Some(v))
}

/// Upserts one entity row within an already-open connection/transaction --
/// shared by the standalone API above and the Unit of Work commit sequence.
pub fn upsert_entity_tx(conn: &Connection, entity: &Entity) -> Result<(), EntityStoreError> {
    conn.execute(
        "INSERT INTO entities (id, entity_type, name, yaml_path, content_hash, attributes_json, created_at, updated_at, container_type, parent_id, sort_order, tags_json, relationships_json, era_id, parent_version_id, model_preference)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT(id) DO UPDATE SET
            entity_type = excluded.entity_type,
            name = excluded.name,
            yaml_path = excluded.yaml_path,
            content_hash = excluded.content_hash,
            attributes_json = excluded.attributes_json,
            updated_at = excluded.updated_at,
            container_type = excluded.container_type,
            parent_id = excluded.parent_id,
            sort_order = excluded.sort_order,
            tags_json = excluded.tags_json,
            relationships_json = excluded.relationships_json,
            era_id = excluded.era_id,
            parent_version_id = excluded.parent_version_id,
            model_preference = excluded.model_preference",
        params![
            entity.id,
            entity.entity_type,
            entity.name,
            yaml_path_for(entity),
            entity.content_hash,
            serde_json::to_string(&entity.attributes)?,
            entity.created_at.to_rfc3339(),
            entity.updated_at.to_rfc3339(),
            entity.entity_type,
            entity.parent_id,
            entity.sort_order,
            serde_json::to_string(&entity.tags)?,
            serde_json::to_string(&entity.relationships)?,
            entity.era_id,
            entity.parent_version_id,
            entity.model_preference,
        ],
    )?;
    Ok(())
}

pub fn delete_entity_tx(conn: &Connection, id: &str) -> Result<(), EntityStoreError> {
    conn.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn upsert_sync_metadata_tx(
    conn: &Connection,
    yaml_path: &str,
    entity_id: &str,
    entity_type: &str,
    content_hash: &str,
    mtime: f64,
    file_size: i64,
) -> Result<(), EntityStoreError> {
    conn.execute(
        "INSERT INTO sync_metadata (yaml_path, entity_id, entity_type, content_hash, mtime, file_size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(yaml_path) DO UPDATE SET
            entity_id = excluded.entity_id,
            entity_type = excluded.entity_type,
            content_hash = excluded.content_hash,
            mtime = excluded.mtime,
            file_size = excluded.file_size",
        params![yaml_path, entity_id, entity_type, content_hash, mtime, file_size],
    )?;
    Ok(())
}

pub fn delete_sync_metadata_tx(conn: &Connection, yaml_path: &str) -> Result<(), EntityStoreError> {
    conn.execute("DELETE FROM sync_metadata WHERE yaml_path = ?1", params![yaml_path])?;
    Ok(())
}

/// The `yaml_path` recorded for an entity is `<entity_type>/<slug>.yaml`
///.
pub fn yaml_path_for(entity: &Entity) -> String {
    format!("{}/{}.yaml", entity.entity_type, entity.slug())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_entity(id: &str, parent_id: Option<&str>, sort_order: i64) -> Entity {
        let now = Utc::now();
        Entity {
            id: id.to_string(),
            entity_type: "scene".to_string(),
            name: format!("Scene {id}"),
            attributes: HashMap::from([("mood".to_string(), json!("tense"))]),
            parent_id: parent_id.map(String::from),
            sort_order,
            tags: vec![],
            relationships: vec![],
            era_id: None,
            parent_version_id: None,
            model_preference: None,
            content_hash: "deadbeef".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_and_get_entity_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let index = RelationalIndex::new(dir.path().join("index.db")).unwrap();
        let entity = sample_entity("e1", None, 0);
        index.upsert_entity(entity.clone()).await.unwrap();
        let fetched = index.get_entity("e1".into()).await.unwrap().unwrap();
        assert_eq!(fetched.name, entity.name);
        assert_eq!(fetched.attributes.get("mood"), Some(&json!("tense")));
    }

    #[tokio::test]
    async fn get_children_orders_by_sort_order() {
        let dir = tempfile::tempdir().unwrap();
        let index = RelationalIndex::new(dir.path().join("index.db")).unwrap();
        index.upsert_entity(sample_entity("c2", Some("p"), 2)).await.unwrap();
        index.upsert_entity(sample_entity("c1", Some("p"), 1)).await.unwrap();
        index.upsert_entity(sample_entity("c3", Some("p"), 3)).await.unwrap();
        let children = index.get_children("p".into()).await.unwrap();
        assert_eq!(
            children.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["c1", "c2", "c3"]
        );
    }

    #[tokio::test]
    async fn delete_entity_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = RelationalIndex::new(dir.path().join("index.db")).unwrap();
        index.delete_entity("missing".into()).await.unwrap();
        index.upsert_entity(sample_entity("e1", None, 0)).await.unwrap();
        index.delete_entity("e1".into()).await.unwrap();
        index.delete_entity("e1".into()).await.unwrap();
        assert!(index.get_entity("e1".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_entities_filters_by_attribute_value() {
        let dir = tempfile::tempdir().unwrap();
        let index = RelationalIndex::new(dir.path().join("index.db")).unwrap();
        index.upsert_entity(sample_entity("e1", None, 0)).await.unwrap();
        let mut other = sample_entity("e2", None, 1);
        other.attributes.insert("mood".to_string(), json!("calm"));
        index.upsert_entity(other).await.unwrap();

        let filters = HashMap::from([("mood".to_string(), json!("tense"))]);
        let results = index
            .query_entities(Some("scene".into()), None, Some(filters))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "e1");
    }

    #[tokio::test]
    async fn relationships_are_queryable_by_source_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let index = RelationalIndex::new(dir.path().join("index.db")).unwrap();
        index.upsert_entity(sample_entity("e1", None, 0)).await.unwrap();
        index.upsert_entity(sample_entity("e2", None, 1)).await.unwrap();
        index
            .add_relationship("e1".into(), "e2".into(), "mentions".into(), None)
            .await
            .unwrap();
        let related = index.get_related("e1".into(), Some("mentions".into())).await.unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, "e2");
    }
}
