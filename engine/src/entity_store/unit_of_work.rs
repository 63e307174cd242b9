//! Unit of Work (C4): the only legal mutation path. Every save or
//! delete is buffered and committed atomically across the filesystem, the
//! relational index, and the event log, with best-effort side effects
//! (vector index, cloud sync) after the atomic core.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use fs2::FileExt;
use serde_json::Value;
use tracing::warn;

use super::db::{ensure_schema, open_connection};
use super::error::EntityStoreError;
use super::event_log::append_event_tx;
use super::fs_store::{self, content_hash};
use super::model::{Entity, EventType};
use super::relational_index::{
    delete_entity_tx, delete_sync_metadata_tx, upsert_entity_tx, upsert_sync_metadata_tx,
};
use super::vector_index::VectorIndex;
use crate::ids;

/// Injected collaborator for step 10 of the commit sequence ("best-effort:
/// enqueue the raw persisted bytes for cloud sync"). The core ships only a
/// no-op implementation; the real transport is an external collaborator.
#[async_trait]
pub trait CloudSyncSink: Send + Sync {
    async fn enqueue(&self, yaml_path: &str, bytes: Vec<u8>) -> Result<(), EntityStoreError>;
}

pub struct NoopCloudSync;

#[async_trait]
impl CloudSyncSink for NoopCloudSync {
    async fn enqueue(&self, _yaml_path: &str, _bytes: Vec<u8>) -> Result<(), EntityStoreError> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct SaveRequest {
    pub entity_id: String,
    pub entity_type: String,
    pub name: String,
    pub yaml_path: String,
    pub data: HashMap<String, Value>,
    pub event_type: EventType,
    pub event_payload: Option<Value>,
    pub branch_id: String,
    pub parent_id: Option<String>,
    pub sort_order: i64,
    pub tags: Vec<String>,
    pub era_id: Option<String>,
    pub parent_version_id: Option<String>,
    pub model_preference: Option<String>,
    pub expected_hash: Option<String>,
}

impl SaveRequest {
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        name: impl Into<String>,
        yaml_path: impl Into<String>,
        data: HashMap<String, Value>,
        event_type: EventType,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            name: name.into(),
            yaml_path: yaml_path.into(),
            data,
            event_type,
            event_payload: None,
            branch_id: "main".to_string(),
            parent_id: None,
            sort_order: 0,
            tags: Vec::new(),
            era_id: None,
            parent_version_id: None,
            model_preference: None,
            expected_hash: None,
        }
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_sort_order(mut self, sort_order: i64) -> Self {
        self.sort_order = sort_order;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_expected_hash(mut self, hash: impl Into<String>) -> Self {
        self.expected_hash = Some(hash.into());
        self
    }

    pub fn with_event_payload(mut self, payload: Value) -> Self {
        self.event_payload = Some(payload);
        self
    }
}

#[derive(Clone, Debug)]
pub struct DeleteRequest {
    pub entity_id: String,
    pub entity_type: String,
    pub yaml_path: String,
    pub event_payload: Option<Value>,
    pub branch_id: String,
}

impl DeleteRequest {
    pub fn new(entity_id: impl Into<String>, entity_type: impl Into<String>, yaml_path: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            yaml_path: yaml_path.into(),
            event_payload: None,
            branch_id: "main".to_string(),
        }
    }
}

pub struct UnitOfWork {
    data_dir: PathBuf,
    index_db_path: PathBuf,
    vector_index: Arc<VectorIndex>,
    cloud_sync: Arc<dyn CloudSyncSink>,
    mtime_cache: Arc<DashMap<String, f64>>,
    buffered_saves: Vec<SaveRequest>,
    buffered_deletes: Vec<DeleteRequest>,
}

impl UnitOfWork {
    pub fn new(
        data_dir: impl AsRef<Path>,
        index_db_path: impl AsRef<Path>,
        vector_index: Arc<VectorIndex>,
        mtime_cache: Arc<DashMap<String, f64>>,
    ) -> Result<Self, EntityStoreError> {
        let index_db_path = index_db_path.as_ref().to_path_buf();
        let conn = open_connection(&index_db_path)?;
        ensure_schema(&conn)?;
        Ok(Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            index_db_path,
            vector_index,
            cloud_sync: Arc::new(NoopCloudSync),
            mtime_cache,
            buffered_saves: Vec::new(),
            buffered_deletes: Vec::new(),
        })
    }

    pub fn with_cloud_sync(mut self, sink: Arc<dyn CloudSyncSink>) -> Self {
        self.cloud_sync = sink;
        self
    }

    pub fn save(&mut self, request: SaveRequest) {
        self.buffered_saves.push(request);
    }

    pub fn delete(&mut self, request: DeleteRequest) {
        self.buffered_deletes.push(request);
    }

    pub fn has_pending(&self) -> bool {
        !self.buffered_saves.is_empty() || !self.buffered_deletes.is_empty()
    }

    pub fn rollback(&mut self) {
        self.buffered_saves.clear();
        self.buffered_deletes.clear();
    }

    /// Runs `body` against this Unit of Work, then commits if it left
    /// anything buffered, or rolls back if `body` itself failed, the
    /// "guaranteed release on all exit paths" scoped-acquisition pattern
    /// spec.md §4.4 asks for.
    pub async fn run<F, Fut, T>(mut self, body: F) -> Result<T, EntityStoreError>
    where
        F: FnOnce(&mut UnitOfWork) -> Fut,
        Fut: std::future::Future<Output = Result<T, EntityStoreError>>,
    {
        match body(&mut self).await {
            Ok(value) => {
                if self.has_pending() {
                    self.commit().await?;
                }
                Ok(value)
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    fn final_path(&self, yaml_path: &str) -> PathBuf {
        self.data_dir.join(yaml_path)
    }

    fn lock_path(&self, yaml_path: &str) -> PathBuf {
        self.data_dir.join(format!("{yaml_path}.lock"))
    }

    fn tmp_path(&self, yaml_path: &str) -> PathBuf {
        self.data_dir.join(format!("{yaml_path}.tmp"))
    }

    /// Executes the 11-step commit sequence. Steps 1-7 are the
    /// atomic core: any failure there unwinds every temp file already written
    /// and returns `Err` with the filesystem untouched. Steps 8-10 are
    /// best-effort post-commit side effects and never fail the commit.
    pub async fn commit(&mut self) -> Result<i64, EntityStoreError> {
        if !self.has_pending() {
            return Ok(0);
        }

        let saves = std::mem::take(&mut self.buffered_saves);
        let deletes = std::mem::take(&mut self.buffered_deletes);

        let touched_paths: Vec<String> = saves
            .iter()
            .map(|s| s.yaml_path.clone())
            .chain(deletes.iter().map(|d| d.yaml_path.clone()))
            .collect();

        // Step 1: acquire exclusive advisory locks.
        let mut locks: Vec<(PathBuf, File)> = Vec::new();
        for path in &touched_paths {
            let lock_path = self.lock_path(path);
            if let Some(parent) = lock_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(&lock_path)?;
            file.lock_exclusive()?;
            locks.push((lock_path, file));
        }

        let result = self.commit_locked(&saves, &deletes).await;

        // Step 11: release all advisory locks.
        for (path, file) in locks {
            let _ = FileExt::unlock(&file);
            let _ = fs::remove_file(path);
        }

        match result {
            Ok(count) => Ok(count),
            Err(e) => {
                self.buffered_saves = saves;
                self.buffered_deletes = deletes;
                Err(e)
            }
        }
    }

    async fn commit_locked(
        &self,
        saves: &[SaveRequest],
        deletes: &[DeleteRequest],
    ) -> Result<i64, EntityStoreError> {
        // Step 2: optimistic concurrency check.
        for request in saves {
            if let Some(expected) = &request.expected_hash {
                let current = self.current_content_hash(&request.entity_id).await?;
                if current.as_deref() != Some(expected.as_str()) {
                    return Err(EntityStoreError::Conflict {
                        entity_id: request.entity_id.clone(),
                    });
                }
            }
        }

        // Build final Entity records up front so steps 3-5 and 9-10 share one value.
        let mut entities = Vec::with_capacity(saves.len());
        for request in saves {
            let entity = self.build_entity(request).await?;
            entities.push(entity);
        }

        // Step 3: write each buffered YAML to a temp file, fsync before rename.
        let mut written_temp_files: Vec<PathBuf> = Vec::new();
        let write_result = self.write_temp_files(saves, &entities, &mut written_temp_files);
        if let Err(e) = write_result {
            self.cleanup_temp_files(&written_temp_files);
            return Err(e);
        }

        // Steps 4-5: one relational transaction for entity/sync-metadata rows and event appends.
        let db_path = self.index_db_path.clone();
        let saves_owned = saves.to_vec();
        let deletes_owned = deletes.to_vec();
        let entities_owned = entities.clone();
        let tx_result = tokio::task::spawn_blocking(move || {
            apply_relational_transaction(&db_path, &saves_owned, &deletes_owned, &entities_owned)
        })
        .await
        .map_err(|e| EntityStoreError::Storage(e.to_string()))?;

        if let Err(e) = tx_result {
            self.cleanup_temp_files(&written_temp_files);
            return Err(e);
        }

        // Step 6: atomically rename each temp file to its final path.
        for (request, path) in saves.iter().zip(written_temp_files.iter()) {
            let final_path = self.final_path(&request.yaml_path);
            fs::rename(path, &final_path)?;
        }

        // Step 7: soft-delete, move deleted files into a sibling `.trash/` directory.
        for request in deletes {
            self.trash_file(request)?;
        }

        // Step 8: invalidate mtime caches for every touched path.
        for request in saves {
            self.mtime_cache.remove(&request.yaml_path);
        }
        for request in deletes {
            self.mtime_cache.remove(&request.yaml_path);
        }

        // Step 9: best-effort vector index update.
        for entity in &entities {
            let text = embedding_text(entity);
            if let Err(e) = self
                .vector_index
                .upsert_embedding(entity.id.clone(), text, None)
                .await
            {
                warn!(entity_id = %entity.id, error = %e, "vector index update failed, continuing");
            }
        }
        for request in deletes {
            if let Err(e) = self.vector_index.delete(request.entity_id.clone()).await {
                warn!(entity_id = %request.entity_id, error = %e, "vector index delete failed, continuing");
            }
        }

        // Step 10: best-effort cloud sync of the persisted bytes.
        for request in saves {
            let final_path = self.final_path(&request.yaml_path);
            match fs::read(&final_path) {
                Ok(bytes) => {
                    if let Err(e) = self.cloud_sync.enqueue(&request.yaml_path, bytes).await {
                        warn!(path = %request.yaml_path, error = %e, "cloud sync enqueue failed, continuing");
                    }
                }
                Err(e) => warn!(path = %request.yaml_path, error = %e, "could not read file for cloud sync"),
            }
        }

        Ok((saves.len() + deletes.len()) as i64)
    }

    async fn current_content_hash(&self, entity_id: &str) -> Result<Option<String>, EntityStoreError> {
        let db_path = self.index_db_path.clone();
        let entity_id = entity_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.query_row(
                "SELECT content_hash FROM entities WHERE id = ?1",
                rusqlite::params![entity_id],
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

    async fn build_entity(&self, request: &SaveRequest) -> Result<Entity, EntityStoreError> {
        let existing = self
            .read_existing_entity(&request.yaml_path)
            .unwrap_or(None);
        let now = Utc::now();
        let created_at = existing.as_ref().map(|e| e.created_at).unwrap_or(now);

        Ok(Entity {
            id: request.entity_id.clone(),
            entity_type: request.entity_type.clone(),
            name: request.name.clone(),
            attributes: request.data.clone(),
            parent_id: request.parent_id.clone(),
            sort_order: request.sort_order,
            tags: request.tags.clone(),
            relationships: existing.map(|e| e.relationships).unwrap_or_default(),
            era_id: request.era_id.clone(),
            parent_version_id: request.parent_version_id.clone(),
            model_preference: request.model_preference.clone(),
            content_hash: content_hash(&request.data),
            created_at,
            updated_at: now,
        })
    }

    fn read_existing_entity(&self, yaml_path: &str) -> Result<Option<Entity>, EntityStoreError> {
        let path = self.final_path(yaml_path);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        Ok(Some(fs_store::parse_yaml(&raw)?))
    }

    fn write_temp_files(
        &self,
        saves: &[SaveRequest],
        entities: &[Entity],
        written: &mut Vec<PathBuf>,
    ) -> Result<(), EntityStoreError> {
        for (request, entity) in saves.iter().zip(entities.iter()) {
            let final_path = self.final_path(&request.yaml_path);
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp_path = self.tmp_path(&request.yaml_path);
            let yaml = fs_store::render_yaml(entity)?;
            fs::write(&tmp_path, yaml)?;
            let file = File::open(&tmp_path)?;
            file.sync_all()?;
            written.push(tmp_path);
        }
        Ok(())
    }

    fn cleanup_temp_files(&self, written: &[PathBuf]) {
        for path in written {
            let _ = fs::remove_file(path);
        }
    }

    fn trash_file(&self, request: &DeleteRequest) -> Result<(), EntityStoreError> {
        let final_path = self.final_path(&request.yaml_path);
        if !final_path.exists() {
            return Ok(());
        }
        let trash_dir = final_path
            .parent()
            .map(|p| p.join(".trash"))
            .unwrap_or_else(|| self.data_dir.join(".trash"));
        fs::create_dir_all(&trash_dir)?;
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| request.entity_id.clone());
        let trashed_name = format!("{}-{}", ids::new_id(), file_name);
        fs::rename(&final_path, trash_dir.join(trashed_name))?;
        Ok(())
    }
}

fn apply_relational_transaction(
    db_path: &Path,
    saves: &[SaveRequest],
    deletes: &[DeleteRequest],
    entities: &[Entity],
) -> Result<(), EntityStoreError> {
    let mut conn = open_connection(db_path)?;
    let tx = conn.transaction()?;

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    for (request, entity) in saves.iter().zip(entities.iter()) {
        upsert_entity_tx(&tx, entity)?;
        let file_size = fs_store::render_yaml(entity)?.len() as i64;
        upsert_sync_metadata_tx(
            &tx,
            &request.yaml_path,
            &entity.id,
            &entity.entity_type,
            &entity.content_hash,
            now_secs,
            file_size,
        )?;
        append_event_tx(
            &tx,
            None,
            &request.branch_id,
            request.event_type,
            &entity.id,
            &request
                .event_payload
                .clone()
                .unwrap_or_else(|| serde_json::to_value(&entity.attributes).unwrap_or(Value::Null)),
        )?;
    }

    for request in deletes {
        delete_entity_tx(&tx, &request.entity_id)?;
        delete_sync_metadata_tx(&tx, &request.yaml_path)?;
        append_event_tx(
            &tx,
            None,
            &request.branch_id,
            EventType::Delete,
            &request.entity_id,
            &request.event_payload.clone().unwrap_or(Value::Null),
        )?;
    }

    tx.commit()?;
    Ok(())
}

/// Text handed to the vector index for an entity: prefers a `text`/`summary`
/// attribute (how prose fragments and research results carry their body),
/// falls back to name plus the full attribute set.
fn embedding_text(entity: &Entity) -> String {
    if let Some(text) = entity.attributes.get("text").and_then(Value::as_str) {
        return format!("{} {}", entity.name, text);
    }
    if let Some(summary) = entity.attributes.get("summary").and_then(Value::as_str) {
        return format!("{} {}", entity.name, summary);
    }
    format!(
        "{} {}",
        entity.name,
        serde_json::to_string(&entity.attributes).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DeterministicEmbedder;
    use serde_json::json;

    fn make_uow(dir: &Path) -> UnitOfWork {
        let vector_index = Arc::new(
            VectorIndex::new(dir.join("vectors.db"), Arc::new(DeterministicEmbedder::new())).unwrap(),
        );
        UnitOfWork::new(
            dir.join("entities"),
            dir.join("index.db"),
            vector_index,
            Arc::new(DashMap::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn commit_writes_file_relational_row_and_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut uow = make_uow(dir.path());
        uow.save(SaveRequest::new(
            "e1",
            "character",
            "Aria",
            "character/aria.yaml",
            HashMap::from([("mood".to_string(), json!("tense"))]),
            EventType::Create,
        ));
        let count = uow.commit().await.unwrap();
        assert_eq!(count, 1);

        let final_path = dir.path().join("entities/character/aria.yaml");
        assert!(final_path.exists());

        let conn = rusqlite::Connection::open(dir.path().join("index.db")).unwrap();
        let hash: String = conn
            .query_row("SELECT content_hash FROM entities WHERE id = 'e1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(hash, content_hash(&HashMap::from([("mood".to_string(), json!("tense"))])));

        let event_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM event_log WHERE container_id = 'e1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(event_count, 1);
    }

    #[tokio::test]
    async fn occ_conflict_rejects_commit_when_hash_does_not_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut uow = make_uow(dir.path());
        uow.save(SaveRequest::new(
            "e1",
            "character",
            "Aria",
            "character/aria.yaml",
            HashMap::new(),
            EventType::Create,
        ));
        uow.commit().await.unwrap();

        let mut uow2 = make_uow(dir.path());
        uow2.save(
            SaveRequest::new(
                "e1",
                "character",
                "Aria",
                "character/aria.yaml",
                HashMap::from([("mood".to_string(), json!("calm"))]),
                EventType::Update,
            )
            .with_expected_hash("not-the-real-hash"),
        );
        let err = uow2.commit().await.unwrap_err();
        assert!(matches!(err, EntityStoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn delete_moves_file_to_trash_and_removes_relational_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut uow = make_uow(dir.path());
        uow.save(SaveRequest::new(
            "e1",
            "character",
            "Aria",
            "character/aria.yaml",
            HashMap::new(),
            EventType::Create,
        ));
        uow.commit().await.unwrap();

        let mut uow2 = make_uow(dir.path());
        uow2.delete(DeleteRequest::new("e1", "character", "character/aria.yaml"));
        uow2.commit().await.unwrap();

        assert!(!dir.path().join("entities/character/aria.yaml").exists());
        let trash_dir = dir.path().join("entities/character/.trash");
        assert_eq!(fs::read_dir(&trash_dir).unwrap().count(), 1);

        let conn = rusqlite::Connection::open(dir.path().join("index.db")).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM entities WHERE id = 'e1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn run_helper_rolls_back_on_error_and_commits_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let uow = make_uow(dir.path());
        let result: Result<(), EntityStoreError> = uow
            .run(|uow| {
                uow.save(SaveRequest::new(
                    "e1",
                    "character",
                    "Aria",
                    "character/aria.yaml",
                    HashMap::new(),
                    EventType::Create,
                ));
                Box::pin(async move { Err(EntityStoreError::Validation("deliberate".into())) })
            })
            .await;
        assert!(result.is_err());
        assert!(!dir.path().join("entities/character/aria.yaml").exists());
    }
}
