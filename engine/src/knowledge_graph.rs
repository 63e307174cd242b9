//! Knowledge Graph Service (C5): a thin facade over the entity
//! store's C1–C3 components providing the higher-level queries the pipeline
//! and chat layers actually want, rather than raw index/event-log calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::entity_store::{
    Entity, EntityStoreError, EventType, RelationalIndex, Relationship, SaveRequest, UnitOfWork,
    VectorIndex,
};
use crate::ids;

const STRUCTURAL_TYPES: &[&str] = &["season", "arc", "act", "chapter", "scene"];

/// The on-disk path used by [`KnowledgeGraph::create_entity`] (and reversed
/// by [`KnowledgeGraph::delete_entity`]): `<type>/<slugified-name>-<id>.yaml`.
/// The id suffix avoids collisions between same-named entities that
/// `relational_index::yaml_path_for` (which has no id suffix) would cause.
fn generic_yaml_path(entity_type: &str, name: &str, id: &str) -> String {
    let slug = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>();
    format!("{entity_type}/{slug}-{id}.yaml")
}

/// One result of [`KnowledgeGraph::semantic_search`] / `hybrid_search`: an
/// entity plus its ordinal rank (0 = best match).
#[derive(Clone, Debug)]
pub struct ScoredEntity {
    pub entity: Entity,
    pub score: usize,
}

#[derive(Clone, Debug)]
pub struct TreeNode {
    pub entity: Entity,
    pub children: Vec<TreeNode>,
}

/// An unresolved (or resolved) relationship, carrying enough identity to act
/// on it via [`KnowledgeGraph::resolve_thread`].
#[derive(Clone, Debug)]
pub struct Thread {
    pub edge_id: String,
    pub source_id: String,
    pub relationship: Relationship,
}

pub struct KnowledgeGraph {
    relational: Arc<RelationalIndex>,
    vector: Arc<VectorIndex>,
    data_dir: PathBuf,
    index_db_path: PathBuf,
    mtime_cache: Arc<DashMap<String, f64>>,
}

impl KnowledgeGraph {
    pub fn new(
        relational: Arc<RelationalIndex>,
        vector: Arc<VectorIndex>,
        data_dir: impl AsRef<Path>,
        index_db_path: impl AsRef<Path>,
        mtime_cache: Arc<DashMap<String, f64>>,
    ) -> Self {
        Self {
            relational,
            vector,
            data_dir: data_dir.as_ref().to_path_buf(),
            index_db_path: index_db_path.as_ref().to_path_buf(),
            mtime_cache,
        }
    }

    fn unit_of_work(&self) -> Result<UnitOfWork, EntityStoreError> {
        UnitOfWork::new(
            &self.data_dir,
            &self.index_db_path,
            self.vector.clone(),
            self.mtime_cache.clone(),
        )
    }

    pub async fn find_containers(
        &self,
        container_type: Option<String>,
        filters: Option<HashMap<String, Value>>,
    ) -> Result<Vec<Entity>, EntityStoreError> {
        self.relational
            .query_entities(container_type.clone(), container_type, filters)
            .await
    }

    /// Links two entities.
    pub async fn add_relationship(
        &self,
        source_id: String,
        target_id: String,
        rel_type: String,
        metadata: Option<Value>,
    ) -> Result<(), EntityStoreError> {
        self.relational.add_relationship(source_id, target_id, rel_type, metadata).await
    }

    pub async fn get_neighbors(
        &self,
        id: String,
        rel_type: Option<String>,
    ) -> Result<Vec<Entity>, EntityStoreError> {
        self.relational.get_related(id, rel_type).await
    }

    pub async fn get_children(&self, id: String) -> Result<Vec<Entity>, EntityStoreError> {
        self.relational.get_children(id).await
    }

    pub async fn get_entity(&self, id: String) -> Result<Option<Entity>, EntityStoreError> {
        self.relational.get_entity(id).await
    }

    pub async fn get_entities_by_type(&self, entity_type: String) -> Result<Vec<Entity>, EntityStoreError> {
        self.relational.query_entities(Some(entity_type), None, None).await
    }

    /// Recursively builds the structural tree under `project_id`, restricted
    /// to `{season, arc, act, chapter, scene}`, non-structural children
    /// (characters mentioned in a scene, research notes, etc.) are excluded.
    pub async fn get_structure_tree(&self, project_id: String) -> Result<Vec<TreeNode>, EntityStoreError> {
        let roots = self.relational.get_children(project_id).await?;
        let mut nodes = Vec::with_capacity(roots.len());
        for entity in roots {
            if STRUCTURAL_TYPES.contains(&entity.entity_type.as_str()) {
                nodes.push(self.build_subtree(entity).await?);
            }
        }
        Ok(nodes)
    }

    fn build_subtree<'a>(
        &'a self,
        entity: Entity,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<TreeNode, EntityStoreError>> + 'a>> {
        Box::pin(async move {
            let child_entities = self.relational.get_children(entity.id.clone()).await?;
            let mut children = Vec::new();
            for child in child_entities {
                if STRUCTURAL_TYPES.contains(&child.entity_type.as_str()) {
                    children.push(self.build_subtree(child).await?);
                }
            }
            Ok(TreeNode { entity, children })
        })
    }

    /// Calls C3 then enriches each hit from C2. Hits with no surviving
    /// relational row (e.g. deleted since indexing) are dropped. Ordinal
    /// `score` (0 = best) reflects the vector index's distance ordering.
    pub async fn semantic_search(
        &self,
        query: String,
        limit: usize,
    ) -> Result<Vec<ScoredEntity>, EntityStoreError> {
        let ids = self.vector.semantic_search(query, limit).await?;
        let mut out = Vec::with_capacity(ids.len());
        for (score, id) in ids.into_iter().enumerate() {
            if let Some(entity) = self.relational.get_entity(id).await? {
                out.push(ScoredEntity { entity, score });
            }
        }
        Ok(out)
    }

    /// Like `semantic_search`, but candidates may be optionally type-filtered
    /// after C2 enrichment.
    pub async fn hybrid_search(
        &self,
        query: String,
        container_type: Option<String>,
        limit: usize,
    ) -> Result<Vec<ScoredEntity>, EntityStoreError> {
        let hits = self.semantic_search(query, limit).await?;
        Ok(match container_type {
            Some(t) => hits.into_iter().filter(|h| h.entity.entity_type == t).collect(),
            None => hits,
        })
    }

    /// Searches for a version of `entity_id` with matching `era_id`,
    /// preferring a fork whose `parent_version_id == entity_id`; otherwise
    /// returns the base entity unchanged.
    pub async fn get_entity_at_era(
        &self,
        entity_id: String,
        era_id: String,
    ) -> Result<Option<Entity>, EntityStoreError> {
        let base = self.relational.get_entity(entity_id.clone()).await?;
        let candidates = self
            .relational
            .query_entities(None, None, None)
            .await?
            .into_iter()
            .filter(|e| e.era_id.as_deref() == Some(era_id.as_str()))
            .collect::<Vec<_>>();

        if let Some(fork) = candidates
            .iter()
            .find(|e| e.parent_version_id.as_deref() == Some(entity_id.as_str()))
        {
            return Ok(Some(fork.clone()));
        }
        if let Some(exact) = candidates.into_iter().find(|e| e.id == entity_id) {
            return Ok(Some(exact));
        }
        Ok(base)
    }

    /// Clones `entity_id` under a new id, sets `parent_version_id` to the
    /// original and `era_id` to `new_era_id`, and persists the fork via C4.
    pub async fn create_era_fork(
        &self,
        entity_id: String,
        new_era_id: String,
    ) -> Result<Entity, EntityStoreError> {
        let original = self
            .relational
            .get_entity(entity_id.clone())
            .await?
            .ok_or_else(|| EntityStoreError::NotFound(format!("entity {entity_id} not found")))?;

        let fork_id = ids::new_id();
        let yaml_path = format!("{}/{}-{}.yaml", original.entity_type, original.slug(), new_era_id);

        let mut request = SaveRequest::new(
            fork_id.clone(),
            original.entity_type.clone(),
            original.name.clone(),
            yaml_path,
            original.attributes.clone(),
            EventType::Create,
        )
        .with_sort_order(original.sort_order)
        .with_tags(original.tags.clone());
        if let Some(parent_id) = &original.parent_id {
            request = request.with_parent_id(parent_id.clone());
        }
        request.era_id = Some(new_era_id);
        request.parent_version_id = Some(entity_id);
        request.model_preference = original.model_preference.clone();

        let mut uow = self.unit_of_work()?;
        uow.save(request);
        uow.commit().await?;

        self.relational
            .get_entity(fork_id)
            .await?
            .ok_or_else(|| EntityStoreError::Storage("era fork vanished immediately after commit".into()))
    }

    /// Persists a brand-new entity of `entity_type` via C4. Used by callers
    /// outside the entity store proper (the pipeline engine's research and
    /// run-persistence handlers) that need a generic creation path rather
    /// than a bespoke one like [`KnowledgeGraph::create_era_fork`].
    pub async fn create_entity(
        &self,
        entity_type: String,
        name: String,
        attributes: HashMap<String, Value>,
        parent_id: Option<String>,
    ) -> Result<Entity, EntityStoreError> {
        let id = ids::new_id();
        let yaml_path = generic_yaml_path(&entity_type, &name, &id);

        let mut request = SaveRequest::new(
            id.clone(),
            entity_type,
            name,
            yaml_path,
            attributes,
            EventType::Create,
        );
        if let Some(parent_id) = parent_id {
            request = request.with_parent_id(parent_id);
        }

        let mut uow = self.unit_of_work()?;
        uow.save(request);
        uow.commit().await?;

        self.relational
            .get_entity(id)
            .await?
            .ok_or_else(|| EntityStoreError::Storage("entity vanished immediately after commit".into()))
    }

    /// Merges `attributes_patch` into an existing entity's attributes and
    /// persists the result as an `EventType::Update`. Uses the entity's current `content_hash` as the
    /// expected hash so a concurrent writer's change is detected rather
    /// than silently overwritten.
    pub async fn update_entity(
        &self,
        id: String,
        attributes_patch: HashMap<String, Value>,
    ) -> Result<Entity, EntityStoreError> {
        let existing = self
            .relational
            .get_entity(id.clone())
            .await?
            .ok_or_else(|| EntityStoreError::NotFound(format!("entity {id} not found")))?;

        let mut attributes = existing.attributes.clone();
        attributes.extend(attributes_patch);
        let yaml_path = generic_yaml_path(&existing.entity_type, &existing.name, &existing.id);

        let mut request = SaveRequest::new(
            existing.id.clone(),
            existing.entity_type.clone(),
            existing.name.clone(),
            yaml_path,
            attributes,
            EventType::Update,
        )
        .with_sort_order(existing.sort_order)
        .with_tags(existing.tags.clone())
        .with_expected_hash(existing.content_hash.clone());
        if let Some(parent_id) = &existing.parent_id {
            request = request.with_parent_id(parent_id.clone());
        }
        request.era_id = existing.era_id.clone();
        request.parent_version_id = existing.parent_version_id.clone();
        request.model_preference = existing.model_preference.clone();

        let mut uow = self.unit_of_work()?;
        uow.save(request);
        uow.commit().await?;

        self.relational
            .get_entity(id)
            .await?
            .ok_or_else(|| EntityStoreError::Storage("entity vanished immediately after update".into()))
    }

    /// Soft-deletes an entity (moved to `.trash/` by C4, relational row and
    /// vector embedding removed). Used by pipeline-definition deletion.
    pub async fn delete_entity(&self, id: String) -> Result<(), EntityStoreError> {
        let entity = self
            .relational
            .get_entity(id.clone())
            .await?
            .ok_or_else(|| EntityStoreError::NotFound(format!("entity {id} not found")))?;
        let yaml_path = generic_yaml_path(&entity.entity_type, &entity.name, &entity.id);

        let mut uow = self.unit_of_work()?;
        uow.delete(crate::entity_store::DeleteRequest::new(
            entity.id.clone(),
            entity.entity_type.clone(),
            yaml_path,
        ));
        uow.commit().await?;
        Ok(())
    }

    /// Relationships whose metadata lacks `resolved = true`, optionally
    /// restricted to edges whose source entity belongs to `era_id`.
    pub async fn get_unresolved_threads(&self, era_id: Option<String>) -> Result<Vec<Thread>, EntityStoreError> {
        let all = self.relational.get_all_relationships_with_source().await?;
        let mut threads = Vec::new();
        for (edge_id, source_id, relationship) in all {
            if relationship.is_resolved() {
                continue;
            }
            if let Some(era) = &era_id {
                let source = self.relational.get_entity(source_id.clone()).await?;
                if source.and_then(|e| e.era_id).as_deref() != Some(era.as_str()) {
                    continue;
                }
            }
            threads.push(Thread {
                edge_id,
                source_id,
                relationship,
            });
        }
        Ok(threads)
    }

    pub async fn resolve_thread(
        &self,
        edge_id: String,
        resolved_in_era: Option<String>,
    ) -> Result<(), EntityStoreError> {
        self.relational.set_relationship_resolved(edge_id, resolved_in_era).await
    }
}
