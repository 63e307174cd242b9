//! Chat tool registry: the concrete actions a classified
//! intent can dispatch to, one handler per intent, collapsed onto a single
//! trait since stable async Rust has no generator handler shape, a handler
//! returns its output as a `Vec<ToolYield>` computed eagerly rather than
//! truly streamed increments, matching how
//! [`crate::llm::LlmClient::invoke_stream`]'s default implementation already
//! emits one whole-response chunk.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use stream_event::ProtocolEvent;

use crate::agent_dispatcher::AgentDispatcher;
use crate::knowledge_graph::KnowledgeGraph;
use crate::pipeline::PipelineEngine;

use super::intent::*;

/// Tool categories that get a synthesized `artifact` event appended by the
/// orchestrator once their handler completes.
pub const ARTIFACT_CATEGORIES: &[&str] = &["search", "create", "evaluate", "pipeline"];

#[derive(Clone, Debug, Default)]
pub struct ToolInput {
    pub content: String,
    pub entity_ids: Vec<String>,
    pub session_id: String,
    pub params: Map<String, Value>,
}

#[derive(Clone, Debug)]
pub enum ToolYield {
    Text(String),
    Event(ProtocolEvent),
}

#[async_trait]
pub trait ChatTool: Send + Sync {
    fn name(&self) -> &str;
    fn category(&self) -> &str;
    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String>;
}

fn text(s: impl Into<String>) -> Vec<ToolYield> {
    vec![ToolYield::Text(s.into())]
}

/// `SEARCH`: hybrid semantic + type search over the knowledge graph
///.
pub struct SearchTool {
    knowledge_graph: Arc<KnowledgeGraph>,
}

impl SearchTool {
    pub fn new(knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self { knowledge_graph }
    }
}

#[async_trait]
impl ChatTool for SearchTool {
    fn name(&self) -> &str {
        TOOL_SEARCH
    }

    fn category(&self) -> &str {
        "search"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let container_type = input
            .params
            .get("entity_type")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        let hits = self
            .knowledge_graph
            .hybrid_search(input.content, container_type, 10)
            .await
            .map_err(|e| e.to_string())?;
        if hits.is_empty() {
            return Ok(text("No matching entities found."));
        }
        let lines: Vec<String> = hits
            .iter()
            .map(|h| format!("- {} ({}): {}", h.entity.name, h.entity.entity_type, h.entity.id))
            .collect();
        Ok(text(format!("Found {} matches:\n{}", hits.len(), lines.join("\n"))))
    }
}

/// `CREATE`: makes a new entity from a `{entity_type, name, attributes,
/// parent_id}` payload.
pub struct CreateTool {
    knowledge_graph: Arc<KnowledgeGraph>,
}

impl CreateTool {
    pub fn new(knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self { knowledge_graph }
    }
}

#[async_trait]
impl ChatTool for CreateTool {
    fn name(&self) -> &str {
        TOOL_CREATE
    }

    fn category(&self) -> &str {
        "create"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let entity_type = input
            .params
            .get("entity_type")
            .and_then(Value::as_str)
            .ok_or("CREATE requires an \"entity_type\" parameter")?
            .to_string();
        let name = input
            .params
            .get("name")
            .and_then(Value::as_str)
            .ok_or("CREATE requires a \"name\" parameter")?
            .to_string();
        let attributes: HashMap<String, Value> = input
            .params
            .get("attributes")
            .and_then(Value::as_object)
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();
        let parent_id = input.params.get("parent_id").and_then(Value::as_str).map(String::from);

        let entity = self
            .knowledge_graph
            .create_entity(entity_type, name, attributes, parent_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(text(format!("Created {} \"{}\" ({})", entity.entity_type, entity.name, entity.id)))
    }
}

/// `UPDATE`: merges an attribute patch into an existing entity via
/// `KnowledgeGraph::update_entity`. Destructive, gated behind
/// `autonomy_level` by the intent classifier.
pub struct UpdateTool {
    knowledge_graph: Arc<KnowledgeGraph>,
}

impl UpdateTool {
    pub fn new(knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self { knowledge_graph }
    }
}

#[async_trait]
impl ChatTool for UpdateTool {
    fn name(&self) -> &str {
        TOOL_UPDATE
    }

    fn category(&self) -> &str {
        "update"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let entity_id = input
            .entity_ids
            .first()
            .cloned()
            .or_else(|| input.params.get("entity_id").and_then(Value::as_str).map(String::from))
            .ok_or("UPDATE requires a mentioned or explicit entity id")?;
        let patch: HashMap<String, Value> = input
            .params
            .get("attributes")
            .and_then(Value::as_object)
            .map(|m| m.clone().into_iter().collect())
            .ok_or("UPDATE requires an \"attributes\" parameter")?;

        let entity = self
            .knowledge_graph
            .update_entity(entity_id, patch)
            .await
            .map_err(|e| e.to_string())?;
        Ok(text(format!("Updated {} \"{}\" ({})", entity.entity_type, entity.name, entity.id)))
    }
}

/// `DELETE`: soft-deletes an entity. Destructive.
pub struct DeleteTool {
    knowledge_graph: Arc<KnowledgeGraph>,
}

impl DeleteTool {
    pub fn new(knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self { knowledge_graph }
    }
}

#[async_trait]
impl ChatTool for DeleteTool {
    fn name(&self) -> &str {
        TOOL_DELETE
    }

    fn category(&self) -> &str {
        "delete"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let entity_id = input
            .entity_ids
            .first()
            .cloned()
            .or_else(|| input.params.get("entity_id").and_then(Value::as_str).map(String::from))
            .ok_or("DELETE requires a mentioned or explicit entity id")?;
        self.knowledge_graph
            .delete_entity(entity_id.clone())
            .await
            .map_err(|e| e.to_string())?;
        Ok(text(format!("Deleted entity {entity_id}")))
    }
}

/// `NAVIGATE`: surfaces an entity's immediate neighborhood (children plus
/// related entities) so the UI can jump there.
pub struct NavigateTool {
    knowledge_graph: Arc<KnowledgeGraph>,
}

impl NavigateTool {
    pub fn new(knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self { knowledge_graph }
    }
}

#[async_trait]
impl ChatTool for NavigateTool {
    fn name(&self) -> &str {
        TOOL_NAVIGATE
    }

    fn category(&self) -> &str {
        "navigate"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let entity_id = input
            .entity_ids
            .first()
            .cloned()
            .or_else(|| input.params.get("entity_id").and_then(Value::as_str).map(String::from))
            .ok_or("NAVIGATE requires a mentioned or explicit entity id")?;
        let entity = self
            .knowledge_graph
            .get_entity(entity_id.clone())
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("entity {entity_id} not found"))?;
        let children = self
            .knowledge_graph
            .get_children(entity_id.clone())
            .await
            .map_err(|e| e.to_string())?;
        Ok(text(format!(
            "{} \"{}\" has {} child entities.",
            entity.entity_type,
            entity.name,
            children.len()
        )))
    }
}

/// `EVALUATE`/critique: dispatches the `continuity` or `style` skill over
/// the mentioned content.
pub struct EvaluateTool {
    agent_dispatcher: Arc<AgentDispatcher>,
}

impl EvaluateTool {
    pub fn new(agent_dispatcher: Arc<AgentDispatcher>) -> Self {
        Self { agent_dispatcher }
    }
}

#[async_trait]
impl ChatTool for EvaluateTool {
    fn name(&self) -> &str {
        TOOL_EVALUATE
    }

    fn category(&self) -> &str {
        "evaluate"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let Some(skill) = self.agent_dispatcher.route(&input.content) else {
            return Ok(text("No evaluation skill matched this request closely enough; try rephrasing."));
        };
        let result = self.agent_dispatcher.execute(skill, &input.content, None).await;
        Ok(text(result.response))
    }
}

/// `RESEARCH`: dispatches the `research` skill through the agent dispatcher.
pub struct ResearchTool {
    agent_dispatcher: Arc<AgentDispatcher>,
}

impl ResearchTool {
    pub fn new(agent_dispatcher: Arc<AgentDispatcher>) -> Self {
        Self { agent_dispatcher }
    }
}

#[async_trait]
impl ChatTool for ResearchTool {
    fn name(&self) -> &str {
        TOOL_RESEARCH
    }

    fn category(&self) -> &str {
        "research"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let skill = self
            .agent_dispatcher
            .skills()
            .iter()
            .find(|s| s.name == "research")
            .or_else(|| self.agent_dispatcher.route(&input.content))
            .ok_or("no research skill is loaded")?;
        let result = self.agent_dispatcher.execute(skill, &input.content, None).await;
        Ok(text(result.response))
    }
}

/// `PIPELINE`: starts a pipeline run, either from an existing saved
/// definition (`params.definition_id`) or generated from natural language
/// on the fly via `generate_pipeline_from_nl`.
pub struct PipelineTool {
    pipeline_engine: Arc<PipelineEngine>,
    agent_dispatcher: Arc<AgentDispatcher>,
}

impl PipelineTool {
    pub fn new(pipeline_engine: Arc<PipelineEngine>, agent_dispatcher: Arc<AgentDispatcher>) -> Self {
        Self {
            pipeline_engine,
            agent_dispatcher,
        }
    }
}

#[async_trait]
impl ChatTool for PipelineTool {
    fn name(&self) -> &str {
        TOOL_PIPELINE
    }

    fn category(&self) -> &str {
        "pipeline"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let definition_id = input.params.get("definition_id").and_then(Value::as_str).map(String::from);

        let definition_id = match definition_id {
            Some(id) => Some(id),
            None => {
                let generated = crate::pipeline::generate_pipeline_from_nl(
                    &input.content,
                    "Chat-requested pipeline",
                    &self.agent_dispatcher,
                )
                .await
                .map_err(|e| e.to_string())?;
                let saved = self
                    .pipeline_engine
                    .save_definition(generated)
                    .await
                    .map_err(|e| e.to_string())?;
                Some(saved.id)
            }
        };

        let run_id = self
            .pipeline_engine
            .start_pipeline(Default::default(), definition_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(vec![
            ToolYield::Text(format!("Started pipeline run {run_id}.")),
            ToolYield::Event(ProtocolEvent::BackgroundUpdate {
                data: serde_json::json!({ "run_id": run_id, "kind": "pipeline_started" }),
            }),
        ])
    }
}

/// `RELATIONSHIP`: adds an edge between two mentioned entities, or reports
/// the existing neighbors of one if only one is mentioned.
pub struct RelationshipTool {
    knowledge_graph: Arc<KnowledgeGraph>,
}

impl RelationshipTool {
    pub fn new(knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self { knowledge_graph }
    }
}

#[async_trait]
impl ChatTool for RelationshipTool {
    fn name(&self) -> &str {
        TOOL_RELATIONSHIP
    }

    fn category(&self) -> &str {
        "relationship"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        if input.entity_ids.len() < 2 {
            let Some(id) = input.entity_ids.first() else {
                return Err("RELATIONSHIP requires at least one mentioned entity".into());
            };
            let neighbors = self
                .knowledge_graph
                .get_neighbors(id.clone(), None)
                .await
                .map_err(|e| e.to_string())?;
            if neighbors.is_empty() {
                return Ok(text("No known relationships for that entity."));
            }
            let names: Vec<&str> = neighbors.iter().map(|e| e.name.as_str()).collect();
            return Ok(text(format!("Related to: {}", names.join(", "))));
        }

        let rel_type = input
            .params
            .get("rel_type")
            .and_then(Value::as_str)
            .unwrap_or("related_to")
            .to_string();
        self.knowledge_graph
            .get_entity(input.entity_ids[0].clone())
            .await
            .map_err(|e| e.to_string())?
            .ok_or("source entity not found")?;
        let metadata = input.params.get("metadata").cloned();
        self.knowledge_graph
            .add_relationship(
                input.entity_ids[0].clone(),
                input.entity_ids[1].clone(),
                rel_type.clone(),
                metadata,
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(text(format!(
            "Linked {} -> {} ({rel_type})",
            input.entity_ids[0], input.entity_ids[1]
        )))
    }
}

/// `WORLD_SUMMARY`: renders the project's structural tree as a flat outline.
pub struct WorldSummaryTool {
    knowledge_graph: Arc<KnowledgeGraph>,
}

impl WorldSummaryTool {
    pub fn new(knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self { knowledge_graph }
    }
}

#[async_trait]
impl ChatTool for WorldSummaryTool {
    fn name(&self) -> &str {
        TOOL_WORLD_SUMMARY
    }

    fn category(&self) -> &str {
        "world_summary"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let project_id = input
            .params
            .get("project_id")
            .and_then(Value::as_str)
            .or(input.entity_ids.first().map(String::as_str))
            .ok_or("WORLD_SUMMARY requires a project_id parameter or mentioned entity")?
            .to_string();
        let tree = self
            .knowledge_graph
            .get_structure_tree(project_id)
            .await
            .map_err(|e| e.to_string())?;
        if tree.is_empty() {
            return Ok(text("This project has no structural entities yet."));
        }
        let mut lines = Vec::new();
        render_tree(&tree, 0, &mut lines);
        Ok(text(lines.join("\n")))
    }
}

fn render_tree(nodes: &[crate::knowledge_graph::TreeNode], depth: usize, out: &mut Vec<String>) {
    for node in nodes {
        out.push(format!("{}- {} ({})", "  ".repeat(depth), node.entity.name, node.entity.entity_type));
        render_tree(&node.children, depth + 1, out);
    }
}

/// `UNRESOLVED_THREADS`: lists relationships not yet marked resolved.
pub struct UnresolvedThreadsTool {
    knowledge_graph: Arc<KnowledgeGraph>,
}

impl UnresolvedThreadsTool {
    pub fn new(knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self { knowledge_graph }
    }
}

#[async_trait]
impl ChatTool for UnresolvedThreadsTool {
    fn name(&self) -> &str {
        TOOL_UNRESOLVED_THREADS
    }

    fn category(&self) -> &str {
        "unresolved_threads"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let era_id = input.params.get("era_id").and_then(Value::as_str).map(String::from);
        let threads = self
            .knowledge_graph
            .get_unresolved_threads(era_id)
            .await
            .map_err(|e| e.to_string())?;
        if threads.is_empty() {
            return Ok(text("No unresolved threads."));
        }
        let lines: Vec<String> = threads
            .iter()
            .map(|t| format!("- {} --[{}]--> {}", t.source_id, t.relationship.rel_type, t.relationship.target_id))
            .collect();
        Ok(text(format!("{} unresolved thread(s):\n{}", threads.len(), lines.join("\n"))))
    }
}

/// `DECIDE`: asks a general-purpose skill to weigh in on a choice, framed as
/// a yes/no/either decision rather than open-ended generation.
pub struct DecideTool {
    agent_dispatcher: Arc<AgentDispatcher>,
}

impl DecideTool {
    pub fn new(agent_dispatcher: Arc<AgentDispatcher>) -> Self {
        Self { agent_dispatcher }
    }
}

#[async_trait]
impl ChatTool for DecideTool {
    fn name(&self) -> &str {
        TOOL_DECIDE
    }

    fn category(&self) -> &str {
        "decide"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let Some(skill) = self.agent_dispatcher.route(&input.content) else {
            return Ok(text("Not enough signal to weigh in, try laying out the options explicitly."));
        };
        let result = self.agent_dispatcher.execute(skill, &input.content, None).await;
        Ok(text(result.response))
    }
}

/// `SAVE_TO_MEMORY`: writes a `project_memory` entity.
pub struct SaveToMemoryTool {
    knowledge_graph: Arc<KnowledgeGraph>,
}

impl SaveToMemoryTool {
    pub fn new(knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self { knowledge_graph }
    }
}

#[async_trait]
impl ChatTool for SaveToMemoryTool {
    fn name(&self) -> &str {
        TOOL_SAVE_TO_MEMORY
    }

    fn category(&self) -> &str {
        "save_to_memory"
    }

    async fn call(&self, input: ToolInput) -> Result<Vec<ToolYield>, String> {
        let key = input
            .params
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or("note")
            .to_string();
        let value = input
            .params
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or(&input.content)
            .to_string();
        let mut attributes = HashMap::new();
        attributes.insert("key".into(), Value::String(key.clone()));
        attributes.insert("value".into(), Value::String(value));
        attributes.insert("scope".into(), Value::String("global".into()));
        attributes.insert("source".into(), Value::String("chat".into()));
        attributes.insert("auto_inject".into(), Value::Bool(true));

        let entity = self
            .knowledge_graph
            .create_entity("project_memory".into(), key, attributes, None)
            .await
            .map_err(|e| e.to_string())?;
        Ok(text(format!("Remembered as project memory entry {}.", entity.id)))
    }
}

/// Holds every registered tool keyed by name.
pub struct ChatToolRegistry {
    tools: HashMap<String, Arc<dyn ChatTool>>,
}

impl ChatToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn ChatTool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatTool>> {
        self.tools.get(name).cloned()
    }

    /// Wires up every tool from a set of shared collaborators, minus `CHAT`
    /// which the orchestrator handles as its non-tool fallback path.
    pub fn with_standard_tools(
        knowledge_graph: Arc<KnowledgeGraph>,
        agent_dispatcher: Arc<AgentDispatcher>,
        pipeline_engine: Arc<PipelineEngine>,
    ) -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(SearchTool::new(knowledge_graph.clone())))
            .register(Arc::new(CreateTool::new(knowledge_graph.clone())))
            .register(Arc::new(UpdateTool::new(knowledge_graph.clone())))
            .register(Arc::new(DeleteTool::new(knowledge_graph.clone())))
            .register(Arc::new(NavigateTool::new(knowledge_graph.clone())))
            .register(Arc::new(EvaluateTool::new(agent_dispatcher.clone())))
            .register(Arc::new(ResearchTool::new(agent_dispatcher.clone())))
            .register(Arc::new(PipelineTool::new(pipeline_engine, agent_dispatcher.clone())))
            .register(Arc::new(RelationshipTool::new(knowledge_graph.clone())))
            .register(Arc::new(WorldSummaryTool::new(knowledge_graph.clone())))
            .register(Arc::new(UnresolvedThreadsTool::new(knowledge_graph.clone())))
            .register(Arc::new(DecideTool::new(agent_dispatcher)))
            .register(Arc::new(SaveToMemoryTool::new(knowledge_graph)));
        registry
    }
}

impl Default for ChatToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DeterministicEmbedder;
    use crate::entity_store::{RelationalIndex, VectorIndex};
    use dashmap::DashMap;

    async fn knowledge_graph() -> Arc<KnowledgeGraph> {
        let dir = tempfile::tempdir().unwrap();
        let relational = Arc::new(RelationalIndex::new(dir.path().join("index.db")).unwrap());
        let vector = Arc::new(VectorIndex::new(dir.path().join("vectors.db"), Arc::new(DeterministicEmbedder::new())).unwrap());
        Arc::new(KnowledgeGraph::new(
            relational,
            vector,
            dir.path().to_path_buf(),
            dir.path().join("index.db"),
            Arc::new(DashMap::new()),
        ))
    }

    #[tokio::test]
    async fn create_then_update_then_search() {
        let kg = knowledge_graph().await;
        let create = CreateTool::new(kg.clone());
        let mut params = Map::new();
        params.insert("entity_type".into(), Value::String("character".into()));
        params.insert("name".into(), Value::String("Mira".into()));
        let mut input = ToolInput::default();
        input.params = params;
        let out = create.call(input).await.unwrap();
        let ToolYield::Text(msg) = &out[0] else { panic!("expected text") };
        assert!(msg.contains("Created character"));

        let entities = kg.get_entities_by_type("character".into()).await.unwrap();
        assert_eq!(entities.len(), 1);
        let entity_id = entities[0].id.clone();

        let update = UpdateTool::new(kg.clone());
        let mut attrs = Map::new();
        attrs.insert("mood".into(), Value::String("determined".into()));
        let mut up_params = Map::new();
        up_params.insert("attributes".into(), Value::Object(attrs));
        let up_input = ToolInput {
            content: String::new(),
            entity_ids: vec![entity_id.clone()],
            session_id: String::new(),
            params: up_params,
        };
        update.call(up_input).await.unwrap();
        let refreshed = kg.get_entity(entity_id).await.unwrap().unwrap();
        assert_eq!(refreshed.attributes.get("mood").unwrap(), "determined");
    }

    #[tokio::test]
    async fn update_without_entity_id_fails() {
        let kg = knowledge_graph().await;
        let update = UpdateTool::new(kg);
        let err = update.call(ToolInput::default()).await.unwrap_err();
        assert!(err.contains("entity id"));
    }

    #[tokio::test]
    async fn relationship_reports_no_neighbors() {
        let kg = knowledge_graph().await;
        let created = kg
            .create_entity("character".into(), "Solo".into(), HashMap::new(), None)
            .await
            .unwrap();
        let tool = RelationshipTool::new(kg);
        let input = ToolInput {
            content: String::new(),
            entity_ids: vec![created.id],
            session_id: String::new(),
            params: Map::new(),
        };
        let out = tool.call(input).await.unwrap();
        let ToolYield::Text(msg) = &out[0] else { panic!("expected text") };
        assert!(msg.contains("No known relationships"));
    }
}
