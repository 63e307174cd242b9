//! Public control surface: `start_pipeline`,
//! `resume_pipeline`, `set_step_model_override`, `stream_pipeline`, plus
//! pipeline-definition CRUD, NL-to-DAG generation, and deterministic
//! distillation of recorded UI actions into a [`PipelineDefinition`].
//!
//! The live-runs table is process-wide shared state (a `DashMap` rather than
//! a single mutex-guarded map, so concurrent runs don't serialize on each
//! other), `stream_pipeline` polls it every 100ms, `generate_pipeline_from_nl`
//! tolerantly extracts JSON from a model response, and
//! `distill_recorded_actions` maps recorded UI actions to step types via a
//! fixed rule table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{unfold, Stream};
use serde_json::{json, Value};
use tracing::warn;

use crate::agent_dispatcher::AgentDispatcher;
use crate::ids;
use crate::knowledge_graph::KnowledgeGraph;

use super::executor::drive;
use super::handlers::{HandlerRegistry, PipelineContext};
use super::types::{
    EdgeDefinition, PipelineDefinition, PipelineError, PipelineRun, Payload, RunState, StepDefinition, StepType,
};

const PIPELINE_DEF_CONTAINER_TYPE: &str = "pipeline_def";
const PIPELINE_RUN_CONTAINER_TYPE: &str = "pipeline_run";
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct PipelineEngine {
    ctx: Arc<PipelineContext>,
    handlers: Arc<HandlerRegistry>,
    runs: Arc<dashmap::DashMap<String, PipelineRun>>,
}

impl PipelineEngine {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            handlers: Arc::new(HandlerRegistry::new()),
            runs: Arc::new(dashmap::DashMap::new()),
        }
    }

    pub fn get_run(&self, run_id: &str) -> Option<PipelineRun> {
        self.runs.get(run_id).map(|r| r.clone())
    }

    /// creates a run and drives it in a background task
    /// until it pauses or terminates. Returns the run id immediately.
    pub async fn start_pipeline(
        &self,
        initial_payload: Payload,
        definition_id: Option<String>,
    ) -> Result<String, PipelineError> {
        let run_id = ids::new_id();
        let definition = match &definition_id {
            Some(id) => Some(
                self.get_definition(id)
                    .await?
                    .ok_or_else(|| PipelineError::NotFound(id.clone()))?,
            ),
            None => None,
        };
        let total_steps = definition.as_ref().map(|d| d.steps.len()).unwrap_or(0);
        let run = PipelineRun::new(run_id.clone(), definition_id, initial_payload, total_steps);
        self.runs.insert(run_id.clone(), run);

        self.spawn_drive(run_id.clone(), definition);
        Ok(run_id)
    }

    /// validates the run is paused, merges `new_payload`
    /// into it, then resumes driving in a background task.
    pub async fn resume_pipeline(&self, run_id: &str, new_payload: Payload) -> Result<(), PipelineError> {
        let definition_id = {
            let mut entry = self
                .runs
                .get_mut(run_id)
                .ok_or_else(|| PipelineError::NotFound(run_id.to_string()))?;
            if entry.current_state != RunState::PausedForUser {
                return Err(PipelineError::NotPaused(
                    run_id.to_string(),
                    format!("{:?}", entry.current_state),
                ));
            }
            for (key, value) in new_payload {
                entry.payload.insert(key, value);
            }
            entry.definition_id.clone()
        };

        let definition = match definition_id {
            Some(id) => Some(
                self.get_definition(&id)
                    .await?
                    .ok_or_else(|| PipelineError::NotFound(id))?,
            ),
            None => None,
        };
        self.spawn_drive(run_id.to_string(), definition);
        Ok(())
    }

    pub fn set_step_model_override(
        &self,
        run_id: &str,
        step_id: &str,
        model: String,
    ) -> Result<(), PipelineError> {
        let mut entry = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| PipelineError::NotFound(run_id.to_string()))?;
        entry
            .step_overrides
            .entry(step_id.to_string())
            .or_default()
            .insert("model".to_string(), model);
        Ok(())
    }

    /// polls the live run every 100ms, yielding a JSON
    /// snapshot each time `current_state` or `current_step_id` changes, and
    /// closing the stream after yielding a terminal snapshot.
    pub fn stream_pipeline(&self, run_id: String) -> impl Stream<Item = Value> {
        unfold(
            (self.runs.clone(), run_id, None::<(RunState, Option<String>)>, false),
            |(runs, run_id, mut last, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    tokio::time::sleep(STREAM_POLL_INTERVAL).await;
                    let Some(entry) = runs.get(&run_id) else {
                        return None;
                    };
                    let key = (entry.current_state, entry.current_step_id.clone());
                    let snapshot = entry.snapshot();
                    drop(entry);

                    if Some(&key) != last.as_ref() {
                        let is_terminal = key.0.is_terminal();
                        last = Some(key);
                        return Some((snapshot, (runs, run_id, last, is_terminal)));
                    }
                }
            },
        )
    }

    fn spawn_drive(&self, run_id: String, definition: Option<PipelineDefinition>) {
        let ctx = self.ctx.clone();
        let handlers = self.handlers.clone();
        let runs = self.runs.clone();
        tokio::spawn(async move {
            match definition {
                Some(def) => {
                    if let Some(mut entry) = runs.get_mut(&run_id) {
                        if let Err(e) = drive(&ctx, &handlers, &def, &mut entry).await {
                            warn!("pipeline run {run_id} failed to drive: {e}");
                        }
                    }
                }
                None => drive_legacy_pipeline(&runs, &run_id).await,
            }
            persist_if_terminal(&runs, &ctx.knowledge_graph, &run_id).await;
        });
    }

    // -- pipeline definition CRUD --

    pub async fn save_definition(&self, mut definition: PipelineDefinition) -> Result<PipelineDefinition, PipelineError> {
        definition
            .validate()
            .map_err(|e| PipelineError::Validation(e.to_string()))?;
        let attributes = definition_to_attributes(&definition);
        let entity = self
            .ctx
            .knowledge_graph
            .create_entity(PIPELINE_DEF_CONTAINER_TYPE.to_string(), definition.name.clone(), attributes, None)
            .await
            .map_err(|e| PipelineError::Validation(e.to_string()))?;
        definition.id = entity.id;
        Ok(definition)
    }

    pub async fn get_definition(&self, id: &str) -> Result<Option<PipelineDefinition>, PipelineError> {
        let entity = self
            .ctx
            .knowledge_graph
            .get_entity(id.to_string())
            .await
            .map_err(|e| PipelineError::Validation(e.to_string()))?;
        match entity {
            Some(e) if e.entity_type == PIPELINE_DEF_CONTAINER_TYPE => {
                Ok(Some(attributes_to_definition(e.id, e.name, &e.attributes)))
            }
            _ => Ok(None),
        }
    }

    pub async fn list_definitions(&self) -> Result<Vec<PipelineDefinition>, PipelineError> {
        let entities = self
            .ctx
            .knowledge_graph
            .find_containers(Some(PIPELINE_DEF_CONTAINER_TYPE.to_string()), None)
            .await
            .map_err(|e| PipelineError::Validation(e.to_string()))?;
        Ok(entities
            .into_iter()
            .map(|e| attributes_to_definition(e.id, e.name, &e.attributes))
            .collect())
    }

    pub async fn delete_definition(&self, id: &str) -> Result<(), PipelineError> {
        self.ctx
            .knowledge_graph
            .delete_entity(id.to_string())
            .await
            .map_err(|e| PipelineError::Validation(e.to_string()))
    }
}

fn definition_to_attributes(definition: &PipelineDefinition) -> HashMap<String, Value> {
    HashMap::from([
        ("description".to_string(), json!(definition.description)),
        ("steps".to_string(), json!(definition.steps)),
        ("edges".to_string(), json!(definition.edges)),
    ])
}

fn attributes_to_definition(id: String, name: String, attributes: &HashMap<String, Value>) -> PipelineDefinition {
    PipelineDefinition {
        id,
        name,
        description: attributes
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        steps: attributes
            .get("steps")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default(),
        edges: attributes
            .get("edges")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

/// The hardcoded bootstrap path. Sleeps replaced
/// with short yields since there is no real external latency to simulate
/// here; the shape, context gathering, hardcoded prompt assembly, a single
/// pause, then completion, mirrors `_run_legacy_pipeline`.
async fn drive_legacy_pipeline(runs: &dashmap::DashMap<String, PipelineRun>, run_id: &str) {
    {
        let Some(mut run) = runs.get_mut(run_id) else { return };
        if run.current_state == RunState::PausedForUser {
            run.current_state = RunState::Completed;
            return;
        }
        run.current_state = RunState::ContextGathering;
    }
    tokio::task::yield_now().await;
    {
        let Some(mut run) = runs.get_mut(run_id) else { return };
        run.current_state = RunState::PromptAssembly;
        run.payload.insert(
            "prompt_text".to_string(),
            Value::String("[Legacy pipeline: no definition supplied]".to_string()),
        );
    }
    tokio::task::yield_now().await;
    if let Some(mut run) = runs.get_mut(run_id) {
        run.current_state = RunState::PausedForUser;
    }
}

async fn persist_if_terminal(
    runs: &dashmap::DashMap<String, PipelineRun>,
    knowledge_graph: &Arc<KnowledgeGraph>,
    run_id: &str,
) {
    let snapshot = match runs.get(run_id) {
        Some(r) if r.current_state.is_terminal() => r.clone(),
        _ => return,
    };
    let attributes = HashMap::from([
        ("state".to_string(), json!(snapshot.current_state)),
        ("definition_id".to_string(), json!(snapshot.definition_id)),
        ("steps_completed".to_string(), json!(snapshot.steps_completed)),
        ("total_steps".to_string(), json!(snapshot.total_steps)),
        ("error".to_string(), json!(snapshot.error)),
        ("created_at".to_string(), json!(snapshot.created_at.to_rfc3339())),
    ]);
    if let Err(e) = knowledge_graph
        .create_entity(PIPELINE_RUN_CONTAINER_TYPE.to_string(), format!("Run {}", snapshot.id), attributes, None)
        .await
    {
        warn!("failed to persist completed pipeline run {}: {e}", snapshot.id);
    }
}

/// Known slash commands and the prompt template they expand to. Unknown
/// commands fall back to a generic template that just forwards the
/// command's argument text.
fn command_prompt_map() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("/brainstorm", "Brainstorm five distinct directions for: {{text}}"),
        ("/expand", "Expand the following passage with richer sensory detail:\n\n{{text}}"),
        ("/describe", "Write a vivid description of: {{text}}"),
        ("/dialogue", "Write a dialogue exchange for this beat: {{text}}"),
        ("/twist", "Propose an unexpected but earned twist building on: {{text}}"),
        ("/continue", "Continue the scene naturally from this point:\n\n{{text}}"),
        ("/summarize", "Summarize the key events of: {{text}}"),
        ("/critique", "Critique this passage for continuity and pacing:\n\n{{text}}"),
    ])
}

/// synthesizes a [`PipelineDefinition`] deterministically
/// from a session's recorded UI actions, one rule per action type. Raises
/// on empty input; appends a final `APPROVE_OUTPUT` step labelled "Final
/// Review" when the session contained at least one approval but doesn't
/// already end on one.
pub fn distill_recorded_actions(actions: &[Value], title: &str) -> Result<PipelineDefinition, PipelineError> {
    if actions.is_empty() {
        return Err(PipelineError::Validation("no recorded actions to distill".into()));
    }
    let commands = command_prompt_map();

    let mut steps = Vec::new();
    let mut edges = Vec::new();
    let mut had_approval = false;
    let mut next_id = 0usize;
    let mut fresh_id = || {
        next_id += 1;
        format!("step-{next_id}")
    };

    for action in actions {
        let action_type = action.get("type").and_then(Value::as_str).unwrap_or("");
        match action_type {
            "slash_command" => {
                let command = action.get("command").and_then(Value::as_str).unwrap_or("");
                let template = commands
                    .get(command)
                    .copied()
                    .unwrap_or("Respond to this request: {{text}}");
                let template_id = fresh_id();
                steps.push(
                    StepDefinition::new(template_id.clone(), StepType::PromptTemplate, format!("Template: {command}"))
                        .with_config(json!({"template_inline": template}).as_object().unwrap().clone()),
                );
                let generate_id = fresh_id();
                steps.push(StepDefinition::new(generate_id.clone(), StepType::LlmGenerate, format!("Generate: {command}")));
                edges.push(EdgeDefinition { source: template_id, target: generate_id });
            }
            "approval" => {
                let id = fresh_id();
                steps.push(StepDefinition::new(id, StepType::ApproveOutput, "Approve Output"));
                had_approval = true;
            }
            "text_selection" => {
                let id = fresh_id();
                steps.push(StepDefinition::new(id, StepType::GatherBuckets, "Gather Selected Context"));
            }
            "save" => {
                let container_type = action.get("container_type").and_then(Value::as_str).unwrap_or("fragment");
                let id = fresh_id();
                steps.push(
                    StepDefinition::new(id, StepType::SaveToBucket, "Save to Library")
                        .with_config(json!({"container_type": container_type}).as_object().unwrap().clone()),
                );
            }
            "option_select" => {
                let id = fresh_id();
                steps.push(StepDefinition::new(id, StepType::ReviewPrompt, "Review Options"));
            }
            "entity_mention" => {
                let id = fresh_id();
                steps.push(StepDefinition::new(id, StepType::SemanticSearch, "Search Mentioned Entity"));
            }
            "chat_message" => {
                let message = action.get("message").and_then(Value::as_str).unwrap_or("");
                let template_id = fresh_id();
                steps.push(
                    StepDefinition::new(template_id.clone(), StepType::PromptTemplate, "Chat Prompt").with_config(
                        json!({"template_inline": format!("Respond conversationally to: {message}")})
                            .as_object()
                            .unwrap()
                            .clone(),
                    ),
                );
                let generate_id = fresh_id();
                steps.push(StepDefinition::new(generate_id.clone(), StepType::LlmGenerate, "Chat Response"));
                edges.push(EdgeDefinition { source: template_id, target: generate_id });
            }
            other => {
                warn!("distill_recorded_actions: ignoring unrecognized action type '{other}'");
            }
        }
    }

    // Chain every step not already linked by an explicit edge above, in
    // recorded order, so the distilled pipeline is a single linear chain.
    let explicit: std::collections::HashSet<String> = edges.iter().map(|e| e.source.clone()).collect();
    for window in steps.windows(2) {
        let [a, b] = window else { continue };
        if !explicit.contains(a.id.as_str()) {
            edges.push(EdgeDefinition { source: a.id.clone(), target: b.id.clone() });
        }
    }

    if had_approval && steps.last().map(|s| s.step_type) != Some(StepType::ApproveOutput) {
        if let Some(last) = steps.last() {
            let target = fresh_id();
            edges.push(EdgeDefinition { source: last.id.clone(), target: target.clone() });
            steps.push(StepDefinition::new(target, StepType::ApproveOutput, "Final Review"));
        }
    }

    Ok(PipelineDefinition {
        id: String::new(),
        name: title.to_string(),
        description: "Distilled from recorded session actions".to_string(),
        steps,
        edges,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    })
}

/// dispatches the `pipeline_director` skill with the user's
/// natural-language intent and a description of the expected JSON shape,
/// then tolerantly parses its response into a [`PipelineDefinition]`.
/// Unknown step types fall back to `LLM_GENERATE` with a warning rather
/// than aborting generation; edges referencing unknown step ids are
/// dropped. Raises if the skill isn't loaded or zero steps are produced.
pub async fn generate_pipeline_from_nl(
    intent: &str,
    title: &str,
    agent_dispatcher: &AgentDispatcher,
) -> Result<PipelineDefinition, PipelineError> {
    let skill = agent_dispatcher
        .skills()
        .iter()
        .find(|s| s.name == "pipeline_director")
        .ok_or_else(|| PipelineError::Validation("pipeline_director skill is not loaded".into()))?;

    let schema_hint = format!(
        "Design a pipeline DAG for the following request and respond with ONLY a JSON object of the \
         shape {{\"steps\": [{{\"id\": str, \"step_type\": str, \"label\": str, \"config\": object}}], \
         \"edges\": [{{\"source\": str, \"target\": str}}]}}. Valid step_type values: {}.\n\nRequest: {intent}",
        StepType::all()
            .iter()
            .map(|t| serde_json::to_value(t).unwrap().as_str().unwrap().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let result = agent_dispatcher.execute(skill, &schema_hint, None).await;
    let raw = extract_json_object(&result.response)
        .ok_or_else(|| PipelineError::Validation("planner response contained no JSON object".into()))?;
    let parsed: Value = serde_json::from_str(&raw)
        .map_err(|e| PipelineError::Validation(format!("planner response was not valid JSON: {e}")))?;

    let mut step_ids = std::collections::HashSet::new();
    let mut steps = Vec::new();
    for raw_step in parsed.get("steps").and_then(Value::as_array).cloned().unwrap_or_default() {
        let id = raw_step.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        if id.is_empty() {
            continue;
        }
        let label = raw_step.get("label").and_then(Value::as_str).unwrap_or(&id).to_string();
        let config = raw_step
            .get("config")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let type_name = raw_step.get("step_type").and_then(Value::as_str).unwrap_or("");
        let step_type = parse_step_type(type_name).unwrap_or_else(|| {
            warn!("generate_pipeline_from_nl: unknown step_type '{type_name}', falling back to LLM_GENERATE");
            StepType::LlmGenerate
        });
        step_ids.insert(id.clone());
        steps.push(StepDefinition::new(id, step_type, label).with_config(config));
    }

    if steps.is_empty() {
        return Err(PipelineError::Validation("planner produced zero steps".into()));
    }

    let edges: Vec<EdgeDefinition> = parsed
        .get("edges")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|raw_edge| {
            let source = raw_edge.get("source").and_then(Value::as_str)?.to_string();
            let target = raw_edge.get("target").and_then(Value::as_str)?.to_string();
            if step_ids.contains(&source) && step_ids.contains(&target) {
                Some(EdgeDefinition { source, target })
            } else {
                warn!("generate_pipeline_from_nl: dropping edge referencing unknown step(s) {source} -> {target}");
                None
            }
        })
        .collect();

    Ok(PipelineDefinition {
        id: String::new(),
        name: title.to_string(),
        description: format!("Generated from: {intent}"),
        steps,
        edges,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    })
}

fn parse_step_type(name: &str) -> Option<StepType> {
    StepType::all()
        .iter()
        .find(|t| serde_json::to_value(t).ok().and_then(|v| v.as_str().map(String::from)).as_deref() == Some(name))
        .copied()
}

/// Strips a ```json fence if present, else returns the trimmed body as-is.
fn extract_json_object(response: &str) -> Option<String> {
    let trimmed = response.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + "```json".len()..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim().to_string());
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim().to_string());
        }
    }
    if trimmed.starts_with('{') {
        return Some(trimmed.to_string());
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        Some(trimmed[start..=end].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distill_rejects_empty_action_list() {
        assert!(distill_recorded_actions(&[], "Test Session").is_err());
    }

    #[test]
    fn distill_produces_slash_command_pair_and_final_approval() {
        let actions = vec![
            json!({"type": "slash_command", "command": "/brainstorm", "text": "a heist"}),
            json!({"type": "approval"}),
        ];
        let def = distill_recorded_actions(&actions, "Heist Session").unwrap();
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[0].step_type, StepType::PromptTemplate);
        assert_eq!(def.steps[1].step_type, StepType::LlmGenerate);
        assert_eq!(def.steps[2].step_type, StepType::ApproveOutput);
        assert_eq!(def.edges.len(), 2);
    }

    #[test]
    fn distill_does_not_duplicate_final_approval_when_already_present() {
        let actions = vec![
            json!({"type": "chat_message", "message": "hello"}),
            json!({"type": "approval"}),
        ];
        let def = distill_recorded_actions(&actions, "Chat Session").unwrap();
        assert_eq!(def.steps.last().unwrap().step_type, StepType::ApproveOutput);
        assert_eq!(def.steps.iter().filter(|s| s.step_type == StepType::ApproveOutput).count(), 1);
    }

    #[test]
    fn distill_ignores_unrecognized_action_types() {
        let actions = vec![json!({"type": "unknown_future_action"}), json!({"type": "save", "container_type": "scene"})];
        let def = distill_recorded_actions(&actions, "Mixed Session").unwrap();
        assert_eq!(def.steps.len(), 1);
        assert_eq!(def.steps[0].step_type, StepType::SaveToBucket);
    }

    #[test]
    fn extract_json_object_handles_fenced_and_bare() {
        assert_eq!(extract_json_object("```json\n{\"a\": 1}\n```").unwrap(), "{\"a\": 1}");
        assert_eq!(extract_json_object("{\"a\": 1}").unwrap(), "{\"a\": 1}");
        assert_eq!(extract_json_object("Sure thing: {\"a\": 1} done").unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn parse_step_type_accepts_known_wire_name() {
        assert_eq!(parse_step_type("llm_generate"), Some(StepType::LlmGenerate));
        assert_eq!(parse_step_type("not_a_real_type"), None);
    }
}
