//! Handler contracts for every pipeline step type: a tagged sum type plus a
//! handler registry keyed by `step_type`. Each handler receives the run (for
//! `current_agent_id` / `step_overrides`) and the step definition, and
//! mutates `run.payload` in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{error, warn};

use crate::agent_dispatcher::AgentDispatcher;
use crate::context_assembler::{ContextAssembler, ContextRequest};
use crate::entity_store::EntityStoreError;
use crate::knowledge_graph::KnowledgeGraph;
use crate::llm::{LlmCallParams, LlmClient};
use crate::message::Message;
use crate::model_config::{ModelConfigRegistry, ResolveRequest};

use super::types::{PipelineError, PipelineRun, StepDefinition, StepType};

/// Collaborators injected into the pipeline engine.
pub struct PipelineContext {
    pub context_assembler: Arc<ContextAssembler>,
    pub model_registry: Arc<ModelConfigRegistry>,
    pub knowledge_graph: Arc<KnowledgeGraph>,
    pub agent_dispatcher: Option<Arc<AgentDispatcher>>,
    pub llm: Arc<dyn LlmClient>,
    pub http_client: reqwest::Client,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &PipelineContext,
        run: &mut PipelineRun,
        step: &StepDefinition,
    ) -> Result<(), PipelineError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StepType, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register(StepType::GatherBuckets, Arc::new(GatherBuckets));
        registry.register(StepType::SemanticSearch, Arc::new(SemanticSearch));
        registry.register(StepType::PromptTemplate, Arc::new(PromptTemplate));
        registry.register(StepType::MultiVariant, Arc::new(MultiVariant));
        registry.register(StepType::LlmGenerate, Arc::new(LlmGenerate));
        registry.register(StepType::ImageGenerate, Arc::new(ImageGenerate));
        registry.register(StepType::SaveToBucket, Arc::new(SaveToBucket));
        registry.register(StepType::HttpRequest, Arc::new(HttpRequest));
        registry.register(StepType::ResearchDeepDive, Arc::new(ResearchDeepDive));
        registry.register(StepType::StyleEnforceDialogue, Arc::new(StyleEnforceDialogue));
        registry
    }

    pub fn register(&mut self, step_type: StepType, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step_type, handler);
    }

    pub fn get(&self, step_type: StepType) -> Option<&Arc<dyn StepHandler>> {
        self.handlers.get(&step_type)
    }
}

fn get_str(config: &Map<String, Value>, key: &str) -> Option<String> {
    config.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn get_usize(config: &Map<String, Value>, key: &str, default: usize) -> usize {
    config.get(key).and_then(|v| v.as_u64()).map(|v| v as usize).unwrap_or(default)
}

fn get_bool(config: &Map<String, Value>, key: &str, default: bool) -> bool {
    config.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn get_str_list(config: &Map<String, Value>, key: &str) -> Vec<String> {
    config
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn query_from_payload(payload: &Map<String, Value>) -> String {
    payload
        .get("text")
        .or_else(|| payload.get("prompt_text"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

struct GatherBuckets;

#[async_trait]
impl StepHandler for GatherBuckets {
    async fn handle(
        &self,
        ctx: &PipelineContext,
        run: &mut PipelineRun,
        step: &StepDefinition,
    ) -> Result<(), PipelineError> {
        let container_types = get_str_list(&step.config, "container_types");
        let max_items = get_usize(&step.config, "max_items", 10);
        let max_tokens = get_usize(&step.config, "max_tokens", max_items * 400);
        let include_relationships = get_bool(&step.config, "include_relationships", true);
        let query = query_from_payload(&run.payload);

        let mut request = ContextRequest::new(query, max_tokens);
        request.explicit_types = container_types.clone();
        request.include_relationships = include_relationships;

        let result = ctx
            .context_assembler
            .assemble(request)
            .await
            .map_err(context_store_error)?;

        run.payload.insert("gathered_context".into(), Value::String(result.text));
        run.payload.insert(
            "gathered_context_meta".into(),
            json!({
                "container_types": container_types,
                "max_items": max_items,
                "containers_included": result.included_count,
                "containers_truncated": result.truncated_count,
                "token_estimate": result.token_estimate,
                "status": "gathered",
                "buckets": result.buckets.iter().map(|b| json!({
                    "id": b.id, "name": b.name, "type": b.entity_type, "summary": b.preview,
                })).collect::<Vec<_>>(),
            }),
        );
        Ok(())
    }
}

struct SemanticSearch;

#[async_trait]
impl StepHandler for SemanticSearch {
    async fn handle(
        &self,
        ctx: &PipelineContext,
        run: &mut PipelineRun,
        step: &StepDefinition,
    ) -> Result<(), PipelineError> {
        let limit = get_usize(&step.config, "limit", 5);
        let max_tokens = get_usize(&step.config, "max_tokens", limit * 400);
        let include_relationships = get_bool(&step.config, "include_relationships", true);
        let query = query_from_payload(&run.payload);

        if query.is_empty() {
            run.payload.insert(
                "search_results_meta".into(),
                json!({"limit": limit, "status": "searched", "query": ""}),
            );
            return Ok(());
        }

        let mut request = ContextRequest::new(query.clone(), max_tokens);
        request.include_relationships = include_relationships;
        let result = ctx
            .context_assembler
            .assemble(request)
            .await
            .map_err(context_store_error)?;

        run.payload.insert("search_results".into(), Value::String(result.text));
        run.payload.insert(
            "search_results_meta".into(),
            json!({
                "query": query,
                "limit": limit,
                "containers_included": result.included_count,
                "containers_truncated": result.truncated_count,
                "token_estimate": result.token_estimate,
                "status": "searched",
            }),
        );
        Ok(())
    }
}

struct PromptTemplate;

#[async_trait]
impl StepHandler for PromptTemplate {
    async fn handle(
        &self,
        _ctx: &PipelineContext,
        run: &mut PipelineRun,
        step: &StepDefinition,
    ) -> Result<(), PipelineError> {
        let template = get_str(&step.config, "template_inline").unwrap_or_default();
        let prompt = if template.is_empty() {
            run.payload
                .get("prompt_text")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("[Auto-assembled prompt from step {}]", step.id))
        } else {
            let mut prompt = template;
            for (key, value) in run.payload.clone() {
                if let Some(s) = value.as_str() {
                    prompt = prompt.replace(&format!("{{{{{key}}}}}"), s);
                }
            }
            prompt
        };
        run.payload.insert("prompt_text".into(), Value::String(prompt));
        run.payload.insert("step_name".into(), Value::String(step.label.clone()));
        Ok(())
    }
}

struct MultiVariant;

#[async_trait]
impl StepHandler for MultiVariant {
    async fn handle(
        &self,
        _ctx: &PipelineContext,
        run: &mut PipelineRun,
        step: &StepDefinition,
    ) -> Result<(), PipelineError> {
        let count = get_usize(&step.config, "count", 3);
        run.payload.insert("variant_count".into(), json!(count));
        Ok(())
    }
}

struct LlmGenerate;

#[async_trait]
impl StepHandler for LlmGenerate {
    async fn handle(
        &self,
        ctx: &PipelineContext,
        run: &mut PipelineRun,
        step: &StepDefinition,
    ) -> Result<(), PipelineError> {
        let step_model = step.config.get("model").and_then(|v| v.as_str()).map(String::from);
        let step_temperature = step.config.get("temperature").and_then(|v| v.as_f64()).map(|v| v as f32);
        let step_max_tokens = step.config.get("max_tokens").and_then(|v| v.as_u64()).map(|v| v as u32);

        // One-shot payload override beats step config, which in turn beats
        // this step's recorded runtime override from `set_step_model_override`.
        let override_model = run.payload.remove("model").and_then(|v| v.as_str().map(String::from));
        let runtime_override = run
            .step_overrides
            .get(&step.id)
            .and_then(|overrides| overrides.get("model"))
            .cloned();

        let resolved = ctx
            .model_registry
            .resolve(ResolveRequest {
                step_model: override_model.or(runtime_override).or(step_model),
                step_temperature,
                step_max_tokens,
                entity_model_preference: None,
                agent_id: run.current_agent_id.clone(),
            })
            .await;

        let temperature = run
            .payload
            .remove("temperature")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32)
            .unwrap_or(resolved.temperature.unwrap_or(0.7));

        run.payload.remove("regenerate");

        let mut prompt_text = run
            .payload
            .get("prompt_text")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        if prompt_text.is_empty() {
            run.payload.insert(
                "generated_text".into(),
                Value::String("[No prompt was provided to the LLM]".into()),
            );
            return Ok(());
        }

        if let Some(pinned) = run.payload.get("pinned_context_ids").and_then(|v| v.as_array()).cloned() {
            let mut blocks = Vec::new();
            for id in pinned.iter().filter_map(|v| v.as_str()) {
                if let Ok(Some(entity)) = ctx.knowledge_graph.get_entity(id.to_string()).await {
                    let content = entity
                        .attributes
                        .get("text")
                        .or_else(|| entity.attributes.get("summary"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    blocks.push(format!("[{} ({})]: {}", entity.name, entity.entity_type, content));
                }
            }
            if !blocks.is_empty() {
                prompt_text.push_str("\n\n## Pinned Context\n");
                prompt_text.push_str(&blocks.join("\n\n"));
            }
        }

        prompt_text.push_str(
            "\n\n[SYSTEM INSTRUCTION: You MUST output your response as a valid JSON object \
             containing exactly three keys: 'generated_text' (string) containing your actual \
             response to the prompt above, 'confidence_score' (number 0-100) estimating your \
             confidence in meeting the prompt requirements and preserving continuity, and \
             'continuity_errors' (array of strings) listing any detected logical or continuity \
             errors. Do NOT wrap in markdown blocks if possible.]",
        );

        run.payload.insert("resolved_model".into(), Value::String(resolved.model.clone()));

        let params = LlmCallParams {
            model: resolved.model,
            temperature: Some(temperature),
            max_tokens: resolved.max_tokens,
        };
        let messages = [
            Message::system("You are a creative writing assistant."),
            Message::user(prompt_text),
        ];

        match ctx.llm.invoke(&messages, &params).await {
            Ok(response) => {
                let content = strip_code_fence(response.content.trim());
                match serde_json::from_str::<Value>(&content) {
                    Ok(parsed) => {
                        let generated = parsed
                            .get("generated_text")
                            .and_then(|v| v.as_str())
                            .map(String::from)
                            .unwrap_or_else(|| content.clone());
                        let confidence = parsed.get("confidence_score").cloned().unwrap_or(json!(0));
                        let errors = parsed.get("continuity_errors").cloned().unwrap_or(json!([]));
                        run.payload.insert("generated_text".into(), Value::String(generated));
                        run.payload.insert("confidence_score".into(), confidence);
                        run.payload.insert("continuity_errors".into(), errors);
                    }
                    Err(_) => {
                        warn!("LLM_GENERATE: failed to parse structured JSON output, using raw text");
                        run.payload.insert("generated_text".into(), Value::String(content));
                        run.payload.insert("confidence_score".into(), json!(0));
                        run.payload.insert(
                            "continuity_errors".into(),
                            json!(["Failed to parse structured output"]),
                        );
                    }
                }
            }
            Err(e) => {
                error!("LLM_GENERATE failed: {e}");
                run.payload.insert("generated_text".into(), Value::String(format!("[error: {e}]")));
                run.payload.insert("confidence_score".into(), json!(0));
                run.payload.insert("continuity_errors".into(), json!([e.to_string()]));
            }
        }
        Ok(())
    }
}

fn strip_code_fence(content: &str) -> String {
    let mut s = content;
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim().to_string()
}

struct ImageGenerate;

#[async_trait]
impl StepHandler for ImageGenerate {
    async fn handle(
        &self,
        _ctx: &PipelineContext,
        run: &mut PipelineRun,
        _step: &StepDefinition,
    ) -> Result<(), PipelineError> {
        run.payload.insert("image_status".into(), Value::String("queued".into()));
        let prompt = run.payload.get("prompt_text").cloned().unwrap_or(Value::String(String::new()));
        run.payload.insert("image_prompt".into(), prompt);
        Ok(())
    }
}

/// Marker-only per Open Question 2: actual persistence is the
/// caller's responsibility via the Unit of Work.
struct SaveToBucket;

#[async_trait]
impl StepHandler for SaveToBucket {
    async fn handle(
        &self,
        _ctx: &PipelineContext,
        run: &mut PipelineRun,
        step: &StepDefinition,
    ) -> Result<(), PipelineError> {
        let container_type = get_str(&step.config, "container_type").unwrap_or_else(|| "fragment".into());
        run.payload.insert(
            "saved".into(),
            json!({"container_type": container_type, "status": "saved"}),
        );
        Ok(())
    }
}

struct HttpRequest;

#[async_trait]
impl StepHandler for HttpRequest {
    async fn handle(
        &self,
        ctx: &PipelineContext,
        run: &mut PipelineRun,
        step: &StepDefinition,
    ) -> Result<(), PipelineError> {
        let url = get_str(&step.config, "url").unwrap_or_default();
        if url.is_empty() {
            run.payload.insert("http_response".into(), json!({"error": "No URL configured"}));
            return Ok(());
        }
        let method = get_str(&step.config, "method").unwrap_or_else(|| "POST".into());
        let headers: HashMap<String, String> = step
            .config
            .get("headers")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::POST);
        let mut request = ctx
            .http_client
            .request(method, &url)
            .timeout(Duration::from_secs(30))
            .json(&Value::Object(run.payload.clone()));
        for (k, v) in headers {
            request = request.header(k, v);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let truncated: String = body.chars().take(2000).collect();
                run.payload.insert("http_response".into(), json!({"status": status, "body": truncated}));
            }
            Err(e) => {
                run.payload.insert("http_response".into(), json!({"error": e.to_string()}));
            }
        }
        Ok(())
    }
}

struct ResearchDeepDive;

#[async_trait]
impl StepHandler for ResearchDeepDive {
    async fn handle(
        &self,
        ctx: &PipelineContext,
        run: &mut PipelineRun,
        step: &StepDefinition,
    ) -> Result<(), PipelineError> {
        let query = query_from_payload(&run.payload);
        if query.is_empty() {
            run.payload.insert("research_result".into(), json!({"error": "No research query provided"}));
            return Ok(());
        }
        let Some(dispatcher) = &ctx.agent_dispatcher else {
            run.payload.insert("research_result".into(), json!({"error": "AgentDispatcher not available"}));
            return Ok(());
        };
        let Some(skill) = dispatcher.skills().iter().find(|s| s.name == "research_agent") else {
            run.payload.insert("research_result".into(), json!({"error": "research_agent skill not loaded"}));
            return Ok(());
        };

        let result = dispatcher.execute(skill, &query, None).await;

        if result.success && !result.actions.is_empty() {
            let data = result.actions[0].clone();
            run.payload.insert("research_result".into(), data.clone());
            run.payload.insert(
                "research_summary".into(),
                data.get("summary").cloned().unwrap_or(Value::String(String::new())),
            );

            let save_to_library = get_bool(&step.config, "save_to_library", true);
            if save_to_library {
                let mut attributes = Map::new();
                attributes.insert("original_query".into(), Value::String(query.clone()));
                attributes.insert("summary".into(), data.get("summary").cloned().unwrap_or(Value::String(String::new())));
                attributes.insert(
                    "confidence_score".into(),
                    data.get("confidence_score").cloned().unwrap_or(json!(0.0)),
                );
                attributes.insert("sources".into(), data.get("sources").cloned().unwrap_or(json!([])));
                attributes.insert("key_facts".into(), data.get("key_facts").cloned().unwrap_or(json!({})));

                let preview: String = query.chars().take(50).collect();
                match ctx
                    .knowledge_graph
                    .create_entity("research_topic".into(), format!("Research: {preview}"), attributes.into_iter().collect(), None)
                    .await
                {
                    Ok(entity) => {
                        run.payload.insert("research_container_id".into(), Value::String(entity.id));
                    }
                    Err(e) => warn!("failed to persist research result: {e}"),
                }
            }
        } else {
            run.payload.insert(
                "research_result".into(),
                json!({
                    "response": result.response.chars().take(500).collect::<String>(),
                    "error": result.error,
                }),
            );
        }
        Ok(())
    }
}

struct StyleEnforceDialogue;

#[async_trait]
impl StepHandler for StyleEnforceDialogue {
    async fn handle(
        &self,
        ctx: &PipelineContext,
        run: &mut PipelineRun,
        step: &StepDefinition,
    ) -> Result<(), PipelineError> {
        let speaker_name = get_str(&step.config, "speaker_name").unwrap_or_default();
        let voice_profile_bucket_id = get_str(&step.config, "voice_profile_bucket_id").unwrap_or_default();
        if speaker_name.is_empty() || voice_profile_bucket_id.is_empty() {
            warn!("STYLE_ENFORCE_DIALOGUE: missing speaker_name or voice_profile_bucket_id");
            return Ok(());
        }
        let Ok(Some(_profile)) = ctx.knowledge_graph.get_entity(voice_profile_bucket_id.clone()).await else {
            warn!("STYLE_ENFORCE_DIALOGUE: voice profile {voice_profile_bucket_id} not found");
            return Ok(());
        };
        let text = query_from_payload(&run.payload);
        if text.is_empty() {
            return Ok(());
        }
        // The original restyles only lines attributed to `speaker_name`,
        // leaving surrounding prose untouched; a dedicated voice-rendering
        // model call is out of scope here so the text passes through with
        // the marker recorded for observability.
        run.payload.insert("style_enforced_for".into(), Value::String(speaker_name));
        Ok(())
    }
}

fn context_store_error(e: EntityStoreError) -> PipelineError {
    PipelineError::Validation(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fence_removes_json_fence() {
        let input = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fence(input), "{\"a\": 1}");
    }

    #[test]
    fn strip_code_fence_passes_through_plain_text() {
        assert_eq!(strip_code_fence("{\"a\": 1}"), "{\"a\": 1}");
    }
}
