//! Model Config Registry (C7): resolves which model
//! configuration to use for an LLM call via a four-level cascade, highest
//! priority first, step config, entity `model_preference`, per-agent
//! default, project default. An empty string at any level means "fall
//! through" to the next.
//!
//! Built as a resolver wrapping a cached project config, consulted before
//! falling through to the next source, generalised from "context/output
//! token limits" to "which model + sampling params to use".

use std::collections::HashMap;
use std::sync::Arc;

use env_config::ProjectConfig;
use tokio::sync::RwLock;

use crate::llm::LlmCallParams;

/// Inputs available at the point an `LLM_GENERATE` step (or any other model
/// call site) resolves its configuration. Each field is cascade level 1 or
/// 2; levels 3-4 come from the registry's own project config.
#[derive(Clone, Debug, Default)]
pub struct ResolveRequest {
    /// Cascade level 1: explicit `model` in the current pipeline step's config.
    pub step_model: Option<String>,
    pub step_temperature: Option<f32>,
    pub step_max_tokens: Option<u32>,
    /// Cascade level 2: `model_preference` set on the entity being operated on.
    pub entity_model_preference: Option<String>,
    /// Which compiled-in/per-agent default table entry to consult at level 3.
    pub agent_id: Option<String>,
}

/// Per-agent defaults baked into the binary, consulted when the project
/// config has no override for that agent.
fn compiled_in_agent_defaults() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("writing", "openai/gpt-4o"),
        ("research", "openai/gpt-4o-mini"),
        ("continuity", "openai/gpt-4o-mini"),
        ("style", "openai/gpt-4o"),
        ("chat", "openai/gpt-4o"),
    ])
}

pub struct ModelConfigRegistry {
    app_name: String,
    project_config: RwLock<ProjectConfig>,
    agent_defaults: HashMap<&'static str, &'static str>,
}

impl ModelConfigRegistry {
    pub fn new(app_name: impl Into<String>, project_config: ProjectConfig) -> Self {
        Self {
            app_name: app_name.into(),
            project_config: RwLock::new(project_config),
            agent_defaults: compiled_in_agent_defaults(),
        }
    }

    pub async fn from_xdg(app_name: impl Into<String>) -> Result<Self, env_config::LoadError> {
        let app_name = app_name.into();
        let project_config = env_config::load_project_config(&app_name)?;
        Ok(Self::new(app_name, project_config))
    }

    /// Resolves the four-level cascade into call parameters ready to hand to
    /// an [`crate::llm::LlmClient`]. `temperature`/`max_tokens` are resolved
    /// independently of `model`, only the model id falls through levels;
    /// sampling params fall through from step config to engine defaults
    /// since entities/agents/projects don't carry temperature preferences.
    pub async fn resolve(&self, request: ResolveRequest) -> LlmCallParams {
        let model = self.resolve_model(&request).await;
        LlmCallParams {
            model,
            temperature: request.step_temperature.or(Some(0.8)),
            max_tokens: request.step_max_tokens,
        }
    }

    async fn resolve_model(&self, request: &ResolveRequest) -> String {
        if let Some(m) = non_empty(request.step_model.as_deref()) {
            return m.to_string();
        }
        if let Some(m) = non_empty(request.entity_model_preference.as_deref()) {
            return m.to_string();
        }
        if let Some(agent_id) = &request.agent_id {
            let project = self.project_config.read().await;
            if let Some(m) = non_empty(project.agent_defaults.get(agent_id).map(String::as_str)) {
                return m.to_string();
            }
            if let Some(m) = self.agent_defaults.get(agent_id.as_str()) {
                return m.to_string();
            }
        }
        let project = self.project_config.read().await;
        if let Some(m) = non_empty(Some(project.default_model.as_str())) {
            return m.to_string();
        }
        String::new()
    }

    /// Writes `patch` into the project config (merging non-default fields)
    /// and reloads, so subsequent `resolve` calls see the change immediately
    ///.
    pub async fn update_config(
        &self,
        mutate: impl FnOnce(&mut ProjectConfig),
    ) -> Result<(), env_config::LoadError> {
        let mut project = self.project_config.write().await;
        mutate(&mut project);
        env_config::save_project_config(&self.app_name, &project)?;
        let reloaded = env_config::load_project_config(&self.app_name)?;
        *project = reloaded;
        Ok(())
    }

    pub async fn project_default_model(&self) -> String {
        self.project_config.read().await.default_model.clone()
    }

    pub async fn context_budget(&self) -> usize {
        self.project_config.read().await.context_budget
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Shared registry handle, the pipeline engine and chat orchestrator both
/// inject this as a setter-provided singleton.
pub type SharedModelConfigRegistry = Arc<ModelConfigRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(project: ProjectConfig) -> ModelConfigRegistry {
        ModelConfigRegistry::new("test-app", project)
    }

    #[tokio::test]
    async fn step_config_wins_over_everything() {
        let registry = registry_with(ProjectConfig {
            default_model: "openai/project-default".into(),
            ..Default::default()
        });
        let params = registry
            .resolve(ResolveRequest {
                step_model: Some("openai/step-override".into()),
                entity_model_preference: Some("openai/entity-pref".into()),
                agent_id: Some("writing".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(params.model, "openai/step-override");
    }

    #[tokio::test]
    async fn empty_step_model_falls_through_to_entity_preference() {
        let registry = registry_with(ProjectConfig::default());
        let params = registry
            .resolve(ResolveRequest {
                step_model: Some(String::new()),
                entity_model_preference: Some("openai/entity-pref".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(params.model, "openai/entity-pref");
    }

    #[tokio::test]
    async fn agent_override_in_project_config_beats_compiled_in_default() {
        let mut project = ProjectConfig::default();
        project
            .agent_defaults
            .insert("writing".into(), "openai/custom-writer".into());
        let registry = registry_with(project);
        let params = registry
            .resolve(ResolveRequest {
                agent_id: Some("writing".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(params.model, "openai/custom-writer");
    }

    #[tokio::test]
    async fn falls_back_to_compiled_in_agent_default_when_project_has_none() {
        let registry = registry_with(ProjectConfig::default());
        let params = registry
            .resolve(ResolveRequest {
                agent_id: Some("research".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(params.model, "openai/gpt-4o-mini");
    }

    #[tokio::test]
    async fn falls_back_to_project_default_when_agent_unknown() {
        let registry = registry_with(ProjectConfig {
            default_model: "openai/project-default".into(),
            ..Default::default()
        });
        let params = registry
            .resolve(ResolveRequest {
                agent_id: Some("nonexistent-agent".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(params.model, "openai/project-default");
    }

    #[tokio::test]
    async fn empty_cascade_resolves_to_empty_string() {
        let registry = registry_with(ProjectConfig::default());
        let params = registry.resolve(ResolveRequest::default()).await;
        assert_eq!(params.model, "");
    }
}
