//! Pipeline data model: step/edge/definition
//! shapes, the run-state machine, and the ephemeral run record threaded
//! through the executor.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("run {0} is not paused (currently {1})")]
    NotPaused(String, String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Context,
    Transform,
    Human,
    Execute,
    Logic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    GatherBuckets,
    SemanticSearch,
    PromptTemplate,
    MultiVariant,
    ReviewPrompt,
    ApproveOutput,
    ApproveImage,
    LlmGenerate,
    ImageGenerate,
    SaveToBucket,
    HttpRequest,
    ResearchDeepDive,
    StyleEnforceDialogue,
    IfElse,
    Loop,
    MergeOutputs,
}

impl StepType {
    pub fn category(self) -> StepCategory {
        match self {
            StepType::GatherBuckets | StepType::SemanticSearch => StepCategory::Context,
            StepType::PromptTemplate | StepType::MultiVariant => StepCategory::Transform,
            StepType::ReviewPrompt | StepType::ApproveOutput | StepType::ApproveImage => {
                StepCategory::Human
            }
            StepType::LlmGenerate
            | StepType::ImageGenerate
            | StepType::SaveToBucket
            | StepType::HttpRequest
            | StepType::ResearchDeepDive
            | StepType::StyleEnforceDialogue => StepCategory::Execute,
            StepType::IfElse | StepType::Loop | StepType::MergeOutputs => StepCategory::Logic,
        }
    }

    /// All known step type wire names, used to validate planner output
    ///.
    pub fn all() -> &'static [StepType] {
        &[
            StepType::GatherBuckets,
            StepType::SemanticSearch,
            StepType::PromptTemplate,
            StepType::MultiVariant,
            StepType::ReviewPrompt,
            StepType::ApproveOutput,
            StepType::ApproveImage,
            StepType::LlmGenerate,
            StepType::ImageGenerate,
            StepType::SaveToBucket,
            StepType::HttpRequest,
            StepType::ResearchDeepDive,
            StepType::StyleEnforceDialogue,
            StepType::IfElse,
            StepType::Loop,
            StepType::MergeOutputs,
        ]
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub step_type: StepType,
    pub label: String,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    /// UI-only coordinates; carried through but never read by the executor.
    #[serde(default)]
    pub position: Value,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, step_type: StepType, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type,
            label: label.into(),
            config: serde_json::Map::new(),
            position: Value::Null,
        }
    }

    pub fn with_config(mut self, config: serde_json::Map<String, Value>) -> Self {
        self.config = config;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub source: String,
    pub target: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl PipelineDefinition {
    /// invariants: step ids unique, every edge endpoint names
    /// an existing step.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(PipelineError::Validation(format!("duplicate step id '{}'", step.id)));
            }
        }
        for edge in &self.edges {
            if !seen.contains(edge.source.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "edge references unknown source step '{}'",
                    edge.source
                )));
            }
            if !seen.contains(edge.target.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "edge references unknown target step '{}'",
                    edge.target
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    ContextGathering,
    PromptAssembly,
    Executing,
    PausedForUser,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

/// The mutable "blackboard" threaded through every step of a run
///. A thin wrapper over `serde_json::Map` so handlers read
/// and write with ordinary map operations while the run snapshot serialises
/// as a plain JSON object.
pub type Payload = serde_json::Map<String, Value>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub definition_id: Option<String>,
    pub current_state: RunState,
    pub current_step_id: Option<String>,
    pub current_step_type: Option<StepType>,
    pub current_step_label: Option<String>,
    pub current_agent_id: Option<String>,
    pub payload: Payload,
    pub steps_completed: Vec<String>,
    /// Per-step runtime overrides set by `set_step_model_override`, keyed
    /// by step id then override key (currently only `"model"`).
    #[serde(default)]
    pub step_overrides: HashMap<String, HashMap<String, String>>,
    pub total_steps: usize,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn new(id: String, definition_id: Option<String>, payload: Payload, total_steps: usize) -> Self {
        Self {
            id,
            definition_id,
            current_state: RunState::ContextGathering,
            current_step_id: None,
            current_step_type: None,
            current_step_label: None,
            current_agent_id: None,
            payload,
            steps_completed: Vec::new(),
            step_overrides: HashMap::new(),
            total_steps,
            created_at: Utc::now(),
            error: None,
        }
    }

    /// JSON snapshot emitted by `stream_pipeline`.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_duplicate_step_ids() {
        let def = PipelineDefinition {
            id: "p1".into(),
            name: "test".into(),
            description: String::new(),
            steps: vec![
                StepDefinition::new("a", StepType::PromptTemplate, "A"),
                StepDefinition::new("a", StepType::LlmGenerate, "A again"),
            ],
            edges: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_rejects_dangling_edge() {
        let def = PipelineDefinition {
            id: "p1".into(),
            name: "test".into(),
            description: String::new(),
            steps: vec![StepDefinition::new("a", StepType::PromptTemplate, "A")],
            edges: vec![EdgeDefinition {
                source: "a".into(),
                target: "nonexistent".into(),
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_definition() {
        let def = PipelineDefinition {
            id: "p1".into(),
            name: "test".into(),
            description: String::new(),
            steps: vec![
                StepDefinition::new("a", StepType::PromptTemplate, "A"),
                StepDefinition::new("b", StepType::LlmGenerate, "B"),
            ],
            edges: vec![EdgeDefinition {
                source: "a".into(),
                target: "b".into(),
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(def.validate().is_ok());
    }

    #[test]
    fn step_type_category_matches_taxonomy() {
        assert_eq!(StepType::GatherBuckets.category(), StepCategory::Context);
        assert_eq!(StepType::IfElse.category(), StepCategory::Logic);
        assert_eq!(StepType::LlmGenerate.category(), StepCategory::Execute);
        assert_eq!(StepType::ApproveOutput.category(), StepCategory::Human);
        assert_eq!(StepType::PromptTemplate.category(), StepCategory::Transform);
    }
}
