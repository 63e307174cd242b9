//! Crate-wide error taxonomy: validation, conflict, not-found, transient
//! provider, storage, and logic-evaluation errors, each with its own propagation
//! policy. Per-subsystem errors (below) convert into this for callers that cross
//! module boundaries; subsystems that only ever need their own variant keep their
//! own `thiserror` enum instead of funnelling everything through one god-error.

use thiserror::Error;

/// Top-level error surfaced by the agent dispatcher and anything it calls into.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("llm error: {0}")]
    Llm(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    pub fn other(msg: impl Into<String>) -> Self {
        AgentError::Other(msg.into())
    }
}

impl From<crate::entity_store::EntityStoreError> for AgentError {
    fn from(e: crate::entity_store::EntityStoreError) -> Self {
        AgentError::Other(e.to_string())
    }
}
