//! Chat Orchestrator (C10): session/message persistence,
//! intent classification, the three-layer context manager, the tool
//! registry, slash commands, and the orchestrator that ties them together.

mod context_manager;
mod intent;
mod orchestrator;
mod session_store;
mod slash_commands;
mod tool_registry;

pub use context_manager::{ChatContext, ChatContextManager, CompactionResult, HistoryMessage, LayerBreakdown};
pub use intent::{
    IntentClassifier, KeywordIntentClassifier, ToolIntent, TOOL_CHAT, TOOL_CREATE, TOOL_DECIDE, TOOL_DELETE,
    TOOL_EVALUATE, TOOL_NAVIGATE, TOOL_PIPELINE, TOOL_RELATIONSHIP, TOOL_RESEARCH, TOOL_SAVE_TO_MEMORY, TOOL_SEARCH,
    TOOL_UNRESOLVED_THREADS, TOOL_UPDATE, TOOL_WORLD_SUMMARY,
};
pub use orchestrator::ChatOrchestrator;
pub use session_store::{
    ActionTrace, ApprovalState, Artifact, AutonomyLevel, ChatError, ChatMessage, ChatSession, ChatSessionStore,
    MessageRole, SessionState,
};
pub use slash_commands::{PlanStep, SlashCommandRouter};
pub use tool_registry::{ChatTool, ChatToolRegistry, ToolInput, ToolYield, ARTIFACT_CATEGORIES};
