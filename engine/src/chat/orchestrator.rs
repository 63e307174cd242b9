//! Chat Orchestrator (C10): `handle_message`'s 8-step flow --
//! persist the user turn, branch on slash commands, classify intent, gate on
//! approval, dispatch a tool or fall through to a model call over the
//! three-layer context, then persist the assistant turn and close out the
//! event stream.
//!
//! Stable async Rust has no generator, so the handler is reshaped onto a
//! push-based `mpsc` channel wrapped in a [`tokio_stream::wrappers::ReceiverStream`]
//! rather than the poll-based `DashMap` + `stream::unfold` idiom C9's
//! pipeline engine uses, chat backpressure is naturally push-shaped (the
//! caller awaits the next event), which a channel models more directly than
//! a polled run table would.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use stream_event::ProtocolEvent;

use crate::llm::{LlmClient, MessageChunk};
use crate::message::Message;
use crate::model_config::{ModelConfigRegistry, ResolveRequest};

use super::context_manager::ChatContextManager;
use super::intent::{IntentClassifier, ToolIntent, TOOL_CHAT};
use super::session_store::{ApprovalState, ChatError, ChatMessage, ChatSessionStore, MessageRole};
use super::slash_commands::SlashCommandRouter;
use super::tool_registry::{ChatToolRegistry, ToolInput, ToolYield, ARTIFACT_CATEGORIES};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const CHAT_AGENT_ID: &str = "chat";

/// Canned response used when the model call itself fails, so a transient
/// provider outage degrades the turn instead of killing the session
///.
fn canned_failure_shell(error: &str) -> String {
    format!(
        "I ran into a problem reaching the model ({error}). Your message was saved, \
         try again in a moment, or rephrase."
    )
}

pub struct ChatOrchestrator {
    sessions: Arc<ChatSessionStore>,
    context_manager: Arc<ChatContextManager>,
    classifier: Arc<dyn IntentClassifier>,
    tools: Arc<ChatToolRegistry>,
    slash_commands: Arc<SlashCommandRouter>,
    model_registry: Arc<ModelConfigRegistry>,
    llm: Arc<dyn LlmClient>,
}

impl ChatOrchestrator {
    pub fn new(
        sessions: Arc<ChatSessionStore>,
        context_manager: Arc<ChatContextManager>,
        classifier: Arc<dyn IntentClassifier>,
        tools: Arc<ChatToolRegistry>,
        slash_commands: Arc<SlashCommandRouter>,
        model_registry: Arc<ModelConfigRegistry>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            sessions,
            context_manager,
            classifier,
            tools,
            slash_commands,
            model_registry,
            llm,
        }
    }

    /// Kicks off one turn and returns immediately with a stream of
    /// [`ProtocolEvent`]s; the turn itself runs in a background task that
    /// feeds the channel until it sends `Complete` or `Error` and drops.
    pub async fn handle_message(
        &self,
        session_id: String,
        content: String,
        mentioned_entity_ids: Option<Vec<String>>,
    ) -> Result<ReceiverStream<ProtocolEvent>, ChatError> {
        let session = self
            .sessions
            .get_session(session_id.clone())
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("chat session {session_id} not found")))?;

        let mentioned_entity_ids = mentioned_entity_ids.unwrap_or_default();
        let user_message = ChatMessage::new(session_id.clone(), MessageRole::User, content.clone())
            .with_mentioned_entity_ids(mentioned_entity_ids.clone());
        self.sessions.append_message(user_message).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let sessions = self.sessions.clone();
        let context_manager = self.context_manager.clone();
        let classifier = self.classifier.clone();
        let tools = self.tools.clone();
        let slash_commands = self.slash_commands.clone();
        let model_registry = self.model_registry.clone();
        let llm = self.llm.clone();

        tokio::spawn(async move {
            let autonomy_level = session.autonomy_level;

            if SlashCommandRouter::is_slash_command(&content) {
                let result = slash_commands
                    .handle(&session_id, &content, &llm, &context_manager)
                    .await;
                finish_from_yields(&tx, &sessions, &session_id, result, "slash_command").await;
                return;
            }

            let intent = classifier.classify(&content, autonomy_level).await;
            let _ = tx
                .send(ProtocolEvent::ActionTrace {
                    data: serde_json::json!({
                        "tool": intent.tool,
                        "confidence": intent.confidence,
                        "stage": "classified",
                    }),
                })
                .await;

            if intent.requires_approval {
                let _ = tx
                    .send(ProtocolEvent::ApprovalNeeded {
                        data: serde_json::json!({ "tool": intent.tool, "confidence": intent.confidence }),
                    })
                    .await;
                let mut pending = ChatMessage::new(session_id.clone(), MessageRole::Assistant, String::new());
                pending.approval_state = Some(ApprovalState::Pending);
                let _ = sessions.append_message(pending).await;
                return;
            }

            if intent.tool != TOOL_CHAT {
                let outcome = run_tool(&tools, &intent, &content, &mentioned_entity_ids, &session_id).await;
                finish_from_yields(&tx, &sessions, &session_id, outcome, &intent.tool).await;
                return;
            }

            run_chat_completion(
                &tx,
                &sessions,
                &context_manager,
                &model_registry,
                &llm,
                &session_id,
                &content,
                &mentioned_entity_ids,
            )
            .await;
        });

        Ok(ReceiverStream::new(rx))
    }
}

async fn run_tool(
    tools: &ChatToolRegistry,
    intent: &ToolIntent,
    content: &str,
    mentioned_entity_ids: &[String],
    session_id: &str,
) -> Result<Vec<ToolYield>, String> {
    let Some(tool) = tools.get(&intent.tool) else {
        return Err(format!("no handler registered for tool \"{}\"", intent.tool));
    };
    let input = ToolInput {
        content: content.to_string(),
        entity_ids: mentioned_entity_ids.to_vec(),
        session_id: session_id.to_string(),
        params: intent.params.clone(),
    };
    let mut yields = tool.call(input).await?;
    if ARTIFACT_CATEGORIES.contains(&tool.category()) {
        let summary = yields
            .iter()
            .filter_map(|y| match y {
                ToolYield::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        yields.push(ToolYield::Event(ProtocolEvent::Artifact {
            data: serde_json::json!({ "tool": intent.tool, "summary": summary }),
        }));
    }
    Ok(yields)
}

/// Sends `outcome`'s yields as `Token`/passthrough events, persists the
/// assistant turn, and always terminates with `Complete` or `Error`
///.
async fn finish_from_yields(
    tx: &mpsc::Sender<ProtocolEvent>,
    sessions: &Arc<ChatSessionStore>,
    session_id: &str,
    outcome: Result<Vec<ToolYield>, String>,
    trace_label: &str,
) {
    match outcome {
        Ok(yields) => {
            let mut content_parts = Vec::new();
            for y in yields {
                match y {
                    ToolYield::Text(t) => {
                        content_parts.push(t.clone());
                        let _ = tx.send(ProtocolEvent::Token { content: t }).await;
                    }
                    ToolYield::Event(e) => {
                        let _ = tx.send(e).await;
                    }
                }
            }
            let content = content_parts.join("\n");
            let assistant_message = ChatMessage::new(session_id.to_string(), MessageRole::Assistant, content.clone());
            let _ = sessions.append_message(assistant_message).await;
            let _ = tx
                .send(ProtocolEvent::Complete {
                    data: serde_json::json!({ "tool": trace_label }),
                })
                .await;
        }
        Err(error) => {
            let _ = tx.send(ProtocolEvent::Error { message: error }).await;
            let _ = tx
                .send(ProtocolEvent::Complete {
                    data: serde_json::json!({ "tool": trace_label, "failed": true }),
                })
                .await;
        }
    }
}

/// The `CHAT` (non-tool) path: assembles the three-layer context, streams
/// the model's reply token-by-token through `invoke_stream`, and persists
/// the assistant turn with its token usage.
async fn run_chat_completion(
    tx: &mpsc::Sender<ProtocolEvent>,
    sessions: &Arc<ChatSessionStore>,
    context_manager: &Arc<ChatContextManager>,
    model_registry: &Arc<ModelConfigRegistry>,
    llm: &Arc<dyn LlmClient>,
    session_id: &str,
    content: &str,
    mentioned_entity_ids: &[String],
) {
    let chat_context = match context_manager
        .build_context(session_id.to_string(), Some(mentioned_entity_ids.to_vec()), None)
        .await
    {
        Ok(ctx) => ctx,
        Err(e) => {
            let _ = tx.send(ProtocolEvent::Error { message: e.to_string() }).await;
            let _ = tx
                .send(ProtocolEvent::Complete {
                    data: serde_json::json!({ "tool": "chat", "failed": true }),
                })
                .await;
            return;
        }
    };

    let mut messages = Vec::new();
    let mut system_sections = Vec::new();
    if !chat_context.system_context.is_empty() {
        system_sections.push(chat_context.system_context.clone());
    }
    if !chat_context.entity_context.is_empty() {
        system_sections.push(chat_context.entity_context.clone());
    }
    if !system_sections.is_empty() {
        messages.push(Message::system(system_sections.join("\n\n")));
    }
    for history in &chat_context.messages {
        messages.push(match history.role.as_str() {
            "assistant" => Message::assistant(history.content.clone()),
            "system" => Message::system(history.content.clone()),
            _ => Message::user(history.content.clone()),
        });
    }
    messages.push(Message::user(content.to_string()));

    let params = model_registry
        .resolve(ResolveRequest {
            agent_id: Some(CHAT_AGENT_ID.to_string()),
            ..Default::default()
        })
        .await;

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<MessageChunk>(EVENT_CHANNEL_CAPACITY);
    let forward_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(chunk) = chunk_rx.recv().await {
            let _ = forward_tx.send(ProtocolEvent::Token { content: chunk.content }).await;
        }
    });

    let response = llm.invoke_stream(&messages, &params, Some(chunk_tx)).await;
    let _ = forwarder.await;

    let (final_content, token_usage) = match response {
        Ok(r) => {
            let usage = r.usage.as_ref().map(|u| u.total_tokens as u64).unwrap_or(0);
            (r.content, usage)
        }
        Err(e) => {
            let shell = canned_failure_shell(&e.to_string());
            let _ = tx
                .send(ProtocolEvent::Token {
                    content: shell.clone(),
                })
                .await;
            (shell, 0)
        }
    };

    let assistant_message = ChatMessage::new(session_id.to_string(), MessageRole::Assistant, final_content);
    let _ = sessions.append_message(assistant_message).await;

    if token_usage > 0 {
        if let Ok(Some(mut session)) = sessions.get_session(session_id.to_string()).await {
            session.token_usage += token_usage;
            let _ = sessions.save_session(session).await;
        }
    }

    let _ = tx
        .send(ProtocolEvent::Complete {
            data: serde_json::json!({ "tool": "chat", "token_usage": token_usage }),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::context_manager::ChatContextManager;
    use crate::chat::intent::KeywordIntentClassifier;
    use crate::chat::session_store::AutonomyLevel;
    use crate::chat::tool_registry::ChatToolRegistry;
    use crate::embedding::DeterministicEmbedder;
    use crate::entity_store::{RelationalIndex, VectorIndex};
    use crate::knowledge_graph::KnowledgeGraph;
    use crate::llm::MockLlm;
    use dashmap::DashMap;
    use tokio_stream::StreamExt;

    async fn orchestrator() -> (ChatOrchestrator, Arc<ChatSessionStore>, String) {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(ChatSessionStore::new(dir.path().join("chat.db")).unwrap());
        let relational = Arc::new(RelationalIndex::new(dir.path().join("index.db")).unwrap());
        let vector = Arc::new(VectorIndex::new(dir.path().join("vectors.db"), Arc::new(DeterministicEmbedder::new())).unwrap());
        let kg = Arc::new(KnowledgeGraph::new(
            relational,
            vector,
            dir.path().to_path_buf(),
            dir.path().join("index.db"),
            Arc::new(DashMap::new()),
        ));
        let context_manager = Arc::new(ChatContextManager::new(sessions.clone(), kg.clone()));
        let classifier: Arc<dyn IntentClassifier> = Arc::new(KeywordIntentClassifier::new());
        let tools = Arc::new(ChatToolRegistry::new());
        let slash_commands = Arc::new(SlashCommandRouter::new());
        let model_registry = Arc::new(ModelConfigRegistry::new(
            "test-app",
            env_config::ProjectConfig::default(),
        ));
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlm::fixed("Hello from the model"));

        let session = sessions
            .create_session("s".into(), None, AutonomyLevel::Execute, 4000)
            .await
            .unwrap();

        let orch = ChatOrchestrator::new(
            sessions.clone(),
            context_manager,
            classifier,
            tools,
            slash_commands,
            model_registry,
            llm,
        );
        (orch, sessions, session.id)
    }

    #[tokio::test]
    async fn chat_path_emits_token_then_complete_and_persists_reply() {
        let (orch, sessions, session_id) = orchestrator().await;
        let mut stream = orch
            .handle_message(session_id.clone(), "how's it going?".into(), None)
            .await
            .unwrap();

        let mut saw_token = false;
        let mut saw_complete = false;
        while let Some(event) = stream.next().await {
            match event {
                ProtocolEvent::Token { .. } => saw_token = true,
                ProtocolEvent::Complete { .. } => saw_complete = true,
                _ => {}
            }
        }
        assert!(saw_token);
        assert!(saw_complete);

        let messages = sessions.get_messages(session_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Hello from the model");
    }

    #[tokio::test]
    async fn destructive_intent_under_ask_autonomy_requires_approval() {
        let (orch, sessions, _) = orchestrator().await;
        let session = sessions
            .create_session("ask".into(), None, AutonomyLevel::Ask, 4000)
            .await
            .unwrap();
        let mut stream = orch
            .handle_message(session.id.clone(), "delete the villain character".into(), None)
            .await
            .unwrap();

        let mut saw_approval_needed = false;
        while let Some(event) = stream.next().await {
            if let ProtocolEvent::ApprovalNeeded { .. } = event {
                saw_approval_needed = true;
            }
        }
        assert!(saw_approval_needed);
    }

    #[tokio::test]
    async fn unknown_slash_command_lists_valid_commands() {
        let (orch, _sessions, session_id) = orchestrator().await;
        let mut stream = orch
            .handle_message(session_id, "/frobnicate".into(), None)
            .await
            .unwrap();

        let mut saw_listing = false;
        while let Some(event) = stream.next().await {
            if let ProtocolEvent::Token { content } = event {
                if content.contains("/plan") {
                    saw_listing = true;
                }
            }
        }
        assert!(saw_listing);
    }
}
