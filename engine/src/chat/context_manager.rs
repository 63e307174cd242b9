//! Three-layer chat context assembly and compaction.
//!
//! Layer 3 (on-demand entity retrieval) defers to the already-implemented
//! [`crate::context_assembler`] (C6); Layer 1 (Project Memory) is modelled
//! as ordinary `project_memory` entities via
//! [`crate::knowledge_graph::KnowledgeGraph`] rather than a bespoke store.
//! Token-budget priority is L3 > L2 (session history) > L1.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context_assembler::{estimate_tokens, ContextAssembler, ContextRequest};
use crate::knowledge_graph::KnowledgeGraph;

use super::session_store::{ChatError, ChatSessionStore, MessageRole};

const DEFAULT_TOKEN_BUDGET: usize = 8_000;
const DEFAULT_KEEP_RECENT: usize = 5;
const DIGEST_LINE_TRUNCATE: usize = 200;
const PROJECT_MEMORY_ENTITY_TYPE: &str = "project_memory";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LayerBreakdown {
    pub project_memory: usize,
    pub session_history: usize,
    pub on_demand_retrieval: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatContext {
    pub system_context: String,
    pub messages: Vec<HistoryMessage>,
    pub entity_context: String,
    pub token_usage: usize,
    pub layers: LayerBreakdown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompactionResult {
    pub digest: Option<String>,
    pub original_message_count: usize,
    pub token_reduction: usize,
    pub preserved_entities: Vec<String>,
    pub compaction_number: u32,
}

pub struct ChatContextManager {
    sessions: Arc<ChatSessionStore>,
    knowledge_graph: Arc<KnowledgeGraph>,
    context_assembler: Option<Arc<ContextAssembler>>,
}

impl ChatContextManager {
    pub fn new(sessions: Arc<ChatSessionStore>, knowledge_graph: Arc<KnowledgeGraph>) -> Self {
        Self {
            sessions,
            knowledge_graph,
            context_assembler: None,
        }
    }

    pub fn with_context_assembler(mut self, assembler: Arc<ContextAssembler>) -> Self {
        self.context_assembler = Some(assembler);
        self
    }

    /// Builds the `{system_context, messages, entity_context, token_usage,
    /// layers}` structure handed to the model call.
    /// Budget is spent L3 (most specific) first, then L2, then L1.
    pub async fn build_context(
        &self,
        session_id: String,
        mentioned_entity_ids: Option<Vec<String>>,
        token_budget: Option<usize>,
    ) -> Result<ChatContext, ChatError> {
        let token_budget = token_budget.unwrap_or(DEFAULT_TOKEN_BUDGET);
        let mut remaining = token_budget;

        let entity_context = self
            .build_entity_context(mentioned_entity_ids.unwrap_or_default())
            .await;
        let l3_tokens = estimate_tokens(&entity_context).min(remaining);
        remaining = remaining.saturating_sub(l3_tokens);

        let (messages, l2_tokens) = self.build_session_history(&session_id, remaining).await?;
        remaining = remaining.saturating_sub(l2_tokens);

        let (system_context, l1_tokens) = self.build_project_memory_section(&session_id, remaining).await;

        Ok(ChatContext {
            system_context,
            messages,
            entity_context,
            token_usage: l3_tokens + l2_tokens + l1_tokens,
            layers: LayerBreakdown {
                project_memory: l1_tokens,
                session_history: l2_tokens,
                on_demand_retrieval: l3_tokens,
            },
        })
    }

    /// Layer 3: one short context block per mentioned entity id via C6.
    /// Empty (not an error) when no assembler is wired up or no entities
    /// were mentioned, matches the original's "mentions without assembler"
    /// no-op behaviour.
    async fn build_entity_context(&self, mentioned_entity_ids: Vec<String>) -> String {
        let Some(assembler) = &self.context_assembler else {
            return String::new();
        };
        if mentioned_entity_ids.is_empty() {
            return String::new();
        }
        let mut request = ContextRequest::new(String::new(), 2_000);
        request.explicit_ids = mentioned_entity_ids;
        match assembler.assemble(request).await {
            Ok(result) => result.text,
            Err(_) => String::new(),
        }
    }

    /// Layer 2: the session's messages, taken from the most recent backward
    /// until the running token estimate would exceed `budget`, then restored
    /// to chronological order.
    async fn build_session_history(
        &self,
        session_id: &str,
        budget: usize,
    ) -> Result<(Vec<HistoryMessage>, usize), ChatError> {
        let all = self.sessions.get_messages(session_id.to_string()).await?;
        let mut kept = Vec::new();
        let mut used = 0usize;
        for message in all.into_iter().rev() {
            let cost = estimate_tokens(&message.content);
            if used + cost > budget && !kept.is_empty() {
                break;
            }
            used += cost;
            kept.push(HistoryMessage {
                role: role_str(message.role).to_string(),
                content: message.content,
            });
        }
        kept.reverse();
        Ok((kept, used))
    }

    /// Layer 1: all `auto_inject` project-memory entries scoped to `global`,
    /// concatenated into a single system section.
    /// Truncated line-by-line from the end if it would overflow `budget` --
    /// Project Memory is the lowest-priority layer.
    async fn build_project_memory_section(&self, _session_id: &str, budget: usize) -> (String, usize) {
        let entries = self
            .knowledge_graph
            .get_entities_by_type(PROJECT_MEMORY_ENTITY_TYPE.to_string())
            .await
            .unwrap_or_default();

        let mut lines: Vec<String> = entries
            .into_iter()
            .filter(|e| {
                e.attributes.get("auto_inject").and_then(|v| v.as_bool()).unwrap_or(false)
                    && e.attributes.get("scope").and_then(|v| v.as_str()).unwrap_or("global") == "global"
            })
            .map(|e| {
                let key = e.attributes.get("key").and_then(|v| v.as_str()).unwrap_or(&e.name).to_string();
                let value = e.attributes.get("value").and_then(|v| v.as_str()).unwrap_or("").to_string();
                format!("{key}: {value}")
            })
            .collect();

        let mut text = lines.join("\n");
        while estimate_tokens(&text) > budget && !lines.is_empty() {
            lines.pop();
            text = lines.join("\n");
        }
        let tokens = estimate_tokens(&text);
        (text, tokens)
    }

    /// `/compact`: summarises every message
    /// older than the most recent `keep_recent` into a digest, preserving
    /// the mentioned entity ids of the kept messages. A no-op when there
    /// aren't enough messages to benefit.
    pub async fn compact(&self, session_id: String, keep_recent: Option<usize>) -> Result<CompactionResult, ChatError> {
        let keep_recent = keep_recent.unwrap_or(DEFAULT_KEEP_RECENT);
        let session = self
            .sessions
            .get_session(session_id.clone())
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("chat session {session_id} not found")))?;
        let all = self.sessions.get_messages(session_id.clone()).await?;
        let total = all.len();

        if total <= keep_recent {
            return Ok(CompactionResult {
                digest: None,
                original_message_count: total,
                token_reduction: 0,
                preserved_entities: Vec::new(),
                compaction_number: session.compaction_count,
            });
        }

        let split = total - keep_recent;
        let (older, recent) = all.split_at(split);

        let mut digest = String::from("## Conversation Summary\n");
        for message in older {
            let preview: String = message.content.chars().take(DIGEST_LINE_TRUNCATE).collect();
            digest.push_str(&format!("- {}: {}\n", role_str(message.role), preview));
        }

        let original_text: String = older.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join(" ");
        let original_tokens = estimate_tokens(&original_text);
        let digest_tokens = estimate_tokens(&digest);
        let token_reduction = original_tokens.saturating_sub(digest_tokens);

        let mut preserved_entities = Vec::new();
        for message in recent {
            for id in &message.mentioned_entity_ids {
                if !preserved_entities.contains(id) {
                    preserved_entities.push(id.clone());
                }
            }
        }

        let compaction_number = session.compaction_count + 1;
        let mut updated = session;
        updated.digest = Some(digest.clone());
        updated.compaction_count = compaction_number;
        updated.state = super::session_store::SessionState::Compacted;
        self.sessions.save_session(updated).await?;

        Ok(CompactionResult {
            digest: Some(digest),
            original_message_count: total,
            token_reduction,
            preserved_entities,
            compaction_number,
        })
    }
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_store::{RelationalIndex, VectorIndex};
    use crate::chat::session_store::{AutonomyLevel, ChatMessage};
    use crate::embedding::DeterministicEmbedder;
    use dashmap::DashMap;

    async fn manager() -> (ChatContextManager, Arc<ChatSessionStore>) {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(ChatSessionStore::new(dir.path().join("chat.db")).unwrap());
        let relational = Arc::new(RelationalIndex::new(dir.path().join("index.db")).unwrap());
        let vector = Arc::new(VectorIndex::new(dir.path().join("vectors.db"), Arc::new(DeterministicEmbedder::new())).unwrap());
        let kg = Arc::new(KnowledgeGraph::new(
            relational,
            vector,
            dir.path(),
            dir.path().join("index.db"),
            Arc::new(DashMap::new()),
        ));
        (ChatContextManager::new(sessions.clone(), kg), sessions)
    }

    #[tokio::test]
    async fn empty_session_has_empty_messages_and_system_context() {
        let (mgr, sessions) = manager().await;
        let session = sessions.create_session("s".into(), None, AutonomyLevel::Ask, 4000).await.unwrap();
        let ctx = mgr.build_context(session.id, None, None).await.unwrap();
        assert!(ctx.messages.is_empty());
        assert_eq!(ctx.system_context, "");
        assert_eq!(ctx.entity_context, "");
    }

    #[tokio::test]
    async fn includes_session_messages_in_order() {
        let (mgr, sessions) = manager().await;
        let session = sessions.create_session("s".into(), None, AutonomyLevel::Ask, 4000).await.unwrap();
        sessions
            .append_message(ChatMessage::new(session.id.clone(), MessageRole::User, "Hello"))
            .await
            .unwrap();
        sessions
            .append_message(ChatMessage::new(session.id.clone(), MessageRole::Assistant, "Hi there"))
            .await
            .unwrap();

        let ctx = mgr.build_context(session.id, None, None).await.unwrap();
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[0].role, "user");
        assert_eq!(ctx.messages[1].role, "assistant");
    }

    #[tokio::test]
    async fn total_tokens_stay_within_budget() {
        let (mgr, sessions) = manager().await;
        let session = sessions.create_session("s".into(), None, AutonomyLevel::Ask, 4000).await.unwrap();
        for i in 0..20 {
            let content = format!("Message {i} ").repeat(100);
            sessions
                .append_message(ChatMessage::new(session.id.clone(), MessageRole::User, content))
                .await
                .unwrap();
        }
        let ctx = mgr.build_context(session.id, None, Some(1000)).await.unwrap();
        assert!(ctx.token_usage <= 1000);
        assert!(ctx.messages.len() < 20);
    }

    #[tokio::test]
    async fn compact_empty_session_is_a_zero_reduction_noop() {
        let (mgr, sessions) = manager().await;
        let session = sessions.create_session("s".into(), None, AutonomyLevel::Ask, 4000).await.unwrap();
        let result = mgr.compact(session.id, None).await.unwrap();
        assert_eq!(result.original_message_count, 0);
        assert_eq!(result.token_reduction, 0);
    }

    #[tokio::test]
    async fn compact_creates_digest_and_preserves_recent_entities() {
        let (mgr, sessions) = manager().await;
        let session = sessions.create_session("s".into(), None, AutonomyLevel::Ask, 4000).await.unwrap();
        for i in 0..20 {
            sessions
                .append_message(ChatMessage::new(
                    session.id.clone(),
                    MessageRole::User,
                    format!("Message number {i}: {}", "x".repeat(500)),
                ))
                .await
                .unwrap();
            sessions
                .append_message(
                    ChatMessage::new(session.id.clone(), MessageRole::Assistant, format!("Reply to {i}: {}", "y".repeat(500)))
                        .with_mentioned_entity_ids(vec![format!("char_{i}")]),
                )
                .await
                .unwrap();
        }

        let result = mgr.compact(session.id.clone(), Some(5)).await.unwrap();
        assert_eq!(result.original_message_count, 40);
        let digest = result.digest.expect("digest");
        assert!(digest.contains("Conversation Summary"));
        assert!(result.token_reduction > 0);
        assert_eq!(result.compaction_number, 1);

        let session_after = sessions.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(session_after.compaction_count, 1);
        assert!(session_after.digest.is_some());
    }

    #[tokio::test]
    async fn compact_with_few_messages_is_a_noop() {
        let (mgr, sessions) = manager().await;
        let session = sessions.create_session("s".into(), None, AutonomyLevel::Ask, 4000).await.unwrap();
        for i in 0..5 {
            sessions
                .append_message(ChatMessage::new(session.id.clone(), MessageRole::User, format!("msg {i}")))
                .await
                .unwrap();
        }
        let result = mgr.compact(session.id, Some(10)).await.unwrap();
        assert_eq!(result.token_reduction, 0);
    }
}
