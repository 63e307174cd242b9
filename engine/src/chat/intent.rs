//! Intent classification: maps a chat message to a
//! tool name plus a confidence score, optional extracted parameters, and an
//! approval gate, using the same keyword-scoring idiom as the agent
//! dispatcher's `route` (`agent_dispatcher::route`) rather than a separate
//! classifier shape.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::session_store::AutonomyLevel;

pub const TOOL_CHAT: &str = "CHAT";
pub const TOOL_SEARCH: &str = "SEARCH";
pub const TOOL_CREATE: &str = "CREATE";
pub const TOOL_UPDATE: &str = "UPDATE";
pub const TOOL_DELETE: &str = "DELETE";
pub const TOOL_NAVIGATE: &str = "NAVIGATE";
pub const TOOL_EVALUATE: &str = "EVALUATE";
pub const TOOL_RESEARCH: &str = "RESEARCH";
pub const TOOL_PIPELINE: &str = "PIPELINE";
pub const TOOL_RELATIONSHIP: &str = "RELATIONSHIP";
pub const TOOL_WORLD_SUMMARY: &str = "WORLD_SUMMARY";
pub const TOOL_UNRESOLVED_THREADS: &str = "UNRESOLVED_THREADS";
pub const TOOL_DECIDE: &str = "DECIDE";
pub const TOOL_SAVE_TO_MEMORY: &str = "SAVE_TO_MEMORY";

/// Tools whose side effects are destructive enough to gate behind
/// `autonomy_level`.
const DESTRUCTIVE_TOOLS: &[&str] = &[TOOL_DELETE, TOOL_UPDATE, TOOL_CREATE];

#[derive(Clone, Debug)]
pub struct ToolIntent {
    pub tool: String,
    pub confidence: f32,
    pub params: Map<String, Value>,
    pub requires_approval: bool,
}

impl ToolIntent {
    pub fn chat() -> Self {
        Self {
            tool: TOOL_CHAT.to_string(),
            confidence: 1.0,
            params: Map::new(),
            requires_approval: false,
        }
    }
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, content: &str, autonomy_level: AutonomyLevel) -> ToolIntent;
}

/// Default classifier: scores each known tool's keyword list against the
/// message, picks the best match above a minimum confidence, and falls back
/// to `CHAT` otherwise. Gates destructive tools behind `autonomy_level`
/// exactly as `Ask` never auto-runs them, `Suggest` still asks, and only
/// `Execute` proceeds unattended.
pub struct KeywordIntentClassifier {
    keyword_table: HashMap<&'static str, &'static [&'static str]>,
}

impl Default for KeywordIntentClassifier {
    fn default() -> Self {
        Self {
            keyword_table: HashMap::from([
                (TOOL_SEARCH, &["search for", "find", "look up", "search"][..]),
                (TOOL_CREATE, &["create a", "create ", "add a new", "new character", "new scene"][..]),
                (TOOL_UPDATE, &["update ", "change ", "rename ", "edit "][..]),
                (TOOL_DELETE, &["delete ", "remove ", "get rid of"][..]),
                (TOOL_NAVIGATE, &["go to", "show me", "open ", "navigate to"][..]),
                (TOOL_EVALUATE, &["evaluate", "critique", "review my", "how good is"][..]),
                (TOOL_RESEARCH, &["research ", "look into", "investigate"][..]),
                (TOOL_PIPELINE, &["run the pipeline", "run pipeline", "start the pipeline"][..]),
                (TOOL_RELATIONSHIP, &["how are", "related to", "relationship between"][..]),
                (TOOL_WORLD_SUMMARY, &["summarize the world", "world summary", "summarize everything"][..]),
                (TOOL_UNRESOLVED_THREADS, &["unresolved threads", "loose ends", "dangling plot"][..]),
                (TOOL_DECIDE, &["decide whether", "should i", "which is better"][..]),
                (TOOL_SAVE_TO_MEMORY, &["remember that", "save to memory", "always remember"][..]),
            ]),
        }
    }
}

impl KeywordIntentClassifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(&self, content: &str, autonomy_level: AutonomyLevel) -> ToolIntent {
        let lower = content.to_lowercase();
        let mut best: Option<(&'static str, f32)> = None;

        for (tool, keywords) in &self.keyword_table {
            let hits = keywords.iter().filter(|kw| lower.contains(*kw)).count();
            if hits == 0 {
                continue;
            }
            let confidence = (hits as f32 / keywords.len() as f32).max(0.34).min(0.95);
            if best.map(|(_, c)| confidence > c).unwrap_or(true) {
                best = Some((tool, confidence));
            }
        }

        let Some((tool, confidence)) = best else {
            return ToolIntent::chat();
        };

        let requires_approval = DESTRUCTIVE_TOOLS.contains(&tool) && autonomy_level < AutonomyLevel::Execute;
        ToolIntent {
            tool: tool.to_string(),
            confidence,
            params: Map::new(),
            requires_approval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unmatched_content_falls_back_to_chat() {
        let classifier = KeywordIntentClassifier::new();
        let intent = classifier.classify("how's it going today?", AutonomyLevel::Execute).await;
        assert_eq!(intent.tool, TOOL_CHAT);
    }

    #[tokio::test]
    async fn matches_search_keywords() {
        let classifier = KeywordIntentClassifier::new();
        let intent = classifier.classify("search for the dragon's lair", AutonomyLevel::Execute).await;
        assert_eq!(intent.tool, TOOL_SEARCH);
        assert!(!intent.requires_approval);
    }

    #[tokio::test]
    async fn destructive_tool_requires_approval_below_execute_autonomy() {
        let classifier = KeywordIntentClassifier::new();
        let intent = classifier.classify("delete the villain character", AutonomyLevel::Suggest).await;
        assert_eq!(intent.tool, TOOL_DELETE);
        assert!(intent.requires_approval);
    }

    #[tokio::test]
    async fn destructive_tool_does_not_require_approval_at_execute_autonomy() {
        let classifier = KeywordIntentClassifier::new();
        let intent = classifier.classify("delete the villain character", AutonomyLevel::Execute).await;
        assert!(!intent.requires_approval);
    }
}
