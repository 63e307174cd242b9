//! Agent Dispatcher (C8): a polymorphic tool-routing layer.
//! Routes an intent to a [`Skill`] by keyword scoring (falling back to an
//! LLM classifier on ambiguity) and runs a bounded ReAct loop that lets the
//! chosen skill call registered tools until it produces a final answer.
//!
//! Follows the overall Think → Act → Observe shape of a classic ReAct
//! runner, but drives it over a plain text `Action: Tool("arg")` / `Final
//! Answer: …` protocol (a tagged-variant dispatch table) rather than a JSON
//! tool-call or general state-graph engine.

mod skill;
mod tool;

pub use skill::{load_skills_dir, parse_skill_file, Skill};
pub use tool::{RegisteredTool, ToolHandler, ToolRegistry};

use std::sync::Arc;

use serde_json::Value;

use crate::error::AgentError;
use crate::llm::{LlmCallParams, LlmClient};
use crate::message::Message;

const DEFAULT_MAX_ITERATIONS: usize = 5;

/// Result of [`AgentDispatcher::execute`].
#[derive(Clone, Debug)]
pub struct AgentResult {
    pub skill_name: String,
    pub response: String,
    /// Structured JSON actions parsed out of the final response, accepting
    /// either bare JSON or a ```json fenced block.
    pub actions: Vec<Value>,
    pub success: bool,
    pub error: Option<String>,
    pub iterations: usize,
    pub model_used: String,
    pub context_keys_used: Vec<String>,
}

pub struct AgentDispatcher {
    skills: Vec<Skill>,
    tools: ToolRegistry,
    llm: Arc<dyn LlmClient>,
    classifier_llm: Arc<dyn LlmClient>,
    max_iterations: usize,
}

impl AgentDispatcher {
    pub fn new(skills: Vec<Skill>, tools: ToolRegistry, llm: Arc<dyn LlmClient>) -> Self {
        let classifier_llm = llm.clone();
        Self {
            skills,
            tools,
            llm,
            classifier_llm,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Uses a separate (typically cheaper) model for [`Self::route_with_llm`].
    pub fn with_classifier_llm(mut self, classifier_llm: Arc<dyn LlmClient>) -> Self {
        self.classifier_llm = classifier_llm;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn skills(&self) -> &[Skill] {
        &self.skills
    }

    /// Keyword scoring: each keyword found in `intent`
    /// contributes a score equal to its word count. The best-scoring skill
    /// wins unless it ties with another, in which case routing is ambiguous.
    pub fn route(&self, intent: &str) -> Option<&Skill> {
        let intent_lower = intent.to_lowercase();
        let mut best_score = 0usize;
        let mut best: Option<&Skill> = None;
        let mut tied = false;

        for skill in &self.skills {
            let score: usize = skill
                .keywords
                .iter()
                .filter(|kw| intent_lower.contains(&kw.to_lowercase()))
                .map(|kw| kw.split_whitespace().count().max(1))
                .sum();
            if score == 0 {
                continue;
            }
            match score.cmp(&best_score) {
                std::cmp::Ordering::Greater => {
                    best_score = score;
                    best = Some(skill);
                    tied = false;
                }
                std::cmp::Ordering::Equal => {
                    tied = true;
                }
                std::cmp::Ordering::Less => {}
            }
        }

        if tied {
            None
        } else {
            best
        }
    }

    /// Asks [`Self::classifier_llm`] to pick a skill name from the known set
    /// when keyword routing is ambiguous. Missing/unknown names yield `None`.
    pub async fn route_with_llm(&self, intent: &str) -> Result<Option<&Skill>, AgentError> {
        if self.skills.is_empty() {
            return Ok(None);
        }
        let names: Vec<&str> = self.skills.iter().map(|s| s.name.as_str()).collect();
        let system = format!(
            "Classify the user's intent into exactly one of these skill names: {}. \
             Respond with only the skill name, nothing else.",
            names.join(", ")
        );
        let response = self
            .classifier_llm
            .invoke(
                &[Message::system(system), Message::user(intent)],
                &LlmCallParams::default(),
            )
            .await?;
        let picked = response.content.trim();
        Ok(self.skills.iter().find(|s| s.name == picked))
    }

    /// Runs the bounded ReAct loop for `skill` against
    /// `intent`, seeded with optional prior `context`.
    pub async fn execute(
        &self,
        skill: &Skill,
        intent: &str,
        context: Option<Vec<(String, String)>>,
    ) -> AgentResult {
        let system_prompt = format!("{}\n\n{}", skill.system_prompt, self.tools.preamble());
        let mut messages = vec![Message::system(system_prompt)];
        let context_keys_used: Vec<String> = context
            .iter()
            .flatten()
            .map(|(k, _)| k.clone())
            .collect();
        if let Some(pairs) = &context {
            for (key, value) in pairs {
                messages.push(Message::user(format!("Context[{key}]: {value}")));
            }
        }
        messages.push(Message::user(intent));

        let params = LlmCallParams::default();
        let mut iterations = 0usize;
        let mut last_response = String::new();

        loop {
            iterations += 1;
            let invoke_result = self.llm.invoke(&messages, &params).await;
            let response = match invoke_result {
                Ok(r) => r.content,
                Err(e) => {
                    return AgentResult {
                        skill_name: skill.name.clone(),
                        response: last_response,
                        actions: Vec::new(),
                        success: false,
                        error: Some(e.to_string()),
                        iterations,
                        model_used: params.model.clone(),
                        context_keys_used,
                    };
                }
            };
            last_response = response.clone();

            if let Some(final_answer) = extract_final_answer(&response) {
                return AgentResult {
                    skill_name: skill.name.clone(),
                    response: final_answer.clone(),
                    actions: extract_json_actions(&final_answer),
                    success: true,
                    error: None,
                    iterations,
                    model_used: params.model.clone(),
                    context_keys_used,
                };
            }

            if let Some((tool_name, arg)) = extract_action(&response) {
                messages.push(Message::assistant(response.clone()));
                let observation = self.tools.dispatch(&tool_name, arg).await;
                messages.push(Message::user(format!("Observation: {observation}")));
                if iterations >= self.max_iterations {
                    return AgentResult {
                        skill_name: skill.name.clone(),
                        response,
                        actions: Vec::new(),
                        success: true,
                        error: None,
                        iterations,
                        model_used: params.model.clone(),
                        context_keys_used,
                    };
                }
                continue;
            }

            // Neither Action: nor Final Answer: present, treat as final.
            return AgentResult {
                skill_name: skill.name.clone(),
                response: response.clone(),
                actions: extract_json_actions(&response),
                success: true,
                error: None,
                iterations,
                model_used: params.model.clone(),
                context_keys_used,
            };
        }
    }
}

fn extract_final_answer(response: &str) -> Option<String> {
    response
        .find("Final Answer:")
        .map(|idx| response[idx + "Final Answer:".len()..].trim().to_string())
}

/// Parses `Action: ToolName("arg")` out of a model response. Returns the
/// tool name and the unquoted argument.
fn extract_action(response: &str) -> Option<(String, String)> {
    let idx = response.find("Action:")?;
    let rest = &response[idx + "Action:".len()..];
    let line = rest.lines().next().unwrap_or("").trim();
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    if close < open {
        return None;
    }
    let name = line[..open].trim().to_string();
    if name.is_empty() {
        return None;
    }
    let arg_raw = line[open + 1..close].trim();
    let arg = arg_raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(arg_raw)
        .to_string();
    Some((name, arg))
}

/// Extracts structured JSON actions from a response, accepting either a bare
/// JSON value or a ```json fenced block. Returns an empty vec if neither
/// parses, this is best-effort glass-box metadata, not a hard requirement.
fn extract_json_actions(response: &str) -> Vec<Value> {
    if let Some(start) = response.find("```json") {
        let after = &response[start + "```json".len()..];
        if let Some(end) = after.find("```") {
            let candidate = after[..end].trim();
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                return vec![value];
            }
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(response.trim()) {
        return vec![value];
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    fn brainstorm_skill() -> Skill {
        Skill {
            name: "brainstorm".into(),
            description: "Generate ideas".into(),
            system_prompt: "You brainstorm ideas.".into(),
            keywords: vec!["brainstorm".into(), "idea".into()],
        }
    }

    fn expand_skill() -> Skill {
        Skill {
            name: "expand".into(),
            description: "Expand a draft".into(),
            system_prompt: "You expand drafts.".into(),
            keywords: vec!["expand".into(), "draft".into()],
        }
    }

    #[test]
    fn routes_to_highest_scoring_skill() {
        let dispatcher = AgentDispatcher::new(
            vec![brainstorm_skill(), expand_skill()],
            ToolRegistry::new(),
            Arc::new(MockLlm::new(Vec::<String>::new())),
        );
        let routed = dispatcher.route("give me some ideas to brainstorm");
        assert_eq!(routed.unwrap().name, "brainstorm");
    }

    #[test]
    fn tied_scores_are_ambiguous() {
        let mut a = brainstorm_skill();
        a.keywords = vec!["story".into()];
        let mut b = expand_skill();
        b.keywords = vec!["story".into()];
        let dispatcher = AgentDispatcher::new(
            vec![a, b],
            ToolRegistry::new(),
            Arc::new(MockLlm::new(Vec::<String>::new())),
        );
        assert!(dispatcher.route("tell me a story").is_none());
    }

    #[test]
    fn no_matching_keywords_routes_to_none() {
        let dispatcher = AgentDispatcher::new(
            vec![brainstorm_skill()],
            ToolRegistry::new(),
            Arc::new(MockLlm::new(Vec::<String>::new())),
        );
        assert!(dispatcher.route("completely unrelated text").is_none());
    }

    #[tokio::test]
    async fn execute_stops_at_final_answer() {
        let llm = Arc::new(MockLlm::new(vec![
            "Final Answer: here are three ideas".to_string(),
        ]));
        let dispatcher = AgentDispatcher::new(vec![], ToolRegistry::new(), llm);
        let result = dispatcher.execute(&brainstorm_skill(), "give me ideas", None).await;
        assert!(result.success);
        assert_eq!(result.response, "here are three ideas");
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn execute_dispatches_tool_action_then_finalizes() {
        let mut tools = ToolRegistry::new();
        tools.register(
            "search",
            "search the knowledge graph",
            Arc::new(|arg: String| async move { Ok(format!("found: {arg}")) }),
        );
        let llm = Arc::new(MockLlm::new(vec![
            "Action: search(\"dragons\")".to_string(),
            "Final Answer: dragons are great".to_string(),
        ]));
        let dispatcher = AgentDispatcher::new(vec![], tools, llm);
        let result = dispatcher
            .execute(&brainstorm_skill(), "tell me about dragons", None)
            .await;
        assert!(result.success);
        assert_eq!(result.response, "dragons are great");
        assert_eq!(result.iterations, 2);
    }

    #[tokio::test]
    async fn execute_terminates_at_max_iterations_with_last_response() {
        let mut tools = ToolRegistry::new();
        tools.register(
            "loop_tool",
            "never stops",
            Arc::new(|_: String| async move { Ok("ok".to_string()) }),
        );
        let responses = vec!["Action: loop_tool(\"x\")".to_string(); 10];
        let llm = Arc::new(MockLlm::new(responses));
        let dispatcher = AgentDispatcher::new(vec![], tools, llm).with_max_iterations(3);
        let result = dispatcher.execute(&brainstorm_skill(), "loop forever", None).await;
        assert!(result.success);
        assert_eq!(result.iterations, 3);
    }

    #[tokio::test]
    async fn execute_treats_unrecognized_response_as_final() {
        let llm = Arc::new(MockLlm::new(vec!["just a plain reply".to_string()]));
        let dispatcher = AgentDispatcher::new(vec![], ToolRegistry::new(), llm);
        let result = dispatcher.execute(&brainstorm_skill(), "hi", None).await;
        assert!(result.success);
        assert_eq!(result.response, "just a plain reply");
    }

    #[tokio::test]
    async fn execute_captures_tool_error_as_observation_not_fatal() {
        let mut tools = ToolRegistry::new();
        tools.register(
            "fails",
            "always fails",
            Arc::new(|_: String| async move { Err("boom".to_string()) }),
        );
        let llm = Arc::new(MockLlm::new(vec![
            "Action: fails(\"x\")".to_string(),
            "Final Answer: recovered".to_string(),
        ]));
        let dispatcher = AgentDispatcher::new(vec![], tools, llm);
        let result = dispatcher.execute(&brainstorm_skill(), "try", None).await;
        assert!(result.success);
        assert_eq!(result.response, "recovered");
    }

    #[test]
    fn extract_json_actions_parses_fenced_block() {
        let response = "Final Answer: done\n```json\n{\"action\": \"create\"}\n```";
        let actions = extract_json_actions(response);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0]["action"], "create");
    }
}
