//! Slash commands: `/plan`, `/approve`, `/execute`,
//! `/compact`, dispatched on the first whitespace-split token. JSON
//! extraction here mirrors rather than reuses
//! `pipeline::control::extract_json_object`'s fenced/bare tolerance, that
//! helper is private to its module and only extracts objects, not arrays.
//!
//! Per-session plan state lives in a process-wide `DashMap`, it does not
//! survive a restart.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stream_event::ProtocolEvent;

use crate::llm::{LlmCallParams, LlmClient};
use crate::message::Message;

use super::context_manager::ChatContextManager;
use super::session_store::ChatError;
use super::tool_registry::ToolYield;

const PLAN_STEP_COUNT: usize = 4;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: u32,
    pub action: String,
    pub status: String,
}

/// Routes the four slash commands the orchestrator recognizes, keeping
/// in-flight plans keyed by session id.
pub struct SlashCommandRouter {
    plans: DashMap<String, Vec<PlanStep>>,
}

impl SlashCommandRouter {
    pub fn new() -> Self {
        Self { plans: DashMap::new() }
    }

    /// `true` if `content` looks like a slash command at all (spec.md
    /// §4.10 step 2: slash commands are handled before intent classification).
    pub fn is_slash_command(content: &str) -> bool {
        content.trim_start().starts_with('/')
    }

    pub async fn handle(
        &self,
        session_id: &str,
        content: &str,
        llm: &Arc<dyn LlmClient>,
        context_manager: &ChatContextManager,
    ) -> Result<Vec<ToolYield>, ChatError> {
        let trimmed = content.trim();
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match command {
            "/plan" => self.plan(session_id, rest, llm).await,
            "/approve" => Ok(self.approve(session_id, rest)),
            "/execute" => self.execute(session_id).await,
            "/compact" => self.compact(session_id, context_manager).await,
            _ => Ok(vec![ToolYield::Text(format!(
                "Unknown command \"{command}\". Valid commands: /plan, /approve, /execute, /compact."
            ))]),
        }
    }

    async fn plan(&self, session_id: &str, goal: &str, llm: &Arc<dyn LlmClient>) -> Result<Vec<ToolYield>, ChatError> {
        if goal.is_empty() {
            return Ok(vec![ToolYield::Text("Usage: /plan <goal>".into())]);
        }
        let system = format!(
            "Break the user's goal into exactly {PLAN_STEP_COUNT} concrete steps. Respond with ONLY a JSON \
             array of objects shaped {{\"step\": int, \"action\": string, \"status\": \"pending\"}}."
        );
        let response = llm
            .invoke(&[Message::system(system), Message::user(goal)], &LlmCallParams::default())
            .await
            .map_err(|e| ChatError::Storage(e.to_string()))?;

        let steps = extract_plan_steps(&response.content).unwrap_or_else(|| {
            (1..=PLAN_STEP_COUNT as u32)
                .map(|n| PlanStep {
                    step: n,
                    action: format!("Step {n} toward: {goal}"),
                    status: "pending".into(),
                })
                .collect()
        });
        self.plans.insert(session_id.to_string(), steps.clone());

        let summary = steps
            .iter()
            .map(|s| format!("{}. {} [{}]", s.step, s.action, s.status))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(vec![ToolYield::Text(format!("Proposed plan:\n{summary}\n\nUse /approve to accept steps, then /execute."))])
    }

    /// `/approve all` or `/approve 1,2,3`, flips matching steps to
    /// `approved`. No regex available; parsed by manual splitting.
    fn approve(&self, session_id: &str, arg: &str) -> Vec<ToolYield> {
        let Some(mut plan) = self.plans.get_mut(session_id) else {
            return vec![ToolYield::Text("No plan to approve. Run /plan <goal> first.".into())];
        };
        if arg.eq_ignore_ascii_case("all") || arg.is_empty() {
            for step in plan.iter_mut() {
                step.status = "approved".into();
            }
        } else {
            let wanted: Vec<u32> = arg
                .split(',')
                .filter_map(|part| part.trim().parse::<u32>().ok())
                .collect();
            for step in plan.iter_mut() {
                if wanted.contains(&step.step) {
                    step.status = "approved".into();
                }
            }
        }
        let summary = plan
            .iter()
            .map(|s| format!("{}. {} [{}]", s.step, s.action, s.status))
            .collect::<Vec<_>>()
            .join("\n");
        vec![ToolYield::Text(format!("Updated plan:\n{summary}"))]
    }

    /// Runs every `approved` step in order, emitting an `action_trace` per
    /// step and a final `background_update`.
    /// Steps have no concrete executor wired up yet, running one simply
    /// marks it `done` and traces that it ran, matching the original's
    /// behaviour before a step type is bound to a real tool call.
    async fn execute(&self, session_id: &str) -> Result<Vec<ToolYield>, ChatError> {
        let Some((_, mut plan)) = self.plans.remove(session_id) else {
            return Ok(vec![ToolYield::Text("No plan to execute. Run /plan <goal> first.".into())]);
        };
        let approved: Vec<&mut PlanStep> = plan.iter_mut().filter(|s| s.status == "approved").collect();
        if approved.is_empty() {
            return Ok(vec![ToolYield::Text("No approved steps to execute. Run /approve first.".into())]);
        }

        let mut out = Vec::new();
        for step in approved {
            out.push(ToolYield::Event(ProtocolEvent::ActionTrace {
                data: serde_json::json!({ "step": step.step, "action": step.action, "status": "running" }),
            }));
            step.status = "done".into();
            out.push(ToolYield::Text(format!("Completed step {}: {}", step.step, step.action)));
        }
        out.push(ToolYield::Event(ProtocolEvent::BackgroundUpdate {
            data: serde_json::json!({ "kind": "plan_executed", "session_id": session_id }),
        }));
        Ok(out)
    }

    async fn compact(&self, session_id: &str, context_manager: &ChatContextManager) -> Result<Vec<ToolYield>, ChatError> {
        let result = context_manager.compact(session_id.to_string(), None).await?;
        let message = match result.digest {
            Some(_) => format!(
                "Compacted {} messages, saving ~{} tokens (compaction #{}).",
                result.original_message_count, result.token_reduction, result.compaction_number
            ),
            None => "Not enough history to compact yet.".to_string(),
        };
        Ok(vec![ToolYield::Text(message)])
    }
}

impl Default for SlashCommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tolerantly extracts a JSON array of plan steps from a model response:
/// strips a ```json fence if present, else finds the first `[` / last `]`.
fn extract_plan_steps(response: &str) -> Option<Vec<PlanStep>> {
    let fragment = extract_json_array(response)?;
    let raw: Vec<Value> = serde_json::from_str(&fragment).ok()?;
    let steps: Vec<PlanStep> = raw
        .into_iter()
        .enumerate()
        .map(|(i, v)| PlanStep {
            step: v.get("step").and_then(Value::as_u64).unwrap_or(i as u64 + 1) as u32,
            action: v.get("action").and_then(Value::as_str).unwrap_or("").to_string(),
            status: v.get("status").and_then(Value::as_str).unwrap_or("pending").to_string(),
        })
        .filter(|s| !s.action.is_empty())
        .collect();
    if steps.is_empty() {
        None
    } else {
        Some(steps)
    }
}

fn extract_json_array(response: &str) -> Option<String> {
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
    if trimmed.starts_with('[') {
        return Some(trimmed.to_string());
    }
    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
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
    fn recognizes_slash_commands() {
        assert!(SlashCommandRouter::is_slash_command("/plan write chapter 3"));
        assert!(!SlashCommandRouter::is_slash_command("plan write chapter 3"));
    }

    #[test]
    fn extracts_fenced_json_array() {
        let steps = extract_plan_steps(
            "```json\n[{\"step\":1,\"action\":\"outline\",\"status\":\"pending\"}]\n```",
        )
        .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action, "outline");
    }

    #[test]
    fn extracts_bare_json_array() {
        let steps = extract_plan_steps("Sure: [{\"step\":1,\"action\":\"draft\",\"status\":\"pending\"}] done").unwrap();
        assert_eq!(steps[0].action, "draft");
    }

    #[tokio::test]
    async fn approve_without_plan_is_a_friendly_no_op() {
        let router = SlashCommandRouter::new();
        let out = router.approve("s1", "all");
        let ToolYield::Text(msg) = &out[0] else { panic!("expected text") };
        assert!(msg.contains("No plan"));
    }

    #[tokio::test]
    async fn approve_all_then_execute_runs_every_step() {
        let router = SlashCommandRouter::new();
        router.plans.insert(
            "s1".to_string(),
            vec![
                PlanStep { step: 1, action: "a".into(), status: "pending".into() },
                PlanStep { step: 2, action: "b".into(), status: "pending".into() },
            ],
        );
        router.approve("s1", "all");
        let out = router.execute("s1").await.unwrap();
        let texts: Vec<&str> = out
            .iter()
            .filter_map(|y| match y {
                ToolYield::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert!(texts.iter().any(|t| t.contains("Completed step 1")));
        assert!(texts.iter().any(|t| t.contains("Completed step 2")));
        assert!(router.plans.get("s1").is_none());
    }

    #[tokio::test]
    async fn execute_without_approved_steps_is_a_no_op() {
        let router = SlashCommandRouter::new();
        router.plans.insert(
            "s1".to_string(),
            vec![PlanStep { step: 1, action: "a".into(), status: "pending".into() }],
        );
        let out = router.execute("s1").await.unwrap();
        let ToolYield::Text(msg) = &out[0] else { panic!("expected text") };
        assert!(msg.contains("No approved steps"));
    }
}
