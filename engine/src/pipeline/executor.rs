//! Cursor-based traversal: walks a [`PipelineDefinition`]
//! one step at a time, dispatching by category, until the run reaches a
//! terminal state or suspends waiting on a human.
//!
//! Precomputes a `step_map` / `default_next` table up front, auto-approves
//! HUMAN steps below a configured risk threshold, supports a backward
//! cursor jump for refine/regenerate steps, and treats a malformed or
//! disallowed LOOP/IF_ELSE condition as a routing failure rather than a
//! panic. Uses a plain `edges: Vec<(String, String)>` with `START`/`END`
//! sentinels for the general shape of a hand-walked DAG, rather than a
//! generic graph library.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{json, Value};
use tracing::warn;

use super::evaluator::evaluate_condition;
use super::handlers::{HandlerRegistry, PipelineContext};
use super::types::{PipelineDefinition, PipelineError, PipelineRun, RunState, StepDefinition, StepType};

/// Auto-approval threshold for `APPROVE_OUTPUT` steps.
const AUTO_APPROVE_CONFIDENCE_THRESHOLD: f64 = 90.0;

const DEFAULT_MAX_LOOP_ITERATIONS: u64 = 10;

/// One entry in the auto-approval ledger.
fn auto_approved_entry(step: &StepDefinition, payload: &serde_json::Map<String, Value>) -> Value {
    json!({
        "step_id": step.id,
        "step_name": step.label,
        "prompt_text": payload.get("prompt_text").cloned().unwrap_or(Value::Null),
        "model": payload.get("resolved_model").cloned().unwrap_or(Value::Null),
        "confidence_score": payload.get("confidence_score").cloned().unwrap_or(Value::Null),
        "continuity_errors": payload.get("continuity_errors").cloned().unwrap_or(json!([])),
        "generated_text": payload.get("generated_text").cloned().unwrap_or(Value::Null),
    })
}

/// Precomputed routing tables derived once from a [`PipelineDefinition`]:
/// the step lookup, and, for the "default next" rule ("first outgoing
/// edge by definition order"), the first edge target recorded per source.
struct RoutingTables {
    steps: HashMap<String, StepDefinition>,
    default_next: HashMap<String, String>,
    /// All edge targets out of a source, in definition order; `IF_ELSE`
    /// looks specific targets up by step id rather than by position, but
    /// the table is kept for completeness/observability.
    #[allow(dead_code)]
    edge_targets: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl RoutingTables {
    fn build(definition: &PipelineDefinition) -> Self {
        let steps: HashMap<String, StepDefinition> =
            definition.steps.iter().map(|s| (s.id.clone(), s.clone())).collect();

        let mut default_next = HashMap::new();
        let mut edge_targets: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &definition.edges {
            edge_targets.entry(edge.source.clone()).or_default().push(edge.target.clone());
            default_next.entry(edge.source.clone()).or_insert_with(|| edge.target.clone());
        }

        Self {
            steps,
            default_next,
            edge_targets,
            order: topological_sort(definition),
        }
    }

    fn first_step_id(&self) -> Option<String> {
        self.order.first().cloned()
    }
}

/// Kahn's algorithm with a cycle-tolerant fallback: any step left
/// unprocessed once the queue drains (because a `LOOP` back-edge prevents
/// full topological resolution) is appended in definition order, so loop-
/// containing definitions still produce a usable traversal/start order
/// instead of erroring.
fn topological_sort(definition: &PipelineDefinition) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = definition.steps.iter().map(|s| (s.id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &definition.edges {
        if let Some(count) = in_degree.get_mut(edge.target.as_str()) {
            *count += 1;
        }
        adjacency.entry(edge.source.as_str()).or_default().push(edge.target.as_str());
    }

    let mut queue: VecDeque<&str> = definition
        .steps
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
        .collect();

    let mut order = Vec::with_capacity(definition.steps.len());
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        order.push(id.to_string());
        if let Some(targets) = adjacency.get(id) {
            for target in targets {
                if let Some(count) = in_degree.get_mut(target) {
                    if *count > 0 {
                        *count -= 1;
                    }
                    if *count == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }
    }

    for step in &definition.steps {
        if !seen.contains(step.id.as_str()) {
            order.push(step.id.clone());
        }
    }
    order
}

/// Runs `definition` from `run`'s current position to completion, failure,
/// or the next human checkpoint. Mutates `run` in place; returns `Ok(())`
/// in every case except an internal logic error (handler/evaluator errors
/// are captured onto `run.error` and surface as `RunState::Failed`, not as
/// an `Err` here, matching the original's `try/except` around the whole
/// traversal loop).
pub async fn drive(
    ctx: &PipelineContext,
    handlers: &HandlerRegistry,
    definition: &PipelineDefinition,
    run: &mut PipelineRun,
) -> Result<(), PipelineError> {
    let tables = RoutingTables::build(definition);

    if run.current_step_id.is_none() {
        run.current_step_id = tables.first_step_id();
        run.current_state = RunState::ContextGathering;
    }

    loop {
        let Some(step_id) = run.current_step_id.clone() else {
            run.current_state = RunState::Completed;
            return Ok(());
        };

        let Some(step) = tables.steps.get(&step_id).cloned() else {
            run.current_state = RunState::Failed;
            run.error = Some(format!("step '{step_id}' not found in definition"));
            return Ok(());
        };

        // Captured before the state is overwritten below: tells a HUMAN step
        // whether this call is its first encounter (seed payload and
        // suspend) or a resume after `resume_pipeline` woke the run back up
        // sitting on the same step id.
        let resuming_here = run.current_state == RunState::PausedForUser;

        run.current_step_type = Some(step.step_type);
        run.current_step_label = Some(step.label.clone());
        run.current_state = match step.step_type.category() {
            super::types::StepCategory::Context => RunState::ContextGathering,
            super::types::StepCategory::Transform => RunState::PromptAssembly,
            _ => RunState::Executing,
        };

        match step.step_type {
            StepType::ApproveOutput | StepType::ApproveImage | StepType::ReviewPrompt => {
                match handle_human_step(&tables, &step, run, resuming_here) {
                    HumanOutcome::Advance => {}
                    HumanOutcome::JumpBack(target) => {
                        run.current_step_id = Some(target);
                        continue;
                    }
                    HumanOutcome::Suspend => {
                        run.current_state = RunState::PausedForUser;
                        return Ok(());
                    }
                }
            }
            StepType::IfElse | StepType::Loop | StepType::MergeOutputs => {
                match handle_logic_step(&step, run) {
                    Ok(Some(next)) => {
                        run.steps_completed.push(step.id.clone());
                        run.current_step_id = Some(next);
                        continue;
                    }
                    Ok(None) => {
                        run.steps_completed.push(step.id.clone());
                    }
                    Err(e) => {
                        run.current_state = RunState::Failed;
                        run.error = Some(e.to_string());
                        return Ok(());
                    }
                }
            }
            _ => {
                if let Some(handler) = handlers.get(step.step_type) {
                    if let Err(e) = handler.handle(ctx, run, &step).await {
                        run.current_state = RunState::Failed;
                        run.error = Some(e.to_string());
                        return Ok(());
                    }
                } else {
                    warn!("no handler registered for step type {:?}", step.step_type);
                }
                run.steps_completed.push(step.id.clone());
            }
        }

        match tables.default_next.get(&step.id) {
            Some(next) => run.current_step_id = Some(next.clone()),
            None => {
                run.current_state = RunState::Completed;
                return Ok(());
            }
        }
    }
}

enum HumanOutcome {
    Advance,
    Suspend,
    JumpBack(String),
}

/// / §4.9.4 HUMAN handling: auto-approve `APPROVE_OUTPUT`
/// above the confidence threshold with no continuity errors, otherwise
/// seed the payload with step metadata and pause. On resume, a
/// `refine_instructions` or `regenerate` flag in the payload redirects the
/// cursor back to the nearest prior `LLM_GENERATE` step instead of
/// advancing, the HUMAN step itself is not marked completed in that case.
fn handle_human_step(
    tables: &RoutingTables,
    step: &StepDefinition,
    run: &mut PipelineRun,
    resuming_here: bool,
) -> HumanOutcome {
    if !resuming_here && step.step_type == StepType::ApproveOutput {
        let confidence = run.payload.get("confidence_score").and_then(Value::as_f64).unwrap_or(0.0);
        let errors_empty = run
            .payload
            .get("continuity_errors")
            .and_then(Value::as_array)
            .map(|a| a.is_empty())
            .unwrap_or(true);
        if confidence > AUTO_APPROVE_CONFIDENCE_THRESHOLD && errors_empty {
            let entry = auto_approved_entry(step, &run.payload);
            run.payload
                .entry("auto_approved_steps")
                .or_insert_with(|| json!([]))
                .as_array_mut()
                .map(|v| v.push(entry));
            run.steps_completed.push(step.id.clone());
            return HumanOutcome::Advance;
        }
    }

    if !resuming_here {
        run.payload.insert("step_name".into(), Value::String(step.label.clone()));
        run.payload.insert("step_type".into(), json!(step.step_type));
        run.payload.insert("step_config".into(), Value::Object(step.config.clone()));
        return HumanOutcome::Suspend;
    }

    let refine = run.payload.remove("refine_instructions").and_then(|v| v.as_str().map(String::from));
    let regenerate = run.payload.remove("regenerate").and_then(|v| v.as_bool()).unwrap_or(false);

    if refine.is_some() || regenerate {
        if let Some(instructions) = refine {
            let mut prompt = run.payload.get("prompt_text").and_then(Value::as_str).unwrap_or("").to_string();
            prompt.push_str("\n\nRefine instructions: ");
            prompt.push_str(&instructions);
            run.payload.insert("prompt_text".into(), Value::String(prompt));
        }
        for completed_id in run.steps_completed.iter().rev() {
            if tables.steps.get(completed_id).map(|s| s.step_type) == Some(StepType::LlmGenerate) {
                return HumanOutcome::JumpBack(completed_id.clone());
            }
        }
        warn!("refine/regenerate requested but no prior LLM_GENERATE step found in run {}", run.id);
    }

    run.steps_completed.push(step.id.clone());
    HumanOutcome::Advance
}

/// LOGIC handling. Returns `Ok(Some(next_step_id))` to
/// explicitly redirect the cursor, `Ok(None)` to fall through to the
/// default-next edge.
fn handle_logic_step(step: &StepDefinition, run: &mut PipelineRun) -> Result<Option<String>, PipelineError> {
    match step.step_type {
        StepType::IfElse => {
            let condition = step.config.get("condition").and_then(Value::as_str).unwrap_or("");
            // a malformed/disallowed condition is treated as
            // false (take the false branch), not propagated as a run failure.
            let result = evaluate_condition(condition, &run.payload).unwrap_or_else(|e| {
                warn!("IF_ELSE step {} condition evaluation failed, taking false branch: {e}", step.id);
                false
            });
            let target_key = if result { "true_target" } else { "false_target" };
            let target = step.config.get(target_key).and_then(Value::as_str).map(String::from);
            let record = merge_logic_record(&run.payload, &step.id, json!({"condition": condition, "result": result}));
            run.payload.insert("_logic".to_string(), record);
            Ok(target)
        }
        StepType::Loop => {
            let condition = step.config.get("condition").and_then(Value::as_str).unwrap_or("");
            let max_iterations = step.config.get("max_iterations").and_then(Value::as_u64).unwrap_or(DEFAULT_MAX_LOOP_ITERATIONS);
            let loop_back_to = step.config.get("loop_back_to").and_then(Value::as_str).map(String::from);

            let counters = run
                .payload
                .entry("_loop_counters")
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .cloned()
                .unwrap_or_default();
            let current_iteration = counters.get(&step.id).and_then(Value::as_u64).unwrap_or(0) + 1;
            let mut counters = counters;
            counters.insert(step.id.clone(), json!(current_iteration));
            run.payload.insert("_loop_counters".into(), Value::Object(counters));

            let exit_met = match evaluate_condition(condition, &run.payload) {
                Ok(met) => met,
                Err(e) => {
                    warn!("LOOP step {} condition evaluation failed, exiting defensively: {e}", step.id);
                    true
                }
            };
            let exit = exit_met || current_iteration >= max_iterations;

            let record = merge_logic_record(
                &run.payload,
                &step.id,
                json!({
                    "condition": condition,
                    "exit_met": exit_met,
                    "iteration": current_iteration,
                    "max_iterations": max_iterations,
                }),
            );
            run.payload.insert("_logic".to_string(), record);

            if exit {
                Ok(None)
            } else {
                Ok(loop_back_to)
            }
        }
        StepType::MergeOutputs => {
            let source_keys: Vec<String> = step
                .config
                .get("source_keys")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            let deep = step.config.get("merge_strategy").and_then(Value::as_str) == Some("deep");

            let mut merged = serde_json::Map::new();
            for key in &source_keys {
                if let Some(value) = run.payload.get(key) {
                    match value {
                        Value::Object(incoming) if deep => {
                            merged = deep_merge(Value::Object(merged), Value::Object(incoming.clone()))
                                .as_object()
                                .cloned()
                                .unwrap_or_default();
                        }
                        Value::Object(incoming) => {
                            for (k, v) in incoming {
                                merged.insert(k.clone(), v.clone());
                            }
                        }
                        other => {
                            merged.insert(key.clone(), other.clone());
                        }
                    }
                }
            }
            run.payload.insert("merged".into(), Value::Object(merged));
            Ok(None)
        }
        _ => unreachable!("handle_logic_step called with a non-logic step type"),
    }
}

/// Writes a per-step debug record into `payload["_logic"][step_id]`
/// (supplemental glass-box feature mirroring the original's behaviour; see
/// DESIGN.md). Existing entries for other steps in the same run are kept.
fn merge_logic_record(payload: &serde_json::Map<String, Value>, step_id: &str, record: Value) -> Value {
    let mut logic = payload
        .get("_logic")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    logic.insert(step_id.to_string(), record);
    Value::Object(logic)
}

fn deep_merge(base: Value, incoming: Value) -> Value {
    match (base, incoming) {
        (Value::Object(mut a), Value::Object(b)) => {
            for (key, value) in b {
                let merged = match a.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                a.insert(key, merged);
            }
            Value::Object(a)
        }
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{EdgeDefinition, StepDefinition};

    fn def_with_edges(steps: Vec<StepDefinition>, edges: Vec<(&str, &str)>) -> PipelineDefinition {
        PipelineDefinition {
            id: "def1".into(),
            name: "test".into(),
            description: String::new(),
            steps,
            edges: edges
                .into_iter()
                .map(|(s, t)| EdgeDefinition { source: s.into(), target: t.into() })
                .collect(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn topological_sort_orders_linear_chain() {
        let def = def_with_edges(
            vec![
                StepDefinition::new("a", StepType::PromptTemplate, "A"),
                StepDefinition::new("b", StepType::LlmGenerate, "B"),
                StepDefinition::new("c", StepType::ApproveOutput, "C"),
            ],
            vec![("a", "b"), ("b", "c")],
        );
        assert_eq!(topological_sort(&def), vec!["a", "b", "c"]);
    }

    #[test]
    fn topological_sort_tolerates_loop_back_edge() {
        let def = def_with_edges(
            vec![
                StepDefinition::new("gather", StepType::GatherBuckets, "Gather"),
                StepDefinition::new("work", StepType::LlmGenerate, "Work"),
                StepDefinition::new("check", StepType::Loop, "Check"),
            ],
            vec![("gather", "work"), ("work", "check"), ("check", "work")],
        );
        let order = topological_sort(&def);
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], "gather");
    }

    #[test]
    fn default_next_picks_first_outgoing_edge() {
        let def = def_with_edges(
            vec![
                StepDefinition::new("a", StepType::IfElse, "A").with_config(
                    serde_json::json!({"condition": "x > 5", "true_target": "b", "false_target": "c"})
                        .as_object()
                        .unwrap()
                        .clone(),
                ),
                StepDefinition::new("b", StepType::LlmGenerate, "B"),
                StepDefinition::new("c", StepType::LlmGenerate, "C"),
            ],
            vec![("a", "b"), ("a", "c")],
        );
        let tables = RoutingTables::build(&def);
        assert_eq!(tables.default_next.get("a"), Some(&"b".to_string()));
    }

    #[test]
    fn merge_outputs_flattens_shallow_sources() {
        let step = StepDefinition::new("merge", StepType::MergeOutputs, "Merge").with_config(
            json!({"source_keys": ["branch_a_data", "branch_b_data"], "merge_strategy": "shallow"})
                .as_object()
                .unwrap()
                .clone(),
        );
        let mut run = PipelineRun::new(
            "run1".into(),
            None,
            json!({
                "branch_a_data": {"title": "Ch 1", "words": 500},
                "branch_b_data": {"summary": "A journey", "rating": 4.5},
            })
            .as_object()
            .unwrap()
            .clone(),
            1,
        );
        handle_logic_step(&step, &mut run).unwrap();
        assert_eq!(
            run.payload.get("merged").unwrap(),
            &json!({"title": "Ch 1", "words": 500, "summary": "A journey", "rating": 4.5})
        );
    }

    #[test]
    fn merge_outputs_deep_merges_overlapping_nested_keys() {
        let step = StepDefinition::new("merge", StepType::MergeOutputs, "Merge").with_config(
            json!({"source_keys": ["a_data", "b_data"], "merge_strategy": "deep"})
                .as_object()
                .unwrap()
                .clone(),
        );
        let mut run = PipelineRun::new(
            "run1".into(),
            None,
            json!({
                "a_data": {"shared": {"x": 1}, "a_only": 1},
                "b_data": {"shared": {"y": 2}, "b_only": 2},
            })
            .as_object()
            .unwrap()
            .clone(),
            1,
        );
        handle_logic_step(&step, &mut run).unwrap();
        assert_eq!(
            run.payload.get("merged").unwrap(),
            &json!({"shared": {"x": 1, "y": 2}, "a_only": 1, "b_only": 2})
        );
    }

    #[test]
    fn merge_outputs_inserts_scalar_sources_under_their_key() {
        let step = StepDefinition::new("merge", StepType::MergeOutputs, "Merge").with_config(
            json!({"source_keys": ["count"], "merge_strategy": "shallow"}).as_object().unwrap().clone(),
        );
        let mut run =
            PipelineRun::new("run1".into(), None, json!({"count": 3}).as_object().unwrap().clone(), 1);
        handle_logic_step(&step, &mut run).unwrap();
        assert_eq!(run.payload.get("merged").unwrap(), &json!({"count": 3}));
    }

    #[test]
    fn deep_merge_merges_nested_objects() {
        let base = serde_json::json!({"a": {"x": 1}, "b": 2});
        let incoming = serde_json::json!({"a": {"y": 2}, "c": 3});
        let merged = deep_merge(base, incoming);
        assert_eq!(merged, serde_json::json!({"a": {"x": 1, "y": 2}, "b": 2, "c": 3}));
    }
}
