//! Pipeline Engine: a DAG executor with human
//! checkpoints, branching, bounded loops, and model cascades.
//!
//! Uses a cursor/edge traversal idiom instead of a generic topological walk,
//! since a run must be able to pause mid-edge and resume on the same cursor.

mod control;
mod evaluator;
mod executor;
mod handlers;
mod types;

pub use control::{distill_recorded_actions, generate_pipeline_from_nl, PipelineEngine};
pub use evaluator::{evaluate_condition, EvaluatorError};
pub use executor::drive;
pub use handlers::{HandlerRegistry, PipelineContext, StepHandler};
pub use types::{
    EdgeDefinition, Payload, PipelineDefinition, PipelineError, PipelineRun, RunState, StepCategory,
    StepDefinition, StepType,
};
