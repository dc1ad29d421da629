//! Planner trait and implementations
//!
//! The planner decomposes a free-text query into an ordered step plan.
//! It decides which kinds of operations are needed and in what order,
//! based only on query surface features — never on document content.

use crate::models::{Query, Step, StepPlan};
use crate::Result;
use async_trait::async_trait;

pub mod llm;
pub use llm::LlmPlanner;

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, query: &Query) -> Result<StepPlan>;
}

/// Mock planner for development & testing
/// Keeps the pipeline functional without LLM dependency
pub struct MockPlanner;

#[async_trait]
impl Planner for MockPlanner {
    async fn plan(&self, query: &Query) -> Result<StepPlan> {
        Ok(StepPlan::new(vec![
            Step::retrieve(format!("Find information relevant to: {}", query.text)),
            Step::synthesize("Combine all gathered information into a comprehensive answer"),
        ]))
    }
}
