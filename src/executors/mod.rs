//! Step executors
//!
//! One executor per step kind that does real work: retrieval against
//! the document store and numeric calculation over retrieved context.
//! Synthesis lives in its own module since it terminates the plan.

pub mod calculation;
pub mod expr;
pub mod retrieval;

pub use calculation::CalculationExecutor;
pub use retrieval::RetrievalExecutor;
