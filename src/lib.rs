//! Financial query orchestrator
//!
//! Turns a free-text question about financial documents into a cited,
//! validated answer. A planner decomposes the query into typed steps,
//! executors run retrieval and calculations against a document store
//! and a language-model gateway, and a synthesizer/validator pair
//! produces the final answer with a bounded repair loop.
//!
//! The pipeline degrades rather than aborts: step failures, empty
//! search results and expired deadlines all surface as structured
//! fields on [`models::QueryResult`], never as a crash.

pub mod agent;
pub mod config;
pub mod error;
pub mod executors;
pub mod extract;
pub mod gateway;
pub mod models;
pub mod planner;
pub mod store;
pub mod synthesis;
pub mod validation;

pub use agent::Orchestrator;
pub use config::{Deadline, OrchestratorConfig};
pub use error::{OrchestrationError, Result};
pub use gateway::{GeminiGateway, LanguageModelGateway, MockGateway};
pub use models::{Query, QueryResult, Step, StepKind, StepPlan};
pub use planner::{LlmPlanner, MockPlanner, Planner};
pub use store::{DocumentStore, HttpDocumentStore, InMemoryDocumentStore, SearchFilters};
