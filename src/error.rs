//! Error types for the financial query orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    /// Unparseable or empty plan. Fatal to the whole query.
    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Internal retrieval failure. An empty result set after filter
    /// fallback is NOT an error and never produces this variant.
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Bad inputs or an invalid expression. Non-fatal: recorded as a
    /// failed step result, never aborts the plan.
    #[error("Calculation error: {0}")]
    Calculation(String),

    /// Rate limit, timeout, or connection failure. Retried once before
    /// surfacing as the error kind of whichever step invoked it.
    #[error("Gateway transient error: {0}")]
    GatewayTransient(String),

    /// Malformed model output. Surfaced immediately to the caller.
    #[error("Gateway content error: {0}")]
    GatewayContent(String),

    #[error("Document store error: {0}")]
    Store(String),

    /// The overall query deadline expired mid-execution.
    #[error("Query deadline exceeded")]
    DeadlineExceeded,

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Transient errors are eligible for a single retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::GatewayTransient(_))
    }
}
