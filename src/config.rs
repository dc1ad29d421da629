//! Orchestrator configuration and deadline propagation
//!
//! All retry and fallback behavior is bounded by explicit limits here;
//! nothing in the pipeline loops open-ended.

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::future::Future;
use std::time::{Duration, Instant};

/// Bounded limits for one query's execution.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum passages returned per retrieval step.
    pub top_k: usize,
    /// Maximum repair attempts after a failed validation.
    pub max_repair_attempts: u32,
    /// Plans longer than this are rejected as planning errors.
    pub max_plan_steps: usize,
    /// Overall wall-clock budget for one query.
    pub query_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_repair_attempts: 1,
            max_plan_steps: 20,
            query_timeout: Duration::from_secs(120),
        }
    }
}

impl OrchestratorConfig {
    /// Load limits from the environment, keeping defaults for anything
    /// unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(top_k) = env_parse::<usize>("ORCHESTRATOR_TOP_K") {
            config.top_k = top_k;
        }
        if let Some(repairs) = env_parse::<u32>("ORCHESTRATOR_MAX_REPAIRS") {
            config.max_repair_attempts = repairs;
        }
        if let Some(steps) = env_parse::<usize>("ORCHESTRATOR_MAX_PLAN_STEPS") {
            config.max_plan_steps = steps;
        }
        if let Some(secs) = env_parse::<u64>("ORCHESTRATOR_QUERY_TIMEOUT_SECS") {
            config.query_timeout = Duration::from_secs(secs);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Wall-clock deadline threaded through every suspension point, so a
/// query whose budget expires mid-plan aborts instead of hanging.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            at: Some(Instant::now() + budget),
        }
    }

    pub fn expired(&self) -> bool {
        self.at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }

    fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Run a latency-bearing call under the remaining budget.
    pub async fn bound<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.remaining() {
            None => fut.await,
            Some(remaining) if remaining.is_zero() => Err(OrchestrationError::DeadlineExceeded),
            Some(remaining) => match tokio::time::timeout(remaining, fut).await {
                Ok(result) => result,
                Err(_) => Err(OrchestrationError::DeadlineExceeded),
            },
        }
    }
}
