//! Query orchestration state machine
//!
//! Drives one query through planning, step execution, synthesis,
//! validation and a bounded repair loop. Each query owns its own
//! context; concurrent queries never share mutable state. The entry
//! point never returns an error: every failure mode produces a
//! structured result the caller can inspect.

use crate::config::{Deadline, OrchestratorConfig};
use crate::error::OrchestrationError;
use crate::executors::{CalculationExecutor, RetrievalExecutor};
use crate::gateway::LanguageModelGateway;
use crate::models::{
    AccumulatedContext, Citation, DraftAnswer, Query, QueryResult, RetrievalSummary, StepKind,
    StepResult, ValidationVerdict,
};
use crate::planner::Planner;
use crate::store::DocumentStore;
use crate::synthesis::Synthesizer;
use crate::validation::Validator;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where the state machine currently is for one query. Transitions are
/// logged, not persisted; a query is processed in a single pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Planning,
    ExecutingStep(usize),
    Synthesizing,
    Validating,
    Repairing,
    Done,
}

pub struct Orchestrator {
    planner: Box<dyn Planner>,
    retrieval: RetrievalExecutor,
    calculation: CalculationExecutor,
    synthesizer: Synthesizer,
    validator: Validator,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        planner: Box<dyn Planner>,
        gateway: Arc<dyn LanguageModelGateway>,
        store: Arc<dyn DocumentStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            planner,
            retrieval: RetrievalExecutor::new(gateway.clone(), store, config.top_k),
            calculation: CalculationExecutor::new(gateway.clone()),
            synthesizer: Synthesizer::new(gateway),
            validator: Validator::new(),
            config,
        }
    }

    /// Analyze one free-text query end to end. Step failures are
    /// recorded and execution continues; only an expired deadline cuts
    /// the plan short, and even then a partial result comes back.
    pub async fn analyze_query(&self, query_text: &str) -> QueryResult {
        let query = Query::new(query_text);
        let deadline = Deadline::after(self.config.query_timeout);

        let mut phase = Phase::Planning;
        info!(?phase, query = %query.text, "Starting query analysis");

        let mut plan = match deadline.bound(self.planner.plan(&query)).await {
            Ok(plan) => plan,
            Err(OrchestrationError::DeadlineExceeded) => {
                warn!("Deadline expired during planning");
                return self.assemble(
                    &query,
                    AccumulatedContext::new(),
                    Vec::new(),
                    self.fallback_answer(&AccumulatedContext::new()),
                    ValidationVerdict::skipped("Query timed out before planning finished"),
                    true,
                );
            }
            Err(e) => {
                error!(error = %e, "Planning failed");
                return failure_result(&query, format!("Unable to plan the query: {}", e));
            }
        };

        plan.ensure_synthesis();
        if plan.len() > self.config.max_plan_steps {
            return failure_result(
                &query,
                format!(
                    "Plan of {} steps exceeds the limit of {}",
                    plan.len(),
                    self.config.max_plan_steps
                ),
            );
        }

        let mut context = AccumulatedContext::new();
        let mut retrieval_steps = Vec::new();
        let mut timed_out = false;

        for (index, step) in plan.steps.iter().enumerate() {
            if deadline.expired() {
                warn!(step = index, "Deadline expired between steps");
                timed_out = true;
                break;
            }

            phase = Phase::ExecutingStep(index);
            info!(?phase, kind = ?step.kind, description = %step.description, "Executing step");

            match step.kind {
                StepKind::Retrieve => {
                    match self.retrieval.execute(step, &context, deadline).await {
                        Ok((search_query, passages)) => {
                            retrieval_steps.push(RetrievalSummary {
                                step_index: index,
                                search_query,
                                results_count: passages.len(),
                            });
                            context.push(step.clone(), StepResult::Retrieved { passages });
                        }
                        Err(OrchestrationError::DeadlineExceeded) => {
                            warn!(step = index, "Deadline expired during retrieval");
                            timed_out = true;
                            break;
                        }
                        Err(e) => {
                            warn!(step = index, error = %e, "Retrieve step failed");
                            context.push(
                                step.clone(),
                                StepResult::Failed {
                                    error: e.to_string(),
                                },
                            );
                        }
                    }
                }
                StepKind::Calculate => {
                    match self.calculation.execute(step, &context, deadline).await {
                        Ok(calculation) => {
                            context.push(step.clone(), StepResult::Calculated { calculation });
                        }
                        Err(OrchestrationError::DeadlineExceeded) => {
                            warn!(step = index, "Deadline expired during calculation");
                            timed_out = true;
                            break;
                        }
                        Err(e) => {
                            warn!(step = index, error = %e, "Calculate step failed");
                            context.push(
                                step.clone(),
                                StepResult::Failed {
                                    error: e.to_string(),
                                },
                            );
                        }
                    }
                }
                StepKind::Synthesize => {
                    context.push(step.clone(), StepResult::Synthesized);
                }
            }
        }

        let mut feedback: Option<ValidationVerdict> = None;
        let mut attempts = 0u32;

        let (draft, verdict) = loop {
            phase = if feedback.is_some() {
                Phase::Repairing
            } else {
                Phase::Synthesizing
            };
            debug!(?phase, attempt = attempts, "Producing draft answer");

            let draft = if timed_out {
                self.fallback_answer(&context)
            } else {
                match self
                    .synthesizer
                    .synthesize(&query, &context, feedback.as_ref(), deadline)
                    .await
                {
                    Ok(draft) => draft,
                    Err(OrchestrationError::DeadlineExceeded) => {
                        warn!("Deadline expired during synthesis");
                        timed_out = true;
                        self.fallback_answer(&context)
                    }
                    Err(e) => {
                        warn!(error = %e, "Synthesis failed - falling back to retrieved data");
                        self.fallback_answer(&context)
                    }
                }
            };

            phase = Phase::Validating;
            debug!(?phase, "Validating draft answer");
            let verdict = self.validator.validate(&draft, &context);

            if verdict.is_valid || attempts >= self.config.max_repair_attempts || timed_out {
                break (draft, verdict);
            }

            attempts += 1;
            info!(
                attempt = attempts,
                unsupported = verdict.unsupported_claims.len(),
                "Repairing draft answer"
            );
            feedback = Some(verdict);
        };

        phase = Phase::Done;
        info!(?phase, timed_out, valid = verdict.is_valid, "Query analysis complete");

        self.assemble(&query, context, retrieval_steps, draft, verdict, timed_out)
    }

    fn assemble(
        &self,
        query: &Query,
        context: AccumulatedContext,
        retrieval_steps: Vec<RetrievalSummary>,
        draft: DraftAnswer,
        validation: ValidationVerdict,
        timed_out: bool,
    ) -> QueryResult {
        let calculations_performed: BTreeMap<usize, _> = context
            .calculations()
            .map(|(index, calculation)| (index, calculation.clone()))
            .collect();

        QueryResult {
            query: query.text.clone(),
            final_answer: draft.text,
            sources_used: draft.citations,
            calculations_performed,
            retrieval_steps,
            validation,
            processing_steps: context.len(),
            success: !timed_out,
            timed_out,
        }
    }

    /// Draft built without the gateway: a plain statement of what was
    /// (or was not) retrieved, citing every passage in the context.
    fn fallback_answer(&self, context: &AccumulatedContext) -> DraftAnswer {
        let mut citations = Vec::new();
        let mut seen = HashSet::new();
        for passage in context.passages() {
            let citation = Citation::from_passage(passage);
            if seen.insert(citation.key()) {
                citations.push(citation);
            }
        }

        let mut text = String::from("The answer could not be fully synthesized. ");
        if citations.is_empty() {
            text.push_str("No relevant documents were found for this query.");
        } else {
            text.push_str("The following source data was retrieved:\n");
            for citation in &citations {
                text.push_str(&format!(
                    "- {} ({}): {}\n",
                    citation.document,
                    citation.section.as_deref().unwrap_or("unknown section"),
                    citation.content_preview
                ));
            }
            for (index, calculation) in context.calculations() {
                text.push_str(&format!(
                    "- Computed in step {}: {} = {} {}\n",
                    index + 1,
                    calculation.formula,
                    calculation.result,
                    calculation.units
                ));
            }
        }

        DraftAnswer { text, citations }
    }
}

fn failure_result(query: &Query, message: String) -> QueryResult {
    QueryResult {
        query: query.text.clone(),
        final_answer: format!("Unable to analyze the query. {}", message),
        sources_used: Vec::new(),
        calculations_performed: BTreeMap::new(),
        retrieval_steps: Vec::new(),
        validation: ValidationVerdict::skipped("Query failed before synthesis"),
        processing_steps: 0,
        success: false,
        timed_out: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::models::{ContentType, PassageMetadata, RetrievedPassage, Step, StepPlan};
    use crate::planner::LlmPlanner;
    use crate::store::InMemoryDocumentStore;
    use crate::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn passage(filename: &str, quarter: &str, year: i32, content: &str) -> RetrievedPassage {
        RetrievedPassage {
            content: content.to_string(),
            metadata: PassageMetadata {
                document_type: "financial_statement".to_string(),
                filename: filename.to_string(),
                quarter: Some(quarter.to_string()),
                year: Some(year),
                section_name: Some("income_statement".to_string()),
                page_number: Some(3),
                chunk_id: format!("{}-{}", quarter, year),
                content_type: ContentType::Text,
            },
            similarity_score: 0.1,
        }
    }

    fn profit_store() -> InMemoryDocumentStore {
        InMemoryDocumentStore::new(vec![
            passage(
                "fab_q3_2023.pdf",
                "Q3",
                2023,
                "Net Profit After Tax AED 3,200 million",
            ),
            passage(
                "fab_q3_2024.pdf",
                "Q3",
                2024,
                "Net Profit After Tax AED 3,689 million",
            ),
        ])
    }

    /// Planner returning a fixed plan, for driving specific step mixes.
    struct ScriptedPlanner(Vec<Step>);

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn plan(&self, _query: &Query) -> Result<StepPlan> {
            Ok(StepPlan::new(self.0.clone()))
        }
    }

    struct FailingPlanner;

    #[async_trait]
    impl Planner for FailingPlanner {
        async fn plan(&self, _query: &Query) -> Result<StepPlan> {
            Err(OrchestrationError::Planning("no plan".to_string()))
        }
    }

    fn orchestrator_with(
        planner: Box<dyn Planner>,
        gateway: MockGateway,
        store: InMemoryDocumentStore,
    ) -> Orchestrator {
        let gateway: Arc<dyn LanguageModelGateway> = Arc::new(gateway);
        Orchestrator::new(
            planner,
            gateway,
            Arc::new(store),
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test]
    async fn yoy_comparison_end_to_end() {
        let gateway = MockGateway::new();
        // Calculation input extraction, then synthesis.
        gateway.push_response(r#"{"net_profit_q3_2023": 3200, "net_profit_q3_2024": 3689}"#);
        gateway.push_response(
            "Net profit grew from AED 3,200 million in Q3 2023 to AED 3,689 million \
             in Q3 2024, an increase of 15.28%.",
        );

        let planner = Box::new(LlmPlanner::new(Arc::new(MockGateway::new())));
        let orchestrator = orchestrator_with(planner, gateway, profit_store());

        let result = orchestrator
            .analyze_query("Compare net profit Q3 2023 vs Q3 2024")
            .await;

        assert!(result.success);
        assert!(!result.timed_out);
        assert!(result.validation.is_valid);
        assert_eq!(result.processing_steps, 4);
        assert_eq!(result.retrieval_steps.len(), 2);
        assert!(result.retrieval_steps.iter().all(|r| r.results_count == 1));

        assert_eq!(result.calculations_performed.len(), 1);
        let calculation = result.calculations_performed.values().next().unwrap();
        assert!((calculation.result - 15.28125).abs() < 1e-9);

        assert_eq!(result.sources_used.len(), 2);
        assert!(result.final_answer.contains("15.28"));
    }

    #[tokio::test]
    async fn empty_corpus_yields_uncertain_answer_not_failure() {
        // Unscripted gateway: search derivation and synthesis both
        // degrade to their deterministic fallbacks.
        let planner = Box::new(crate::planner::MockPlanner);
        let orchestrator = orchestrator_with(
            planner,
            MockGateway::new(),
            InMemoryDocumentStore::empty(),
        );

        let result = orchestrator.analyze_query("What was Q3 2024 net profit?").await;

        assert!(result.success);
        assert!(!result.timed_out);
        assert!(result.sources_used.is_empty());
        assert!(result.final_answer.contains("No relevant documents"));
        assert!(result.validation.is_valid);
    }

    #[tokio::test]
    async fn calculation_failure_is_recorded_and_execution_continues() {
        let gateway = MockGateway::new();
        // Input extraction fails outright; synthesis still runs.
        gateway.push_error(OrchestrationError::GatewayContent("garbage".to_string()));
        gateway.push_response(
            "The percentage change could not be computed because the required \
             figures were not found in the retrieved documents.",
        );

        let planner = Box::new(ScriptedPlanner(vec![
            Step::retrieve("Management outlook commentary").with_param("quarter", json!("Q3")),
            Step::calculate("Percentage change in net profit"),
            Step::synthesize("Combine into answer"),
        ]));
        let store = InMemoryDocumentStore::new(vec![passage(
            "fab_q3_2024_transcript.pdf",
            "Q3",
            2024,
            "Management outlook commentary on market conditions.",
        )]);

        let orchestrator = orchestrator_with(planner, gateway, store);
        let result = orchestrator.analyze_query("YoY change in net profit?").await;

        assert!(result.success);
        assert!(result.calculations_performed.is_empty());
        assert_eq!(result.processing_steps, 3);
        assert!(result.final_answer.contains("could not be computed"));
    }

    #[tokio::test]
    async fn repair_loop_is_bounded() {
        let gateway = MockGateway::new();
        // Both drafts carry a figure absent from the evidence, so the
        // verdict stays invalid; the loop must stop after one repair.
        gateway.push_response("Net profit was AED 9,999 million.");
        gateway.push_response("Net profit was AED 8,888 million.");

        let planner = Box::new(ScriptedPlanner(vec![
            Step::retrieve("Net profit").with_param("quarter", json!("Q3")),
            Step::synthesize("Answer"),
        ]));
        let store = InMemoryDocumentStore::new(vec![passage(
            "fab_q3_2024.pdf",
            "Q3",
            2024,
            "Net Profit After Tax AED 3,689 million",
        )]);

        let orchestrator = orchestrator_with(planner, gateway, store);
        let result = orchestrator.analyze_query("Net profit?").await;

        assert!(result.success);
        assert!(!result.validation.is_valid);
        assert_eq!(result.validation.unsupported_claims.len(), 1);
        // The second (repaired) draft is the one returned.
        assert!(result.final_answer.contains("8,888"));
    }

    #[tokio::test]
    async fn planning_failure_is_a_structured_result() {
        let orchestrator = orchestrator_with(
            Box::new(FailingPlanner),
            MockGateway::new(),
            InMemoryDocumentStore::empty(),
        );

        let result = orchestrator.analyze_query("Anything").await;

        assert!(!result.success);
        assert!(!result.timed_out);
        assert_eq!(result.processing_steps, 0);
        assert!(result.final_answer.contains("Unable to analyze"));
    }

    #[tokio::test]
    async fn oversized_plan_is_rejected() {
        let steps: Vec<Step> = (0..30).map(|i| Step::retrieve(format!("step {}", i))).collect();
        let orchestrator = orchestrator_with(
            Box::new(ScriptedPlanner(steps)),
            MockGateway::new(),
            InMemoryDocumentStore::empty(),
        );

        let result = orchestrator.analyze_query("Anything").await;
        assert!(!result.success);
        assert!(result.final_answer.contains("exceeds the limit"));
    }

    #[tokio::test]
    async fn expired_deadline_yields_partial_timed_out_result() {
        let planner = Box::new(crate::planner::MockPlanner);
        let gateway: Arc<dyn LanguageModelGateway> = Arc::new(MockGateway::new());
        let config = OrchestratorConfig {
            query_timeout: Duration::ZERO,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(
            planner,
            gateway,
            Arc::new(InMemoryDocumentStore::empty()),
            config,
        );

        let result = orchestrator.analyze_query("Net profit?").await;

        assert!(result.timed_out);
        assert!(!result.success);
        assert!(!result.final_answer.is_empty());
    }
}
