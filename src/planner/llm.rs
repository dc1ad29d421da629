//! LLM-backed planner for query decomposition
//!
//! High-confidence comparison and trend queries are planned
//! deterministically from surface features; everything else goes
//! through the gateway with a schema-validated JSON decode.

use super::Planner;
use crate::extract::{extract_periods, Period};
use crate::gateway::{complete_with_retry, strip_code_fences, LanguageModelGateway, ResponseFormat};
use crate::models::{Query, Step, StepKind, StepPlan};
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

const COMPARISON_KEYWORDS: &[&str] = &[
    " vs ",
    " vs. ",
    "versus",
    "compare",
    "compared",
    "yoy",
    "year-over-year",
    "year over year",
    "qoq",
    "quarter-over-quarter",
    "change",
    "difference between",
];

const TREND_KEYWORDS: &[&str] = &[
    "trend",
    "trended",
    "trajectory",
    "over the last",
    "over the past",
    "evolution",
];

pub struct LlmPlanner {
    gateway: Arc<dyn LanguageModelGateway>,
}

impl LlmPlanner {
    pub fn new(gateway: Arc<dyn LanguageModelGateway>) -> Self {
        Self { gateway }
    }

    /// Deterministic planning for unambiguous query shapes, using only
    /// surface features of the query text.
    fn plan_by_heuristics(query: &Query) -> Option<StepPlan> {
        let lowered = query.text.to_lowercase();
        let has_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

        let periods = extract_periods(&query.text);

        // Comparison across two explicit periods: narrow retrieval per
        // period, then a calculation, then synthesis. Narrower searches
        // improve downstream precision, so this wins over one broad
        // retrieval even when the query also implies a direct lookup.
        if has_any(COMPARISON_KEYWORDS) && periods.len() >= 2 {
            let mut steps: Vec<Step> = periods
                .iter()
                .take(2)
                .map(|p| retrieve_step_for_period(&query.text, p))
                .collect();

            let calculation_type = if lowered.contains("cagr") {
                "cagr"
            } else if lowered.contains("ratio") {
                "ratio"
            } else {
                "percentage_change"
            };

            steps.push(
                Step::calculate(format!(
                    "Compute the {} between {} {} and {} {}",
                    calculation_type.replace('_', " "),
                    periods[0].quarter,
                    periods[0].year,
                    periods[1].quarter,
                    periods[1].year
                ))
                .with_param("calculation_type", json!(calculation_type)),
            );
            steps.push(Step::synthesize(
                "Combine the retrieved figures and the calculation into a comprehensive answer",
            ));

            return Some(StepPlan::new(steps));
        }

        // Trend question: one retrieval covering multiple periods.
        if has_any(TREND_KEYWORDS) {
            let steps = vec![
                Step::retrieve(format!(
                    "Find figures across all periods relevant to: {}",
                    query.text
                )),
                Step::synthesize(
                    "Summarize the trend across periods with supporting figures",
                ),
            ];
            return Some(StepPlan::new(steps));
        }

        None
    }

    fn build_prompt(&self, query: &Query, strict: bool) -> String {
        let base = format!(
            r#"You are a financial analysis planning engine. Break the query below into executable steps.

QUERY: {}

AVAILABLE STEP KINDS:
- retrieve: find specific financial data in the indexed documents
- calculate: perform a mathematical operation on values retrieved by earlier steps
- synthesize: combine all gathered information into the final answer

AVAILABLE DOCUMENT TYPES:
- financial_statement (Balance Sheet, Income Statement, Cash Flow)
- earnings_presentation (management commentary, charts, metrics)
- results_call_transcript (management and analyst discussions)

COMMON FINANCIAL CONCEPTS:
- Net Profit, Revenue, Assets, Liabilities, Equity
- ROE = Net Income / Shareholder's Equity
- Loan-to-Deposit Ratio = Total Loans / Total Deposits
- YoY change = (Current Year - Previous Year) / Previous Year * 100

Rules:
- Prefer several narrow retrieve steps over one broad retrieve step
- Put retrieve steps before the calculate steps that consume their data
- The last step must be a synthesize step
- Return ONLY a JSON array of steps, no explanation text
- JSON format:

[
  {{"kind": "retrieve", "description": "Net Profit After Tax for Q3 2023", "parameters": {{"quarter": "Q3", "year": 2023}}}},
  {{"kind": "calculate", "description": "Percentage change between the two figures", "parameters": {{"calculation_type": "percentage_change"}}}},
  {{"kind": "synthesize", "description": "Combine results into the final answer", "parameters": {{}}}}
]
"#,
            query.text
        );

        if strict {
            format!(
                "{}\n\nIMPORTANT: the previous response was not valid JSON. Respond with ONLY the JSON array, starting with [ and ending with ].",
                base
            )
        } else {
            base
        }
    }

    fn decode_plan(response: &str) -> Result<StepPlan> {
        let cleaned = strip_code_fences(response);

        // Models sometimes wrap the array in prose; keep only the
        // outermost bracketed span.
        let array_span = match (cleaned.find('['), cleaned.rfind(']')) {
            (Some(start), Some(end)) if start < end => &cleaned[start..=end],
            _ => {
                return Err(crate::error::OrchestrationError::InvalidPlan(
                    "No JSON array in planner response".to_string(),
                ))
            }
        };

        let raw_steps: Vec<RawStep> = serde_json::from_str(array_span).map_err(|e| {
            crate::error::OrchestrationError::InvalidPlan(format!(
                "Planner response is not a step array: {}",
                e
            ))
        })?;

        let mut steps = Vec::with_capacity(raw_steps.len());
        for raw in raw_steps {
            let description = raw.description.trim().to_string();
            if description.is_empty() {
                continue;
            }
            steps.push(Step {
                kind: parse_kind(&raw.kind)?,
                description,
                parameters: raw.parameters,
            });
        }

        if steps.is_empty() {
            return Err(crate::error::OrchestrationError::InvalidPlan(
                "Planner returned zero steps".to_string(),
            ));
        }

        Ok(StepPlan::new(steps))
    }
}

fn retrieve_step_for_period(query_text: &str, period: &Period) -> Step {
    Step::retrieve(format!(
        "Find figures relevant to '{}' for {} {}",
        query_text, period.quarter, period.year
    ))
    .with_param("quarter", json!(period.quarter))
    .with_param("year", json!(period.year))
}

fn parse_kind(raw: &str) -> Result<StepKind> {
    let lowered = raw.trim().to_lowercase();
    if lowered.starts_with("retriev") {
        Ok(StepKind::Retrieve)
    } else if lowered.starts_with("calcul") {
        Ok(StepKind::Calculate)
    } else if lowered.starts_with("synth") {
        Ok(StepKind::Synthesize)
    } else {
        Err(crate::error::OrchestrationError::InvalidPlan(format!(
            "Unknown step kind: {}",
            raw
        )))
    }
}

#[derive(Debug, Deserialize)]
struct RawStep {
    kind: String,
    description: String,
    #[serde(default)]
    parameters: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, query: &Query) -> Result<StepPlan> {
        if let Some(plan) = Self::plan_by_heuristics(query) {
            debug!(steps = plan.len(), "Plan built from query surface features");
            return Ok(plan);
        }

        let prompt = self.build_prompt(query, false);
        let response =
            complete_with_retry(self.gateway.as_ref(), &prompt, ResponseFormat::StructuredJson)
                .await
                .map_err(|e| {
                    crate::error::OrchestrationError::Planning(format!(
                        "Gateway failed during planning: {}",
                        e
                    ))
                })?;

        match Self::decode_plan(&response) {
            Ok(plan) => Ok(plan),
            Err(first_error) => {
                // One stricter attempt before surfacing the failure.
                warn!(error = %first_error, "Plan decode failed - retrying with stricter instruction");

                let strict_prompt = self.build_prompt(query, true);
                let retry_response = complete_with_retry(
                    self.gateway.as_ref(),
                    &strict_prompt,
                    ResponseFormat::StructuredJson,
                )
                .await
                .map_err(|e| {
                    crate::error::OrchestrationError::Planning(format!(
                        "Gateway failed during planning retry: {}",
                        e
                    ))
                })?;

                Self::decode_plan(&retry_response).map_err(|e| {
                    crate::error::OrchestrationError::Planning(format!(
                        "Plan unparseable after strict retry: {}",
                        e
                    ))
                })
            }
        }
    }
}
