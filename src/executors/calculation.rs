//! Calculation executor
//!
//! Extracts numeric inputs from step parameters or earlier retrieval
//! results, builds an arithmetic expression from a fixed set of
//! calculation types, and evaluates it with the restricted evaluator.
//! A calculation failure is recorded, not fatal: later steps continue
//! and the synthesizer caveats instead of fabricating a number.

use crate::config::Deadline;
use crate::executors::expr;
use crate::extract::extract_metrics;
use crate::gateway::{complete_with_retry, LanguageModelGateway, ResponseFormat};
use crate::models::{AccumulatedContext, CalculationResult, CalculationType, Step};
use crate::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct CalculationExecutor {
    gateway: Arc<dyn LanguageModelGateway>,
}

impl CalculationExecutor {
    pub fn new(gateway: Arc<dyn LanguageModelGateway>) -> Self {
        Self { gateway }
    }

    pub async fn execute(
        &self,
        step: &Step,
        context: &AccumulatedContext,
        deadline: Deadline,
    ) -> Result<CalculationResult> {
        let calculation_type = resolve_type(step);

        let mut inputs = numeric_parameters(step);
        if inputs.len() < 2 {
            inputs = self.extract_inputs(step, context, deadline).await?;
        }

        if inputs.len() < 2 {
            return Err(crate::error::OrchestrationError::Calculation(format!(
                "Required inputs could not be extracted from context ({} found, 2 needed)",
                inputs.len()
            )));
        }

        let ordered = order_by_period(&inputs);
        let formula = build_formula(calculation_type, &ordered, step)?;

        debug!(%formula, ?calculation_type, "Evaluating calculation");

        let result = expr::evaluate(&formula)?;
        if !result.is_finite() {
            return Err(crate::error::OrchestrationError::Calculation(format!(
                "Expression '{}' produced a non-finite result",
                formula
            )));
        }

        let units = step
            .param_str("units")
            .unwrap_or_else(|| calculation_type.default_units())
            .to_string();

        Ok(CalculationResult {
            calculation_type,
            formula,
            inputs,
            result,
            units,
        })
    }

    /// Ask the gateway for strictly numeric JSON; degrade to pattern
    /// extraction over the retrieved passages when that fails.
    async fn extract_inputs(
        &self,
        step: &Step,
        context: &AccumulatedContext,
        deadline: Deadline,
    ) -> Result<BTreeMap<String, f64>> {
        let available = available_data(context);

        let prompt = format!(
            r#"Extract the numeric inputs needed for this calculation from the data below.

CALCULATION REQUEST: {}

DATA CONTEXT:
{}

KNOWN DATA POINTS:
{}

Return ONLY a JSON object mapping descriptive labels to plain numbers, for example:
{{"net_profit_q3_2023": 3200, "net_profit_q3_2024": 3689}}
Every value must be a number. No strings, no nested objects, no explanation.
"#,
            step.description,
            context.format_for_prompt(),
            serde_json::to_string_pretty(&available)?
        );

        let extracted = deadline
            .bound(complete_with_retry(
                self.gateway.as_ref(),
                &prompt,
                ResponseFormat::StructuredJson,
            ))
            .await
            .and_then(|response| {
                serde_json::from_str::<BTreeMap<String, f64>>(
                    crate::gateway::strip_code_fences(&response),
                )
                .map_err(|e| {
                    crate::error::OrchestrationError::GatewayContent(format!(
                        "Numeric extraction returned non-numeric JSON: {}",
                        e
                    ))
                })
            });

        match extracted {
            Ok(inputs) if !inputs.is_empty() => Ok(inputs),
            Ok(_) => Ok(available),
            Err(crate::error::OrchestrationError::DeadlineExceeded) => {
                Err(crate::error::OrchestrationError::DeadlineExceeded)
            }
            Err(e) => {
                warn!(error = %e, "Gateway extraction failed - using pattern-extracted data");
                Ok(available)
            }
        }
    }
}

/// Metrics found in the retrieved passages, labeled with their fiscal
/// period where the passage metadata provides one.
fn available_data(context: &AccumulatedContext) -> BTreeMap<String, f64> {
    let mut data = BTreeMap::new();

    for passage in context.passages() {
        for (metric, value) in extract_metrics(&passage.content) {
            let label = match (&passage.metadata.quarter, passage.metadata.year) {
                (Some(quarter), Some(year)) => {
                    format!("{}_{}_{}", metric, quarter.to_lowercase(), year)
                }
                (None, Some(year)) => format!("{}_{}", metric, year),
                _ => metric,
            };
            data.entry(label).or_insert(value);
        }
    }

    data
}

fn resolve_type(step: &Step) -> CalculationType {
    if let Some(raw) = step.param_str("calculation_type") {
        match raw.to_lowercase().as_str() {
            "percentage_change" | "growth_rate" => return CalculationType::PercentageChange,
            "ratio" => return CalculationType::Ratio,
            "cagr" => return CalculationType::Cagr,
            "sum" => return CalculationType::Sum,
            "difference" => return CalculationType::Difference,
            _ => {}
        }
    }

    let lowered = step.description.to_lowercase();
    if lowered.contains("cagr") || lowered.contains("compound annual") {
        CalculationType::Cagr
    } else if lowered.contains("ratio") {
        CalculationType::Ratio
    } else if lowered.contains("sum") || lowered.contains("total of") {
        CalculationType::Sum
    } else if lowered.contains("difference") {
        CalculationType::Difference
    } else {
        // Change/growth phrasing and the unadorned default.
        CalculationType::PercentageChange
    }
}

fn numeric_parameters(step: &Step) -> BTreeMap<String, f64> {
    step.parameters
        .iter()
        .filter(|(key, _)| {
            !matches!(
                key.as_str(),
                "calculation_type" | "units" | "periods" | "quarter" | "year"
            )
        })
        .filter_map(|(key, value)| value.as_f64().map(|v| (key.clone(), v)))
        .collect()
}

/// Inputs ordered oldest-first when their labels carry a fiscal period
/// suffix ("..._q3_2023"); map order otherwise.
fn order_by_period(inputs: &BTreeMap<String, f64>) -> Vec<(String, f64)> {
    let mut ordered: Vec<(String, f64)> = inputs
        .iter()
        .map(|(label, value)| (label.clone(), *value))
        .collect();

    ordered.sort_by_key(|(label, _)| {
        period_rank(label).unwrap_or((i32::MAX, u8::MAX))
    });
    ordered
}

/// Parse a "..._q3_2023" or "..._2023" label suffix into (year, quarter).
fn period_rank(label: &str) -> Option<(i32, u8)> {
    let mut parts = label.rsplit('_');
    let last = parts.next()?;
    let year: i32 = last.parse().ok()?;
    if !(1990..=2100).contains(&year) {
        return None;
    }

    let quarter = parts
        .next()
        .and_then(|p| p.strip_prefix('q'))
        .and_then(|q| q.parse::<u8>().ok())
        .unwrap_or(0);

    Some((year, quarter))
}

fn build_formula(
    calculation_type: CalculationType,
    ordered: &[(String, f64)],
    step: &Step,
) -> Result<String> {
    let first = ordered.first().map(|(_, v)| *v).unwrap_or(0.0);
    let last = ordered.last().map(|(_, v)| *v).unwrap_or(0.0);

    let formula = match calculation_type {
        CalculationType::PercentageChange => {
            format!("({} - {}) / {} * 100", last, first, first)
        }
        CalculationType::Ratio => format!("{} / {}", first, last),
        CalculationType::Cagr => {
            let periods = step
                .parameters
                .get("periods")
                .and_then(|v| v.as_f64())
                .or_else(|| infer_periods(ordered))
                .ok_or_else(|| {
                    crate::error::OrchestrationError::Calculation(
                        "CAGR requires a period count or dated inputs".to_string(),
                    )
                })?;
            format!("(({} / {}) ^ (1 / {}) - 1) * 100", last, first, periods)
        }
        CalculationType::Sum => ordered
            .iter()
            .map(|(_, v)| v.to_string())
            .collect::<Vec<_>>()
            .join(" + "),
        CalculationType::Difference => format!("{} - {}", last, first),
    };

    Ok(formula)
}

/// Number of elapsed years between the oldest and newest dated inputs.
fn infer_periods(ordered: &[(String, f64)]) -> Option<f64> {
    let first_year = ordered.first().and_then(|(l, _)| period_rank(l)).map(|(y, _)| y)?;
    let last_year = ordered.last().and_then(|(l, _)| period_rank(l)).map(|(y, _)| y)?;
    let span = last_year - first_year;
    if span > 0 {
        Some(f64::from(span))
    } else {
        None
    }
}
