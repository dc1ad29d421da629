//! Draft answer validation
//!
//! Deterministic, rule-based checking of numeric claims against the
//! accumulated evidence. The verdict is advisory: it can trigger one
//! repair pass but never blocks a result from being returned. Running
//! validation twice on the same draft yields the same verdict.

use crate::extract::{extract_numbers, extract_numbers_with_spans};
use crate::models::{AccumulatedContext, DraftAnswer, ValidationVerdict};
use tracing::debug;

pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(
        &self,
        draft: &DraftAnswer,
        context: &AccumulatedContext,
    ) -> ValidationVerdict {
        if context.is_empty() {
            return ValidationVerdict::skipped("No evidence gathered; validation skipped");
        }

        let evidence = evidence_numbers(context);
        let claims = numeric_claims(&draft.text);

        if claims.is_empty() {
            return ValidationVerdict {
                is_valid: true,
                unsupported_claims: Vec::new(),
                notes: "No numeric claims to check".to_string(),
            };
        }

        let mut unsupported = Vec::new();
        for claim in &claims {
            if !is_supported(claim, &evidence) {
                unsupported.push(describe_claim(&draft.text, claim));
            }
        }

        debug!(
            claims = claims.len(),
            unsupported = unsupported.len(),
            "Validated draft answer"
        );

        let notes = format!(
            "{} of {} numeric claims supported by retrieved data and calculations",
            claims.len() - unsupported.len(),
            claims.len()
        );

        ValidationVerdict {
            is_valid: unsupported.is_empty(),
            unsupported_claims: unsupported,
            notes,
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct NumericClaim {
    start: usize,
    value: f64,
    /// Decimal places in the surface form, bounding the rounding the
    /// synthesizer may have applied.
    precision: u32,
}

/// Numbers in the answer that assert something checkable. Years,
/// quarter references and small ordinals are skipped: they identify
/// periods rather than claim figures.
fn numeric_claims(text: &str) -> Vec<NumericClaim> {
    extract_numbers_with_spans(text)
        .into_iter()
        .filter(|(start, _, value)| {
            // Small integers are period/page/ordinal noise, but small
            // fractional values (ratios, growth percentages) are real
            // claims.
            if value.abs() < 10.0 && value.fract() == 0.0 {
                return false;
            }
            if value.fract() == 0.0 && (1990.0..=2100.0).contains(value) {
                return false;
            }
            // "Q3", "Q3'24": period references, not figures.
            let preceding = text[..*start].trim_end_matches('\'');
            if preceding.ends_with('Q') || preceding.ends_with('q') {
                return false;
            }
            let mut tail = preceding.chars().rev();
            match (tail.next(), tail.next()) {
                (Some(d), Some(q)) if ('1'..='4').contains(&d) && q.eq_ignore_ascii_case(&'q') => {
                    false
                }
                _ => true,
            }
        })
        .map(|(start, end, value)| NumericClaim {
            start,
            value,
            precision: decimal_places(&text[start..end]),
        })
        .collect()
}

fn decimal_places(literal: &str) -> u32 {
    literal
        .rsplit_once('.')
        .map(|(_, frac)| frac.len() as u32)
        .unwrap_or(0)
}

/// Every number the evidence can vouch for: passage figures,
/// calculation inputs and calculation results.
fn evidence_numbers(context: &AccumulatedContext) -> Vec<f64> {
    let mut numbers: Vec<f64> = context
        .passages()
        .flat_map(|p| extract_numbers(&p.content))
        .collect();

    for (_, calculation) in context.calculations() {
        numbers.extend(calculation.inputs.values().copied());
        numbers.push(calculation.result);
    }

    numbers
}

/// A claim is supported when some evidence number rounds to it at the
/// claim's own precision: "15.28" is supported by 15.28125.
fn is_supported(claim: &NumericClaim, evidence: &[f64]) -> bool {
    let tolerance = 0.5 * 10f64.powi(-(claim.precision as i32));
    evidence
        .iter()
        .any(|candidate| (candidate - claim.value).abs() <= tolerance)
}

/// The claim with enough preceding text to locate it in the answer.
fn describe_claim(text: &str, claim: &NumericClaim) -> String {
    let preceding: String = text[..claim.start]
        .chars()
        .rev()
        .take(40)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{}{}", preceding.trim_start(), claim.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CalculationResult, CalculationType, Citation, ContentType, PassageMetadata,
        RetrievedPassage, Step, StepResult,
    };
    use std::collections::BTreeMap;

    fn passage(content: &str) -> RetrievedPassage {
        RetrievedPassage {
            content: content.to_string(),
            metadata: PassageMetadata {
                document_type: "financial_statement".to_string(),
                filename: "fab_q3_2024.pdf".to_string(),
                quarter: Some("Q3".to_string()),
                year: Some(2024),
                section_name: Some("income_statement".to_string()),
                page_number: Some(3),
                chunk_id: "c1".to_string(),
                content_type: ContentType::Text,
            },
            similarity_score: 0.1,
        }
    }

    fn draft(text: &str) -> DraftAnswer {
        DraftAnswer {
            text: text.to_string(),
            citations: Vec::<Citation>::new(),
        }
    }

    fn evidence_context() -> AccumulatedContext {
        let mut context = AccumulatedContext::new();
        context.push(
            Step::retrieve("net profit"),
            StepResult::Retrieved {
                passages: vec![
                    passage("Net Profit After Tax AED 3,200 million"),
                    passage("Net Profit After Tax AED 3,689 million"),
                ],
            },
        );

        let mut inputs = BTreeMap::new();
        inputs.insert("net_profit_q3_2023".to_string(), 3200.0);
        inputs.insert("net_profit_q3_2024".to_string(), 3689.0);
        context.push(
            Step::calculate("YoY change"),
            StepResult::Calculated {
                calculation: CalculationResult {
                    calculation_type: CalculationType::PercentageChange,
                    formula: "(3689 - 3200) / 3200 * 100".to_string(),
                    inputs,
                    result: 15.28125,
                    units: "percent".to_string(),
                },
            },
        );
        context
    }

    #[test]
    fn supported_claims_validate() {
        let verdict = Validator::new().validate(
            &draft(
                "Net profit rose from AED 3,200 million in Q3 2023 to AED 3,689 million \
                 in Q3 2024, an increase of 15.28%.",
            ),
            &evidence_context(),
        );
        assert!(verdict.is_valid);
        assert!(verdict.unsupported_claims.is_empty());
    }

    #[test]
    fn rounded_calculation_result_is_supported() {
        let verdict = Validator::new().validate(
            &draft("The increase was approximately 15.3%."),
            &evidence_context(),
        );
        assert!(verdict.is_valid);
    }

    #[test]
    fn fabricated_figure_is_flagged() {
        let verdict = Validator::new().validate(
            &draft("Net profit was AED 9,999 million, up 15.28%."),
            &evidence_context(),
        );
        assert!(!verdict.is_valid);
        assert_eq!(verdict.unsupported_claims.len(), 1);
        assert!(verdict.unsupported_claims[0].contains("9999"));
    }

    #[test]
    fn fabricated_sub_ten_percentage_is_flagged() {
        let verdict = Validator::new().validate(
            &draft("Net profit grew by 5.7% and ROE reached 9.4 percent."),
            &evidence_context(),
        );
        assert!(!verdict.is_valid);
        assert_eq!(verdict.unsupported_claims.len(), 2);
        assert!(verdict.unsupported_claims[0].contains("5.7"));
    }

    #[test]
    fn supported_sub_ten_ratio_validates() {
        let mut context = AccumulatedContext::new();
        context.push(
            Step::calculate("loan-to-deposit ratio"),
            StepResult::Calculated {
                calculation: CalculationResult {
                    calculation_type: CalculationType::Ratio,
                    formula: "100 / 118".to_string(),
                    inputs: BTreeMap::new(),
                    result: 0.847_457_627,
                    units: "ratio".to_string(),
                },
            },
        );

        let verdict = Validator::new().validate(
            &draft("The loan-to-deposit ratio stood at 0.85."),
            &context,
        );
        assert!(verdict.is_valid);
    }

    #[test]
    fn years_and_quarters_are_not_claims() {
        let verdict = Validator::new().validate(
            &draft("In Q3 2024 compared with Q3'23, figures held steady."),
            &evidence_context(),
        );
        assert!(verdict.is_valid);
    }

    #[test]
    fn empty_context_skips_validation() {
        let verdict = Validator::new().validate(
            &draft("Net profit was AED 9,999 million."),
            &AccumulatedContext::new(),
        );
        assert!(verdict.is_valid);
        assert!(verdict.notes.contains("skipped"));
    }

    #[test]
    fn validation_is_idempotent() {
        let context = evidence_context();
        let answer = draft("Net profit was AED 9,999 million, up 15.28%.");

        let validator = Validator::new();
        let first = validator.validate(&answer, &context);
        let second = validator.validate(&answer, &context);

        assert_eq!(first.is_valid, second.is_valid);
        assert_eq!(first.unsupported_claims, second.unsupported_claims);
        assert_eq!(first.notes, second.notes);
    }
}
