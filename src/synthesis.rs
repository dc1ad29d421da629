//! Answer synthesis
//!
//! Turns the accumulated step context into a cited draft answer. The
//! synthesizer never invents figures: the prompt restricts the model to
//! the retrieved passages and computed results, and citations are
//! attached only for passages the answer actually draws on.

use crate::config::Deadline;
use crate::gateway::{complete_with_retry, LanguageModelGateway, ResponseFormat};
use crate::models::{AccumulatedContext, Citation, DraftAnswer, Query, ValidationVerdict};
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub struct Synthesizer {
    gateway: Arc<dyn LanguageModelGateway>,
}

impl Synthesizer {
    pub fn new(gateway: Arc<dyn LanguageModelGateway>) -> Self {
        Self { gateway }
    }

    /// Produce a draft answer from the context. A prior validation
    /// verdict turns this into a repair attempt: the prompt names the
    /// unsupported claims and instructs the model to drop or re-ground
    /// them.
    pub async fn synthesize(
        &self,
        query: &Query,
        context: &AccumulatedContext,
        prior_feedback: Option<&ValidationVerdict>,
        deadline: Deadline,
    ) -> Result<DraftAnswer> {
        let prompt = build_prompt(query, context, prior_feedback);

        info!(
            repair = prior_feedback.is_some(),
            passages = context.passages().count(),
            "Synthesizing answer"
        );

        let text = deadline
            .bound(complete_with_retry(
                self.gateway.as_ref(),
                &prompt,
                ResponseFormat::FreeText,
            ))
            .await?;
        let text = text.trim().to_string();

        let citations = collect_citations(&text, context);

        Ok(DraftAnswer { text, citations })
    }
}

fn build_prompt(
    query: &Query,
    context: &AccumulatedContext,
    prior_feedback: Option<&ValidationVerdict>,
) -> String {
    let data_block = if context.is_empty() {
        "(no data was retrieved)".to_string()
    } else {
        context.format_for_prompt()
    };

    let mut prompt = format!(
        r#"You are a financial analyst answering a question about FAB (First Abu Dhabi Bank).

QUESTION: {}

AVAILABLE DATA:
{}

Write a clear, professional answer using ONLY the data above.
- Quote figures exactly as they appear, including units (AED millions, percent).
- If a calculation result is present, state it and name its inputs.
- If the data is insufficient to answer, say so plainly instead of guessing.
- Do not introduce numbers that are not in the data above.
"#,
        query.text, data_block
    );

    if let Some(verdict) = prior_feedback {
        if !verdict.unsupported_claims.is_empty() {
            prompt.push_str(
                "\nA previous draft contained claims not supported by the data. \
                 Remove or re-ground each of these:\n",
            );
            for claim in &verdict.unsupported_claims {
                prompt.push_str(&format!("- {}\n", claim));
            }
        }
    }

    prompt
}

/// Passages the answer draws on: a passage is cited when one of its
/// significant figures appears in the answer, or the answer names its
/// source document or section.
fn collect_citations(answer: &str, context: &AccumulatedContext) -> Vec<Citation> {
    let answer_numbers = crate::extract::extract_numbers(answer);
    let answer_lower = answer.to_lowercase();

    let mut seen = HashSet::new();
    let mut citations = Vec::new();

    for passage in context.passages() {
        let referenced = passage_is_referenced(&answer_numbers, &answer_lower, passage);
        if !referenced {
            continue;
        }

        let citation = Citation::from_passage(passage);
        if seen.insert(citation.key()) {
            citations.push(citation);
        }
    }

    citations
}

fn passage_is_referenced(
    answer_numbers: &[f64],
    answer_lower: &str,
    passage: &crate::models::RetrievedPassage,
) -> bool {
    // Small integers (page numbers, quarter digits) are too ambiguous
    // to count as evidence of use; small fractional figures (ratios,
    // percentages) are not.
    let figures = crate::extract::extract_numbers(&passage.content)
        .into_iter()
        .filter(|n| n.abs() >= 10.0 || n.fract() != 0.0);

    for figure in figures {
        if answer_numbers.iter().any(|n| (n - figure).abs() < 1e-6) {
            return true;
        }
    }

    if answer_lower.contains(&passage.metadata.filename.to_lowercase()) {
        return true;
    }
    if let Some(section) = &passage.metadata.section_name {
        if answer_lower.contains(&section.to_lowercase()) {
            return true;
        }
    }

    false
}
