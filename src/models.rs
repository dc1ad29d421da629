//! Core data models for the query orchestration workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

//
// ================= Enums =================
//

/// Closed set of step kinds. Dispatch over this enum is checked
/// exhaustively at compile time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Retrieve,
    Calculate,
    Synthesize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Table,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CalculationType {
    PercentageChange,
    Ratio,
    Cagr,
    Sum,
    Difference,
}

impl CalculationType {
    /// Default units for a result of this type, used when the step
    /// parameters do not override them.
    pub fn default_units(&self) -> &'static str {
        match self {
            CalculationType::PercentageChange | CalculationType::Cagr => "percent",
            CalculationType::Ratio => "ratio",
            CalculationType::Sum | CalculationType::Difference => "AED millions",
        }
    }
}

impl fmt::Display for CalculationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CalculationType::PercentageChange => "percentage_change",
            CalculationType::Ratio => "ratio",
            CalculationType::Cagr => "cagr",
            CalculationType::Sum => "sum",
            CalculationType::Difference => "difference",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Query =================
//

/// Immutable query input. No mutation after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_session(text: impl Into<String>, session_id: Uuid) -> Self {
        Self {
            text: text.into(),
            session_id: Some(session_id),
            created_at: Utc::now(),
        }
    }
}

//
// ================= Step Plan =================
//

/// One unit of work in a query plan. Immutable once planned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub kind: StepKind,
    pub description: String,
    /// Hints extracted by the planner from the query surface
    /// (target quarters, years, calculation type, ...).
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

impl Step {
    pub fn new(kind: StepKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            parameters: serde_json::Map::new(),
        }
    }

    pub fn retrieve(description: impl Into<String>) -> Self {
        Self::new(StepKind::Retrieve, description)
    }

    pub fn calculate(description: impl Into<String>) -> Self {
        Self::new(StepKind::Calculate, description)
    }

    pub fn synthesize(description: impl Into<String>) -> Self {
        Self::new(StepKind::Synthesize, description)
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// Ordered sequence of steps. Order is execution order: later steps may
/// read values produced by earlier ones, so reordering is not permitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPlan {
    pub steps: Vec<Step>,
}

impl StepPlan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn ends_with_synthesis(&self) -> bool {
        self.steps
            .last()
            .map(|s| s.kind == StepKind::Synthesize)
            .unwrap_or(false)
    }

    /// Append the conventional trailing synthesis step when the planner
    /// omitted it.
    pub fn ensure_synthesis(&mut self) {
        if !self.ends_with_synthesis() {
            self.steps.push(Step::synthesize(
                "Combine all gathered information into a comprehensive answer",
            ));
        }
    }
}

//
// ================= Retrieved Passage =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassageMetadata {
    pub document_type: String,
    pub filename: String,
    pub quarter: Option<String>,
    pub year: Option<i32>,
    pub section_name: Option<String>,
    pub page_number: Option<u32>,
    pub chunk_id: String,
    pub content_type: ContentType,
}

/// A scored excerpt of source material. The core holds read-only copies
/// for the duration of one query.
///
/// `similarity_score` uses distance semantics: lower means closer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub content: String,
    pub metadata: PassageMetadata,
    pub similarity_score: f64,
}

//
// ================= Calculation Result =================
//

/// Invariant: `formula` is the type's template with `inputs` substituted
/// in, so it can be re-derived for audit purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationResult {
    pub calculation_type: CalculationType,
    pub formula: String,
    pub inputs: BTreeMap<String, f64>,
    pub result: f64,
    pub units: String,
}

//
// ================= Accumulated Context =================
//

/// Outcome of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepResult {
    Retrieved { passages: Vec<RetrievedPassage> },
    Calculated { calculation: CalculationResult },
    /// Synthesis steps are markers in the plan; the answer itself is
    /// produced after all steps are consumed.
    Synthesized,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub result: StepResult,
}

/// Append-only record of all step results for one query. Owned
/// exclusively by the orchestration state machine; never shared across
/// concurrent queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccumulatedContext {
    records: Vec<StepRecord>,
}

impl AccumulatedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Step, result: StepResult) {
        self.records.push(StepRecord { step, result });
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All passages retrieved so far, in step order.
    pub fn passages(&self) -> impl Iterator<Item = &RetrievedPassage> {
        self.records.iter().flat_map(|r| match &r.result {
            StepResult::Retrieved { passages } => passages.as_slice(),
            _ => &[],
        })
    }

    /// Calculation results keyed by step index.
    pub fn calculations(&self) -> impl Iterator<Item = (usize, &CalculationResult)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| match &r.result {
                StepResult::Calculated { calculation } => Some((i, calculation)),
                _ => None,
            })
    }

    /// Steps that failed, with their error messages.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &Step, &str)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| match &r.result {
                StepResult::Failed { error } => Some((i, &r.step, error.as_str())),
                _ => None,
            })
    }

    /// Format the context for LLM consumption: passages with their
    /// source headers, calculations with formulas, failures as explicit
    /// limitations.
    pub fn format_for_prompt(&self) -> String {
        let mut blocks = Vec::new();

        for passage in self.passages() {
            let section = passage
                .metadata
                .section_name
                .as_deref()
                .unwrap_or("Unknown");
            let page = passage
                .metadata
                .page_number
                .map(|p| p.to_string())
                .unwrap_or_else(|| "Unknown".to_string());
            blocks.push(format!(
                "Source: {} | Section: {} | Page: {}\nContent: {}",
                passage.metadata.filename, section, page, passage.content
            ));
        }

        for (index, calculation) in self.calculations() {
            blocks.push(format!(
                "Calculation (step {}): {} = {} ({}) [{}]",
                index + 1,
                calculation.formula,
                calculation.result,
                calculation.calculation_type,
                calculation.units
            ));
        }

        for (index, step, error) in self.failures() {
            blocks.push(format!(
                "Limitation: step {} ({}) failed and produced no data: {}",
                index + 1,
                step.description,
                error
            ));
        }

        blocks.join("\n\n")
    }
}

//
// ================= Draft Answer =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub document: String,
    pub section: Option<String>,
    pub page: Option<u32>,
    pub quarter: Option<String>,
    pub year: Option<i32>,
    pub content_preview: String,
}

impl Citation {
    pub fn from_passage(passage: &RetrievedPassage) -> Self {
        let preview: String = passage.content.chars().take(100).collect();
        let preview = if passage.content.chars().count() > 100 {
            format!("{}...", preview)
        } else {
            preview
        };

        Self {
            document: passage.metadata.filename.clone(),
            section: passage.metadata.section_name.clone(),
            page: passage.metadata.page_number,
            quarter: passage.metadata.quarter.clone(),
            year: passage.metadata.year,
            content_preview: preview,
        }
    }

    /// Dedup key across documents, sections and pages.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.document,
            self.section.as_deref().unwrap_or(""),
            self.page.map(|p| p.to_string()).unwrap_or_default()
        )
    }
}

/// Produced by the synthesizer; replaced, not mutated, on each attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftAnswer {
    pub text: String,
    pub citations: Vec<Citation>,
}

//
// ================= Validation =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    pub unsupported_claims: Vec<String>,
    pub notes: String,
}

impl ValidationVerdict {
    pub fn skipped(notes: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            unsupported_claims: Vec::new(),
            notes: notes.into(),
        }
    }
}

//
// ================= Query Result =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSummary {
    pub step_index: usize,
    pub search_query: String,
    pub results_count: usize,
}

/// Final, immutable result returned to the caller. A failed query is
/// still a structured result, never an opaque crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query: String,
    pub final_answer: String,
    pub sources_used: Vec<Citation>,
    pub calculations_performed: BTreeMap<usize, CalculationResult>,
    pub retrieval_steps: Vec<RetrievalSummary>,
    pub validation: ValidationVerdict,
    pub processing_steps: usize,
    pub success: bool,
    /// True when the query deadline expired mid-plan and the result is
    /// partial.
    pub timed_out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_passage(filename: &str, content: &str) -> RetrievedPassage {
        RetrievedPassage {
            content: content.to_string(),
            metadata: PassageMetadata {
                document_type: "financial_statement".to_string(),
                filename: filename.to_string(),
                quarter: Some("Q3".to_string()),
                year: Some(2024),
                section_name: Some("income_statement".to_string()),
                page_number: Some(4),
                chunk_id: "chunk-1".to_string(),
                content_type: ContentType::Text,
            },
            similarity_score: 0.12,
        }
    }

    #[test]
    fn ensure_synthesis_appends_when_missing() {
        let mut plan = StepPlan::new(vec![Step::retrieve("Net profit Q3 2024")]);
        assert!(!plan.ends_with_synthesis());

        plan.ensure_synthesis();
        assert_eq!(plan.len(), 2);
        assert!(plan.ends_with_synthesis());

        // Already-terminated plans are left untouched.
        plan.ensure_synthesis();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn context_iterators_cover_all_result_kinds() {
        let mut context = AccumulatedContext::new();
        context.push(
            Step::retrieve("find net profit"),
            StepResult::Retrieved {
                passages: vec![sample_passage("fab_q3_2024.pdf", "Net Profit AED 3,689 million")],
            },
        );
        context.push(
            Step::calculate("YoY change"),
            StepResult::Failed {
                error: "inputs missing".to_string(),
            },
        );

        assert_eq!(context.len(), 2);
        assert_eq!(context.passages().count(), 1);
        assert_eq!(context.calculations().count(), 0);
        assert_eq!(context.failures().count(), 1);

        let formatted = context.format_for_prompt();
        assert!(formatted.contains("fab_q3_2024.pdf"));
        assert!(formatted.contains("Limitation"));
    }

    #[test]
    fn citation_preview_truncates_long_content() {
        let long = "x".repeat(250);
        let citation = Citation::from_passage(&sample_passage("doc.pdf", &long));
        assert!(citation.content_preview.ends_with("..."));
        assert_eq!(citation.content_preview.chars().count(), 103);
    }

    #[test]
    fn step_kind_serializes_lowercase() {
        let json = serde_json::to_string(&StepKind::Retrieve).unwrap();
        assert_eq!(json, "\"retrieve\"");
    }
}
