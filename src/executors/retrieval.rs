//! Retrieval executor
//!
//! Derives a search string and metadata filters from a retrieve step,
//! queries the document store, and relaxes filters in a fixed order
//! when a search comes back empty. An empty result set after the full
//! fallback is a valid (if weak) outcome, not an error.

use crate::config::Deadline;
use crate::extract::extract_periods;
use crate::gateway::{complete_with_retry, LanguageModelGateway, ResponseFormat};
use crate::models::{AccumulatedContext, RetrievedPassage, Step};
use crate::store::{DocumentStore, SearchFilters};
use crate::Result;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RetrievalExecutor {
    gateway: Arc<dyn LanguageModelGateway>,
    store: Arc<dyn DocumentStore>,
    top_k: usize,
}

/// Gateway-extracted search parameters for one retrieve step.
#[derive(Debug, Deserialize)]
struct SearchSpec {
    search_query: String,
    #[serde(default)]
    filters: SearchFilters,
}

impl RetrievalExecutor {
    pub fn new(
        gateway: Arc<dyn LanguageModelGateway>,
        store: Arc<dyn DocumentStore>,
        top_k: usize,
    ) -> Self {
        Self {
            gateway,
            store,
            top_k,
        }
    }

    /// Execute one retrieve step. Returns the derived search query
    /// (for the result summary) and up to `top_k` deduplicated passages.
    pub async fn execute(
        &self,
        step: &Step,
        _context: &AccumulatedContext,
        deadline: Deadline,
    ) -> Result<(String, Vec<RetrievedPassage>)> {
        let (search_query, filters) = self.derive_search(step, deadline).await?;

        let mut passages = Vec::new();
        for (stage, relaxed) in fallback_stages(&filters).into_iter().enumerate() {
            let filters_ref = relaxed.as_ref().filter(|f| !f.is_empty());

            let results = deadline
                .bound(self.store.search(&search_query, filters_ref, self.top_k))
                .await?;

            if !results.is_empty() {
                debug!(
                    stage,
                    results = results.len(),
                    query = %search_query,
                    "Retrieval succeeded"
                );
                passages = results;
                break;
            }
        }

        if passages.is_empty() {
            warn!(query = %search_query, "No passages at any fallback level");
        }

        let mut deduped = dedup_by_content(passages);
        deduped.truncate(self.top_k);

        Ok((search_query, deduped))
    }

    /// Derive the search string and filters: explicit step parameters
    /// win; otherwise ask the gateway; fall back to pattern extraction
    /// from the step description.
    async fn derive_search(
        &self,
        step: &Step,
        deadline: Deadline,
    ) -> Result<(String, SearchFilters)> {
        let mut filters = filters_from_parameters(step);

        if let Some(query) = step.param_str("search_query") {
            return Ok((query.to_string(), filters));
        }
        if !filters.is_empty() {
            return Ok((clean_description(&step.description), filters));
        }

        let prompt = format!(
            r#"Derive a document search from this retrieval instruction.

INSTRUCTION: {}

Known metadata filters: document_type (financial_statement | earnings_presentation | results_call_transcript), quarter (Q1-Q4), year, section_name.
Only include a filter when the instruction states its value explicitly.

Return ONLY JSON:
{{"search_query": "...", "filters": {{"quarter": "Q3", "year": 2024}}}}
"#,
            step.description
        );

        let spec = deadline
            .bound(complete_with_retry(
                self.gateway.as_ref(),
                &prompt,
                ResponseFormat::StructuredJson,
            ))
            .await
            .and_then(|response| {
                serde_json::from_str::<SearchSpec>(crate::gateway::strip_code_fences(&response))
                    .map_err(|e| {
                        crate::error::OrchestrationError::GatewayContent(format!(
                            "Search spec decode failed: {}",
                            e
                        ))
                    })
            });

        match spec {
            Ok(spec) => Ok((spec.search_query, spec.filters)),
            Err(crate::error::OrchestrationError::DeadlineExceeded) => {
                Err(crate::error::OrchestrationError::DeadlineExceeded)
            }
            Err(e) => {
                // Degrade to pattern extraction rather than failing the step.
                warn!(error = %e, "Filter extraction failed - deriving from description");
                if let Some(period) = extract_periods(&step.description).first() {
                    filters.quarter = Some(period.quarter.clone());
                    filters.year = Some(period.year);
                }
                Ok((clean_description(&step.description), filters))
            }
        }
    }
}

fn filters_from_parameters(step: &Step) -> SearchFilters {
    SearchFilters {
        document_type: step.param_str("document_type").map(str::to_string),
        quarter: step.param_str("quarter").map(str::to_string),
        year: step
            .parameters
            .get("year")
            .and_then(|v| v.as_i64())
            .map(|y| y as i32),
        section_name: step
            .param_str("section_name")
            .or_else(|| step.param_str("section"))
            .map(str::to_string),
    }
}

/// Fixed relaxation order: full filters, drop section, drop year, drop
/// document type, unfiltered. Stages identical to their predecessor are
/// skipped so each search attempt is strictly wider.
fn fallback_stages(filters: &SearchFilters) -> Vec<Option<SearchFilters>> {
    let mut stages: Vec<Option<SearchFilters>> = Vec::with_capacity(5);

    let mut current = filters.clone();
    stages.push(Some(current.clone()));

    current.section_name = None;
    stages.push(Some(current.clone()));

    current.year = None;
    stages.push(Some(current.clone()));

    current.document_type = None;
    stages.push(Some(current.clone()));

    stages.push(None);

    let mut widened: Vec<Option<SearchFilters>> = Vec::with_capacity(5);
    for stage in stages {
        let is_duplicate = match (widened.last(), &stage) {
            (Some(Some(previous)), Some(next)) => previous == next,
            (Some(None), None) => true,
            (Some(Some(previous)), None) => previous.is_empty(),
            _ => false,
        };
        if !is_duplicate {
            widened.push(stage);
        }
    }

    widened
}

/// Remove near-duplicate passages, keyed on a hash of the first 100
/// content characters. Input order (ascending distance) is preserved,
/// so the closest duplicate survives.
fn dedup_by_content(passages: Vec<RetrievedPassage>) -> Vec<RetrievedPassage> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique = Vec::with_capacity(passages.len());

    for passage in passages {
        let prefix: String = passage.content.chars().take(100).collect();
        let digest = hex::encode(Sha256::digest(prefix.as_bytes()));
        if seen.insert(digest) {
            unique.push(passage);
        }
    }

    unique
}

fn clean_description(description: &str) -> String {
    description
        .trim()
        .trim_start_matches("RETRIEVE:")
        .trim_start_matches("Retrieve:")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::models::{ContentType, PassageMetadata};
    use crate::store::InMemoryDocumentStore;
    use serde_json::json;

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
                chunk_id: format!("{}-{}", filename, quarter),
                content_type: ContentType::Text,
            },
            similarity_score: 0.0,
        }
    }

    fn executor(store: InMemoryDocumentStore, gateway: MockGateway) -> RetrievalExecutor {
        RetrievalExecutor::new(Arc::new(gateway), Arc::new(store), 5)
    }

    #[tokio::test]
    async fn parameter_filters_skip_the_gateway() {
        let store = InMemoryDocumentStore::new(vec![
            passage("fab_q3_2023.pdf", "Q3", 2023, "Net Profit AED 3,200 million"),
            passage("fab_q3_2024.pdf", "Q3", 2024, "Net Profit AED 3,689 million"),
        ]);
        // No scripted responses: a gateway call would fail the test.
        let executor = executor(store, MockGateway::new());

        let step = Step::retrieve("Find net profit figures")
            .with_param("quarter", json!("Q3"))
            .with_param("year", json!(2023));

        let (query, passages) = executor
            .execute(&step, &AccumulatedContext::new(), Deadline::none())
            .await
            .unwrap();

        assert_eq!(query, "Find net profit figures");
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].metadata.year, Some(2023));
    }

    #[tokio::test]
    async fn too_strict_filters_fall_back_to_wider_search() {
        let store = InMemoryDocumentStore::new(vec![passage(
            "fab_q3_2024.pdf",
            "Q3",
            2024,
            "Net Profit AED 3,689 million",
        )]);
        let executor = executor(store, MockGateway::new());

        // Wrong year: exact search is empty, dropping the year finds it.
        let step = Step::retrieve("Find net profit figures")
            .with_param("quarter", json!("Q3"))
            .with_param("year", json!(2019));

        let (_, passages) = executor
            .execute(&step, &AccumulatedContext::new(), Deadline::none())
            .await
            .unwrap();
        assert_eq!(passages.len(), 1);
    }

    #[tokio::test]
    async fn empty_corpus_yields_empty_list_not_error() {
        let executor = executor(InMemoryDocumentStore::empty(), MockGateway::new());

        let step = Step::retrieve("Find net profit figures").with_param("quarter", json!("Q3"));
        let (_, passages) = executor
            .execute(&step, &AccumulatedContext::new(), Deadline::none())
            .await
            .unwrap();
        assert!(passages.is_empty());
    }

    #[tokio::test]
    async fn gateway_spec_drives_the_search() {
        let store = InMemoryDocumentStore::new(vec![passage(
            "fab_q3_2024.pdf",
            "Q3",
            2024,
            "Net Profit AED 3,689 million",
        )]);
        let gateway = MockGateway::new();
        gateway.push_response(
            r#"{"search_query": "net profit after tax", "filters": {"quarter": "Q3", "year": 2024}}"#,
        );

        let executor = executor(store, gateway);
        let step = Step::retrieve("Net Profit After Tax for Q3 2024");

        let (query, passages) = executor
            .execute(&step, &AccumulatedContext::new(), Deadline::none())
            .await
            .unwrap();
        assert_eq!(query, "net profit after tax");
        assert_eq!(passages.len(), 1);
    }

    #[tokio::test]
    async fn gateway_failure_degrades_to_description_patterns() {
        let store = InMemoryDocumentStore::new(vec![passage(
            "fab_q3_2024.pdf",
            "Q3",
            2024,
            "Net Profit AED 3,689 million",
        )]);
        // Unscripted gateway -> content error -> description fallback.
        let executor = executor(store, MockGateway::new());
        let step = Step::retrieve("Net Profit After Tax for Q3 2024");

        let (query, passages) = executor
            .execute(&step, &AccumulatedContext::new(), Deadline::none())
            .await
            .unwrap();
        assert!(query.contains("Net Profit"));
        assert_eq!(passages.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_passages_are_removed() {
        let store = InMemoryDocumentStore::new(vec![
            passage("a.pdf", "Q3", 2024, "Net Profit AED 3,689 million"),
            passage("b.pdf", "Q3", 2024, "Net Profit AED 3,689 million"),
        ]);
        let executor = executor(store, MockGateway::new());

        let step = Step::retrieve("net profit").with_param("quarter", json!("Q3"));
        let (_, passages) = executor
            .execute(&step, &AccumulatedContext::new(), Deadline::none())
            .await
            .unwrap();
        assert_eq!(passages.len(), 1);
    }

    #[test]
    fn fallback_stages_widen_monotonically() {
        let filters = SearchFilters {
            document_type: Some("financial_statement".to_string()),
            quarter: Some("Q3".to_string()),
            year: Some(2024),
            section_name: Some("income_statement".to_string()),
        };

        let stages = fallback_stages(&filters);
        assert_eq!(stages.len(), 5);
        assert!(stages[0].as_ref().unwrap().section_name.is_some());
        assert!(stages[1].as_ref().unwrap().section_name.is_none());
        assert!(stages[2].as_ref().unwrap().year.is_none());
        assert!(stages[3].as_ref().unwrap().document_type.is_none());
        assert!(stages[4].is_none());
    }

    #[test]
    fn redundant_stages_are_collapsed() {
        // Only a quarter filter: dropping section/year/doc-type changes
        // nothing, so just two stages remain.
        let filters = SearchFilters {
            quarter: Some("Q3".to_string()),
            ..Default::default()
        };
        let stages = fallback_stages(&filters);
        assert_eq!(stages.len(), 2);
        assert!(stages[1].is_none());
    }

    #[tokio::test]
    async fn relaxing_filters_never_shrinks_results() {
        // Monotonicity over a fixed corpus.
        let store = InMemoryDocumentStore::new(vec![
            passage("a.pdf", "Q3", 2023, "Net Profit AED 3,200 million"),
            passage("b.pdf", "Q3", 2024, "Net Profit AED 3,689 million"),
            passage("c.pdf", "Q2", 2024, "Net Profit AED 3,500 million"),
        ]);

        let strict = SearchFilters {
            quarter: Some("Q3".to_string()),
            year: Some(2024),
            ..Default::default()
        };

        let mut previous = 0;
        for stage in fallback_stages(&strict) {
            let count = store
                .search("net profit", stage.as_ref(), 10)
                .await
                .unwrap()
                .len();
            assert!(count >= previous);
            previous = count;
        }
    }
}
