//! Document store contract and implementations
//!
//! The store is an external collaborator: given a query string and
//! optional metadata filters it returns similarity-ranked passages.
//! Lower `similarity_score` means closer (distance semantics).

use crate::error::OrchestrationError;
use crate::models::RetrievedPassage;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::time::Duration;
use tracing::debug;

/// Metadata constraints for a search. Relaxed progressively by the
/// retrieval executor when a search comes back empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub document_type: Option<String>,
    pub quarter: Option<String>,
    pub year: Option<i32>,
    pub section_name: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.document_type.is_none()
            && self.quarter.is_none()
            && self.year.is_none()
            && self.section_name.is_none()
    }

    pub fn matches(&self, passage: &RetrievedPassage) -> bool {
        let meta = &passage.metadata;

        if let Some(document_type) = &self.document_type {
            if !meta.document_type.eq_ignore_ascii_case(document_type) {
                return false;
            }
        }
        if let Some(quarter) = &self.quarter {
            if meta
                .quarter
                .as_deref()
                .map(|q| !q.eq_ignore_ascii_case(quarter))
                .unwrap_or(true)
            {
                return false;
            }
        }
        if let Some(year) = self.year {
            if meta.year != Some(year) {
                return false;
            }
        }
        if let Some(section_name) = &self.section_name {
            if meta
                .section_name
                .as_deref()
                .map(|s| !s.eq_ignore_ascii_case(section_name))
                .unwrap_or(true)
            {
                return false;
            }
        }

        true
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Top-`limit` passages matching `query` under the given filters,
    /// ranked by ascending distance.
    async fn search(
        &self,
        query: &str,
        filters: Option<&SearchFilters>,
        limit: usize,
    ) -> Result<Vec<RetrievedPassage>>;
}

//
// ================= HTTP-backed store =================
//

/// Client for a vector-search backend exposing a POST /search endpoint.
pub struct HttpDocumentStore {
    client: Client,
    base_url: String,
}

impl HttpDocumentStore {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_env() -> Option<Self> {
        let base_url = env::var("DOCUMENT_STORE_BASE_URL").ok()?;
        Self::new(base_url).ok()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RetrievedPassage>,
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn search(
        &self,
        query: &str,
        filters: Option<&SearchFilters>,
        limit: usize,
    ) -> Result<Vec<RetrievedPassage>> {
        let url = format!("{}/search", self.base_url);
        let body = json!({
            "query": query,
            "filters": filters,
            "n_results": limit,
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::Store(format!("Document store request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OrchestrationError::Store(format!(
                "Document store returned {}: {}",
                status, text
            )));
        }

        let parsed: SearchResponse = response.json().await.map_err(|e| {
            OrchestrationError::Store(format!("Invalid document store response: {}", e))
        })?;

        debug!(
            query = %query,
            results = parsed.results.len(),
            "Document store search complete"
        );

        Ok(parsed.results)
    }
}

//
// ================= In-memory store =================
//

/// Keyword-overlap store for development & testing. Scoring follows the
/// distance convention: more query terms matched, lower score.
pub struct InMemoryDocumentStore {
    passages: Vec<RetrievedPassage>,
}

impl InMemoryDocumentStore {
    pub fn new(passages: Vec<RetrievedPassage>) -> Self {
        Self { passages }
    }

    pub fn empty() -> Self {
        Self {
            passages: Vec::new(),
        }
    }

    fn score(query_terms: &[String], content: &str) -> Option<f64> {
        let content_lower = content.to_lowercase();
        let matched = query_terms
            .iter()
            .filter(|term| content_lower.contains(term.as_str()))
            .count();

        if matched == 0 {
            return None;
        }

        Some(1.0 / (1.0 + matched as f64))
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn search(
        &self,
        query: &str,
        filters: Option<&SearchFilters>,
        limit: usize,
    ) -> Result<Vec<RetrievedPassage>> {
        let query_terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() > 2)
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let mut scored: Vec<RetrievedPassage> = self
            .passages
            .iter()
            .filter(|p| filters.map(|f| f.matches(p)).unwrap_or(true))
            .filter_map(|p| {
                Self::score(&query_terms, &p.content).map(|score| {
                    let mut passage = p.clone();
                    passage.similarity_score = score;
                    passage
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            a.similarity_score
                .partial_cmp(&b.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);

        Ok(scored)
    }
}
