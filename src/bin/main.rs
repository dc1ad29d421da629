//! Demo entry point for the financial query orchestrator.
//!
//! With `GEMINI_API_KEY` and `DOCUMENT_STORE_BASE_URL` set, the real
//! gateway and store are used. Without them the pipeline runs against a
//! small seeded corpus and a scripted gateway, so the full flow can be
//! exercised offline.

use financial_query_orchestrator::models::{ContentType, PassageMetadata, RetrievedPassage};
use financial_query_orchestrator::{
    DocumentStore, GeminiGateway, HttpDocumentStore, InMemoryDocumentStore, LanguageModelGateway,
    LlmPlanner, MockGateway, Orchestrator, OrchestratorConfig, Result,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::from_env();

    let gateway: Arc<dyn LanguageModelGateway> = match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.is_empty() => {
            info!("Using Gemini gateway");
            Arc::new(GeminiGateway::new(key)?)
        }
        _ => {
            info!("GEMINI_API_KEY not set - using scripted mock gateway");
            Arc::new(demo_gateway())
        }
    };

    let store: Arc<dyn DocumentStore> = match HttpDocumentStore::from_env() {
        Some(store) => {
            info!("Using HTTP document store");
            Arc::new(store)
        }
        None => {
            info!("DOCUMENT_STORE_BASE_URL not set - using seeded in-memory store");
            Arc::new(demo_store())
        }
    };

    let planner = Box::new(LlmPlanner::new(gateway.clone()));
    let orchestrator = Orchestrator::new(planner, gateway, store, config);

    let question = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Compare net profit Q3 2023 vs Q3 2024".to_string());

    info!(%question, "Analyzing query");
    let result = orchestrator.analyze_query(&question).await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Scripted responses matching the default demo question: calculation
/// input extraction first, then the synthesized answer.
fn demo_gateway() -> MockGateway {
    let gateway =
        MockGateway::with_default("The mock gateway has no scripted response for this prompt.");
    gateway.push_response(r#"{"net_profit_q3_2023": 3200, "net_profit_q3_2024": 3689}"#);
    gateway.push_response(
        "FAB's net profit grew from AED 3,200 million in Q3 2023 to AED 3,689 million \
         in Q3 2024, a year-over-year increase of 15.28%.",
    );
    gateway
}

fn demo_store() -> InMemoryDocumentStore {
    InMemoryDocumentStore::new(vec![
        seed_passage(
            "fab_q3_2023_financial_statement.pdf",
            "Q3",
            2023,
            "Net Profit After Tax for the quarter was AED 3,200 million, supported by \
             growth in net interest income.",
        ),
        seed_passage(
            "fab_q3_2024_financial_statement.pdf",
            "Q3",
            2024,
            "Net Profit After Tax for the quarter was AED 3,689 million, reflecting \
             continued balance sheet momentum.",
        ),
        seed_passage(
            "fab_q3_2024_earnings_presentation.pdf",
            "Q3",
            2024,
            "Total deposits reached AED 812,400 million with a loan-to-deposit ratio \
             within management's target range.",
        ),
    ])
}

fn seed_passage(filename: &str, quarter: &str, year: i32, content: &str) -> RetrievedPassage {
    let document_type = if filename.contains("presentation") {
        "earnings_presentation"
    } else {
        "financial_statement"
    };

    RetrievedPassage {
        content: content.to_string(),
        metadata: PassageMetadata {
            document_type: document_type.to_string(),
            filename: filename.to_string(),
            quarter: Some(quarter.to_string()),
            year: Some(year),
            section_name: Some("income_statement".to_string()),
            page_number: Some(3),
            chunk_id: format!("{}-p3", filename),
            content_type: ContentType::Text,
        },
        similarity_score: 0.0,
    }
}
