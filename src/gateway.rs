//! Language-model gateway
//!
//! Narrow contract consumed by the planner, executors and synthesizer:
//! a structured prompt in, a free-text or JSON-shaped completion out.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

/// Expected shape of the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    FreeText,
    StructuredJson,
}

#[async_trait]
pub trait LanguageModelGateway: Send + Sync {
    async fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String>;
}

/// Issue a completion, retrying exactly once on a transient failure.
/// Content errors surface immediately to the calling component.
pub async fn complete_with_retry(
    gateway: &dyn LanguageModelGateway,
    prompt: &str,
    format: ResponseFormat,
) -> Result<String> {
    match gateway.complete(prompt, format).await {
        Err(e) if e.is_transient() => {
            warn!(error = %e, "Gateway call failed transiently - retrying once");
            gateway.complete(prompt, format).await
        }
        other => other,
    }
}

/// Strip a markdown code fence the model may have wrapped around JSON.
pub fn strip_code_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

//
// ================= Gemini implementation =================
//

/// Reusable Gemini client (connection-pooled)
pub struct GeminiGateway {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiGateway {
    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent".to_string(),
        })
    }

    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").unwrap_or_default();
        Self::new(api_key)
    }
}

#[async_trait]
impl LanguageModelGateway for GeminiGateway {
    async fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::GatewayContent(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.base_url, self.api_key);

        let response_mime_type = match format {
            ResponseFormat::FreeText => None,
            ResponseFormat::StructuredJson => Some("application/json".to_string()),
        };

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 2048,
                response_mime_type,
            },
        };

        info!(format = ?format, "Calling Gemini API");

        let response = self.client.post(&url).json(&request).send().await.map_err(|e| {
            error!("Gemini API request failed: {}", e);
            // Connection failures and client-side timeouts are retryable.
            OrchestrationError::GatewayTransient(format!("Gemini request error: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = %status, "Gemini API error response: {}", error_text);

            let message = format!("Gemini API returned {}: {}", status, error_text);
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(OrchestrationError::GatewayTransient(message))
            } else {
                Err(OrchestrationError::GatewayContent(message))
            };
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::GatewayContent(format!("Gemini parse error: {}", e))
        })?;

        let text = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| {
                OrchestrationError::GatewayContent("Empty response from Gemini".to_string())
            })?;

        match format {
            ResponseFormat::FreeText => Ok(text),
            ResponseFormat::StructuredJson => Ok(strip_code_fences(&text).to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

//
// ================= Mock implementation =================
//

/// Scripted gateway for development & testing.
/// Keeps the pipeline functional without LLM dependency.
pub struct MockGateway {
    responses: Mutex<VecDeque<Result<String>>>,
    default_response: Option<String>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: None,
        }
    }

    /// Returned when the scripted queue is empty.
    pub fn with_default(default_response: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: Some(default_response.into()),
        }
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(response.into()));
    }

    pub fn push_error(&self, error: OrchestrationError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModelGateway for MockGateway {
    async fn complete(&self, _prompt: &str, _format: ResponseFormat) -> Result<String> {
        if let Some(next) = self.responses.lock().unwrap().pop_front() {
            return next;
        }
        match &self.default_response {
            Some(text) => Ok(text.clone()),
            None => Err(OrchestrationError::GatewayContent(
                "MockGateway has no scripted response".to_string(),
            )),
        }
    }
}
