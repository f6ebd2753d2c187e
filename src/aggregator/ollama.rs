//! Ollama-backed narrative aggregator (`POST {url}/api/generate`, non-streaming)

use super::{build_prompt, recommendation_from_text, AggregationContext, NarrativeAggregator, SYSTEM_PROMPT};
use crate::error::UnderwritingError;
use crate::models::Recommendation;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

pub struct OllamaAggregator {
    client: Client,
    endpoint: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    system: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaAggregator {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl NarrativeAggregator for OllamaAggregator {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn summarize(&self, context: &AggregationContext) -> Result<Recommendation> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(context),
            system: SYSTEM_PROMPT,
            stream: false,
        };

        info!(model = %self.model, "Calling Ollama");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| UnderwritingError::LlmError(format!("Ollama request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "Ollama error response: {}", body);
            return Err(UnderwritingError::LlmError(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| UnderwritingError::LlmError(format!("Ollama parse error: {}", e)))?;

        recommendation_from_text(self.name(), &generated.response, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::context;
    use crate::models::{Decision, DecisionSource};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_summarize_against_local_server() {
        let router = Router::new().route(
            "/api/generate",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["stream"], json!(false));
                Json(json!({
                    "model": body["model"],
                    "response": "Income and credit are solid.\nSuggested decision: APPROVE",
                    "done": true
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let aggregator = OllamaAggregator::new(&format!("http://{}/", addr), "llama3:latest").unwrap();
        let rec = aggregator.summarize(&context(Decision::Reject)).await.unwrap();

        assert_eq!(rec.decision, Decision::Approve);
        assert_eq!(rec.decision_source, DecisionSource::Model);
        assert_eq!(rec.aggregator, "ollama");
    }
}
