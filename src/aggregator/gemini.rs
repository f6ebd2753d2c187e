//! Gemini-backed narrative aggregator
//!
//! Calls the Generative Language API through a long-lived, pooled reqwest client.

use super::{build_prompt, recommendation_from_text, AggregationContext, NarrativeAggregator, SYSTEM_PROMPT};
use crate::error::UnderwritingError;
use crate::models::Recommendation;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/{}:generateContent", GEMINI_BASE_URL, model),
        })
    }

    pub async fn generate(&self, prompt: &str, system_prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(UnderwritingError::ConfigError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

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
                max_output_tokens: 768,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            },
        };

        info!(endpoint = %self.endpoint, "Calling Gemini API");

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                UnderwritingError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(UnderwritingError::LlmError(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            UnderwritingError::LlmError(format!("Gemini parse error: {}", e))
        })?;

        let candidate = gemini_response
            .candidates
            .first()
            .ok_or_else(|| UnderwritingError::LlmError("No candidates from Gemini".to_string()))?;

        let answer = candidate
            .content
            .parts
            .first()
            .ok_or_else(|| UnderwritingError::LlmError("Empty response from Gemini".to_string()))?
            .text
            .clone();

        info!(
            finish_reason = candidate.finish_reason.as_deref().unwrap_or("unknown"),
            "Gemini response received"
        );

        Ok(answer)
    }
}

pub struct GeminiAggregator {
    client: GeminiClient,
}

impl GeminiAggregator {
    pub fn new(api_key: String, model: &str) -> Result<Self> {
        Ok(Self {
            client: GeminiClient::new(api_key, model)?,
        })
    }
}

#[async_trait]
impl NarrativeAggregator for GeminiAggregator {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn summarize(&self, context: &AggregationContext) -> Result<Recommendation> {
        let text = self
            .client
            .generate(&build_prompt(context), SYSTEM_PROMPT)
            .await?;
        recommendation_from_text(self.name(), &text, context)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
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
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_api_field_names() {
        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: "Summarize applicant A1".to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 768,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: SYSTEM_PROMPT.to_string(),
                }],
            },
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("Summarize applicant A1"));
        assert!(json.contains("generationConfig"));
        assert!(json.contains("maxOutputTokens"));
    }

    #[tokio::test]
    async fn test_empty_key_is_config_error() {
        let client = GeminiClient::new(String::new(), "gemini-2.0-flash").unwrap();
        let err = client.generate("hi", SYSTEM_PROMPT).await.unwrap_err();
        assert!(matches!(err, UnderwritingError::ConfigError(_)));
    }
}
