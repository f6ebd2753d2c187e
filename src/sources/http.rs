//! HTTP-backed data source
//!
//! `GET {base}/bank`, `/documents`, `/cibil` and `/experian`, each keyed by
//! `?applicant_id=`. Uses one pooled client for all endpoints.

use super::{
    credit_endpoint, parse_bank_payload, parse_credit_payload, parse_documents_payload, DataSource,
};
use crate::error::UnderwritingError;
use crate::models::{BankAccountRecord, CreditProvider, CreditReport, DocumentBundle};
use crate::Result;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct HttpDataSource {
    client: Client,
    base_url: String,
}

impl HttpDataSource {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, endpoint: &str, applicant_id: &str) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!(%url, applicant_id, "Fetching from data source");

        let response = self
            .client
            .get(&url)
            .query(&[("applicant_id", applicant_id)])
            .send()
            .await
            .map_err(|e| UnderwritingError::transient(endpoint, format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(endpoint, status, &body));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| UnderwritingError::transient(endpoint, format!("invalid JSON response: {}", e)))
    }
}

/// Server errors and throttling are retried; other statuses are not.
fn classify_status(endpoint: &str, status: StatusCode, body: &str) -> UnderwritingError {
    let message = format!("{} returned {}: {}", endpoint, status, body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        UnderwritingError::transient(endpoint, message)
    } else {
        UnderwritingError::ExecutionError(message)
    }
}

#[async_trait::async_trait]
impl DataSource for HttpDataSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_bank_account(&self, applicant_id: &str) -> Result<BankAccountRecord> {
        let payload = self.get_json("bank", applicant_id).await?;
        parse_bank_payload(&payload, "bank")
    }

    async fn fetch_documents(&self, applicant_id: &str) -> Result<DocumentBundle> {
        let payload = self.get_json("documents", applicant_id).await?;
        parse_documents_payload(&payload, "documents")
    }

    async fn fetch_credit_report(
        &self,
        applicant_id: &str,
        provider: CreditProvider,
    ) -> Result<CreditReport> {
        let endpoint = credit_endpoint(provider);
        let payload = self.get_json(endpoint, applicant_id).await?;
        parse_credit_payload(&payload, provider, endpoint)
    }
}
