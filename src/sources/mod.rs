//! External data sources: bank accounts, documents and credit bureaus
//!
//! The workflow only sees the `DataSource` trait. Responses are validated
//! here; a malformed payload is reported as a transient provider error so the
//! step executor retries it.

pub mod http;

pub use http::HttpDataSource;

use crate::error::UnderwritingError;
use crate::models::{
    BankAccount, BankAccountRecord, CreditProvider, CreditReport, DocumentBundle, DocumentMeta,
    Provenance, MAX_CREDIT_SCORE, MIN_CREDIT_SCORE,
};
use crate::Result;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_bank_account(&self, applicant_id: &str) -> Result<BankAccountRecord>;
    async fn fetch_documents(&self, applicant_id: &str) -> Result<DocumentBundle>;
    async fn fetch_credit_report(
        &self,
        applicant_id: &str,
        provider: CreditProvider,
    ) -> Result<CreditReport>;
}

/// Endpoint name used for a credit provider slot.
pub fn credit_endpoint(provider: CreditProvider) -> &'static str {
    match provider {
        CreditProvider::Primary => "cibil",
        CreditProvider::Fallback => "experian",
    }
}

pub fn bureau_name(provider: CreditProvider) -> &'static str {
    match provider {
        CreditProvider::Primary => "CIBIL",
        CreditProvider::Fallback => "Experian",
    }
}

//
// ================= Payload Validation =================
//

pub(crate) fn parse_bank_payload(payload: &Value, source: &str) -> Result<BankAccountRecord> {
    let accounts = payload
        .get("accounts")
        .and_then(Value::as_array)
        .ok_or_else(|| UnderwritingError::transient(source, "bank response missing 'accounts' list"))?;

    let accounts = accounts
        .iter()
        .map(|raw| serde_json::from_value::<BankAccount>(raw.clone()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| UnderwritingError::transient(source, format!("malformed account entry: {}", e)))?;

    Ok(BankAccountRecord {
        accounts,
        provenance: Provenance::now(source),
    })
}

pub(crate) fn parse_documents_payload(payload: &Value, source: &str) -> Result<DocumentBundle> {
    let documents = payload
        .get("documents")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            UnderwritingError::transient(source, "documents response missing 'documents' list")
        })?;

    let documents = documents
        .iter()
        .map(|raw| serde_json::from_value::<DocumentMeta>(raw.clone()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| UnderwritingError::transient(source, format!("malformed document entry: {}", e)))?;

    Ok(DocumentBundle {
        documents,
        provenance: Provenance::now(source),
    })
}

pub(crate) fn parse_credit_payload(
    payload: &Value,
    provider: CreditProvider,
    source: &str,
) -> Result<CreditReport> {
    let bureau = bureau_name(provider);

    let score = payload
        .get("score")
        .and_then(Value::as_f64)
        .ok_or_else(|| UnderwritingError::transient(source, format!("{} response missing 'score'", bureau)))?;

    if !(f64::from(MIN_CREDIT_SCORE)..=f64::from(MAX_CREDIT_SCORE)).contains(&score) {
        return Err(UnderwritingError::transient(
            source,
            format!("invalid credit score from {}: {}", bureau, score),
        ));
    }

    Ok(CreditReport {
        score: score.round() as u16,
        bureau: bureau.to_string(),
        provider,
        data_quality: "validated".to_string(),
        provenance: Provenance::now(source),
    })
}

//
// ================= Mock Source =================
//

/// Number of leading calls each mock endpoint fails before succeeding.
/// `u32::MAX` makes an endpoint fail forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockFailures {
    pub bank: u32,
    pub documents: u32,
    pub primary_credit: u32,
    pub fallback_credit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEndpoint {
    Bank,
    Documents,
    PrimaryCredit,
    FallbackCredit,
}

/// Deterministic in-process source for demos and tests.
pub struct MockDataSource {
    failures: MockFailures,
    balance: f64,
    primary_score: u16,
    fallback_score: u16,
    latency: Option<Duration>,
    bank_calls: AtomicU32,
    document_calls: AtomicU32,
    primary_calls: AtomicU32,
    fallback_calls: AtomicU32,
}

impl MockDataSource {
    pub fn new() -> Self {
        Self {
            failures: MockFailures::default(),
            balance: 25_000.0,
            primary_score: 742,
            fallback_score: 718,
            latency: None,
            bank_calls: AtomicU32::new(0),
            document_calls: AtomicU32::new(0),
            primary_calls: AtomicU32::new(0),
            fallback_calls: AtomicU32::new(0),
        }
    }

    pub fn with_failures(mut self, failures: MockFailures) -> Self {
        self.failures = failures;
        self
    }

    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = balance;
        self
    }

    /// Scores outside 300..=850 are served as-is, to exercise validation.
    pub fn with_scores(mut self, primary: u16, fallback: u16) -> Self {
        self.primary_score = primary;
        self.fallback_score = fallback;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self, endpoint: MockEndpoint) -> u32 {
        self.counter(endpoint).load(Ordering::SeqCst)
    }

    fn counter(&self, endpoint: MockEndpoint) -> &AtomicU32 {
        match endpoint {
            MockEndpoint::Bank => &self.bank_calls,
            MockEndpoint::Documents => &self.document_calls,
            MockEndpoint::PrimaryCredit => &self.primary_calls,
            MockEndpoint::FallbackCredit => &self.fallback_calls,
        }
    }

    fn failure_budget(&self, endpoint: MockEndpoint) -> u32 {
        match endpoint {
            MockEndpoint::Bank => self.failures.bank,
            MockEndpoint::Documents => self.failures.documents,
            MockEndpoint::PrimaryCredit => self.failures.primary_credit,
            MockEndpoint::FallbackCredit => self.failures.fallback_credit,
        }
    }

    async fn call(&self, endpoint: MockEndpoint, source: &str) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let previous = self.counter(endpoint).fetch_add(1, Ordering::SeqCst);
        if previous < self.failure_budget(endpoint) {
            return Err(UnderwritingError::transient(
                source,
                format!("simulated outage (call {})", previous + 1),
            ));
        }
        Ok(())
    }
}

impl Default for MockDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DataSource for MockDataSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch_bank_account(&self, applicant_id: &str) -> Result<BankAccountRecord> {
        self.call(MockEndpoint::Bank, "mock-bank").await?;
        parse_bank_payload(
            &json!({
                "accounts": [
                    {
                        "account_id": format!("{}-savings", applicant_id),
                        "account_type": "savings",
                        "balance": self.balance,
                    }
                ]
            }),
            "mock-bank",
        )
    }

    async fn fetch_documents(&self, applicant_id: &str) -> Result<DocumentBundle> {
        self.call(MockEndpoint::Documents, "mock-documents").await?;
        parse_documents_payload(
            &json!({
                "documents": [
                    { "document_id": format!("{}-id", applicant_id), "doc_type": "identity", "verified": true },
                    { "document_id": format!("{}-payslip", applicant_id), "doc_type": "payslip", "verified": true },
                ]
            }),
            "mock-documents",
        )
    }

    async fn fetch_credit_report(
        &self,
        _applicant_id: &str,
        provider: CreditProvider,
    ) -> Result<CreditReport> {
        let (endpoint, score) = match provider {
            CreditProvider::Primary => (MockEndpoint::PrimaryCredit, self.primary_score),
            CreditProvider::Fallback => (MockEndpoint::FallbackCredit, self.fallback_score),
        };
        let source = format!("mock-{}", credit_endpoint(provider));

        self.call(endpoint, &source).await?;
        parse_credit_payload(&json!({ "score": score }), provider, &source)
    }
}
