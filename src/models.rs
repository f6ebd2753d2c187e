//! Core data models for the underwriting orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::UnderwritingError;
use crate::Result;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    #[default]
    PersonalLoan,
    HomeLoan,
    AutoLoan,
    BusinessLoan,
}

/// Which credit bureau slot served a report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CreditProvider {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentKind {
    Income,
    Expense,
    Credit,
}

/// Whether a suggested decision was read from model output or derived by rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Model,
    Rules,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Review,
    Cancellation,
}

/// Named stage of an orchestration instance.
///
/// `Failed` ranks above every other phase so that moving into it never
/// counts as a regression.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    FetchingData,
    Assessing,
    Aggregating,
    AwaitingReview,
    Finalizing,
    Completed,
    Failed,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Created,
        Phase::FetchingData,
        Phase::Assessing,
        Phase::Aggregating,
        Phase::AwaitingReview,
        Phase::Finalizing,
        Phase::Completed,
        Phase::Failed,
    ];

    pub fn rank(&self) -> u8 {
        match self {
            Phase::Created => 0,
            Phase::FetchingData => 1,
            Phase::Assessing => 2,
            Phase::Aggregating => 3,
            Phase::AwaitingReview => 4,
            Phase::Finalizing => 5,
            Phase::Completed => 6,
            Phase::Failed => 7,
        }
    }

    /// The phase that follows on the happy path, if any.
    pub fn successor(&self) -> Option<Phase> {
        match self {
            Phase::Created => Some(Phase::FetchingData),
            Phase::FetchingData => Some(Phase::Assessing),
            Phase::Assessing => Some(Phase::Aggregating),
            Phase::Aggregating => Some(Phase::AwaitingReview),
            Phase::AwaitingReview => Some(Phase::Finalizing),
            Phase::Finalizing => Some(Phase::Completed),
            Phase::Completed | Phase::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Phases a restarted engine must pick up and drive again.
    /// `AwaitingReview` is excluded: it is parked until a signal arrives.
    pub fn needs_driving(&self) -> bool {
        !self.is_terminal() && *self != Phase::AwaitingReview
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        if next == Phase::Failed {
            return !self.is_terminal();
        }
        self.successor() == Some(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::FetchingData => "fetching_data",
            Phase::Assessing => "assessing",
            Phase::Aggregating => "aggregating",
            Phase::AwaitingReview => "awaiting_review",
            Phase::Finalizing => "finalizing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|phase| phase.as_str() == value)
    }
}

//
// ================= Application =================
//

/// Loan application submitted by a caller. Immutable once an instance starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoanApplication {
    #[serde(alias = "applicantId")]
    pub applicant_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub amount: f64,
    pub income: f64,
    #[serde(default)]
    pub expenses: Option<f64>,
    #[serde(default, alias = "productType")]
    pub product_type: ProductType,
}

impl LoanApplication {
    /// Required-field validation, run before any phase begins.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.applicant_id.trim().is_empty() {
            problems.push("applicant_id must not be empty".to_string());
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                problems.push("name must not be blank when provided".to_string());
            }
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            problems.push(format!("amount must be positive, got {}", self.amount));
        }
        if !self.income.is_finite() || self.income < 0.0 {
            problems.push(format!("income must be non-negative, got {}", self.income));
        }
        if let Some(expenses) = self.expenses {
            if !expenses.is_finite() || expenses < 0.0 {
                problems.push(format!("expenses must be non-negative, got {}", expenses));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(UnderwritingError::ValidationError(problems.join("; ")))
        }
    }
}

//
// ================= Fetched Records =================
//

/// Where and when an external record was obtained.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

impl Provenance {
    pub fn now(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BankAccount {
    pub account_id: String,
    #[serde(default)]
    pub account_type: Option<String>,
    pub balance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BankAccountRecord {
    pub accounts: Vec<BankAccount>,
    pub provenance: Provenance,
}

impl BankAccountRecord {
    /// Balance of the first listed account, which the income heuristic reads.
    pub fn primary_balance(&self) -> f64 {
        self.accounts.first().map(|a| a.balance).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMeta {
    pub document_id: String,
    pub doc_type: String,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentBundle {
    pub documents: Vec<DocumentMeta>,
    pub provenance: Provenance,
}

pub const MIN_CREDIT_SCORE: u16 = 300;
pub const MAX_CREDIT_SCORE: u16 = 850;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditReport {
    pub score: u16,
    pub bureau: String,
    pub provider: CreditProvider,
    pub data_quality: String,
    pub provenance: Provenance,
}

//
// ================= Assessment =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssessmentResult {
    pub kind: AssessmentKind,
    pub passed: bool,
    pub value: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assessments {
    pub income: AssessmentResult,
    pub expense: AssessmentResult,
    pub credit: AssessmentResult,
}

impl Assessments {
    pub fn all_passed(&self) -> bool {
        self.income.passed && self.expense.passed && self.credit.passed
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssessmentResult> {
        [&self.income, &self.expense, &self.credit].into_iter()
    }
}

//
// ================= Decisions =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub decision: Decision,
    pub narrative: String,
    pub aggregator: String,
    pub decision_source: DecisionSource,
    pub produced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanDecision {
    pub decision: Decision,
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
    pub source: SignalSource,
}

//
// ================= Execution Trail =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

/// One Step Executor invocation, retained on the instance for auditing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step: String,
    pub provider: Option<String>,
    pub attempts: u32,
    pub status: StepStatus,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureReason {
    pub code: String,
    pub message: String,
    pub phase: Phase,
    pub failed_at: DateTime<Utc>,
}

/// Frozen outcome of a completed instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalRecord {
    pub application: LoanApplication,
    pub credit_provider: CreditProvider,
    pub assessments: Assessments,
    pub recommendation: Recommendation,
    pub human_decision: HumanDecision,
    pub finalized_at: DateTime<Utc>,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for CreditProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CreditProvider::Primary => "primary",
            CreditProvider::Fallback => "fallback",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProductType::PersonalLoan => "Personal Loan",
            ProductType::HomeLoan => "Home Loan",
            ProductType::AutoLoan => "Auto Loan",
            ProductType::BusinessLoan => "Business Loan",
        };
        write!(f, "{}", s)
    }
}
