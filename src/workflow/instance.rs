//! Orchestration instance: the persisted aggregate for one application
//!
//! All mutation goes through methods here so the phase and single-decision
//! invariants hold no matter which caller drives the instance.

use crate::error::UnderwritingError;
use crate::models::{
    Assessments, BankAccountRecord, CreditProvider, CreditReport, Decision, DocumentBundle,
    FailureReason, FinalRecord, HumanDecision, LoanApplication, Phase, Recommendation, StepRecord,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationInstance {
    pub instance_id: Uuid,
    pub application: LoanApplication,
    pub phase: Phase,
    pub bank: Option<BankAccountRecord>,
    pub documents: Option<DocumentBundle>,
    pub credit: Option<CreditReport>,
    pub assessments: Option<Assessments>,
    pub recommendation: Option<Recommendation>,
    pub human_decision: Option<HumanDecision>,
    pub final_record: Option<FinalRecord>,
    pub record_hash: Option<String>,
    pub audit_id: Option<Uuid>,
    pub failure: Option<FailureReason>,
    pub steps: Vec<StepRecord>,
    /// Incremented on every checkpoint; used for optimistic concurrency.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub review_started_at: Option<DateTime<Utc>>,
}

impl OrchestrationInstance {
    pub fn new(application: LoanApplication) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::new_v4(),
            application,
            phase: Phase::Created,
            bank: None,
            documents: None,
            credit: None,
            assessments: None,
            recommendation: None,
            human_decision: None,
            final_record: None,
            record_hash: None,
            audit_id: None,
            failure: None,
            steps: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            review_started_at: None,
        }
    }

    pub fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(UnderwritingError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        if next == Phase::AwaitingReview && self.recommendation.is_none() {
            return Err(UnderwritingError::StateError(
                "cannot await review without a recommendation".to_string(),
            ));
        }

        self.phase = next;
        self.updated_at = Utc::now();
        if next == Phase::AwaitingReview {
            self.review_started_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Move to `Failed`, recording the phase the failure happened in.
    pub fn fail_with(&mut self, code: &str, message: String) -> Result<()> {
        let phase = self.phase;
        self.transition(Phase::Failed)?;
        self.failure = Some(FailureReason {
            code: code.to_string(),
            message,
            phase,
            failed_at: self.updated_at,
        });
        Ok(())
    }

    pub fn fail(&mut self, error: &UnderwritingError) -> Result<()> {
        self.fail_with(error.code(), error.to_string())
    }

    pub fn set_recommendation(&mut self, recommendation: Recommendation) -> Result<()> {
        if self.phase != Phase::Aggregating {
            return Err(UnderwritingError::InvalidTransition {
                from: self.phase,
                to: Phase::AwaitingReview,
            });
        }
        if self.recommendation.is_some() {
            return Err(UnderwritingError::StateError(format!(
                "recommendation for instance {} already produced",
                self.instance_id
            )));
        }
        self.recommendation = Some(recommendation);
        Ok(())
    }

    /// Accept a review or cancellation signal. Only valid while parked in
    /// `AwaitingReview` and only once.
    pub fn apply_human_decision(&mut self, decision: HumanDecision, signal: &str) -> Result<()> {
        if self.phase != Phase::AwaitingReview || self.human_decision.is_some() {
            return Err(UnderwritingError::InvalidSignalError {
                instance_id: self.instance_id,
                signal: signal.to_string(),
                phase: self.phase,
            });
        }
        self.human_decision = Some(decision);
        self.transition(Phase::Finalizing)
    }

    /// Build the frozen record. Repeated calls return the same record.
    pub fn freeze(&mut self) -> Result<FinalRecord> {
        if self.phase != Phase::Finalizing {
            return Err(UnderwritingError::InvalidTransition {
                from: self.phase,
                to: Phase::Completed,
            });
        }
        if let Some(existing) = &self.final_record {
            return Ok(existing.clone());
        }

        let missing = |what: &str| {
            UnderwritingError::StateError(format!(
                "instance {} cannot finalize without {}",
                self.instance_id, what
            ))
        };
        let record = FinalRecord {
            application: self.application.clone(),
            credit_provider: self.credit.as_ref().ok_or_else(|| missing("credit report"))?.provider,
            assessments: self.assessments.clone().ok_or_else(|| missing("assessments"))?,
            recommendation: self.recommendation.clone().ok_or_else(|| missing("recommendation"))?,
            human_decision: self.human_decision.clone().ok_or_else(|| missing("human decision"))?,
            finalized_at: Utc::now(),
        };

        self.final_record = Some(record.clone());
        Ok(record)
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            instance_id: self.instance_id,
            phase: self.phase,
            application: self.application.clone(),
            bank: self.bank.clone(),
            documents: self.documents.clone(),
            credit: self.credit.clone(),
            assessments: self.assessments.clone(),
            recommendation: self.recommendation.clone(),
            human_decision: self.human_decision.clone(),
            failure: self.failure.clone(),
            steps: self.steps.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn final_result(&self) -> Result<FinalResult> {
        let not_ready = || UnderwritingError::NotReadyError {
            instance_id: self.instance_id,
            phase: self.phase,
        };
        if self.phase != Phase::Completed {
            return Err(not_ready());
        }
        let record = self.final_record.as_ref().ok_or_else(not_ready)?;

        Ok(FinalResult {
            instance_id: self.instance_id,
            recommendation: record.recommendation.clone(),
            human_decision: record.human_decision.clone(),
            credit_provider: record.credit_provider,
            finalized_at: record.finalized_at,
            audit_id: self.audit_id,
            record_hash: self.record_hash.clone(),
        })
    }

    pub fn listing(&self) -> InstanceListing {
        InstanceListing {
            instance_id: self.instance_id,
            applicant_id: self.application.applicant_id.clone(),
            name: self.application.name.clone(),
            amount: self.application.amount,
            phase: self.phase,
            suggested_decision: self.recommendation.as_ref().map(|r| r.decision),
            human_decision: self.human_decision.as_ref().map(|h| h.decision),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

// ===== Query Views =====

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSummary {
    pub instance_id: Uuid,
    pub phase: Phase,
    pub application: LoanApplication,
    pub bank: Option<BankAccountRecord>,
    pub documents: Option<DocumentBundle>,
    pub credit: Option<CreditReport>,
    pub assessments: Option<Assessments>,
    pub recommendation: Option<Recommendation>,
    pub human_decision: Option<HumanDecision>,
    pub failure: Option<FailureReason>,
    pub steps: Vec<StepRecord>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalResult {
    pub instance_id: Uuid,
    pub recommendation: Recommendation,
    pub human_decision: HumanDecision,
    pub credit_provider: CreditProvider,
    pub finalized_at: DateTime<Utc>,
    pub audit_id: Option<Uuid>,
    pub record_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceListing {
    pub instance_id: Uuid,
    pub applicant_id: String,
    pub name: Option<String>,
    pub amount: f64,
    pub phase: Phase,
    pub suggested_decision: Option<Decision>,
    pub human_decision: Option<Decision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
