//! Income, expense and credit assessments
//!
//! Rules-based, side-effect free. The engine runs the three checks in
//! parallel on the blocking pool and joins them before the workflow advances.

use crate::error::UnderwritingError;
use crate::models::{
    AssessmentKind, AssessmentResult, Assessments, BankAccountRecord, CreditReport, Decision,
    LoanApplication,
};
use crate::Result;
use tracing::info;

/// Thresholds used by the assessment rules and the suggested-decision rule.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentPolicy {
    /// Income must exceed `amount * ratio`, unless the balance rule passes.
    pub income_to_amount_ratio: f64,
    pub min_account_balance: f64,
    pub min_credit_score: u16,
    /// Score above which a fully passing application is suggested for approval.
    pub approve_credit_score: u16,
    /// Expenses assumed when the applicant declares none.
    pub default_monthly_expenses: f64,
}

impl Default for AssessmentPolicy {
    fn default() -> Self {
        Self {
            income_to_amount_ratio: 2.0,
            min_account_balance: 5000.0,
            min_credit_score: 620,
            approve_credit_score: 650,
            default_monthly_expenses: 1000.0,
        }
    }
}

//
// ================= Rules =================
//

pub fn assess_income(
    application: &LoanApplication,
    bank: &BankAccountRecord,
    policy: &AssessmentPolicy,
) -> AssessmentResult {
    let ratio = application.income / application.amount.max(1.0);
    let balance = bank.primary_balance();
    let ratio_ok = ratio > policy.income_to_amount_ratio;
    let balance_ok = balance > policy.min_account_balance;

    let rationale = match (ratio_ok, balance_ok) {
        (true, _) => format!(
            "income/amount ratio {:.2} exceeds {:.2}",
            ratio, policy.income_to_amount_ratio
        ),
        (false, true) => format!(
            "income/amount ratio {:.2} is low but account balance {:.2} exceeds {:.2}",
            ratio, balance, policy.min_account_balance
        ),
        (false, false) => format!(
            "income/amount ratio {:.2} and account balance {:.2} are both below threshold",
            ratio, balance
        ),
    };

    AssessmentResult {
        kind: AssessmentKind::Income,
        passed: ratio_ok || balance_ok,
        value: application.income,
        rationale,
    }
}

pub fn assess_expense(application: &LoanApplication, policy: &AssessmentPolicy) -> AssessmentResult {
    let expenses = application
        .expenses
        .unwrap_or(policy.default_monthly_expenses);
    let disposable = application.income - expenses;
    let monthly_instalment = application.amount / 12.0;
    let passed = disposable > monthly_instalment;

    AssessmentResult {
        kind: AssessmentKind::Expense,
        passed,
        value: disposable,
        rationale: format!(
            "disposable income {:.2} {} amount/12 ({:.2})",
            disposable,
            if passed { "covers" } else { "does not cover" },
            monthly_instalment
        ),
    }
}

pub fn assess_credit(report: &CreditReport, policy: &AssessmentPolicy) -> AssessmentResult {
    let passed = report.score > policy.min_credit_score;

    AssessmentResult {
        kind: AssessmentKind::Credit,
        passed,
        value: f64::from(report.score),
        rationale: format!(
            "{} score {} is {} minimum {}",
            report.bureau,
            report.score,
            if passed { "above" } else { "at or below" },
            policy.min_credit_score
        ),
    }
}

/// Deterministic decision rule, also used when a model gives no parsable verdict.
pub fn suggest_decision(
    assessments: &Assessments,
    credit: &CreditReport,
    policy: &AssessmentPolicy,
) -> Decision {
    if assessments.all_passed() && credit.score > policy.approve_credit_score {
        Decision::Approve
    } else {
        Decision::Reject
    }
}

//
// ================= Engine =================
//

#[derive(Debug, Clone, Default)]
pub struct AssessmentEngine {
    policy: AssessmentPolicy,
}

impl AssessmentEngine {
    pub fn new(policy: AssessmentPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AssessmentPolicy {
        &self.policy
    }

    pub async fn run(
        &self,
        application: &LoanApplication,
        bank: &BankAccountRecord,
        credit: &CreditReport,
    ) -> Result<Assessments> {
        let income = {
            let (app, bank, policy) = (application.clone(), bank.clone(), self.policy.clone());
            tokio::task::spawn_blocking(move || assess_income(&app, &bank, &policy))
        };
        let expense = {
            let (app, policy) = (application.clone(), self.policy.clone());
            tokio::task::spawn_blocking(move || assess_expense(&app, &policy))
        };
        let credit_check = {
            let (report, policy) = (credit.clone(), self.policy.clone());
            tokio::task::spawn_blocking(move || assess_credit(&report, &policy))
        };

        let (income, expense, credit_check) = tokio::join!(income, expense, credit_check);
        let join_error =
            |e: tokio::task::JoinError| UnderwritingError::ExecutionError(format!("assessment task failed: {}", e));

        let assessments = Assessments {
            income: income.map_err(join_error)?,
            expense: expense.map_err(join_error)?,
            credit: credit_check.map_err(join_error)?,
        };

        info!(
            applicant_id = %application.applicant_id,
            income = assessments.income.passed,
            expense = assessments.expense.passed,
            credit = assessments.credit.passed,
            "Assessments completed"
        );

        Ok(assessments)
    }
}
