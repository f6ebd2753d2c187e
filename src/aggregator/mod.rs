//! Narrative aggregator trait and implementations
//!
//! The aggregator turns the application and its assessments into a
//! reviewer-facing narrative plus a suggested decision. The provider is chosen
//! once, at configuration time.

use crate::config::{AggregatorConfig, AggregatorKind};
use crate::error::UnderwritingError;
use crate::models::{
    Assessments, CreditReport, Decision, DecisionSource, LoanApplication, Recommendation,
};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub mod gemini;
pub mod ollama;

pub use gemini::{GeminiAggregator, GeminiClient};
pub use ollama::OllamaAggregator;

/// Everything an aggregator may look at.
#[derive(Debug, Clone)]
pub struct AggregationContext {
    pub application: LoanApplication,
    pub assessments: Assessments,
    pub credit: CreditReport,
    /// Decision produced by the deterministic rule, used when a model gives none.
    pub rule_decision: Decision,
}

#[async_trait]
pub trait NarrativeAggregator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn summarize(&self, context: &AggregationContext) -> Result<Recommendation>;
}

/// Deterministic aggregator; no model involved.
pub struct RuleBasedAggregator;

#[async_trait]
impl NarrativeAggregator for RuleBasedAggregator {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn summarize(&self, context: &AggregationContext) -> Result<Recommendation> {
        let mut narrative = format!(
            "Applicant {} requests {:.2} ({}).",
            context.application.applicant_id,
            context.application.amount,
            context.application.product_type
        );
        for result in context.assessments.iter() {
            narrative.push_str(&format!(
                " {:?}: {} ({}).",
                result.kind,
                if result.passed { "pass" } else { "fail" },
                result.rationale
            ));
        }
        narrative.push_str(&format!(
            " Credit data from {} via {} provider.",
            context.credit.bureau, context.credit.provider
        ));

        Ok(Recommendation {
            decision: context.rule_decision,
            narrative,
            aggregator: self.name().to_string(),
            decision_source: DecisionSource::Rules,
            produced_at: Utc::now(),
        })
    }
}

//
// ================= Prompting =================
//

const DECISION_MARKER: &str = "suggested decision:";

pub(crate) fn build_prompt(context: &AggregationContext) -> String {
    let app = &context.application;
    let mut prompt = String::new();

    prompt.push_str("Summarize this loan application for a human underwriter.\n\n");
    prompt.push_str(&format!(
        "Application: applicant {}{}, product {}, amount {:.2}, declared income {:.2}, declared expenses {}\n",
        app.applicant_id,
        app.name
            .as_deref()
            .map(|n| format!(" ({})", n))
            .unwrap_or_default(),
        app.product_type,
        app.amount,
        app.income,
        app.expenses
            .map(|e| format!("{:.2}", e))
            .unwrap_or_else(|| "not declared".to_string()),
    ));
    prompt.push_str(&format!(
        "Credit: score {} from {} ({} provider)\n",
        context.credit.score, context.credit.bureau, context.credit.provider
    ));
    prompt.push_str("Assessments:\n");
    for result in context.assessments.iter() {
        prompt.push_str(&format!(
            "- {:?}: {} (value {:.2}; {})\n",
            result.kind,
            if result.passed { "PASS" } else { "FAIL" },
            result.value,
            result.rationale
        ));
    }
    prompt.push_str(
        "\nKeep it under 200 words. End with exactly one line of the form \
         'Suggested decision: APPROVE' or 'Suggested decision: REJECT'.",
    );

    prompt
}

pub(crate) const SYSTEM_PROMPT: &str = "You are a careful credit analyst. \
Explain the strengths and risks of the application in plain language. \
Never invent figures that are not in the input.";

/// Read the model's verdict line, if it wrote one.
pub(crate) fn parse_decision(text: &str) -> Option<Decision> {
    text.lines().rev().find_map(|line| {
        let lowered = line.trim().trim_matches('*').to_lowercase();
        let verdict = lowered.strip_prefix(DECISION_MARKER)?.trim();
        if verdict.starts_with("approve") {
            Some(Decision::Approve)
        } else if verdict.starts_with("reject") {
            Some(Decision::Reject)
        } else {
            None
        }
    })
}

/// Shape model output into a recommendation, falling back to the rule
/// decision when no verdict line is present.
pub(crate) fn recommendation_from_text(
    aggregator: &str,
    text: &str,
    context: &AggregationContext,
) -> Result<Recommendation> {
    let narrative = text.trim();
    if narrative.is_empty() {
        return Err(UnderwritingError::LlmError(format!(
            "{} returned an empty narrative",
            aggregator
        )));
    }

    let (decision, decision_source) = match parse_decision(narrative) {
        Some(decision) => (decision, DecisionSource::Model),
        None => (context.rule_decision, DecisionSource::Rules),
    };

    Ok(Recommendation {
        decision,
        narrative: narrative.to_string(),
        aggregator: aggregator.to_string(),
        decision_source,
        produced_at: Utc::now(),
    })
}

/// Build the aggregator selected by configuration.
pub fn build_aggregator(config: &AggregatorConfig) -> Result<Arc<dyn NarrativeAggregator>> {
    let aggregator: Arc<dyn NarrativeAggregator> = match config.kind {
        AggregatorKind::Rules => Arc::new(RuleBasedAggregator),
        AggregatorKind::Gemini => {
            let api_key = config.gemini_api_key.clone().ok_or_else(|| {
                UnderwritingError::ConfigError(
                    "MODEL_PROVIDER=gemini requires GEMINI_API_KEY".to_string(),
                )
            })?;
            Arc::new(GeminiAggregator::new(api_key, &config.gemini_model)?)
        }
        AggregatorKind::Ollama => Arc::new(OllamaAggregator::new(
            &config.ollama_url,
            &config.ollama_model,
        )?),
    };

    info!(aggregator = aggregator.name(), "Narrative aggregator selected");
    Ok(aggregator)
}
