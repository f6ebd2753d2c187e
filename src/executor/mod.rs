//! Step executor: bounded retry, per-attempt timeout and provider fallback
//!
//! Every external call made by the workflow goes through here.
//! The executor holds no state; idempotency of the wrapped operation is the caller's concern.

use crate::error::UnderwritingError;
use crate::models::{StepRecord, StepStatus};
use crate::Result;
use chrono::Utc;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ===== Retry Policy =====

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Policy for bank, document and credit fetches.
    pub fn fetch() -> Self {
        Self {
            max_attempts: 10,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(60),
        }
    }

    /// Policy for the narrative aggregator, which may run a slow local model.
    pub fn aggregation() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(1200),
            ..Self::fetch()
        }
    }

    /// Policy for checkpoint writes to the instance store.
    pub fn persistence() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(200),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_intervals(mut self, initial: Duration, maximum: Duration, coefficient: f64) -> Self {
        self.initial_interval = initial;
        self.maximum_interval = maximum.max(initial);
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub(crate) fn next_interval(&self, current: Duration) -> Duration {
        std::cmp::min(
            Duration::from_millis((current.as_millis() as f64 * self.backoff_coefficient) as u64),
            self.maximum_interval,
        )
    }
}

/// Retry policies for each external step of the workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct StepPolicies {
    pub bank: RetryPolicy,
    pub documents: RetryPolicy,
    pub primary_credit: RetryPolicy,
    pub fallback_credit: RetryPolicy,
    pub aggregation: RetryPolicy,
    pub checkpoint: RetryPolicy,
}

impl Default for StepPolicies {
    fn default() -> Self {
        Self {
            bank: RetryPolicy::fetch(),
            documents: RetryPolicy::fetch(),
            primary_credit: RetryPolicy::fetch().with_max_attempts(3),
            fallback_credit: RetryPolicy::fetch(),
            aggregation: RetryPolicy::aggregation(),
            checkpoint: RetryPolicy::persistence(),
        }
    }
}

impl StepPolicies {
    /// Same attempt counts with millisecond intervals, for tests and demos.
    pub fn fast() -> Self {
        let tighten = |policy: RetryPolicy| {
            policy
                .with_intervals(Duration::from_millis(1), Duration::from_millis(5), 2.0)
                .with_attempt_timeout(Duration::from_millis(500))
        };
        let defaults = Self::default();
        Self {
            bank: tighten(defaults.bank),
            documents: tighten(defaults.documents),
            primary_credit: tighten(defaults.primary_credit),
            fallback_credit: tighten(defaults.fallback_credit),
            aggregation: tighten(defaults.aggregation),
            checkpoint: tighten(defaults.checkpoint),
        }
    }
}

// ===== Execution =====

/// One provider the executor may call for a step.
pub struct StepTarget<'a, F> {
    pub provider: &'a str,
    pub policy: &'a RetryPolicy,
    pub operation: F,
}

impl<'a, F> StepTarget<'a, F> {
    pub fn new(provider: &'a str, policy: &'a RetryPolicy, operation: F) -> Self {
        Self {
            provider,
            policy,
            operation,
        }
    }
}

/// Result of running a step, plus the trail of provider invocations.
#[derive(Debug)]
pub struct Attempted<T> {
    pub outcome: Result<T>,
    pub records: Vec<StepRecord>,
    pub used_fallback: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StepExecutor;

impl StepExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run a step against a single provider.
    pub async fn execute<F, Fut, T>(&self, step: &str, target: StepTarget<'_, F>) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (result, record) = self.run_target(step, target).await;

        let outcome = result.map_err(|last_error| UnderwritingError::ExhaustedFallbackError {
            step: step.to_string(),
            attempts: record.attempts,
            last_error: last_error.to_string(),
        });

        Attempted {
            outcome,
            records: vec![record],
            used_fallback: false,
        }
    }

    /// Run a step against the primary provider; once it gives up, run the
    /// fallback under its own policy.
    pub async fn execute_with_fallback<P, PFut, B, BFut, T>(
        &self,
        step: &str,
        primary: StepTarget<'_, P>,
        fallback: StepTarget<'_, B>,
    ) -> Attempted<T>
    where
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<T>>,
        B: FnMut() -> BFut,
        BFut: Future<Output = Result<T>>,
    {
        let (primary_result, primary_record) = self.run_target(step, primary).await;

        let primary_error = match primary_result {
            Ok(value) => {
                return Attempted {
                    outcome: Ok(value),
                    records: vec![primary_record],
                    used_fallback: false,
                }
            }
            Err(e) => e,
        };

        warn!(
            step,
            provider = %primary_record.provider.as_deref().unwrap_or_default(),
            attempts = primary_record.attempts,
            error = %primary_error,
            "Primary provider exhausted, switching to fallback"
        );

        let (fallback_result, fallback_record) = self.run_target(step, fallback).await;
        let total_attempts = primary_record.attempts + fallback_record.attempts;

        let outcome = fallback_result.map_err(|last_error| UnderwritingError::ExhaustedFallbackError {
            step: step.to_string(),
            attempts: total_attempts,
            last_error: last_error.to_string(),
        });

        Attempted {
            outcome,
            records: vec![primary_record, fallback_record],
            used_fallback: true,
        }
    }

    async fn run_target<F, Fut, T>(
        &self,
        step: &str,
        target: StepTarget<'_, F>,
    ) -> (Result<T>, StepRecord)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let StepTarget {
            provider,
            policy,
            mut operation,
        } = target;

        let started = Instant::now();
        let mut attempts = 0;
        let mut delay = policy.initial_interval;

        let result = loop {
            attempts += 1;
            debug!(step, provider, attempt = attempts, "Starting attempt");

            let error = match tokio::time::timeout(policy.attempt_timeout, operation()).await {
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(e)) => e,
                Err(_) => UnderwritingError::transient(
                    provider,
                    format!("attempt timed out after {:?}", policy.attempt_timeout),
                ),
            };

            if attempts >= policy.max_attempts || !error.is_retryable() {
                break Err(error);
            }

            warn!(
                step,
                provider,
                attempt = attempts,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying with backoff"
            );

            tokio::time::sleep(delay).await;
            delay = policy.next_interval(delay);
        };

        let record = StepRecord {
            step: step.to_string(),
            provider: Some(provider.to_string()),
            attempts,
            status: if result.is_ok() {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            },
            error: result.as_ref().err().map(|e| e.to_string()),
            elapsed_ms: started.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
        };

        (result, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fetch()
            .with_intervals(Duration::from_millis(1), Duration::from_millis(4), 2.0)
            .with_attempt_timeout(Duration::from_millis(100))
            .with_max_attempts(max_attempts)
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::fetch();
        let mut delay = policy.initial_interval;
        for _ in 0..10 {
            delay = policy.next_interval(delay);
        }
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn test_default_policies() {
        let policies = StepPolicies::default();
        assert_eq!(policies.primary_credit.max_attempts, 3);
        assert_eq!(policies.fallback_credit.max_attempts, 10);
        assert_eq!(policies.aggregation.attempt_timeout, Duration::from_secs(1200));
        assert_eq!(policies.bank.attempt_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = quick(5);
        let counter = calls.clone();

        let attempted = StepExecutor::new()
            .execute(
                "fetch_bank_account",
                StepTarget::new("bank", &policy, || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(UnderwritingError::transient("bank", "503"))
                        } else {
                            Ok(42)
                        }
                    }
                }),
            )
            .await;

        assert_eq!(attempted.outcome.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(attempted.records[0].attempts, 3);
        assert_eq!(attempted.records[0].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_non_retryable_error_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = quick(5);
        let counter = calls.clone();

        let attempted: Attempted<()> = StepExecutor::new()
            .execute(
                "fetch_documents",
                StepTarget::new("documents", &policy, || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(UnderwritingError::ValidationError("bad applicant".into()))
                    }
                }),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            attempted.outcome,
            Err(UnderwritingError::ExhaustedFallbackError { attempts: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let policy = quick(2).with_attempt_timeout(Duration::from_millis(5));

        let attempted: Attempted<()> = StepExecutor::new()
            .execute(
                "aggregate",
                StepTarget::new("slow-model", &policy, || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }),
            )
            .await;

        let record = &attempted.records[0];
        assert_eq!(record.attempts, 2);
        assert!(record.error.as_deref().unwrap_or_default().contains("timed out"));
        assert!(attempted.outcome.is_err());
    }

    #[tokio::test]
    async fn test_fallback_runs_after_primary_exhausted() {
        let primary_calls = Arc::new(AtomicU32::new(0));
        let primary_policy = quick(3);
        let fallback_policy = quick(10);
        let counter = primary_calls.clone();

        let attempted = StepExecutor::new()
            .execute_with_fallback(
                "fetch_credit_report",
                StepTarget::new("cibil", &primary_policy, || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<u16, _>(UnderwritingError::transient("cibil", "down"))
                    }
                }),
                StepTarget::new("experian", &fallback_policy, || async { Ok(742u16) }),
            )
            .await;

        assert_eq!(primary_calls.load(Ordering::SeqCst), 3);
        assert!(attempted.used_fallback);
        assert_eq!(attempted.outcome.unwrap(), 742);
        assert_eq!(attempted.records.len(), 2);
        assert_eq!(attempted.records[0].status, StepStatus::Failed);
        assert_eq!(attempted.records[1].provider.as_deref(), Some("experian"));
    }

    #[tokio::test]
    async fn test_both_providers_exhausted() {
        let primary_policy = quick(3);
        let fallback_policy = quick(2);

        let attempted: Attempted<u16> = StepExecutor::new()
            .execute_with_fallback(
                "fetch_credit_report",
                StepTarget::new("cibil", &primary_policy, || async {
                    Err(UnderwritingError::transient("cibil", "down"))
                }),
                StepTarget::new("experian", &fallback_policy, || async {
                    Err(UnderwritingError::transient("experian", "down"))
                }),
            )
            .await;

        match attempted.outcome {
            Err(UnderwritingError::ExhaustedFallbackError { step, attempts, last_error }) => {
                assert_eq!(step, "fetch_credit_report");
                assert_eq!(attempts, 5);
                assert!(last_error.contains("experian"));
            }
            other => panic!("expected exhausted fallback, got {:?}", other.map(|_| ())),
        }
    }
}
