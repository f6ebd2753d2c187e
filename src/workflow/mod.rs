//! Underwriting workflow - the orchestration state machine
//!
//! CREATED → FETCHING DATA → ASSESSING → AGGREGATING → AWAITING REVIEW → FINALIZING → COMPLETED
//!
//! `Failed` is reachable from any non-terminal phase. The instance record is
//! checkpointed after every transition and every fetched record, so a fresh
//! engine over the same store picks up where the last one stopped.
//! `AwaitingReview` is a durable checkpoint, not a parked task.

pub mod instance;

pub use instance::{FinalResult, InstanceListing, InstanceSummary, OrchestrationInstance};

use crate::aggregator::{build_aggregator, AggregationContext, NarrativeAggregator};
use crate::assessment::{suggest_decision, AssessmentEngine};
use crate::audit::{compute_record_hash, AuditLog};
use crate::config::AppConfig;
use crate::error::UnderwritingError;
use crate::executor::{StepExecutor, StepPolicies, StepTarget};
use crate::models::{
    CreditProvider, Decision, HumanDecision, LoanApplication, Phase, SignalSource, StepRecord,
    StepStatus,
};
use crate::sources::{credit_endpoint, DataSource, HttpDataSource, MockDataSource};
use crate::state::{build_instance_store, InstanceStore};
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REVIEW_SIGNAL: &str = "human_review";
const CANCEL_SIGNAL: &str = "cancel";

/// Acknowledgement returned for an accepted signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalAck {
    pub instance_id: Uuid,
    pub signal: String,
    pub phase: Phase,
}

pub struct Orchestrator {
    sources: Arc<dyn DataSource>,
    aggregator: Arc<dyn NarrativeAggregator>,
    assessment_engine: AssessmentEngine,
    policies: StepPolicies,
    executor: StepExecutor,
    store: Arc<dyn InstanceStore>,
    audit_log: AuditLog,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        sources: Arc<dyn DataSource>,
        aggregator: Arc<dyn NarrativeAggregator>,
        assessment_engine: AssessmentEngine,
        policies: StepPolicies,
        store: Arc<dyn InstanceStore>,
        audit_log: AuditLog,
    ) -> Self {
        Self {
            sources,
            aggregator,
            assessment_engine,
            policies,
            executor: StepExecutor::new(),
            store,
            audit_log,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wire every collaborator from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let sources: Arc<dyn DataSource> = match &config.data_source.base_url {
            Some(base_url) => {
                let http = HttpDataSource::new(base_url, config.retry.bank.attempt_timeout)?;
                info!(source = http.name(), base_url = http.base_url(), "Data source selected");
                Arc::new(http)
            }
            None => {
                let mut mock = MockDataSource::new().with_failures(config.data_source.mock_failures);
                if let Some(latency) = config.data_source.mock_latency {
                    mock = mock.with_latency(latency);
                }
                info!(
                    source = mock.name(),
                    failures = ?config.data_source.mock_failures,
                    latency = ?config.data_source.mock_latency,
                    "Data source selected"
                );
                Arc::new(mock)
            }
        };

        Ok(Self::new(
            sources,
            build_aggregator(&config.aggregator)?,
            AssessmentEngine::new(config.assessment.clone()),
            config.retry.clone(),
            build_instance_store(config.database_url.as_deref()),
            AuditLog::new(),
        ))
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }

    // ===== Client Surface =====

    /// Validate and persist a new instance in `Created`. Does not drive it.
    pub async fn submit(&self, application: LoanApplication) -> Result<Uuid> {
        if let Err(e) = application.validate() {
            warn!(applicant_id = %application.applicant_id, error = %e, "Application rejected");
            return Err(e);
        }

        let instance = OrchestrationInstance::new(application);
        self.store.insert(&instance).await?;

        info!(
            instance_id = %instance.instance_id,
            applicant_id = %instance.application.applicant_id,
            amount = instance.application.amount,
            "Instance created"
        );
        Ok(instance.instance_id)
    }

    /// Submit and drive the instance in the background until it parks.
    pub async fn start(self: &Arc<Self>, application: LoanApplication) -> Result<Uuid> {
        let instance_id = self.submit(application).await?;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.drive(instance_id).await {
                Ok(phase) => debug!(%instance_id, %phase, "Background drive finished"),
                Err(e) => error!(%instance_id, error = %e, "Background drive aborted"),
            }
        });

        Ok(instance_id)
    }

    /// Never blocks on a running phase; reads the last checkpoint.
    pub async fn get_summary(&self, instance_id: Uuid) -> Result<InstanceSummary> {
        Ok(self.load(instance_id).await?.summary())
    }

    pub async fn get_final_result(&self, instance_id: Uuid) -> Result<FinalResult> {
        self.load(instance_id).await?.final_result()
    }

    pub async fn submit_human_review(
        &self,
        instance_id: Uuid,
        decision: Decision,
        note: Option<String>,
    ) -> Result<SignalAck> {
        let human = HumanDecision {
            decision,
            note,
            decided_at: Utc::now(),
            source: SignalSource::Review,
        };
        self.signal(instance_id, human, REVIEW_SIGNAL).await
    }

    /// Withdraw a parked application: recorded as a rejection, then finalized.
    pub async fn cancel(&self, instance_id: Uuid, reason: Option<String>) -> Result<SignalAck> {
        let human = HumanDecision {
            decision: Decision::Reject,
            note: reason,
            decided_at: Utc::now(),
            source: SignalSource::Cancellation,
        };
        self.signal(instance_id, human, CANCEL_SIGNAL).await
    }

    pub async fn list(&self) -> Result<Vec<InstanceListing>> {
        Ok(self
            .store
            .list()
            .await?
            .iter()
            .map(OrchestrationInstance::listing)
            .collect())
    }

    /// Recompute the digest of the persisted final record.
    pub async fn verify_final_record(&self, instance_id: Uuid) -> Result<bool> {
        let instance = self.load(instance_id).await?;
        Ok(match (&instance.final_record, &instance.record_hash) {
            (Some(record), Some(hash)) => compute_record_hash(record) == *hash,
            _ => false,
        })
    }

    // ===== Driving =====

    /// Advance an instance until it parks for review or reaches a terminal phase.
    pub async fn drive(&self, instance_id: Uuid) -> Result<Phase> {
        self.with_instance_lock(instance_id, move || async move {
            let mut instance = self.load(instance_id).await?;
            self.run_until_parked(&mut instance).await
        })
        .await
    }

    /// Re-drive every instance whose last checkpoint is neither parked nor terminal.
    pub async fn resume_incomplete(&self) -> Result<Vec<Uuid>> {
        self.resume_stalled(Duration::ZERO).await
    }

    /// Re-drive instances that need driving and have not been checkpointed for `idle`.
    pub async fn resume_stalled(&self, idle: Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - chrono_span(idle, "recovery idle time")?;
        let phases: Vec<Phase> = Phase::ALL
            .into_iter()
            .filter(Phase::needs_driving)
            .collect();
        let pending = self.store.list_in_phases(&phases).await?;

        let mut resumed = Vec::with_capacity(pending.len());
        for instance in pending.into_iter().filter(|i| i.updated_at <= cutoff) {
            let instance_id = instance.instance_id;
            info!(%instance_id, phase = %instance.phase, "Resuming instance");

            match self.drive(instance_id).await {
                Ok(phase) => info!(%instance_id, %phase, "Resumed instance parked"),
                Err(e) => error!(%instance_id, error = %e, "Failed to resume instance"),
            }
            resumed.push(instance_id);
        }

        Ok(resumed)
    }

    /// Periodically re-drive instances left mid-phase by an aborted drive.
    pub fn spawn_recovery_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match this.resume_stalled(every).await {
                    Ok(resumed) if !resumed.is_empty() => {
                        info!(count = resumed.len(), "Recovered stalled instances")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Recovery sweep failed"),
                }
            }
        })
    }

    /// Fail instances that have waited in `AwaitingReview` longer than `timeout`.
    pub async fn expire_stale_reviews(&self, timeout: Duration) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - chrono_span(timeout, "review timeout")?;

        let parked = self.store.list_in_phases(&[Phase::AwaitingReview]).await?;
        let mut expired = Vec::new();

        for candidate in parked {
            let instance_id = candidate.instance_id;
            let since = candidate.review_started_at.unwrap_or(candidate.updated_at);
            if since > cutoff {
                continue;
            }

            let outcome = self
                .with_instance_lock(instance_id, move || self.expire_review(instance_id, timeout))
                .await;
            match outcome {
                Ok(true) => {
                    warn!(%instance_id, "Review deadline exceeded");
                    expired.push(instance_id);
                }
                Ok(false) => {}
                Err(e) => error!(%instance_id, error = %e, "Failed to expire review"),
            }
        }

        Ok(expired)
    }

    pub fn spawn_review_sweeper(self: &Arc<Self>, timeout: Duration, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match this.expire_stale_reviews(timeout).await {
                    Ok(expired) if !expired.is_empty() => {
                        info!(count = expired.len(), "Expired stale reviews")
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Review sweep failed"),
                }
            }
        })
    }

    async fn expire_review(&self, instance_id: Uuid, timeout: Duration) -> Result<bool> {
        let mut instance = self.load(instance_id).await?;
        if instance.phase != Phase::AwaitingReview {
            return Ok(false);
        }

        instance.fail_with(
            "review_deadline_exceeded",
            format!("no human review within {:?}", timeout),
        )?;
        self.checkpoint(&mut instance).await?;
        Ok(true)
    }

    async fn signal(&self, instance_id: Uuid, decision: HumanDecision, signal: &str) -> Result<SignalAck> {
        // Reject early from the checkpoint so a signal never queues behind a running phase.
        let current = self.load(instance_id).await?;
        if current.phase != Phase::AwaitingReview {
            warn!(%instance_id, phase = %current.phase, signal, "Signal rejected");
            return Err(UnderwritingError::InvalidSignalError {
                instance_id,
                signal: signal.to_string(),
                phase: current.phase,
            });
        }

        let phase = self
            .with_instance_lock(instance_id, move || async move {
                let mut instance = self.load(instance_id).await?;
                if let Err(e) = instance.apply_human_decision(decision, signal) {
                    warn!(%instance_id, phase = %instance.phase, signal, "Signal rejected");
                    return Err(e);
                }
                self.checkpoint(&mut instance).await?;
                info!(%instance_id, signal, "Human decision recorded");

                self.run_until_parked(&mut instance).await
            })
            .await?;

        Ok(SignalAck {
            instance_id,
            signal: signal.to_string(),
            phase,
        })
    }

    async fn run_until_parked(&self, instance: &mut OrchestrationInstance) -> Result<Phase> {
        loop {
            if matches!(
                instance.phase,
                Phase::AwaitingReview | Phase::Completed | Phase::Failed
            ) {
                return Ok(instance.phase);
            }

            if let Err(e) = self.advance(instance).await {
                if is_persistence_error(&e) {
                    return Err(e);
                }

                error!(
                    instance_id = %instance.instance_id,
                    phase = %instance.phase,
                    code = e.code(),
                    error = %e,
                    "Instance failed"
                );
                instance.fail(&e)?;
                self.checkpoint(instance).await?;
            }
        }
    }

    async fn advance(&self, instance: &mut OrchestrationInstance) -> Result<()> {
        match instance.phase {
            Phase::Created => self.enter(instance, Phase::FetchingData).await,
            Phase::FetchingData => {
                self.fetch_records(instance).await?;
                self.enter(instance, Phase::Assessing).await
            }
            Phase::Assessing => {
                self.assess(instance).await?;
                self.enter(instance, Phase::Aggregating).await
            }
            Phase::Aggregating => {
                self.aggregate(instance).await?;
                self.enter(instance, Phase::AwaitingReview).await?;
                info!(instance_id = %instance.instance_id, "Suspended awaiting human review");
                Ok(())
            }
            Phase::Finalizing => {
                self.finalize(instance).await?;
                self.enter(instance, Phase::Completed).await
            }
            Phase::AwaitingReview | Phase::Completed | Phase::Failed => Ok(()),
        }
    }

    async fn enter(&self, instance: &mut OrchestrationInstance, next: Phase) -> Result<()> {
        let from = instance.phase;
        instance.transition(next)?;
        self.checkpoint(instance).await?;
        info!(instance_id = %instance.instance_id, %from, to = %next, "Phase transition");
        Ok(())
    }

    // ===== Phases =====

    /// Bank, documents, then credit with fallback. Records already stored
    /// by an earlier run are not fetched again.
    async fn fetch_records(&self, instance: &mut OrchestrationInstance) -> Result<()> {
        let sources = self.sources.as_ref();
        let applicant_id = instance.application.applicant_id.clone();
        let applicant = applicant_id.as_str();

        if instance.bank.is_none() {
            let attempted = self
                .executor
                .execute(
                    "fetch_bank_account",
                    StepTarget::new("bank", &self.policies.bank, move || {
                        sources.fetch_bank_account(applicant)
                    }),
                )
                .await;
            instance.steps.extend(attempted.records);
            instance.bank = Some(attempted.outcome?);
            self.checkpoint(instance).await?;
        }

        if instance.documents.is_none() {
            let attempted = self
                .executor
                .execute(
                    "fetch_documents",
                    StepTarget::new("documents", &self.policies.documents, move || {
                        sources.fetch_documents(applicant)
                    }),
                )
                .await;
            instance.steps.extend(attempted.records);
            instance.documents = Some(attempted.outcome?);
            self.checkpoint(instance).await?;
        }

        if instance.credit.is_none() {
            let attempted = self
                .executor
                .execute_with_fallback(
                    "fetch_credit_report",
                    StepTarget::new(
                        credit_endpoint(CreditProvider::Primary),
                        &self.policies.primary_credit,
                        move || sources.fetch_credit_report(applicant, CreditProvider::Primary),
                    ),
                    StepTarget::new(
                        credit_endpoint(CreditProvider::Fallback),
                        &self.policies.fallback_credit,
                        move || sources.fetch_credit_report(applicant, CreditProvider::Fallback),
                    ),
                )
                .await;
            instance.steps.extend(attempted.records);
            let report = attempted.outcome?;

            if attempted.used_fallback {
                warn!(
                    instance_id = %instance.instance_id,
                    bureau = %report.bureau,
                    "Credit report served by fallback provider"
                );
            }
            instance.credit = Some(report);
            self.checkpoint(instance).await?;
        }

        Ok(())
    }

    async fn assess(&self, instance: &mut OrchestrationInstance) -> Result<()> {
        let (bank, credit) = match (&instance.bank, &instance.credit) {
            (Some(bank), Some(credit)) => (bank, credit),
            _ => {
                return Err(UnderwritingError::StateError(
                    "assessment requires bank and credit records".to_string(),
                ))
            }
        };

        let started = Instant::now();
        let assessments = self
            .assessment_engine
            .run(&instance.application, bank, credit)
            .await?;

        instance.steps.push(StepRecord {
            step: "assess".to_string(),
            provider: None,
            attempts: 1,
            status: StepStatus::Succeeded,
            error: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
        });
        instance.assessments = Some(assessments);
        Ok(())
    }

    async fn aggregate(&self, instance: &mut OrchestrationInstance) -> Result<()> {
        if instance.recommendation.is_some() {
            return Ok(());
        }

        let context = match (&instance.assessments, &instance.credit) {
            (Some(assessments), Some(credit)) => AggregationContext {
                application: instance.application.clone(),
                assessments: assessments.clone(),
                credit: credit.clone(),
                rule_decision: suggest_decision(assessments, credit, self.assessment_engine.policy()),
            },
            _ => {
                return Err(UnderwritingError::StateError(
                    "aggregation requires assessments and a credit report".to_string(),
                ))
            }
        };

        let aggregator = self.aggregator.as_ref();
        let context = &context;
        let attempted = self
            .executor
            .execute(
                "aggregate",
                StepTarget::new(aggregator.name(), &self.policies.aggregation, move || {
                    aggregator.summarize(context)
                }),
            )
            .await;
        instance.steps.extend(attempted.records);
        let recommendation = attempted.outcome?;

        info!(
            instance_id = %instance.instance_id,
            decision = %recommendation.decision,
            aggregator = %recommendation.aggregator,
            source = ?recommendation.decision_source,
            "Recommendation produced"
        );

        instance.set_recommendation(recommendation)?;
        self.checkpoint(instance).await
    }

    async fn finalize(&self, instance: &mut OrchestrationInstance) -> Result<()> {
        let record = instance.freeze()?;
        let entry = self.audit_log.record(instance.instance_id, &record).await?;

        // A drive that lost its final checkpoint may already have audited a record.
        if *entry.record != record {
            warn!(instance_id = %instance.instance_id, "Reusing previously audited final record");
            instance.final_record = Some(entry.record.as_ref().clone());
        }

        info!(
            instance_id = %instance.instance_id,
            audit_id = %entry.audit_id,
            recommendation = %entry.record.recommendation.decision,
            human_decision = %entry.record.human_decision.decision,
            "Final record frozen"
        );

        instance.audit_id = Some(entry.audit_id);
        instance.record_hash = Some(entry.record_hash);
        Ok(())
    }

    // ===== Persistence =====

    /// Write the instance at the next version. Store outages are retried
    /// under the checkpoint policy; a version conflict is returned at once.
    async fn checkpoint(&self, instance: &mut OrchestrationInstance) -> Result<()> {
        let expected = instance.version;
        instance.version += 1;
        instance.updated_at = Utc::now();

        let policy = &self.policies.checkpoint;
        let mut attempt = 1;
        let mut delay = policy.initial_interval;

        loop {
            let error = match tokio::time::timeout(
                policy.attempt_timeout,
                self.store.save(instance, expected),
            )
            .await
            {
                Ok(Ok(())) => break,
                Ok(Err(e)) => e,
                Err(_) => UnderwritingError::DatabaseError(format!(
                    "checkpoint timed out after {:?}",
                    policy.attempt_timeout
                )),
            };

            if !error.is_store_unavailable() || attempt >= policy.max_attempts {
                instance.version = expected;
                return Err(error);
            }

            warn!(
                instance_id = %instance.instance_id,
                phase = %instance.phase,
                attempt,
                max_attempts = policy.max_attempts,
                error = %error,
                "Checkpoint failed, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = policy.next_interval(delay);
            attempt += 1;
        }

        debug!(
            instance_id = %instance.instance_id,
            phase = %instance.phase,
            version = instance.version,
            "Checkpoint written"
        );
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<OrchestrationInstance> {
        self.store
            .load(instance_id)
            .await?
            .ok_or(UnderwritingError::InstanceNotFound(instance_id))
    }

    /// Run `work` holding the instance's lock. The lock entry is dropped
    /// again once nobody else is queued on it.
    async fn with_instance_lock<T, F, Fut>(&self, instance_id: Uuid, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(instance_id).or_default())
        };

        let outcome = {
            let _guard = lock.lock().await;
            work().await
        };

        let mut locks = self.locks.lock().await;
        // The map and this handle are the only owners left.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&instance_id);
        }
        outcome
    }
}

/// Convert a configured duration for timestamp arithmetic.
fn chrono_span(duration: Duration, what: &str) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| UnderwritingError::ConfigError(format!("{} out of range: {}", what, e)))
}

/// Errors from the store itself; these abort the drive instead of failing the instance.
fn is_persistence_error(error: &UnderwritingError) -> bool {
    error.is_store_unavailable()
        || matches!(
            error,
            UnderwritingError::StateConflict(_) | UnderwritingError::InstanceNotFound(_)
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::RuleBasedAggregator;
    use crate::models::{DecisionSource, ProductType, Recommendation};
    use crate::sources::{MockEndpoint, MockFailures};
    use crate::state::InMemoryInstanceStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn application() -> LoanApplication {
        LoanApplication {
            applicant_id: "A1".to_string(),
            name: Some("Asha Rao".to_string()),
            amount: 500_000.0,
            income: 120_000.0,
            expenses: None,
            product_type: ProductType::HomeLoan,
        }
    }

    fn orchestrator(
        source: Arc<MockDataSource>,
        aggregator: Arc<dyn NarrativeAggregator>,
        store: Arc<dyn InstanceStore>,
    ) -> Orchestrator {
        Orchestrator::new(
            source,
            aggregator,
            AssessmentEngine::default(),
            StepPolicies::fast(),
            store,
            AuditLog::new(),
        )
    }

    fn default_orchestrator(source: Arc<MockDataSource>) -> Orchestrator {
        orchestrator(
            source,
            Arc::new(RuleBasedAggregator),
            Arc::new(InMemoryInstanceStore::new()),
        )
    }

    struct FailingAggregator {
        calls: AtomicU32,
    }

    #[async_trait]
    impl NarrativeAggregator for FailingAggregator {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn summarize(&self, _context: &AggregationContext) -> Result<Recommendation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(UnderwritingError::LlmError("model unavailable".to_string()))
        }
    }

    /// Records the phase of every write so tests can check ordering.
    struct RecordingStore {
        inner: InMemoryInstanceStore,
        phases: std::sync::Mutex<Vec<Phase>>,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                inner: InMemoryInstanceStore::new(),
                phases: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn phases(&self) -> Vec<Phase> {
            self.phases.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InstanceStore for RecordingStore {
        fn backend(&self) -> &'static str {
            "recording"
        }

        async fn insert(&self, instance: &OrchestrationInstance) -> Result<()> {
            self.phases.lock().unwrap().push(instance.phase);
            self.inner.insert(instance).await
        }

        async fn save(&self, instance: &OrchestrationInstance, expected_version: u64) -> Result<()> {
            self.phases.lock().unwrap().push(instance.phase);
            self.inner.save(instance, expected_version).await
        }

        async fn load(&self, instance_id: Uuid) -> Result<Option<OrchestrationInstance>> {
            self.inner.load(instance_id).await
        }

        async fn list(&self) -> Result<Vec<OrchestrationInstance>> {
            self.inner.list().await
        }
    }

    /// Fails writes on demand: a number of upcoming saves, or every save
    /// that would store a given phase.
    struct FlakyStore {
        inner: InMemoryInstanceStore,
        failures_left: AtomicU32,
        failed_saves: AtomicU32,
        down_for: std::sync::Mutex<Option<Phase>>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryInstanceStore::new(),
                failures_left: AtomicU32::new(0),
                failed_saves: AtomicU32::new(0),
                down_for: std::sync::Mutex::new(None),
            }
        }

        fn fail_next(&self, saves: u32) {
            self.failures_left.store(saves, Ordering::SeqCst);
        }

        fn refuse_phase(&self, phase: Option<Phase>) {
            *self.down_for.lock().unwrap() = phase;
        }
    }

    #[async_trait]
    impl InstanceStore for FlakyStore {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        async fn insert(&self, instance: &OrchestrationInstance) -> Result<()> {
            self.inner.insert(instance).await
        }

        async fn save(&self, instance: &OrchestrationInstance, expected_version: u64) -> Result<()> {
            let refused = *self.down_for.lock().unwrap() == Some(instance.phase);
            let injected = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if refused || injected {
                self.failed_saves.fetch_add(1, Ordering::SeqCst);
                return Err(UnderwritingError::DatabaseError("connection reset".to_string()));
            }
            self.inner.save(instance, expected_version).await
        }

        async fn load(&self, instance_id: Uuid) -> Result<Option<OrchestrationInstance>> {
            self.inner.load(instance_id).await
        }

        async fn list(&self) -> Result<Vec<OrchestrationInstance>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_scenario_a1_approve_end_to_end() {
        let engine = default_orchestrator(Arc::new(MockDataSource::new()));
        let id = engine.submit(application()).await.unwrap();

        assert_eq!(engine.drive(id).await.unwrap(), Phase::AwaitingReview);

        let summary = engine.get_summary(id).await.unwrap();
        assert_eq!(summary.phase, Phase::AwaitingReview);
        assert!(summary.assessments.as_ref().unwrap().all_passed());
        let recommendation = summary.recommendation.unwrap();
        assert_eq!(recommendation.decision, Decision::Approve);
        assert_eq!(recommendation.decision_source, DecisionSource::Rules);
        assert!(summary.human_decision.is_none());

        assert!(matches!(
            engine.get_final_result(id).await,
            Err(UnderwritingError::NotReadyError { phase: Phase::AwaitingReview, .. })
        ));

        let ack = engine
            .submit_human_review(id, Decision::Approve, Some("verified payslips".to_string()))
            .await
            .unwrap();
        assert_eq!(ack.phase, Phase::Completed);

        let final_result = engine.get_final_result(id).await.unwrap();
        assert_eq!(final_result.recommendation.decision, Decision::Approve);
        assert_eq!(final_result.human_decision.decision, Decision::Approve);
        assert_eq!(final_result.credit_provider, CreditProvider::Primary);
        assert!(final_result.audit_id.is_some());

        assert!(engine.verify_final_record(id).await.unwrap());
        assert!(engine.audit_log().verify_integrity(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_primary_exhausted_fallback_succeeds() {
        let source = Arc::new(MockDataSource::new().with_failures(MockFailures {
            primary_credit: 3,
            ..MockFailures::default()
        }));
        let engine = default_orchestrator(source.clone());
        let id = engine.submit(application()).await.unwrap();

        assert_eq!(engine.drive(id).await.unwrap(), Phase::AwaitingReview);

        let summary = engine.get_summary(id).await.unwrap();
        let credit = summary.credit.unwrap();
        assert_eq!(credit.provider, CreditProvider::Fallback);
        assert_eq!(credit.bureau, "Experian");
        assert_eq!(source.calls(MockEndpoint::PrimaryCredit), 3);
        assert_eq!(source.calls(MockEndpoint::FallbackCredit), 1);

        let credit_steps: Vec<_> = summary
            .steps
            .iter()
            .filter(|s| s.step == "fetch_credit_report")
            .collect();
        assert_eq!(credit_steps.len(), 2);
        assert_eq!(credit_steps[0].status, StepStatus::Failed);
        assert_eq!(credit_steps[0].attempts, 3);
        assert_eq!(credit_steps[1].provider.as_deref(), Some("experian"));
    }

    #[tokio::test]
    async fn test_both_credit_providers_exhausted_fails_instance() {
        let source = Arc::new(MockDataSource::new().with_failures(MockFailures {
            primary_credit: u32::MAX,
            fallback_credit: u32::MAX,
            ..MockFailures::default()
        }));
        let store = Arc::new(RecordingStore::new());
        let engine = orchestrator(source.clone(), Arc::new(RuleBasedAggregator), store.clone());
        let id = engine.submit(application()).await.unwrap();

        assert_eq!(engine.drive(id).await.unwrap(), Phase::Failed);

        let summary = engine.get_summary(id).await.unwrap();
        let failure = summary.failure.unwrap();
        assert_eq!(failure.code, "exhausted_fallback_error");
        assert_eq!(failure.phase, Phase::FetchingData);
        assert!(summary.assessments.is_none());
        assert!(summary.recommendation.is_none());
        assert_eq!(source.calls(MockEndpoint::PrimaryCredit), 3);
        assert_eq!(source.calls(MockEndpoint::FallbackCredit), 10);
        assert!(!store.phases().contains(&Phase::Aggregating));

        assert!(matches!(
            engine.get_final_result(id).await,
            Err(UnderwritingError::NotReadyError { phase: Phase::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn test_aggregator_exhausted_fails_instance() {
        let aggregator = Arc::new(FailingAggregator {
            calls: AtomicU32::new(0),
        });
        let engine = orchestrator(
            Arc::new(MockDataSource::new()),
            aggregator.clone(),
            Arc::new(InMemoryInstanceStore::new()),
        );
        let id = engine.submit(application()).await.unwrap();

        assert_eq!(engine.drive(id).await.unwrap(), Phase::Failed);
        assert_eq!(aggregator.calls.load(Ordering::SeqCst), 10);

        let summary = engine.get_summary(id).await.unwrap();
        let failure = summary.failure.unwrap();
        assert_eq!(failure.code, "exhausted_fallback_error");
        assert_eq!(failure.phase, Phase::Aggregating);
        assert!(summary.recommendation.is_none());
        assert!(engine.get_final_result(id).await.is_err());
        assert!(engine
            .submit_human_review(id, Decision::Approve, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_second_review_is_rejected_without_change() {
        let engine = default_orchestrator(Arc::new(MockDataSource::new()));
        let id = engine.submit(application()).await.unwrap();
        engine.drive(id).await.unwrap();
        engine
            .submit_human_review(id, Decision::Approve, None)
            .await
            .unwrap();

        let before = engine.get_summary(id).await.unwrap();
        let err = engine
            .submit_human_review(id, Decision::Reject, Some("changed my mind".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UnderwritingError::InvalidSignalError { phase: Phase::Completed, .. }
        ));

        let after = engine.get_summary(id).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after.human_decision.unwrap().decision, Decision::Approve);
    }

    #[tokio::test]
    async fn test_review_before_suspension_is_rejected() {
        let engine = default_orchestrator(Arc::new(MockDataSource::new()));
        let id = engine.submit(application()).await.unwrap();

        let err = engine
            .submit_human_review(id, Decision::Approve, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UnderwritingError::InvalidSignalError { phase: Phase::Created, .. }
        ));
        assert!(engine.get_summary(id).await.unwrap().human_decision.is_none());
    }

    #[tokio::test]
    async fn test_cancel_finalizes_as_rejection() {
        let engine = default_orchestrator(Arc::new(MockDataSource::new()));
        let id = engine.submit(application()).await.unwrap();
        engine.drive(id).await.unwrap();

        let ack = engine
            .cancel(id, Some("applicant withdrew".to_string()))
            .await
            .unwrap();
        assert_eq!(ack.phase, Phase::Completed);
        assert_eq!(ack.signal, "cancel");

        let final_result = engine.get_final_result(id).await.unwrap();
        assert_eq!(final_result.human_decision.decision, Decision::Reject);
        assert_eq!(final_result.human_decision.source, SignalSource::Cancellation);

        assert!(engine.cancel(id, None).await.is_err());
    }

    #[tokio::test]
    async fn test_phases_never_regress() {
        let store = Arc::new(RecordingStore::new());
        let engine = orchestrator(
            Arc::new(MockDataSource::new()),
            Arc::new(RuleBasedAggregator),
            store.clone(),
        );
        let id = engine.submit(application()).await.unwrap();
        engine.drive(id).await.unwrap();
        engine
            .submit_human_review(id, Decision::Reject, None)
            .await
            .unwrap();

        let phases = store.phases();
        assert!(phases.windows(2).all(|w| w[0].rank() <= w[1].rank()));
        assert_eq!(phases.first(), Some(&Phase::Created));
        assert_eq!(phases.last(), Some(&Phase::Completed));
        for phase in Phase::ALL.iter().filter(|p| **p != Phase::Failed) {
            assert!(phases.contains(phase), "missing {}", phase);
        }
    }

    #[tokio::test]
    async fn test_restart_resumes_without_refetching() {
        let store: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::new());
        let first_source = Arc::new(MockDataSource::new());
        let first = orchestrator(first_source.clone(), Arc::new(RuleBasedAggregator), store.clone());
        let id = first.submit(application()).await.unwrap();

        // Simulate a crash after the bank record was checkpointed.
        let mut instance = store.load(id).await.unwrap().unwrap();
        instance.transition(Phase::FetchingData).unwrap();
        instance.bank = Some(first_source.fetch_bank_account("A1").await.unwrap());
        let expected = instance.version;
        instance.version += 1;
        store.save(&instance, expected).await.unwrap();
        drop(first);

        let second_source = Arc::new(MockDataSource::new());
        let second = orchestrator(second_source.clone(), Arc::new(RuleBasedAggregator), store.clone());

        let resumed = second.resume_incomplete().await.unwrap();
        assert_eq!(resumed, vec![id]);
        assert_eq!(second_source.calls(MockEndpoint::Bank), 0);
        assert_eq!(second_source.calls(MockEndpoint::Documents), 1);
        assert_eq!(second_source.calls(MockEndpoint::PrimaryCredit), 1);

        let summary = second.get_summary(id).await.unwrap();
        assert_eq!(summary.phase, Phase::AwaitingReview);
        assert_eq!(summary.bank, instance.bank);

        assert!(second.resume_incomplete().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_review_is_expired() {
        let engine = default_orchestrator(Arc::new(MockDataSource::new()));
        let id = engine.submit(application()).await.unwrap();
        engine.drive(id).await.unwrap();

        assert!(engine
            .expire_stale_reviews(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());

        let expired = engine.expire_stale_reviews(Duration::ZERO).await.unwrap();
        assert_eq!(expired, vec![id]);

        let summary = engine.get_summary(id).await.unwrap();
        assert_eq!(summary.phase, Phase::Failed);
        assert_eq!(summary.failure.unwrap().code, "review_deadline_exceeded");
    }

    #[tokio::test]
    async fn test_start_drives_in_background() {
        let engine = Arc::new(default_orchestrator(Arc::new(MockDataSource::new())));
        let id = engine.start(application()).await.unwrap();

        let mut phase = Phase::Created;
        for _ in 0..200 {
            phase = engine.get_summary(id).await.unwrap().phase;
            if phase == Phase::AwaitingReview {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(phase, Phase::AwaitingReview);
    }

    #[tokio::test]
    async fn test_invalid_application_never_creates_instance() {
        let engine = default_orchestrator(Arc::new(MockDataSource::new()));
        let mut app = application();
        app.amount = -10.0;

        assert!(matches!(
            engine.submit(app).await,
            Err(UnderwritingError::ValidationError(_))
        ));
        assert!(engine.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_reports_decisions() {
        let engine = default_orchestrator(Arc::new(MockDataSource::new()));
        let parked = engine.submit(application()).await.unwrap();
        engine.drive(parked).await.unwrap();

        let mut other = application();
        other.applicant_id = "B2".to_string();
        let fresh = engine.submit(other).await.unwrap();

        let listing = engine.list().await.unwrap();
        assert_eq!(listing.len(), 2);

        let parked_entry = listing.iter().find(|l| l.instance_id == parked).unwrap();
        assert_eq!(parked_entry.suggested_decision, Some(Decision::Approve));
        assert_eq!(parked_entry.human_decision, None);

        let fresh_entry = listing.iter().find(|l| l.instance_id == fresh).unwrap();
        assert_eq!(fresh_entry.phase, Phase::Created);
        assert_eq!(fresh_entry.applicant_id, "B2");
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let engine = default_orchestrator(Arc::new(MockDataSource::new()));
        assert!(matches!(
            engine.get_summary(Uuid::new_v4()).await,
            Err(UnderwritingError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bank_exhausted_fails_instance() {
        let source = Arc::new(MockDataSource::new().with_failures(MockFailures {
            bank: u32::MAX,
            ..MockFailures::default()
        }));
        let engine = default_orchestrator(source.clone());
        let id = engine.submit(application()).await.unwrap();

        assert_eq!(engine.drive(id).await.unwrap(), Phase::Failed);

        let summary = engine.get_summary(id).await.unwrap();
        let failure = summary.failure.unwrap();
        assert_eq!(failure.code, "exhausted_fallback_error");
        assert_eq!(failure.phase, Phase::FetchingData);
        assert!(summary.bank.is_none());
        assert_eq!(source.calls(MockEndpoint::Bank), 10);
        assert_eq!(source.calls(MockEndpoint::Documents), 0);
        assert_eq!(source.calls(MockEndpoint::PrimaryCredit), 0);
        assert_eq!(source.calls(MockEndpoint::FallbackCredit), 0);
    }

    #[tokio::test]
    async fn test_documents_exhausted_fails_instance() {
        let source = Arc::new(MockDataSource::new().with_failures(MockFailures {
            documents: u32::MAX,
            ..MockFailures::default()
        }));
        let engine = default_orchestrator(source.clone());
        let id = engine.submit(application()).await.unwrap();

        assert_eq!(engine.drive(id).await.unwrap(), Phase::Failed);

        let summary = engine.get_summary(id).await.unwrap();
        let failure = summary.failure.unwrap();
        assert_eq!(failure.code, "exhausted_fallback_error");
        assert_eq!(failure.phase, Phase::FetchingData);
        assert!(summary.bank.is_some());
        assert!(summary.documents.is_none());
        assert_eq!(source.calls(MockEndpoint::Bank), 1);
        assert_eq!(source.calls(MockEndpoint::Documents), 10);
        assert_eq!(source.calls(MockEndpoint::PrimaryCredit), 0);
        assert!(summary.assessments.is_none());
    }

    #[tokio::test]
    async fn test_low_balance_and_income_suggests_reject() {
        let engine = default_orchestrator(Arc::new(MockDataSource::new().with_balance(1_200.0)));
        let id = engine.submit(application()).await.unwrap();
        engine.drive(id).await.unwrap();

        let summary = engine.get_summary(id).await.unwrap();
        let assessments = summary.assessments.unwrap();
        assert!(!assessments.income.passed);
        assert!(assessments.credit.passed);
        assert_eq!(summary.recommendation.unwrap().decision, Decision::Reject);

        engine
            .submit_human_review(id, Decision::Approve, Some("collateral offered".to_string()))
            .await
            .unwrap();
        let final_result = engine.get_final_result(id).await.unwrap();
        assert_eq!(final_result.recommendation.decision, Decision::Reject);
        assert_eq!(final_result.human_decision.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn test_summary_does_not_wait_for_slow_fetches() {
        let source = MockDataSource::new().with_latency(Duration::from_millis(150));
        let engine = Arc::new(default_orchestrator(Arc::new(source)));
        let id = engine.start(application()).await.unwrap();

        let summary = tokio::time::timeout(Duration::from_millis(50), engine.get_summary(id))
            .await
            .expect("summary must answer while fetches are running")
            .unwrap();
        assert!(summary.phase.rank() < Phase::AwaitingReview.rank());

        let mut phase = summary.phase;
        for _ in 0..300 {
            phase = engine.get_summary(id).await.unwrap().phase;
            if phase == Phase::AwaitingReview {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(phase, Phase::AwaitingReview);
    }

    #[tokio::test]
    async fn test_lock_entries_released_after_each_operation() {
        let engine = default_orchestrator(Arc::new(MockDataSource::new()));

        for _ in 0..20 {
            let id = engine.submit(application()).await.unwrap();
            engine.drive(id).await.unwrap();
            engine
                .submit_human_review(id, Decision::Approve, None)
                .await
                .unwrap();
            assert_eq!(engine.get_summary(id).await.unwrap().phase, Phase::Completed);
        }

        let parked = engine.submit(application()).await.unwrap();
        engine.drive(parked).await.unwrap();
        let expired = engine.submit(application()).await.unwrap();
        engine.drive(expired).await.unwrap();
        engine.cancel(parked, None).await.unwrap();
        engine.expire_stale_reviews(Duration::ZERO).await.unwrap();

        assert!(engine.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_retries_through_store_blip() {
        let store = Arc::new(FlakyStore::new());
        let engine = orchestrator(
            Arc::new(MockDataSource::new()),
            Arc::new(RuleBasedAggregator),
            store.clone(),
        );
        let id = engine.submit(application()).await.unwrap();

        store.fail_next(2);
        assert_eq!(engine.drive(id).await.unwrap(), Phase::AwaitingReview);
        assert_eq!(store.failed_saves.load(Ordering::SeqCst), 2);

        let summary = engine.get_summary(id).await.unwrap();
        assert_eq!(summary.phase, Phase::AwaitingReview);
        assert!(summary.failure.is_none());
    }

    #[tokio::test]
    async fn test_lost_final_checkpoint_is_recovered() {
        let store = Arc::new(FlakyStore::new());
        let engine = orchestrator(
            Arc::new(MockDataSource::new()),
            Arc::new(RuleBasedAggregator),
            store.clone(),
        );
        let id = engine.submit(application()).await.unwrap();
        engine.drive(id).await.unwrap();

        store.refuse_phase(Some(Phase::Completed));
        let err = engine
            .submit_human_review(id, Decision::Approve, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UnderwritingError::DatabaseError(_)));
        assert_eq!(
            store.failed_saves.load(Ordering::SeqCst),
            StepPolicies::fast().checkpoint.max_attempts
        );
        assert_eq!(engine.get_summary(id).await.unwrap().phase, Phase::Finalizing);

        // Not idle long enough for the sweep yet.
        store.refuse_phase(None);
        assert!(engine
            .resume_stalled(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());

        assert_eq!(engine.resume_stalled(Duration::ZERO).await.unwrap(), vec![id]);
        let final_result = engine.get_final_result(id).await.unwrap();
        assert_eq!(final_result.human_decision.decision, Decision::Approve);
        assert!(engine.verify_final_record(id).await.unwrap());
        assert!(engine.audit_log().verify_integrity(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_recovery_sweeper_redrives_stalled_instance() {
        let engine = Arc::new(default_orchestrator(Arc::new(MockDataSource::new())));
        let id = engine.submit(application()).await.unwrap();

        let sweeper = engine.spawn_recovery_sweeper(Duration::from_millis(20));
        let mut phase = Phase::Created;
        for _ in 0..200 {
            phase = engine.get_summary(id).await.unwrap().phase;
            if phase == Phase::AwaitingReview {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sweeper.abort();
        assert_eq!(phase, Phase::AwaitingReview);
    }

    #[tokio::test]
    async fn test_review_sweep_continues_past_failed_instance() {
        let store = Arc::new(FlakyStore::new());
        let engine = orchestrator(
            Arc::new(MockDataSource::new()),
            Arc::new(RuleBasedAggregator),
            store.clone(),
        );
        let first = engine.submit(application()).await.unwrap();
        engine.drive(first).await.unwrap();
        let second = engine.submit(application()).await.unwrap();
        engine.drive(second).await.unwrap();

        // Enough failed writes to exhaust one checkpoint, not two.
        store.fail_next(StepPolicies::fast().checkpoint.max_attempts);
        let expired = engine.expire_stale_reviews(Duration::ZERO).await.unwrap();
        assert_eq!(expired.len(), 1);

        let survivor = if expired[0] == first { second } else { first };
        assert_eq!(engine.get_summary(survivor).await.unwrap().phase, Phase::AwaitingReview);
        let failed = engine.get_summary(expired[0]).await.unwrap();
        assert_eq!(failed.phase, Phase::Failed);
        assert_eq!(failed.failure.unwrap().code, "review_deadline_exceeded");

        // The next sweep picks up the one that was skipped.
        assert_eq!(
            engine.expire_stale_reviews(Duration::ZERO).await.unwrap(),
            vec![survivor]
        );
    }
}
