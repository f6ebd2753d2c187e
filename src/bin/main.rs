use loan_underwriting_orchestrator::{
    aggregator::RuleBasedAggregator,
    assessment::AssessmentEngine,
    audit::AuditLog,
    config::TelemetryConfig,
    executor::StepPolicies,
    models::{Decision, LoanApplication, ProductType},
    sources::{MockDataSource, MockFailures},
    state::InMemoryInstanceStore,
    telemetry,
    workflow::Orchestrator,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    telemetry::init(&TelemetryConfig {
        log_level: "debug".to_string(),
    })?;

    info!("Loan Underwriting Orchestrator demo starting");

    // Primary bureau is down for its whole retry budget; the fallback serves the report.
    let sources = MockDataSource::new().with_failures(MockFailures {
        primary_credit: 3,
        ..MockFailures::default()
    });

    let orchestrator = Orchestrator::new(
        Arc::new(sources),
        Arc::new(RuleBasedAggregator),
        AssessmentEngine::default(),
        StepPolicies::fast(),
        Arc::new(InMemoryInstanceStore::new()),
        AuditLog::new(),
    );

    let application = LoanApplication {
        applicant_id: "A1".to_string(),
        name: Some("Asha Rao".to_string()),
        amount: 500_000.0,
        income: 120_000.0,
        expenses: None,
        product_type: ProductType::HomeLoan,
    };

    info!(
        "Submitting application for {} ({})",
        application.applicant_id, application.product_type
    );

    let instance_id = orchestrator.submit(application).await?;
    let phase = orchestrator.drive(instance_id).await?;
    info!("Instance {} parked in phase {}", instance_id, phase);

    let summary = orchestrator.get_summary(instance_id).await?;
    println!("\n=== SUMMARY ===");
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let ack = orchestrator
        .submit_human_review(instance_id, Decision::Approve, Some("Documents verified".to_string()))
        .await?;
    info!("Review accepted, instance now {}", ack.phase);

    let final_result = orchestrator.get_final_result(instance_id).await?;
    println!("\n=== FINAL RESULT ===");
    println!("{}", serde_json::to_string_pretty(&final_result)?);

    println!(
        "\nRecord integrity verified: {}",
        orchestrator.verify_final_record(instance_id).await?
    );

    Ok(())
}
