use loan_underwriting_orchestrator::{
    api::start_server, config::AppConfig, telemetry, workflow::Orchestrator,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env and environment variables
    let config = AppConfig::from_env()?;
    telemetry::init(&config.telemetry)?;

    info!("🚀 Loan Underwriting Orchestrator - API Server");
    info!("📍 Port: {}", config.server.port);
    info!(
        "🧠 Aggregator: {:?} | retries: fetch x{}, credit x{}+{}, aggregate x{}",
        config.aggregator.kind,
        config.retry.bank.max_attempts,
        config.retry.primary_credit.max_attempts,
        config.retry.fallback_credit.max_attempts,
        config.retry.aggregation.max_attempts,
    );

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
    info!(
        "✅ Orchestrator initialized (store: {})",
        orchestrator.store().backend()
    );

    // Pick up instances a previous process left mid-phase
    let resumer = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        match resumer.resume_incomplete().await {
            Ok(resumed) if !resumed.is_empty() => info!("♻️  Resumed {} instance(s)", resumed.len()),
            Ok(_) => {}
            Err(e) => error!("Failed to scan for incomplete instances: {}", e),
        }
    });

    if let Some(timeout) = config.review.timeout {
        info!("⏱️  Review deadline: {:?}", timeout);
        orchestrator.spawn_review_sweeper(timeout, config.review.sweep_interval);
    }

    if let Some(every) = config.recovery.sweep_interval {
        info!("🩺 Recovery sweep every {:?}", every);
        orchestrator.spawn_recovery_sweeper(every);
    }

    info!("📡 Starting API server...");
    start_server(orchestrator, config.server.port).await?;

    Ok(())
}
