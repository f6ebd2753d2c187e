//! Loan Underwriting Orchestrator
//!
//! A durable orchestration engine for loan applications that:
//! - Fetches bank, document and credit records with retry and provider fallback
//! - Runs deterministic income, expense and credit assessments in parallel
//! - Asks a narrative aggregator for a summary and suggested decision
//! - Suspends for a human reviewer and resumes on their signal
//! - Checkpoints every step so a restarted engine continues where it stopped
//! - Freezes an auditable final record
//!
//! LIFECYCLE:
//! CREATED → FETCH → ASSESS → AGGREGATE → AWAIT REVIEW → FINALIZE → COMPLETED

pub mod aggregator;
pub mod api;
pub mod assessment;
pub mod audit;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod sources;
pub mod state;
pub mod telemetry;
pub mod workflow;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use workflow::Orchestrator;
