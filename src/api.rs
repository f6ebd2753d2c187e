//! REST API for the underwriting orchestrator
//!
//! A thin adapter over the client surface: every handler calls exactly one
//! `Orchestrator` operation and maps its error onto a status code.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::UnderwritingError;
use crate::models::{Decision, LoanApplication, Phase};
use crate::workflow::Orchestrator;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReviewRequest {
    pub decision: Decision,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type Reply = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(status: StatusCode, data: T) -> Reply {
    (status, Json(ApiResponse::success(data)))
}

fn status_for(error: &UnderwritingError) -> StatusCode {
    match error {
        UnderwritingError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        UnderwritingError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
        UnderwritingError::InvalidSignalError { .. } | UnderwritingError::StateConflict(_) => {
            StatusCode::CONFLICT
        }
        UnderwritingError::NotReadyError { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: UnderwritingError) -> Reply {
    let status = status_for(&error);
    if status.is_server_error() {
        warn!(code = error.code(), error = %error, "Request failed");
    }

    let mut response = ApiResponse::error(error.to_string());
    if let UnderwritingError::NotReadyError { instance_id, phase } = &error {
        response.data = Some(serde_json::json!({
            "instance_id": instance_id,
            "phase": phase,
            "status": "pending",
        }));
    }
    (status, Json(response))
}

/// Malformed or mistyped bodies answer in the same envelope as every other error.
fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Reply> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        warn!(status = %rejection.status(), "Rejected request body");
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ApiResponse::error(format!(
                "invalid request body: {}",
                rejection.body_text()
            ))),
        )
    })
}

fn parse_instance_id(raw: &str) -> Result<Uuid, Reply> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("unknown instance id '{}'", raw))),
        )
    })
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "store": state.orchestrator.store().backend(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Applications
/// =============================

async fn submit_application(
    State(state): State<ApiState>,
    payload: Result<Json<LoanApplication>, JsonRejection>,
) -> Reply {
    let application = match parse_body(payload) {
        Ok(application) => application,
        Err(reply) => return reply,
    };
    info!(applicant_id = %application.applicant_id, "Received application");

    match state.orchestrator.start(application).await {
        Ok(instance_id) => ok(
            StatusCode::ACCEPTED,
            serde_json::json!({ "instance_id": instance_id, "phase": Phase::Created }),
        ),
        Err(e) => failure(e),
    }
}

async fn list_applications(State(state): State<ApiState>) -> Reply {
    match state.orchestrator.list().await {
        Ok(listing) => ok(StatusCode::OK, listing),
        Err(e) => failure(e),
    }
}

async fn get_summary(State(state): State<ApiState>, Path(raw_id): Path<String>) -> Reply {
    let instance_id = match parse_instance_id(&raw_id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };

    match state.orchestrator.get_summary(instance_id).await {
        Ok(summary) => ok(StatusCode::OK, summary),
        Err(e) => failure(e),
    }
}

async fn get_final_result(State(state): State<ApiState>, Path(raw_id): Path<String>) -> Reply {
    let instance_id = match parse_instance_id(&raw_id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };

    match state.orchestrator.get_final_result(instance_id).await {
        Ok(result) => ok(StatusCode::OK, result),
        Err(e) => failure(e),
    }
}

/// =============================
/// Signals
/// =============================

async fn submit_review(
    State(state): State<ApiState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<ReviewRequest>, JsonRejection>,
) -> Reply {
    let instance_id = match parse_instance_id(&raw_id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    let req = match parse_body(payload) {
        Ok(req) => req,
        Err(reply) => return reply,
    };

    match state
        .orchestrator
        .submit_human_review(instance_id, req.decision, req.note)
        .await
    {
        Ok(ack) => ok(StatusCode::OK, ack),
        Err(e) => failure(e),
    }
}

async fn cancel_application(
    State(state): State<ApiState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> Reply {
    let instance_id = match parse_instance_id(&raw_id) {
        Ok(id) => id,
        Err(reply) => return reply,
    };
    let req = match parse_body(payload) {
        Ok(req) => req,
        Err(reply) => return reply,
    };

    match state.orchestrator.cancel(instance_id, req.reason).await {
        Ok(ack) => ok(StatusCode::OK, ack),
        Err(e) => failure(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route(
            "/api/applications",
            post(submit_application).get(list_applications),
        )
        .route("/api/applications/:id/summary", get(get_summary))
        .route("/api/applications/:id/final", get(get_final_result))
        .route("/api/applications/:id/review", post(submit_review))
        .route("/api/applications/:id/cancel", post(cancel_application))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
