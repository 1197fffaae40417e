use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use eventsense_common::{RunId, RunStatus};
use serde::{Deserialize, Serialize};

use super::query::{IrExport, PdfExport, QueryFacade, ResultView, StatusView};
use super::runner::RunOrchestrator;
use super::store::RunStore;
use super::submission::SubmitRequest;
use crate::errors::AttributionError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: RunStore,
    pub orchestrator: RunOrchestrator,
    pub facade: QueryFacade,
}

impl AppState {
    pub fn new(orchestrator: RunOrchestrator) -> Self {
        let store = orchestrator.store().clone();
        Self {
            facade: QueryFacade::new(store.clone()),
            store,
            orchestrator,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    pub run_id: String,
}

impl RunQuery {
    fn run_id(&self) -> RunId {
        RunId::from(self.run_id.trim())
    }
}

#[derive(Debug, Deserialize)]
pub struct OhlcvQuery {
    pub ticker: String,
    pub timeframe: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub run_id: RunId,
    pub status: RunStatus,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "validation",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message, "kind": kind}))).into_response()
    }
}

impl From<AttributionError> for ApiError {
    fn from(err: AttributionError) -> Self {
        match err {
            AttributionError::Validation(e) => ApiError::BadRequest(e.to_string()),
            AttributionError::NotFound { run_id } => {
                ApiError::NotFound(format!("Run {} not found", run_id))
            }
            other => {
                tracing::error!(error = %other, "Request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/api/attribution/run", post(submit_run))
        .route("/api/attribution/status", get(run_status))
        .route("/api/attribution/result", get(run_result))
        .route("/api/attribution/cancel", post(cancel_run))
        .route("/api/export/ir", get(export_ir))
        .route("/api/export/pdf", get(export_pdf))
        .route("/api/marketdata/ohlcv", get(marketdata_ohlcv))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn submit_run(
    State(state): State<SharedState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(request) = payload?;
    let run = state.orchestrator.submit(request).await?;
    Ok(Json(SubmitResponse {
        run_id: run.run_id.clone(),
        status: run.status,
    }))
}

async fn run_status(
    State(state): State<SharedState>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> Result<Json<StatusView>, ApiError> {
    let Query(query) = query?;
    Ok(Json(state.facade.status(&query.run_id())?))
}

async fn run_result(
    State(state): State<SharedState>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> Result<Json<ResultView>, ApiError> {
    let Query(query) = query?;
    Ok(Json(state.facade.result(&query.run_id())?))
}

async fn cancel_run(
    State(state): State<SharedState>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> Result<Json<StatusView>, ApiError> {
    let Query(query) = query?;
    let run = state.orchestrator.cancel(&query.run_id()).await?;
    Ok(Json(StatusView::from(run.as_ref())))
}

async fn export_ir(
    State(state): State<SharedState>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> Result<Json<IrExport>, ApiError> {
    let Query(query) = query?;
    Ok(Json(state.facade.export_ir(&query.run_id())?))
}

async fn export_pdf(
    State(state): State<SharedState>,
    query: Result<Query<RunQuery>, QueryRejection>,
) -> Result<Json<PdfExport>, ApiError> {
    let Query(query) = query?;
    Ok(Json(state.facade.export_pdf(&query.run_id())?))
}

/// Market data is served by a separate integration; this echoes the request
/// shape with no candles.
async fn marketdata_ohlcv(
    query: Result<Query<OhlcvQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(q) = query?;
    Ok(Json(serde_json::json!({
        "ticker": q.ticker,
        "timeframe": q.timeframe,
        "start": q.start,
        "end": q.end,
        "ohlcv": [],
    })))
}

// ── Tests ─────────────────────────────────────────────────────────────
