//! HTTP authoring and observation surface.
//!
//! Thin layer over the specification store, the run-state store and the
//! event stream: every read returns the document together with its
//! concurrency token, every write carries the token back, and a lost race
//! answers 409 with both tokens so the caller can re-read and reconcile.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::compiler::{Compiler, InstructionPlan, RunContext};
use crate::errors::StoreError;
use crate::events::{Event, EventStream};
use crate::flow::{Finding, Flow, ValidationLevel};
use crate::routing::GraphExtension;
use crate::runstate::{RunState, RunStateStore};
use crate::specstore::SpecStore;
use crate::station::Station;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub specs: Arc<SpecStore>,
    pub runs: Arc<RunStateStore>,
    pub events: Arc<EventStream>,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
pub struct PutFlowRequest {
    pub flow: Flow,
    /// Token from the read this write is based on; absent for creation
    pub expected_token: Option<String>,
}

#[derive(Deserialize)]
pub struct PutStationRequest {
    pub station: Station,
    pub expected_token: Option<String>,
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    pub flow: Flow,
    pub level: Option<ValidationLevel>,
}

#[derive(Deserialize)]
pub struct CompilePreviewRequest {
    pub step: String,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    /// Replay events with id greater than this; 0 replays everything
    #[serde(default)]
    pub after: u64,
}

#[derive(Serialize)]
pub struct DocumentResponse<T> {
    pub document: T,
    pub token: String,
}

#[derive(Serialize)]
pub struct FindingsResponse {
    pub ok: bool,
    pub findings: Vec<Finding>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Conflict { expected: String, actual: String },
    Validation(Vec<Finding>),
    BadRequest(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => ApiError::NotFound(format!("'{id}' not found")),
            StoreError::RunNotFound { run_id } => {
                ApiError::NotFound(format!("Run '{run_id}' not found"))
            }
            StoreError::Conflict { expected, actual } => ApiError::Conflict { expected, actual },
            StoreError::Validation { findings } => ApiError::Validation(findings),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": msg}))).into_response()
            }
            ApiError::Conflict { expected, actual } => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "concurrency conflict",
                    "expected_token": expected,
                    "actual_token": actual,
                })),
            )
                .into_response(),
            ApiError::Validation(findings) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "error": "validation rejected the document",
                    "findings": findings,
                })),
            )
                .into_response(),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": msg})),
            )
                .into_response(),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": msg})),
            )
                .into_response(),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/flows", get(list_flows))
        .route("/api/flows/{id}", get(get_flow).put(put_flow))
        .route("/api/flows/{id}/validate", axum::routing::post(validate_flow))
        .route("/api/flows/{id}/compile", axum::routing::post(compile_preview))
        .route("/api/flows/{id}/proposals", get(list_proposals))
        .route("/api/stations/{id}", get(get_station).put(put_station))
        .route("/api/stations/{id}/{version}", get(get_station_version))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/events", get(get_run_events))
        .route("/health", get(health_check))
}

/// Full application router with CORS, ready to serve.
pub fn router(state: SharedState) -> Router {
    api_router().layer(CorsLayer::permissive()).with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn list_flows(State(state): State<SharedState>) -> Json<Vec<Flow>> {
    Json(state.specs.list_flows())
}

async fn get_flow(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse<Flow>>, ApiError> {
    let (flow, token) = state.specs.get_flow(&id)?;
    Ok(Json(DocumentResponse {
        document: flow,
        token,
    }))
}

async fn put_flow(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PutFlowRequest>,
) -> Result<Json<DocumentResponse<Flow>>, ApiError> {
    if req.flow.id != id {
        return Err(ApiError::BadRequest(format!(
            "Path id '{id}' does not match document id '{}'",
            req.flow.id
        )));
    }
    let (flow, token) = state
        .specs
        .put_flow(req.flow, req.expected_token.as_deref())?;
    Ok(Json(DocumentResponse {
        document: flow,
        token,
    }))
}

async fn validate_flow(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<FindingsResponse>, ApiError> {
    if req.flow.id != id {
        return Err(ApiError::BadRequest(format!(
            "Path id '{id}' does not match document id '{}'",
            req.flow.id
        )));
    }
    let findings = state
        .specs
        .validate_flow(&req.flow, req.level.unwrap_or_default());
    let ok = !findings.iter().any(|f| f.severity.is_error());
    Ok(Json(FindingsResponse { ok, findings }))
}

/// Compile one step of a stored flow against the current catalogs, without
/// touching any run. The preview uses a throwaway run id.
async fn compile_preview(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<CompilePreviewRequest>,
) -> Result<Json<InstructionPlan>, ApiError> {
    let (flow, _) = state.specs.get_flow(&id)?;
    let stations = state.specs.stations_snapshot();
    let fragments = state.specs.fragments_snapshot();
    let compiler = Compiler::new(&stations, &fragments);

    let mut ctx = RunContext::new(Uuid::new_v4(), 0);
    ctx.overrides = req.overrides;
    let plan = compiler
        .compile(&flow, &req.step, &ctx)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(plan))
}

async fn list_proposals(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Json<Vec<GraphExtension>> {
    Json(state.specs.proposals_for(&id))
}

async fn get_station(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse<Station>>, ApiError> {
    let (station, token) = state.specs.latest_station(&id)?;
    Ok(Json(DocumentResponse {
        document: station,
        token,
    }))
}

async fn get_station_version(
    State(state): State<SharedState>,
    Path((id, version)): Path<(String, u32)>,
) -> Result<Json<DocumentResponse<Station>>, ApiError> {
    let (station, token) = state.specs.get_station(&id, version)?;
    Ok(Json(DocumentResponse {
        document: station,
        token,
    }))
}

async fn put_station(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PutStationRequest>,
) -> Result<Json<DocumentResponse<Station>>, ApiError> {
    if req.station.id != id {
        return Err(ApiError::BadRequest(format!(
            "Path id '{id}' does not match document id '{}'",
            req.station.id
        )));
    }
    let (station, token) = state
        .specs
        .put_station(req.station, req.expected_token.as_deref())?;
    Ok(Json(DocumentResponse {
        document: station,
        token,
    }))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunState>, ApiError> {
    Ok(Json(state.runs.load(id)?))
}

async fn get_run_events(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<Event>> {
    let events = state
        .events
        .for_run(id)
        .into_iter()
        .filter(|e| e.id > query.after)
        .collect();
    Json(events)
}
