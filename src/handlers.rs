//! HTTP surface: batch passes, flight sweep and loyalty endpoints.
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, instrument};

use crate::config::Config;
use crate::flight::{self, FlightStatusService, PollSummary};
use crate::loyalty::{self, LoyaltyError};
use crate::model::{BatchCounts, LogStatus, NotificationLogEntry, ParamBag};
use crate::orchestrator::{
    BatchTally, MessageSpec, Orchestrator, PrepareRequest, PrepareSummary, QueueRequest,
    QueueSummary, RecipientParams,
};
use crate::template::{self, TemplateKind};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub orchestrator: Arc<Orchestrator>,
    pub flights: Arc<dyn FlightStatusService>,
    pub config: Arc<Config>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(err) => {
                error!(?err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<LoyaltyError> for ApiError {
    fn from(err: LoyaltyError) -> Self {
        match err {
            LoyaltyError::CustomerNotFound(_) | LoyaltyError::RedemptionNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            LoyaltyError::Store(inner) => ApiError::Internal(inner),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/batches/{batch}", get(batch_status))
        .route("/batches/{batch}/queue", post(queue_batch))
        .route("/batches/{batch}/prepare", post(prepare_batch))
        .route("/batches/{batch}/execute", post(execute_batch))
        .route("/batches/{batch}/retry", post(retry_batch))
        .route(
            "/batches/{batch}/entries",
            get(list_entries).delete(clear_entries),
        )
        .route("/flights/poll", post(poll_flights))
        .route("/loyalty/{customer}", get(loyalty_balance))
        .route("/loyalty/{customer}/accruals", post(accrue_points))
        .route("/loyalty/{customer}/redemptions", post(request_redemption))
        .route("/loyalty/redemptions/{id}/verify", post(verify_redemption))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct StatusFilter {
    pub status: Option<String>,
}

fn parse_status(raw: &str) -> Result<LogStatus, ApiError> {
    LogStatus::parse_status(raw.trim())
        .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {raw}")))
}

#[derive(Debug, Serialize)]
pub struct BatchView {
    pub batch: String,
    pub counts: BatchCounts,
    pub total: i64,
}

async fn batch_status(
    State(state): State<AppState>,
    Path(batch): Path<String>,
) -> Result<Json<BatchView>, ApiError> {
    let counts = state.orchestrator.counts(&batch).await?;
    Ok(Json(BatchView {
        total: counts.total(),
        batch,
        counts,
    }))
}

#[instrument(skip_all, fields(batch = %batch))]
async fn queue_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
    Json(request): Json<QueueRequest>,
) -> Result<Json<QueueSummary>, ApiError> {
    if request.recipients.is_empty() {
        return Err(ApiError::BadRequest("recipients must not be empty".into()));
    }
    Ok(Json(state.orchestrator.queue(&batch, &request).await?))
}

#[instrument(skip_all, fields(batch = %batch))]
async fn prepare_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
    Json(request): Json<PrepareRequest>,
) -> Result<Json<PrepareSummary>, ApiError> {
    if request.message.is_none() && !request.recipients.is_empty() {
        return Err(ApiError::BadRequest(
            "message is required when recipients are given".into(),
        ));
    }
    Ok(Json(state.orchestrator.prepare(&batch, &request).await?))
}

async fn execute_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
) -> Result<Json<BatchTally>, ApiError> {
    Ok(Json(state.orchestrator.execute(&batch).await?))
}

async fn retry_batch(
    State(state): State<AppState>,
    Path(batch): Path<String>,
) -> Result<Json<BatchTally>, ApiError> {
    Ok(Json(state.orchestrator.retry(&batch).await?))
}

async fn list_entries(
    State(state): State<AppState>,
    Path(batch): Path<String>,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<Vec<NotificationLogEntry>>, ApiError> {
    let status = filter.status.as_deref().map(parse_status).transpose()?;
    let mut entries = state.orchestrator.entries(&batch, status).await?;
    entries.iter_mut().for_each(template::redact_entry);
    Ok(Json(entries))
}

async fn clear_entries(
    State(state): State<AppState>,
    Path(batch): Path<String>,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let raw = filter
        .status
        .ok_or_else(|| ApiError::BadRequest("status query parameter is required".into()))?;
    let status = parse_status(&raw)?;
    let removed = state.orchestrator.clear(&batch, status).await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn poll_flights(State(state): State<AppState>) -> Result<Json<PollSummary>, ApiError> {
    let summary = flight::run_poll(
        &state.pool,
        state.flights.as_ref(),
        &state.config.flights,
        Utc::now().date_naive(),
        Some(state.orchestrator.as_ref()),
    )
    .await?;
    Ok(Json(summary))
}

async fn loyalty_balance(
    State(state): State<AppState>,
    Path(customer): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let balance = loyalty::balance(&state.pool, customer).await?;
    Ok(Json(json!({ "customer_id": customer, "balance": balance })))
}

#[derive(Debug, Deserialize)]
pub struct AccrualBody {
    pub amount: i64,
    #[serde(default)]
    pub reference: Option<String>,
}

async fn accrue_points(
    State(state): State<AppState>,
    Path(customer): Path<i64>,
    Json(body): Json<AccrualBody>,
) -> Result<impl IntoResponse, ApiError> {
    let accrual = loyalty::accrue(
        &state.pool,
        &state.config.loyalty,
        customer,
        body.amount,
        body.reference.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(accrual)))
}

#[derive(Debug, Deserialize)]
pub struct RedemptionBody {
    pub points: i64,
}

#[derive(Debug, Serialize)]
pub struct RedemptionCreated {
    pub redemption_id: i64,
    pub points: i64,
    pub expires_at: chrono::DateTime<Utc>,
    pub batch: String,
    pub delivery: BatchTally,
}

pub fn redemption_batch_id(redemption_id: i64) -> String {
    format!("redemption-{redemption_id}")
}

/// Create the redemption and deliver its code over WhatsApp. The code never
/// appears in the response.
#[instrument(skip_all, fields(customer = customer))]
async fn request_redemption(
    State(state): State<AppState>,
    Path(customer): Path<i64>,
    Json(body): Json<RedemptionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let redemption = loyalty::request_redemption(
        &state.pool,
        &state.config.loyalty,
        customer,
        body.points,
        Utc::now(),
    )
    .await?;

    let batch = redemption_batch_id(redemption.redemption_id);
    let request = PrepareRequest {
        message: Some(MessageSpec::Template {
            template: TemplateKind::CodigoRedencion,
            params: ParamBag::from([
                ("codigo".to_string(), redemption.code.clone()),
                ("puntos".to_string(), redemption.points.to_string()),
            ]),
        }),
        recipients: vec![RecipientParams::new(customer)],
    };
    let prepared = state.orchestrator.prepare(&batch, &request).await?;
    if prepared.storage_errors > 0 {
        return Err(ApiError::Internal(anyhow::anyhow!(
            "redemption {} could not be queued for delivery",
            redemption.redemption_id
        )));
    }
    if let Some(rejected) = prepared.rejected.first() {
        return Err(ApiError::BadRequest(format!(
            "redemption code cannot be delivered: {}",
            rejected.reason
        )));
    }
    let delivery = state.orchestrator.execute(&batch).await?;

    Ok((
        StatusCode::CREATED,
        Json(RedemptionCreated {
            redemption_id: redemption.redemption_id,
            points: redemption.points,
            expires_at: redemption.expires_at,
            batch,
            delivery,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub code: String,
}

async fn verify_redemption(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<VerifyBody>,
) -> Result<Json<loyalty::Verified>, ApiError> {
    let verified = loyalty::verify_redemption(
        &state.pool,
        &state.config.loyalty,
        id,
        &body.code,
        Utc::now(),
    )
    .await?;
    Ok(Json(verified))
}
