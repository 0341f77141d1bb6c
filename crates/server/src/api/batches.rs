//! Batch API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use cartpilot_core::{
    AccountRange, BatchConfig, BatchError, BatchId, BatchStatus, Event, EventFilter, EventKind,
    EventLevel, StopAck, TaskId, TaskResult,
};

use crate::state::AppState;

/// Maximum allowed limit for event queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for event queries
const DEFAULT_LIMIT: i64 = 100;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for starting a batch
#[derive(Debug, Deserialize)]
pub struct StartBatchBody {
    /// First account number, inclusive
    pub range_start: u64,
    /// Last account number, inclusive
    pub range_end: u64,
    #[serde(flatten)]
    pub config: BatchConfig,
}

#[derive(Debug, Serialize)]
pub struct StartBatchResponse {
    pub batch_id: BatchId,
}

/// Query parameters for the event history
#[derive(Debug, Deserialize)]
pub struct ListEventsParams {
    pub task_id: Option<String>,
    pub kind: Option<String>,
    /// Lowest level to include: debug, info, warn or error
    pub level: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListEventsResponse {
    pub events: Vec<Event>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct ListBatchesResponse {
    pub batches: Vec<BatchStatus>,
}

#[derive(Debug, Serialize)]
pub struct StopAllResponse {
    pub acknowledged: bool,
    /// Batches that were running and are now stopping.
    pub stopped: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct BatchErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<BatchErrorResponse>);

fn error_response(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(BatchErrorResponse {
            error: error.into(),
        }),
    )
}

fn batch_error(e: BatchError) -> ApiError {
    let status = match &e {
        BatchError::Validation(_) => StatusCode::BAD_REQUEST,
        BatchError::NotFound(_) => StatusCode::NOT_FOUND,
        BatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn parse_batch_id(id: &str) -> Result<BatchId, ApiError> {
    id.parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid batch id: {}", id)))
}

// ============================================================================
// Handlers
// ============================================================================

/// Start a batch over an account range
pub async fn start_batch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartBatchBody>,
) -> Result<(StatusCode, Json<StartBatchResponse>), ApiError> {
    let range = AccountRange::new(body.range_start, body.range_end);
    let batch_id = state
        .controller()
        .start(range, body.config)
        .await
        .map_err(batch_error)?;

    Ok((StatusCode::CREATED, Json(StartBatchResponse { batch_id })))
}

/// List batches started by this process
pub async fn list_batches(State(state): State<Arc<AppState>>) -> Json<ListBatchesResponse> {
    Json(ListBatchesResponse {
        batches: state.controller().list().await,
    })
}

/// Get the status of a batch
pub async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BatchStatus>, ApiError> {
    let id = parse_batch_id(&id)?;
    state
        .controller()
        .status(&id)
        .await
        .map(Json)
        .map_err(batch_error)
}

/// Get the finished task outcomes of a batch
pub async fn get_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TaskResult>>, ApiError> {
    let id = parse_batch_id(&id)?;
    state
        .controller()
        .results(&id)
        .await
        .map(Json)
        .map_err(batch_error)
}

/// Event history of a batch, from the event log
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ListEventsParams>,
) -> Result<Json<ListEventsResponse>, ApiError> {
    let id = parse_batch_id(&id)?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = EventFilter::new()
        .with_batch_id(id)
        .with_limit(limit)
        .with_offset(offset);

    if let Some(ref task_id) = params.task_id {
        let task_id: TaskId = task_id.parse().map_err(|_| {
            error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid task id: {}", task_id),
            )
        })?;
        filter = filter.with_task_id(task_id);
    }

    if let Some(ref kind) = params.kind {
        let kind = EventKind::parse(kind).ok_or_else(|| {
            error_response(StatusCode::BAD_REQUEST, format!("Unknown event kind: {}", kind))
        })?;
        filter = filter.with_kind(kind);
    }

    if let Some(ref level) = params.level {
        let level = EventLevel::parse(level).ok_or_else(|| {
            error_response(StatusCode::BAD_REQUEST, format!("Unknown level: {}", level))
        })?;
        filter = filter.with_min_level(level);
    }

    let store = state.run_store();
    let events = store
        .query_events(&filter)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    // Get total count (without pagination)
    let count_filter = EventFilter {
        limit: i64::MAX,
        offset: 0,
        ..filter.clone()
    };
    let total = store
        .count_events(&count_filter)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(ListEventsResponse {
        events,
        total,
        limit,
        offset,
    }))
}

/// Request a cooperative stop of one batch
pub async fn stop_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StopAck>, ApiError> {
    let id = parse_batch_id(&id)?;
    state
        .controller()
        .stop(&id)
        .await
        .map(Json)
        .map_err(batch_error)
}

/// Stop every running batch
pub async fn stop_all(State(state): State<Arc<AppState>>) -> Json<StopAllResponse> {
    let stopped = state.controller().stop_all().await;
    info!(stopped, "Stop requested for all running batches");
    Json(StopAllResponse {
        acknowledged: true,
        stopped,
    })
}
