use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};
use crate::backup::{BackupOutcome, Initiator, RunResult};
use crate::history::BackupAttempt;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub artifact_name: String,
}

fn outcome_response(outcome: BackupOutcome, failure_message: &str) -> Response {
    match outcome.result {
        RunResult::Completed { message, receipt } => (
            StatusCode::OK,
            Json(json!({
                "status": "completed",
                "message": message,
                "receipt": receipt,
                "attempt": outcome.attempt,
            })),
        )
            .into_response(),
        RunResult::Failed { reason, failure } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": failure_message,
                "details": reason,
                "failure": failure,
                "attempt": outcome.attempt,
            })),
        )
            .into_response(),
    }
}

pub async fn trigger_backup(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Response> {
    let outcome = state
        .orchestrator
        .try_backup(Initiator::Manual {
            operator_id: user.user_id,
        })
        .await?;
    Ok(outcome_response(outcome, "Backup failed"))
}

pub async fn trigger_restore(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<RestoreRequest>,
) -> ApiResult<Response> {
    let artifact = body.artifact_name.trim();
    if artifact.is_empty() {
        return Err(ApiError::BadRequest("artifact_name must not be empty".to_string()));
    }
    let outcome = state
        .orchestrator
        .try_restore(artifact, Some(user.user_id))
        .await?;
    Ok(outcome_response(outcome, "Restore failed"))
}

pub async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<BackupAttempt>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);
    let records = state.history.list(limit, offset).await?;
    Ok(Json(records))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<BackupAttempt>> {
    state
        .history
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("history record {}", id)))
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
