use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use feature_usage_limits::LimitError;
use tracing::{error, info};

use super::types::{
    CheckUsageResponse, ErrorResponse, FeatureSubjectRequest, PurgeRequest, PurgeResponse,
    RemainingUnitsResponse, RemoveOverrideRequest, RemoveOverrideResponse, SetOverrideRequest,
    UsageRequest, UsageResponse, UsageSnapshotResponse,
};
use super::ApiState;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub async fn record_usage(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<UsageRequest>,
) -> ApiResult<UsageResponse> {
    state
        .verifier
        .record_feature_usage(&request.feature(), &request.subject, &request.deltas)
        .map_err(limit_error)?;

    Ok(Json(UsageResponse { success: true }))
}

pub async fn reduce_usage(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<UsageRequest>,
) -> ApiResult<UsageResponse> {
    state
        .verifier
        .reduce_feature_usage(&request.feature(), &request.subject, &request.deltas)
        .map_err(limit_error)?;

    Ok(Json(UsageResponse { success: true }))
}

pub async fn check_usage(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<UsageRequest>,
) -> ApiResult<CheckUsageResponse> {
    let within_limits = state
        .verifier
        .is_within_limits(&request.feature(), &request.subject, &request.deltas)
        .map_err(limit_error)?;

    Ok(Json(CheckUsageResponse { within_limits }))
}

pub async fn remaining_units(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<FeatureSubjectRequest>,
) -> ApiResult<RemainingUnitsResponse> {
    let remaining = state
        .verifier
        .remaining_units(&request.feature(), &request.subject)
        .map_err(limit_error)?;

    Ok(Json(RemainingUnitsResponse { remaining }))
}

pub async fn usage_snapshot(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<FeatureSubjectRequest>,
) -> ApiResult<UsageSnapshotResponse> {
    let limits = state
        .verifier
        .usage_snapshot(&request.feature(), &request.subject)
        .map_err(limit_error)?;

    Ok(Json(UsageSnapshotResponse { limits }))
}

pub async fn set_override(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SetOverrideRequest>,
) -> ApiResult<UsageResponse> {
    state
        .verifier
        .override_limit(&request.feature(), &request.subject, &request.rule)
        .map_err(limit_error)?;

    Ok(Json(UsageResponse { success: true }))
}

pub async fn remove_override(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<RemoveOverrideRequest>,
) -> ApiResult<RemoveOverrideResponse> {
    let removed = state
        .verifier
        .remove_limit_override(&request.feature(), &request.subject, &request.limit_id)
        .map_err(limit_error)?;

    Ok(Json(RemoveOverrideResponse { removed }))
}

pub async fn purge_expired(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<PurgeRequest>,
) -> ApiResult<PurgeResponse> {
    let as_of = request.as_of.unwrap_or_else(Utc::now);
    let removed = state.verifier.purge_expired(as_of).map_err(limit_error)?;

    info!(removed, as_of = %as_of, "manual retention sweep completed");
    Ok(Json(PurgeResponse { removed }))
}

pub async fn health_check() -> ApiResult<serde_json::Value> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": "usage-tracker"
    })))
}

fn limit_error(err: LimitError) -> (StatusCode, Json<ErrorResponse>) {
    match &err {
        LimitError::InvalidInput(message) => bad_request("invalid_request", message),
        LimitError::FeatureNotFound(_) => not_found("feature_not_found", &err.to_string()),
        LimitError::LimitExceeded {
            limit_id,
            current,
            requested,
            quota,
            ..
        } => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: err.to_string(),
                code: "limit_exceeded".to_string(),
                details: Some(serde_json::json!({
                    "limit_id": limit_id,
                    "current": current,
                    "requested": requested,
                    "quota": quota,
                })),
            }),
        ),
        _ => internal_error(&err),
    }
}

fn bad_request(code: &str, message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            code: code.to_string(),
            details: None,
        }),
    )
}

fn not_found(code: &str, message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.to_string(),
            code: code.to_string(),
            details: None,
        }),
    )
}

fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, Json<ErrorResponse>) {
    error!(error = %err, "usage API internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal server error".to_string(),
            code: "internal_error".to_string(),
            details: Some(serde_json::json!({ "message": err.to_string() })),
        }),
    )
}
