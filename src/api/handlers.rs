use crate::api::ApiState;
use crate::api::responses::{
    ApiErrorCode, CheckpointEntry, CheckpointsSuccessResponse, ErrorResponse, HealthStatus,
    HealthSuccessResponse, LevelSuccessResponse, SeriesBucketResponse, SeriesSuccessResponse,
    SummaryResponse, VoteAcceptedResponse, VoteRequest,
};
use crate::error::AppError;
use crate::estimation::level::{clamp_level, level_from_average};
use crate::estimation::now_ms;
use crate::state::AppState;
use crate::vote::Vote;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info};

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";
const EPOCH_TIMESTAMP: &str = "1970-01-01T00:00:00Z";
/// How far ahead of server time a client vote timestamp may be.
const MAX_CLOCK_SKEW_MS: i64 = 60_000;

#[derive(Debug)]
enum TimestampError {
    Range(time::error::ComponentRange),
    Format(time::error::Format),
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampError::Range(err) => write!(f, "timestamp out of range: {err}"),
            TimestampError::Format(err) => write!(f, "timestamp format error: {err}"),
        }
    }
}

pub enum ApiResponse<T> {
    Success { status: StatusCode, body: T },
    Error {
        status: StatusCode,
        body: ErrorResponse,
    },
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self {
            ApiResponse::Success { status, body } => (status, Json(body)).into_response(),
            ApiResponse::Error { status, body } => (status, Json(body)).into_response(),
        }
    }
}

pub async fn get_health(State(api): State<ApiState>) -> impl IntoResponse {
    build_health_response(&api.state, now_ms())
}

pub async fn get_checkpoints(State(api): State<ApiState>) -> impl IntoResponse {
    build_checkpoints_response(&api.state, now_ms())
}

pub async fn get_level(
    State(api): State<ApiState>,
    Path(checkpoint_id): Path<String>,
) -> impl IntoResponse {
    build_level_response(&api.state, &checkpoint_id, now_ms())
}

pub async fn get_series(
    State(api): State<ApiState>,
    Path(checkpoint_id): Path<String>,
) -> impl IntoResponse {
    build_series_response(&api.state, &checkpoint_id, now_ms())
}

pub async fn post_vote(
    State(api): State<ApiState>,
    Path(checkpoint_id): Path<String>,
    Json(request): Json<VoteRequest>,
) -> impl IntoResponse {
    build_vote_response(&api, &checkpoint_id, request, now_ms())
}

fn build_health_response(
    state: &Arc<RwLock<AppState>>,
    now: i64,
) -> ApiResponse<HealthSuccessResponse> {
    let Ok(guard) = state.read() else {
        return internal_error("state lock poisoned while reading snapshots", now);
    };
    let checkpoints = guard.checkpoints().len();
    let refreshed = guard
        .checkpoints()
        .iter()
        .filter(|c| guard.snapshot(&c.id).is_some())
        .count();
    drop(guard);

    let status = if checkpoints > 0 && refreshed == checkpoints {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    };

    with_timestamp(now, |timestamp| HealthSuccessResponse {
        status,
        checkpoints,
        refreshed,
        timestamp,
    })
}

fn build_checkpoints_response(
    state: &Arc<RwLock<AppState>>,
    now: i64,
) -> ApiResponse<CheckpointsSuccessResponse> {
    let Ok(guard) = state.read() else {
        return internal_error("state lock poisoned while reading checkpoints", now);
    };
    let checkpoints = guard
        .checkpoints()
        .iter()
        .map(|checkpoint| {
            let level = guard.snapshot(&checkpoint.id).map(|s| s.estimate.level);
            CheckpointEntry {
                id: checkpoint.id.clone(),
                name: checkpoint.name.clone(),
                level: level.map(|l| l.index()),
                status: level,
            }
        })
        .collect();
    drop(guard);

    with_timestamp(now, |timestamp| CheckpointsSuccessResponse {
        checkpoints,
        timestamp,
    })
}

fn build_level_response(
    state: &Arc<RwLock<AppState>>,
    checkpoint_id: &str,
    now: i64,
) -> ApiResponse<LevelSuccessResponse> {
    let Ok(guard) = state.read() else {
        return internal_error("state lock poisoned while reading level", now);
    };
    let Some(checkpoint) = guard.checkpoint(checkpoint_id).cloned() else {
        return unknown_checkpoint(checkpoint_id, now);
    };
    let Some(snapshot) = guard.snapshot(checkpoint_id).cloned() else {
        return no_data(now);
    };
    drop(guard);

    let estimate = snapshot.estimate;
    with_timestamp(snapshot.computed_at_ms, |timestamp| LevelSuccessResponse {
        checkpoint_id: checkpoint.id,
        name: checkpoint.name,
        level: estimate.level.index(),
        status: estimate.level,
        confidence: estimate.confidence,
        vote_count: estimate.count,
        weighted_average: estimate.avg,
        weights: estimate.buckets,
        traffic_delay_minutes: snapshot.traffic.map(|t| t.delay_minutes),
        timestamp,
    })
}

fn build_series_response(
    state: &Arc<RwLock<AppState>>,
    checkpoint_id: &str,
    now: i64,
) -> ApiResponse<SeriesSuccessResponse> {
    let Ok(guard) = state.read() else {
        return internal_error("state lock poisoned while reading series", now);
    };
    if guard.checkpoint(checkpoint_id).is_none() {
        return unknown_checkpoint(checkpoint_id, now);
    }
    let Some(snapshot) = guard.snapshot(checkpoint_id).cloned() else {
        return no_data(now);
    };
    drop(guard);

    let day_start = match format_timestamp(snapshot.day_start_ms) {
        Ok(formatted) => formatted,
        Err(err) => {
            return internal_error(&format!("day start formatting failure: {err}"), now);
        }
    };
    let buckets = snapshot
        .series
        .iter()
        .enumerate()
        .map(|(index, bucket)| SeriesBucketResponse {
            index,
            count: bucket.count,
            avg: bucket.avg,
            smoothed: bucket.smoothed,
            status: (!bucket.is_empty()).then(|| level_from_average(bucket.avg)),
        })
        .collect();
    let summary = SummaryResponse {
        total: snapshot.summary.total,
        avg: snapshot.summary.avg,
        counts: snapshot.summary.counts,
        status: snapshot.summary.level(),
    };

    with_timestamp(snapshot.computed_at_ms, |timestamp| SeriesSuccessResponse {
        checkpoint_id: snapshot.checkpoint_id,
        day_start,
        buckets,
        summary,
        timestamp,
    })
}

fn build_vote_response(
    api: &ApiState,
    checkpoint_id: &str,
    request: VoteRequest,
    now: i64,
) -> ApiResponse<VoteAcceptedResponse> {
    match api.state.read() {
        Ok(guard) if guard.checkpoint(checkpoint_id).is_none() => {
            return unknown_checkpoint(checkpoint_id, now);
        }
        Ok(_) => {}
        Err(_) => return internal_error("state lock poisoned while checking checkpoint", now),
    }

    let timestamp_ms = request.timestamp_ms.unwrap_or(now);
    if timestamp_ms < 0 {
        return invalid_vote("timestamp_ms must not be negative", now);
    }
    if timestamp_ms > now.saturating_add(MAX_CLOCK_SKEW_MS) {
        return invalid_vote("timestamp_ms is in the future", now);
    }
    let timestamp = match format_timestamp(timestamp_ms) {
        Ok(formatted) => formatted,
        Err(err) => return internal_error(&format!("vote timestamp formatting failure: {err}"), now),
    };

    let vote = Vote {
        checkpoint_id: checkpoint_id.to_string(),
        level: request.level,
        timestamp_ms,
        origin_id: request.origin_id,
    };
    let level = clamp_level(vote.level);

    let admitted = api.limiter.admit(&vote, now, || match api.state.write() {
        Ok(mut guard) => guard.record_vote(vote.clone()),
        Err(_) => Err(AppError::StateLock),
    });
    if let Err(err) = admitted {
        return vote_error(err, now);
    }

    info!(checkpoint_id, level, "Vote accepted");
    ApiResponse::Success {
        status: StatusCode::ACCEPTED,
        body: VoteAcceptedResponse {
            checkpoint_id: checkpoint_id.to_string(),
            level,
            timestamp,
        },
    }
}

fn invalid_vote<T>(message: &str, now: i64) -> ApiResponse<T> {
    error_response(
        StatusCode::BAD_REQUEST,
        ApiErrorCode::InvalidVote,
        message.to_string(),
        None,
        now,
    )
}

fn vote_error<T>(err: AppError, now: i64) -> ApiResponse<T> {
    match err {
        AppError::UnknownCheckpoint(id) => unknown_checkpoint(&id, now),
        AppError::RateLimited { retry_after_ms } => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            ApiErrorCode::RateLimited,
            "Vote rate limit exceeded for this device".to_string(),
            Some(retry_after_ms),
            now,
        ),
        other => internal_error(&format!("vote handling failed: {other}"), now),
    }
}

fn with_timestamp<T>(timestamp_ms: i64, build: impl FnOnce(String) -> T) -> ApiResponse<T> {
    match format_timestamp(timestamp_ms) {
        Ok(formatted) => ApiResponse::Success {
            status: StatusCode::OK,
            body: build(formatted),
        },
        Err(err) => internal_error(&format!("timestamp formatting failure: {err}"), now_ms()),
    }
}

fn unknown_checkpoint<T>(checkpoint_id: &str, now: i64) -> ApiResponse<T> {
    error_response(
        StatusCode::NOT_FOUND,
        ApiErrorCode::UnknownCheckpoint,
        format!("Unknown checkpoint: {checkpoint_id}"),
        None,
        now,
    )
}

fn no_data<T>(now: i64) -> ApiResponse<T> {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        ApiErrorCode::NoData,
        "No estimate available yet".to_string(),
        None,
        now,
    )
}

fn internal_error<T>(message: &str, now: i64) -> ApiResponse<T> {
    error!(message = message, "Internal error while handling API request");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ApiErrorCode::InternalError,
        INTERNAL_ERROR_MESSAGE.to_string(),
        None,
        now,
    )
}

fn error_response<T>(
    status: StatusCode,
    error_code: ApiErrorCode,
    error_message: String,
    retry_after_ms: Option<i64>,
    now: i64,
) -> ApiResponse<T> {
    let timestamp = format_timestamp(now).unwrap_or_else(|err| {
        error!(error = %err, "Failed to format error timestamp");
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| EPOCH_TIMESTAMP.to_string())
    });
    ApiResponse::Error {
        status,
        body: ErrorResponse {
            error_code,
            error_message,
            retry_after_ms,
            timestamp,
        },
    }
}

fn format_timestamp(timestamp_ms: i64) -> Result<String, TimestampError> {
    let datetime = OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp_ms) * 1_000_000)
        .map_err(TimestampError::Range)?;
    datetime.format(&Rfc3339).map_err(TimestampError::Format)
}
