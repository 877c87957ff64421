use crate::estimation::estimator::Confidence;
use crate::estimation::level::{CongestionLevel, LEVEL_COUNT};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct LevelSuccessResponse {
    pub checkpoint_id: String,
    pub name: String,
    pub level: u8,
    pub status: CongestionLevel,
    pub confidence: Confidence,
    pub vote_count: usize,
    pub weighted_average: f64,
    pub weights: [f64; LEVEL_COUNT],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_delay_minutes: Option<f64>,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SeriesBucketResponse {
    pub index: usize,
    pub count: u32,
    pub avg: f64,
    pub smoothed: f64,
    /// Absent for buckets without votes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CongestionLevel>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SummaryResponse {
    pub total: u32,
    pub avg: f64,
    pub counts: [u32; LEVEL_COUNT],
    pub status: CongestionLevel,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SeriesSuccessResponse {
    pub checkpoint_id: String,
    pub day_start: String,
    pub buckets: Vec<SeriesBucketResponse>,
    pub summary: SummaryResponse,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointEntry {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CongestionLevel>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointsSuccessResponse {
    pub checkpoints: Vec<CheckpointEntry>,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VoteRequest {
    pub level: i64,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub origin_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct VoteAcceptedResponse {
    pub checkpoint_id: String,
    pub level: u8,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthSuccessResponse {
    pub status: HealthStatus,
    pub checkpoints: usize,
    pub refreshed: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    NoData,
    UnknownCheckpoint,
    InvalidVote,
    RateLimited,
    InternalError,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ErrorResponse {
    pub error_code: ApiErrorCode,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<i64>,
    pub timestamp: String,
}
