use crate::ratelimit::RateLimiter;
use crate::state::AppState;
use crate::store::MemoryStore;
use axum::Router;
use axum::routing::{get, post};
use std::sync::{Arc, RwLock};

pub mod handlers;
pub mod responses;

#[derive(Debug, Clone)]
pub struct ApiState {
    pub state: Arc<RwLock<AppState>>,
    pub limiter: Arc<RateLimiter<MemoryStore>>,
}

pub fn router(api: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::get_health))
        .route("/api/checkpoints", get(handlers::get_checkpoints))
        .route("/api/checkpoints/{id}/level", get(handlers::get_level))
        .route("/api/checkpoints/{id}/series", get(handlers::get_series))
        .route("/api/checkpoints/{id}/votes", post(handlers::post_vote))
        .with_state(api)
}
