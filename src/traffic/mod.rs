//! External traffic-delay source for checkpoints, with caller-owned caching.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod cache;
pub mod mock;
pub mod remote;

use cache::TtlCache;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficReading {
    pub delay_minutes: f64,
    pub fetched_at_ms: i64,
}

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("dns error: {0}")]
    Dns(String),
    #[error("connect error: {0}")]
    Connect(std::io::Error),
    #[error("io error: {0}")]
    Io(std::io::Error),
    #[error("http status {0} ({1})")]
    Http(u16, String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

pub trait TrafficSource: Send + Sync + std::fmt::Debug {
    fn fetch(&self, checkpoint_id: &str, now_ms: i64) -> Result<TrafficReading, TrafficError>;
}

/// Return the cached reading while fresh, otherwise fetch and cache.
///
/// A failed fetch falls back to the last cached reading, however old.
pub fn refresh_traffic(
    source: &dyn TrafficSource,
    cache: &mut TtlCache<TrafficReading>,
    checkpoint_id: &str,
    now_ms: i64,
) -> Option<TrafficReading> {
    if let Some(reading) = cache.get_fresh(now_ms) {
        debug!(checkpoint_id, "Traffic cache hit");
        return Some(reading.clone());
    }

    match source.fetch(checkpoint_id, now_ms) {
        Ok(reading) => {
            cache.store(reading.clone(), now_ms);
            Some(reading)
        }
        Err(err) => {
            warn!(checkpoint_id, error = %err, "Traffic fetch failed");
            cache.last().cloned()
        }
    }
}
