use crate::estimation::estimator::EstimatorParams;
use crate::estimation::{DEFAULT_LIVE_WINDOW, DEFAULT_REFRESH_INTERVAL, DEFAULT_TRAFFIC_TTL};
use crate::ratelimit::DEFAULT_MIN_INTERVAL;
use crate::traffic::remote::DEFAULT_TIMEOUT;
use crate::vote::Checkpoint;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const DEFAULT_SERVER_PORT: u16 = 8080;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub app: AppSection,
    pub logging: LoggingSection,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub estimation: Option<EstimationSection>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSection>,
    #[serde(default)]
    pub traffic: Option<TrafficSection>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Port to listen on (default: 8080)
    pub port: Option<u16>,
    /// Refresh interval in seconds for the estimation pipeline (default: 5)
    pub refresh_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EstimationSection {
    /// Live window for the current estimate, in minutes (default: 120)
    pub window_minutes: Option<u64>,
    /// Fixed offset of local time from UTC, used for the day boundary
    pub utc_offset_minutes: Option<i32>,
    #[serde(default)]
    pub params: Option<EstimatorParams>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSection {
    pub min_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrafficSection {
    pub endpoint: Option<String>,
    pub timeout_ms: Option<u64>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

pub fn load_default() -> Result<Config, ConfigError> {
    load_from_path(DEFAULT_CONFIG_PATH)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Reject values that would break the refresh loop or the estimator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval().is_zero() {
            return Err(invalid("server.refresh_interval_secs must be positive"));
        }
        if self.live_window().is_zero() {
            return Err(invalid("estimation.window_minutes must be positive"));
        }
        let offset_minutes = self.utc_offset_minutes();
        if time::UtcOffset::from_whole_seconds(offset_minutes.saturating_mul(60)).is_err() {
            return Err(ConfigError::Invalid(format!(
                "estimation.utc_offset_minutes out of range: {offset_minutes}"
            )));
        }
        if self.traffic_endpoint().is_some() && self.traffic_timeout().is_zero() {
            return Err(invalid("traffic.timeout_ms must be positive"));
        }

        let params = self.estimator_params();
        if !(params.decay_minutes.is_finite() && params.decay_minutes > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "estimation.params.decay_minutes must be positive, got {}",
                params.decay_minutes
            )));
        }
        if !(params.bimodal_weight_ratio > 0.0 && params.bimodal_weight_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "estimation.params.bimodal_weight_ratio must be in (0, 1], got {}",
                params.bimodal_weight_ratio
            )));
        }
        if !(params.dominance_tolerance.is_finite() && params.dominance_tolerance >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "estimation.params.dominance_tolerance must be non-negative, got {}",
                params.dominance_tolerance
            )));
        }
        if params.bimodal_min_gap == 0 {
            return Err(invalid("estimation.params.bimodal_min_gap must be at least 1"));
        }
        if params.medium_confidence_votes > params.high_confidence_votes {
            return Err(ConfigError::Invalid(format!(
                "estimation.params.medium_confidence_votes ({}) exceeds high_confidence_votes ({})",
                params.medium_confidence_votes, params.high_confidence_votes
            )));
        }
        Ok(())
    }

    /// Log level from `[logging].level`, falling back to INFO.
    pub fn log_level(&self) -> tracing::Level {
        self.logging
            .level
            .trim()
            .parse()
            .unwrap_or(tracing::Level::INFO)
    }

    /// Returns the server port (default: 8080)
    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    /// Returns the refresh interval as Duration (default: 5 seconds)
    pub fn refresh_interval(&self) -> Duration {
        self.server
            .as_ref()
            .and_then(|s| s.refresh_interval_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL)
    }

    pub fn live_window(&self) -> Duration {
        self.estimation
            .as_ref()
            .and_then(|s| s.window_minutes)
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
            .unwrap_or(DEFAULT_LIVE_WINDOW)
    }

    pub fn utc_offset_minutes(&self) -> i32 {
        self.estimation
            .as_ref()
            .and_then(|s| s.utc_offset_minutes)
            .unwrap_or(0)
    }

    pub fn estimator_params(&self) -> EstimatorParams {
        self.estimation
            .as_ref()
            .and_then(|s| s.params.clone())
            .unwrap_or_default()
    }

    pub fn rate_limit_interval(&self) -> Duration {
        self.rate_limit
            .as_ref()
            .and_then(|s| s.min_interval_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MIN_INTERVAL)
    }

    /// Traffic endpoint, or `None` when not configured or empty.
    pub fn traffic_endpoint(&self) -> Option<&str> {
        let endpoint = self.traffic.as_ref()?.endpoint.as_deref()?.trim();
        if endpoint.is_empty() {
            None
        } else {
            Some(endpoint)
        }
    }

    pub fn traffic_timeout(&self) -> Duration {
        self.traffic
            .as_ref()
            .and_then(|s| s.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn traffic_ttl(&self) -> Duration {
        self.traffic
            .as_ref()
            .and_then(|s| s.ttl_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TRAFFIC_TTL)
    }
}
