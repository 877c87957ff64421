use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unknown checkpoint: {0}")]
    UnknownCheckpoint(String),
    #[error("vote rate limited, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: i64 },
    #[error("key-value store error: {0}")]
    Store(String),
    #[error("time conversion error: {0}")]
    Time(String),
    #[error("state lock poisoned")]
    StateLock,
}
