use serde::{Deserialize, Serialize};

pub type CheckpointId = String;

/// A configured physical checkpoint that votes are scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub name: String,
}

/// One crowdsourced congestion report.
///
/// `level` is stored as reported; consumers clamp it to `0..=3` before use.
/// `timestamp_ms` is assigned by the reporting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub checkpoint_id: CheckpointId,
    pub level: i64,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

impl Vote {
    pub fn new(checkpoint_id: impl Into<CheckpointId>, level: i64, timestamp_ms: i64) -> Self {
        Self {
            checkpoint_id: checkpoint_id.into(),
            level,
            timestamp_ms,
            origin_id: None,
        }
    }

    pub fn with_origin(mut self, origin_id: impl Into<String>) -> Self {
        self.origin_id = Some(origin_id.into());
        self
    }
}
