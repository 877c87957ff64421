//! Congestion level taxonomy shared by the estimator and the day series.

use serde::{Deserialize, Serialize};

pub const MIN_LEVEL: i64 = 0;
pub const MAX_LEVEL: i64 = 3;
pub const LEVEL_COUNT: usize = 4;

/// Accumulated weight per level, indexed by level.
pub type WeightBuckets = [f64; LEVEL_COUNT];

/// Clamp a raw reported level into `0..=3`.
pub fn clamp_level(raw: i64) -> u8 {
    raw.clamp(MIN_LEVEL, MAX_LEVEL) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Free,
    Light,
    Moderate,
    Heavy,
}

impl CongestionLevel {
    pub const ALL: [CongestionLevel; LEVEL_COUNT] = [
        CongestionLevel::Free,
        CongestionLevel::Light,
        CongestionLevel::Moderate,
        CongestionLevel::Heavy,
    ];

    /// Level for a raw reported value, clamped into range.
    pub fn from_raw(raw: i64) -> Self {
        Self::ALL[clamp_level(raw) as usize]
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CongestionLevel::Free => "free",
            CongestionLevel::Light => "light",
            CongestionLevel::Moderate => "moderate",
            CongestionLevel::Heavy => "heavy",
        }
    }
}

impl std::fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a continuous average into a level with half-open thresholds.
///
/// `0.5` maps to light and `2.5` to heavy; this is not the same as rounding.
pub fn level_from_average(avg: f64) -> CongestionLevel {
    if !avg.is_finite() || avg < 0.5 {
        CongestionLevel::Free
    } else if avg < 1.5 {
        CongestionLevel::Light
    } else if avg < 2.5 {
        CongestionLevel::Moderate
    } else {
        CongestionLevel::Heavy
    }
}

/// Round half away from zero and clamp into the level range.
pub(crate) fn round_to_level(value: f64) -> CongestionLevel {
    if !value.is_finite() {
        return CongestionLevel::Free;
    }
    CongestionLevel::from_raw(value.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_level_bounds_out_of_range_values() {
        assert_eq!(clamp_level(-4), 0);
        assert_eq!(clamp_level(0), 0);
        assert_eq!(clamp_level(2), 2);
        assert_eq!(clamp_level(3), 3);
        assert_eq!(clamp_level(99), 3);
    }

    #[test]
    fn status_labels_follow_level_order() {
        let labels: Vec<&str> = CongestionLevel::ALL.iter().map(|l| l.as_str()).collect();
        assert_eq!(labels, vec!["free", "light", "moderate", "heavy"]);
        assert_eq!(CongestionLevel::from_raw(2).index(), 2);
    }

    #[test]
    fn average_classification_matches_boundaries() {
        let cases = [
            (0.0, CongestionLevel::Free),
            (0.49, CongestionLevel::Free),
            (0.5, CongestionLevel::Light),
            (1.49, CongestionLevel::Light),
            (1.5, CongestionLevel::Moderate),
            (2.49, CongestionLevel::Moderate),
            (2.5, CongestionLevel::Heavy),
            (3.0, CongestionLevel::Heavy),
        ];
        for (avg, expected) in cases {
            assert_eq!(level_from_average(avg), expected, "avg = {avg}");
        }
    }

    #[test]
    fn non_finite_average_is_free() {
        assert_eq!(level_from_average(f64::NAN), CongestionLevel::Free);
        assert_eq!(round_to_level(f64::INFINITY), CongestionLevel::Free);
    }

    #[test]
    fn level_serializes_as_lowercase_label() -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(CongestionLevel::Moderate)?;
        assert_eq!(value, serde_json::json!("moderate"));
        Ok(())
    }
}
