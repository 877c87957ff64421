//! Recency-weighted vote estimator.
//!
//! Each vote contributes `exp(-age_minutes / decay_minutes)` to the bucket of
//! its level. The reported level is the dominant bucket, unless two far-apart
//! levels carry similar weight (reported as their midpoint) or the weighted
//! average drifts away from the dominant level (reported as the rounded
//! average).

use crate::estimation::level::{
    CongestionLevel, LEVEL_COUNT, WeightBuckets, clamp_level, round_to_level,
};
use crate::vote::Vote;
use serde::{Deserialize, Serialize};

const MS_PER_MINUTE: f64 = 60_000.0;

/// Estimator tuning, overridable from `[estimation.params]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EstimatorParams {
    pub decay_minutes: f64,
    pub bimodal_min_gap: u8,
    pub bimodal_weight_ratio: f64,
    pub dominance_tolerance: f64,
    pub high_confidence_votes: usize,
    pub medium_confidence_votes: usize,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            decay_minutes: 12.0, // half-life ~8.3 min
            bimodal_min_gap: 2,
            bimodal_weight_ratio: 0.7,
            dominance_tolerance: 0.35,
            high_confidence_votes: 10,
            medium_confidence_votes: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelEstimate {
    pub level: CongestionLevel,
    pub count: usize,
    pub confidence: Confidence,
    pub buckets: WeightBuckets,
    pub avg: f64,
}

impl LevelEstimate {
    /// Result for an empty vote window.
    pub fn baseline() -> Self {
        Self {
            level: CongestionLevel::Free,
            count: 0,
            confidence: Confidence::Low,
            buckets: [0.0; LEVEL_COUNT],
            avg: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LevelEstimator {
    pub params: EstimatorParams,
}

impl LevelEstimator {
    pub fn new(params: EstimatorParams) -> Self {
        Self { params }
    }

    pub fn with_defaults() -> Self {
        Self::new(EstimatorParams::default())
    }

    /// Weight of a vote recorded at `timestamp_ms`, observed at `now_ms`.
    ///
    /// Votes from the future count as fresh.
    pub fn recency_weight(&self, timestamp_ms: i64, now_ms: i64) -> f64 {
        let age_minutes = (now_ms.saturating_sub(timestamp_ms) as f64 / MS_PER_MINUTE).max(0.0);
        (-age_minutes / self.params.decay_minutes).exp()
    }

    /// Estimate the current level from votes already scoped to one
    /// checkpoint and a live window.
    pub fn estimate(&self, votes: &[Vote], now_ms: i64) -> LevelEstimate {
        if votes.is_empty() {
            return LevelEstimate::baseline();
        }

        let mut buckets: WeightBuckets = [0.0; LEVEL_COUNT];
        for vote in votes {
            buckets[clamp_level(vote.level) as usize] +=
                self.recency_weight(vote.timestamp_ms, now_ms);
        }

        let avg = weighted_average(&buckets);
        let level = self.pick_level(&buckets, avg);
        let count = votes.len();

        LevelEstimate {
            level,
            count,
            confidence: self.confidence(count),
            buckets,
            avg,
        }
    }

    pub fn confidence(&self, count: usize) -> Confidence {
        if count >= self.params.high_confidence_votes {
            Confidence::High
        } else if count >= self.params.medium_confidence_votes {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    fn pick_level(&self, buckets: &WeightBuckets, avg: f64) -> CongestionLevel {
        let mut ranked: Vec<usize> = (0..LEVEL_COUNT).collect();
        // Stable sort keeps the lower level first on equal weight.
        ranked.sort_by(|a, b| buckets[*b].total_cmp(&buckets[*a]));
        let (top1, top2) = (ranked[0], ranked[1]);
        let (top1w, top2w) = (buckets[top1], buckets[top2]);

        if top1.abs_diff(top2) >= self.params.bimodal_min_gap as usize
            && top2w >= self.params.bimodal_weight_ratio * top1w
        {
            return round_to_level((top1 + top2) as f64 / 2.0);
        }

        if (avg - top1 as f64).abs() < self.params.dominance_tolerance {
            CongestionLevel::ALL[top1]
        } else {
            round_to_level(avg)
        }
    }
}

/// Estimate with the default parameters.
pub fn estimate(votes: &[Vote], now_ms: i64) -> LevelEstimate {
    LevelEstimator::with_defaults().estimate(votes, now_ms)
}

fn weighted_average(buckets: &WeightBuckets) -> f64 {
    let total: f64 = buckets.iter().sum();
    let divisor = if total > 0.0 { total } else { 1.0 };
    let weighted: f64 = buckets
        .iter()
        .enumerate()
        .map(|(level, weight)| level as f64 * weight)
        .sum();
    weighted / divisor
}
