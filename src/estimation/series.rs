//! Intraday series: 96 fifteen-minute buckets from local midnight, smoothed
//! with a single 3-point moving average over the raw bucket averages.

use crate::estimation::level::{CongestionLevel, LEVEL_COUNT, clamp_level, level_from_average};
use crate::vote::Vote;
use serde::Serialize;

pub const BUCKET_WIDTH_MS: i64 = 15 * 60 * 1000;
pub const BUCKETS_PER_DAY: usize = 96;
pub const DAY_MS: i64 = BUCKET_WIDTH_MS * BUCKETS_PER_DAY as i64;

/// One fifteen-minute cell. `count == 0` means no data, not a free reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Bucket {
    pub sum: f64,
    pub count: u32,
    pub avg: f64,
    pub smoothed: f64,
}

impl Bucket {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaySummary {
    pub total: u32,
    pub avg: f64,
    pub counts: [u32; LEVEL_COUNT],
}

impl DaySummary {
    pub fn level(&self) -> CongestionLevel {
        level_from_average(self.avg)
    }
}

/// Bucket index for a timestamp, or `None` when it falls outside the day.
pub fn bucket_index(timestamp_ms: i64, day_start_ms: i64) -> Option<usize> {
    if timestamp_ms < day_start_ms {
        return None;
    }
    let index = (timestamp_ms - day_start_ms) / BUCKET_WIDTH_MS;
    usize::try_from(index)
        .ok()
        .filter(|index| *index < BUCKETS_PER_DAY)
}

/// Build the day series. Always returns `BUCKETS_PER_DAY` buckets.
pub fn build(votes: &[Vote], day_start_ms: i64) -> Vec<Bucket> {
    let mut buckets = vec![Bucket::default(); BUCKETS_PER_DAY];

    for vote in votes {
        let Some(index) = bucket_index(vote.timestamp_ms, day_start_ms) else {
            continue;
        };
        let bucket = &mut buckets[index];
        bucket.sum += f64::from(clamp_level(vote.level));
        bucket.count += 1;
    }

    for bucket in &mut buckets {
        bucket.avg = if bucket.count > 0 {
            bucket.sum / f64::from(bucket.count)
        } else {
            0.0
        };
    }

    let raw: Vec<f64> = buckets.iter().map(|bucket| bucket.avg).collect();
    for (index, smoothed) in smooth(&raw).into_iter().enumerate() {
        buckets[index].smoothed = smoothed;
    }

    buckets
}

/// 3-point moving average. Edges reuse their own value as the missing
/// neighbour. Reads only from `raw`.
fn smooth(raw: &[f64]) -> Vec<f64> {
    let last = raw.len().saturating_sub(1);
    raw.iter()
        .enumerate()
        .map(|(index, value)| {
            let left = if index == 0 { *value } else { raw[index - 1] };
            let right = if index == last { *value } else { raw[index + 1] };
            (left + value + right) / 3.0
        })
        .collect()
}

/// Unweighted count-per-level and overall average over every vote given.
pub fn summarize(votes: &[Vote]) -> DaySummary {
    let mut counts = [0u32; LEVEL_COUNT];
    let mut sum = 0u64;
    for vote in votes {
        let level = clamp_level(vote.level);
        counts[level as usize] += 1;
        sum += u64::from(level);
    }

    let total: u32 = counts.iter().sum();
    let avg = if total > 0 {
        sum as f64 / f64::from(total)
    } else {
        0.0
    };

    DaySummary { total, avg, counts }
}
