use crate::error::AppError;
use crate::state::{AppState, CheckpointSnapshot};
use crate::traffic::cache::TtlCache;
use crate::traffic::{TrafficReading, TrafficSource, refresh_traffic};
use crate::vote::{CheckpointId, Vote};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use time::{OffsetDateTime, Time, UtcOffset};
use tracing::{debug, info, warn};

pub mod estimator;
pub mod level;
pub mod series;

use estimator::LevelEstimator;
use series::DAY_MS;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LIVE_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_TRAFFIC_TTL: Duration = Duration::from_secs(5 * 60);

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Votes recorded within `window` before `now_ms` (future votes included).
pub fn live_window(votes: &[Vote], now_ms: i64, window: Duration) -> Vec<Vote> {
    let cutoff = now_ms.saturating_sub(duration_ms(window));
    votes
        .iter()
        .filter(|vote| vote.timestamp_ms >= cutoff)
        .cloned()
        .collect()
}

/// Votes in `[day_start_ms, day_start_ms + 24h)`.
pub fn votes_for_day(votes: &[Vote], day_start_ms: i64) -> Vec<Vote> {
    let day_end = day_start_ms.saturating_add(DAY_MS);
    votes
        .iter()
        .filter(|vote| vote.timestamp_ms >= day_start_ms && vote.timestamp_ms < day_end)
        .cloned()
        .collect()
}

/// Local midnight for `now_ms` at a fixed UTC offset, as epoch milliseconds.
pub fn local_day_start_ms(now_ms: i64, utc_offset_minutes: i32) -> Result<i64, AppError> {
    let offset = UtcOffset::from_whole_seconds(utc_offset_minutes.saturating_mul(60))
        .map_err(|err| AppError::Time(err.to_string()))?;
    let now = OffsetDateTime::from_unix_timestamp_nanos(i128::from(now_ms) * 1_000_000)
        .map_err(|err| AppError::Time(err.to_string()))?
        .to_offset(offset);
    let midnight = now.replace_time(Time::MIDNIGHT);
    i64::try_from(midnight.unix_timestamp_nanos() / 1_000_000)
        .map_err(|err| AppError::Time(err.to_string()))
}

/// Everything a refresh cycle needs besides shared state. Owned by the
/// refresh loop, including the per-checkpoint traffic caches.
#[derive(Debug)]
pub struct RefreshPipeline {
    pub estimator: LevelEstimator,
    pub window: Duration,
    pub utc_offset_minutes: i32,
    traffic: Option<Box<dyn TrafficSource>>,
    traffic_ttl: Duration,
    traffic_caches: HashMap<CheckpointId, TtlCache<TrafficReading>>,
}

impl RefreshPipeline {
    pub fn new(estimator: LevelEstimator, window: Duration, utc_offset_minutes: i32) -> Self {
        Self {
            estimator,
            window,
            utc_offset_minutes,
            traffic: None,
            traffic_ttl: DEFAULT_TRAFFIC_TTL,
            traffic_caches: HashMap::new(),
        }
    }

    pub fn with_traffic(mut self, source: Box<dyn TrafficSource>, ttl: Duration) -> Self {
        self.traffic = Some(source);
        self.traffic_ttl = ttl;
        self
    }

    /// Compute a fresh snapshot for one checkpoint from its vote log.
    pub fn refresh_checkpoint(
        &mut self,
        checkpoint_id: &str,
        votes: &[Vote],
        now_ms: i64,
        day_start_ms: i64,
    ) -> CheckpointSnapshot {
        let live = live_window(votes, now_ms, self.window);
        let today = votes_for_day(votes, day_start_ms);

        let estimate = self.estimator.estimate(&live, now_ms);
        let series = series::build(&today, day_start_ms);
        let summary = series::summarize(&today);

        let traffic = match self.traffic.as_deref() {
            Some(source) => {
                let ttl = self.traffic_ttl;
                let cache = self
                    .traffic_caches
                    .entry(checkpoint_id.to_string())
                    .or_insert_with(|| TtlCache::new(ttl));
                refresh_traffic(source, cache, checkpoint_id, now_ms)
            }
            None => None,
        };

        debug!(
            checkpoint_id,
            level = %estimate.level,
            live_votes = estimate.count,
            day_votes = summary.total,
            "Checkpoint refreshed"
        );

        CheckpointSnapshot {
            checkpoint_id: checkpoint_id.to_string(),
            estimate,
            series,
            summary,
            traffic,
            day_start_ms,
            computed_at_ms: now_ms,
        }
    }
}

/// Recompute and publish every checkpoint snapshot, then prune votes that
/// neither the live window nor the current day still needs.
pub fn run_refresh_cycle(
    state: &Arc<RwLock<AppState>>,
    pipeline: &mut RefreshPipeline,
    now_ms: i64,
) -> Result<usize, AppError> {
    let day_start_ms = local_day_start_ms(now_ms, pipeline.utc_offset_minutes)?;

    let inputs: Vec<(CheckpointId, Vec<Vote>)> = {
        let guard = state.read().map_err(|_| AppError::StateLock)?;
        guard
            .checkpoints()
            .iter()
            .map(|checkpoint| {
                (
                    checkpoint.id.clone(),
                    guard.votes_for(&checkpoint.id).to_vec(),
                )
            })
            .collect()
    };

    let snapshots: Vec<CheckpointSnapshot> = inputs
        .iter()
        .map(|(checkpoint_id, votes)| {
            pipeline.refresh_checkpoint(checkpoint_id, votes, now_ms, day_start_ms)
        })
        .collect();

    let refreshed = snapshots.len();
    let cutoff = day_start_ms.min(now_ms.saturating_sub(duration_ms(pipeline.window)));

    let mut guard = state.write().map_err(|_| AppError::StateLock)?;
    for snapshot in snapshots {
        guard.set_snapshot(snapshot)?;
    }
    let pruned = guard.prune_votes_before(cutoff);
    if pruned > 0 {
        debug!(pruned, cutoff_ms = cutoff, "Pruned expired votes");
    }

    Ok(refreshed)
}

pub fn spawn_refresh_thread(
    state: Arc<RwLock<AppState>>,
    mut pipeline: RefreshPipeline,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        info!(interval_ms = interval.as_millis(), "Refresh thread started");
        while !stop.load(Ordering::Relaxed) {
            let cycle_start = Instant::now();

            if let Err(e) = run_refresh_cycle(&state, &mut pipeline, now_ms()) {
                warn!(error = %e, "Error running refresh cycle");
            }

            sleep_with_stop(interval, &stop, cycle_start);
        }
        info!("Refresh thread stopped");
    })
}

fn sleep_with_stop(duration: Duration, stop: &AtomicBool, start: Instant) {
    let elapsed = start.elapsed();
    if elapsed >= duration {
        return;
    }
    let remaining = duration - elapsed;
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;

    while slept < remaining {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        std::thread::sleep(step.min(remaining - slept));
        slept += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::level::CongestionLevel;
    use crate::vote::Checkpoint;

    // 2023-11-14T22:13:20Z
    const NOW: i64 = 1_700_000_000_000;
    const UTC_MIDNIGHT: i64 = 1_699_920_000_000;
    const MINUTE: i64 = 60_000;

    fn state_with(checkpoint_ids: &[&str]) -> Arc<RwLock<AppState>> {
        let checkpoints = checkpoint_ids
            .iter()
            .map(|id| Checkpoint {
                id: id.to_string(),
                name: id.to_uppercase(),
            })
            .collect();
        Arc::new(RwLock::new(AppState::new(checkpoints)))
    }

    fn pipeline() -> RefreshPipeline {
        RefreshPipeline::new(LevelEstimator::with_defaults(), DEFAULT_LIVE_WINDOW, 0)
    }

    #[test]
    fn day_start_at_utc() -> Result<(), AppError> {
        assert_eq!(local_day_start_ms(NOW, 0)?, UTC_MIDNIGHT);
        assert_eq!(local_day_start_ms(UTC_MIDNIGHT, 0)?, UTC_MIDNIGHT);
        Ok(())
    }

    #[test]
    fn day_start_respects_positive_offset() -> Result<(), AppError> {
        // 00:13 local at UTC+2, so the local day began at 22:00 UTC.
        assert_eq!(local_day_start_ms(NOW, 120)?, UTC_MIDNIGHT + 22 * 60 * MINUTE);
        Ok(())
    }

    #[test]
    fn day_start_respects_negative_offset() -> Result<(), AppError> {
        // 17:13 local at UTC-5, same calendar day, midnight at 05:00 UTC.
        assert_eq!(local_day_start_ms(NOW, -300)?, UTC_MIDNIGHT + 5 * 60 * MINUTE);
        Ok(())
    }

    #[test]
    fn day_start_rejects_impossible_offset() {
        assert!(matches!(
            local_day_start_ms(NOW, 60 * 30),
            Err(AppError::Time(_))
        ));
    }

    #[test]
    fn live_window_is_inclusive_of_cutoff() {
        let votes = vec![
            Vote::new("cp", 1, NOW - 120 * MINUTE - 1),
            Vote::new("cp", 1, NOW - 120 * MINUTE),
            Vote::new("cp", 1, NOW + MINUTE),
        ];

        let live = live_window(&votes, NOW, DEFAULT_LIVE_WINDOW);

        assert_eq!(live.len(), 2);
    }

    #[test]
    fn votes_for_day_excludes_other_days() {
        let votes = vec![
            Vote::new("cp", 1, UTC_MIDNIGHT - 1),
            Vote::new("cp", 1, UTC_MIDNIGHT),
            Vote::new("cp", 1, UTC_MIDNIGHT + DAY_MS),
        ];

        assert_eq!(votes_for_day(&votes, UTC_MIDNIGHT).len(), 1);
    }

    #[test]
    fn refresh_cycle_publishes_snapshot_per_checkpoint() -> Result<(), AppError> {
        let state = state_with(&["north", "south"]);
        {
            let mut guard = state.write().map_err(|_| AppError::StateLock)?;
            for _ in 0..4 {
                guard.record_vote(Vote::new("north", 3, NOW - MINUTE))?;
            }
        }
        let mut pipeline = pipeline();

        let refreshed = run_refresh_cycle(&state, &mut pipeline, NOW)?;

        let guard = state.read().map_err(|_| AppError::StateLock)?;
        assert_eq!(refreshed, 2);
        let north = guard.snapshot("north").expect("north snapshot");
        assert_eq!(north.estimate.level, CongestionLevel::Heavy);
        assert_eq!(north.summary.total, 4);
        assert_eq!(north.day_start_ms, UTC_MIDNIGHT);
        assert_eq!(north.series.len(), series::BUCKETS_PER_DAY);
        let south = guard.snapshot("south").expect("south snapshot");
        assert_eq!(south.estimate.count, 0);
        Ok(())
    }

    #[test]
    fn refresh_cycle_prunes_votes_outside_window_and_day() -> Result<(), AppError> {
        let state = state_with(&["north"]);
        {
            let mut guard = state.write().map_err(|_| AppError::StateLock)?;
            guard.record_vote(Vote::new("north", 1, UTC_MIDNIGHT - 1))?;
            guard.record_vote(Vote::new("north", 1, UTC_MIDNIGHT + MINUTE))?;
        }
        let mut pipeline = pipeline();

        run_refresh_cycle(&state, &mut pipeline, NOW)?;

        let guard = state.read().map_err(|_| AppError::StateLock)?;
        assert_eq!(guard.votes_for("north").len(), 1);
        Ok(())
    }

    #[test]
    fn refresh_cycle_keeps_yesterday_votes_inside_live_window() -> Result<(), AppError> {
        let state = state_with(&["north"]);
        let just_after_midnight = UTC_MIDNIGHT + 10 * MINUTE;
        {
            let mut guard = state.write().map_err(|_| AppError::StateLock)?;
            guard.record_vote(Vote::new("north", 2, UTC_MIDNIGHT - 30 * MINUTE))?;
        }
        let mut pipeline = pipeline();

        run_refresh_cycle(&state, &mut pipeline, just_after_midnight)?;

        let guard = state.read().map_err(|_| AppError::StateLock)?;
        assert_eq!(guard.votes_for("north").len(), 1);
        let snapshot = guard.snapshot("north").expect("north snapshot");
        assert_eq!(snapshot.estimate.count, 1);
        assert_eq!(snapshot.summary.total, 0);
        Ok(())
    }

    #[test]
    fn stop_flag_ends_refresh_thread() -> Result<(), Box<dyn std::error::Error>> {
        let state = state_with(&["north"]);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_refresh_thread(
            Arc::clone(&state),
            pipeline(),
            Duration::from_millis(50),
            Arc::clone(&stop),
        );

        std::thread::sleep(Duration::from_millis(120));
        stop.store(true, Ordering::Relaxed);
        handle.join().map_err(|_| "refresh thread panicked")?;

        let guard = state.read().map_err(|_| AppError::StateLock)?;
        assert!(guard.snapshot("north").is_some());
        Ok(())
    }
}
