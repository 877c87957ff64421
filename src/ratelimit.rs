//! Per-device vote throttling backed by an injected key-value store.
//!
//! The last accepted vote of each origin at each checkpoint is remembered
//! under `last_vote:{checkpoint}:{origin}`. Entries older than the minimum
//! interval no longer affect anything and are swept at most once per interval.

use crate::error::AppError;
use crate::store::KeyValueStore;
use crate::vote::Vote;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(120);
const KEY_PREFIX: &str = "last_vote:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastVote {
    pub level: i64,
    pub timestamp_ms: i64,
}

#[derive(Debug)]
pub struct RateLimiter<S: KeyValueStore> {
    store: S,
    min_interval_ms: i64,
    // Serializes check-then-set; holds the time of the last sweep.
    last_sweep_ms: Mutex<i64>,
}

impl<S: KeyValueStore> RateLimiter<S> {
    pub fn new(store: S, min_interval: Duration) -> Self {
        Self {
            store,
            min_interval_ms: i64::try_from(min_interval.as_millis()).unwrap_or(i64::MAX),
            last_sweep_ms: Mutex::new(i64::MIN),
        }
    }

    /// Accept `vote` and remember it, or reject it when the same origin voted
    /// at the same checkpoint less than `min_interval` ago.
    ///
    /// Votes without an origin cannot be attributed and always pass.
    pub fn check_and_record(&self, vote: &Vote, now_ms: i64) -> Result<(), AppError> {
        self.admit(vote, now_ms, || Ok(()))
    }

    /// Like [`check_and_record`](Self::check_and_record), but runs `accept`
    /// between the check and the record. The vote is only remembered when
    /// `accept` succeeds, and no other vote is admitted in between.
    pub fn admit<F>(&self, vote: &Vote, now_ms: i64, accept: F) -> Result<(), AppError>
    where
        F: FnOnce() -> Result<(), AppError>,
    {
        let Some(origin_id) = vote.origin_id.as_deref() else {
            debug!(checkpoint_id = %vote.checkpoint_id, "Vote without origin bypasses rate limit");
            return accept();
        };

        let mut last_sweep_ms = self
            .last_sweep_ms
            .lock()
            .map_err(|_| AppError::Store("rate limiter lock poisoned".to_string()))?;
        if now_ms.saturating_sub(*last_sweep_ms) >= self.min_interval_ms {
            self.sweep_expired(now_ms)?;
            *last_sweep_ms = now_ms;
        }

        if let Some(last) = self.last_vote(origin_id, &vote.checkpoint_id)? {
            let elapsed = now_ms.saturating_sub(last.timestamp_ms);
            if elapsed < self.min_interval_ms {
                let retry_after_ms = self.min_interval_ms - elapsed.max(0);
                debug!(
                    checkpoint_id = %vote.checkpoint_id,
                    retry_after_ms,
                    "Vote rejected by rate limit"
                );
                return Err(AppError::RateLimited { retry_after_ms });
            }
        }

        accept()?;

        let record = LastVote {
            level: vote.level,
            timestamp_ms: now_ms,
        };
        let encoded =
            serde_json::to_string(&record).map_err(|err| AppError::Store(err.to_string()))?;
        self.store
            .set(&last_vote_key(origin_id, &vote.checkpoint_id), encoded)
    }

    /// Drop remembered votes that can no longer limit anything at `now_ms`,
    /// along with unreadable entries. Returns the number removed.
    pub fn sweep_expired(&self, now_ms: i64) -> Result<usize, AppError> {
        let min_interval_ms = self.min_interval_ms;
        let removed = self.store.retain(&mut |key: &str, value: &str| {
            if !key.starts_with(KEY_PREFIX) {
                return true;
            }
            serde_json::from_str::<LastVote>(value)
                .map(|last| now_ms.saturating_sub(last.timestamp_ms) < min_interval_ms)
                .unwrap_or(false)
        })?;
        if removed > 0 {
            debug!(removed, "Swept expired rate limit entries");
        }
        Ok(removed)
    }

    /// Last accepted vote of `origin_id` at `checkpoint_id`.
    ///
    /// An unreadable entry is treated as absent.
    pub fn last_vote(
        &self,
        origin_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<LastVote>, AppError> {
        let Some(raw) = self.store.get(&last_vote_key(origin_id, checkpoint_id))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(last) => Ok(Some(last)),
            Err(err) => {
                warn!(checkpoint_id, error = %err, "Discarding unreadable last vote entry");
                Ok(None)
            }
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

fn last_vote_key(origin_id: &str, checkpoint_id: &str) -> String {
    format!("{KEY_PREFIX}{checkpoint_id}:{origin_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const NOW: i64 = 1_700_000_000_000;

    fn limiter() -> RateLimiter<MemoryStore> {
        RateLimiter::new(MemoryStore::new(), Duration::from_secs(60))
    }

    #[test]
    fn first_vote_is_accepted_and_remembered() -> Result<(), AppError> {
        let limiter = limiter();
        let vote = Vote::new("north", 2, NOW).with_origin("device-a");

        limiter.check_and_record(&vote, NOW)?;

        assert_eq!(
            limiter.last_vote("device-a", "north")?,
            Some(LastVote {
                level: 2,
                timestamp_ms: NOW
            })
        );
        Ok(())
    }

    #[test]
    fn repeat_vote_within_interval_is_rejected() -> Result<(), AppError> {
        let limiter = limiter();
        let vote = Vote::new("north", 2, NOW).with_origin("device-a");
        limiter.check_and_record(&vote, NOW)?;

        let result = limiter.check_and_record(&vote, NOW + 20_000);

        assert!(matches!(
            result,
            Err(AppError::RateLimited {
                retry_after_ms: 40_000
            })
        ));
        Ok(())
    }

    #[test]
    fn vote_after_interval_is_accepted() -> Result<(), AppError> {
        let limiter = limiter();
        let vote = Vote::new("north", 1, NOW).with_origin("device-a");
        limiter.check_and_record(&vote, NOW)?;

        limiter.check_and_record(&Vote::new("north", 3, NOW).with_origin("device-a"), NOW + 60_000)?;

        let last = limiter.last_vote("device-a", "north")?;
        assert_eq!(last.map(|l| l.level), Some(3));
        Ok(())
    }

    #[test]
    fn limits_are_scoped_per_checkpoint_and_origin() -> Result<(), AppError> {
        let limiter = limiter();
        limiter.check_and_record(&Vote::new("north", 1, NOW).with_origin("device-a"), NOW)?;

        limiter.check_and_record(&Vote::new("south", 1, NOW).with_origin("device-a"), NOW)?;
        limiter.check_and_record(&Vote::new("north", 1, NOW).with_origin("device-b"), NOW)?;

        assert_eq!(limiter.store().len(), 3);
        Ok(())
    }

    #[test]
    fn anonymous_votes_are_not_limited() -> Result<(), AppError> {
        let limiter = limiter();
        let vote = Vote::new("north", 1, NOW);

        limiter.check_and_record(&vote, NOW)?;
        limiter.check_and_record(&vote, NOW)?;

        assert!(limiter.store().is_empty());
        Ok(())
    }

    #[test]
    fn corrupt_entry_is_treated_as_absent() -> Result<(), AppError> {
        let limiter = limiter();
        limiter
            .store()
            .set(&last_vote_key("device-a", "north"), "not json".to_string())?;

        assert_eq!(limiter.last_vote("device-a", "north")?, None);
        limiter.check_and_record(&Vote::new("north", 1, NOW).with_origin("device-a"), NOW)?;
        Ok(())
    }

    #[test]
    fn rejected_acceptance_does_not_consume_the_slot() -> Result<(), AppError> {
        let limiter = limiter();
        let vote = Vote::new("north", 2, NOW).with_origin("device-a");

        let result = limiter.admit(&vote, NOW, || Err(AppError::StateLock));

        assert!(matches!(result, Err(AppError::StateLock)));
        assert_eq!(limiter.last_vote("device-a", "north")?, None);
        limiter.check_and_record(&vote, NOW + 1)?;
        Ok(())
    }

    #[test]
    fn concurrent_votes_from_one_origin_admit_exactly_one() {
        let limiter = Arc::new(limiter());
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let vote = Vote::new("north", 1, NOW).with_origin("device-a");
                    barrier.wait();
                    limiter.check_and_record(&vote, NOW).is_ok()
                })
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|handle| handle.join().expect("voter thread"))
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, 1);
    }

    #[test]
    fn expired_entries_are_swept_on_later_votes() -> Result<(), AppError> {
        let limiter = limiter();
        limiter.check_and_record(&Vote::new("north", 1, NOW).with_origin("device-a"), NOW)?;
        limiter.check_and_record(&Vote::new("south", 1, NOW).with_origin("device-b"), NOW)?;
        assert_eq!(limiter.store().len(), 2);

        limiter.check_and_record(
            &Vote::new("north", 2, NOW).with_origin("device-c"),
            NOW + 60_000,
        )?;

        assert_eq!(limiter.store().len(), 1);
        assert_eq!(limiter.last_vote("device-a", "north")?, None);
        assert!(limiter.last_vote("device-c", "north")?.is_some());
        Ok(())
    }

    #[test]
    fn sweep_keeps_live_entries_and_drops_corrupt_ones() -> Result<(), AppError> {
        let limiter = limiter();
        limiter.check_and_record(&Vote::new("north", 1, NOW).with_origin("device-a"), NOW)?;
        limiter
            .store()
            .set(&last_vote_key("device-b", "north"), "garbage".to_string())?;
        limiter.store().set("unrelated", "kept".to_string())?;

        let removed = limiter.sweep_expired(NOW + 30_000)?;

        assert_eq!(removed, 1);
        assert!(limiter.last_vote("device-a", "north")?.is_some());
        assert_eq!(limiter.store().get("unrelated")?, Some("kept".to_string()));
        Ok(())
    }
}
