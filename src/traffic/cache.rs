use std::time::Duration;

/// A cached value with the time it was fetched and how long it stays fresh.
///
/// Owned by the caller and passed into whatever refreshes it.
#[derive(Debug, Clone)]
pub struct TtlCache<T> {
    entry: Option<(T, i64)>,
    ttl_ms: i64,
}

impl<T> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: None,
            ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn is_fresh(&self, now_ms: i64) -> bool {
        match &self.entry {
            Some((_, fetched_at_ms)) => {
                now_ms >= *fetched_at_ms && now_ms - fetched_at_ms < self.ttl_ms
            }
            None => false,
        }
    }

    /// The cached value if it is still within its TTL.
    pub fn get_fresh(&self, now_ms: i64) -> Option<&T> {
        if self.is_fresh(now_ms) {
            self.entry.as_ref().map(|(value, _)| value)
        } else {
            None
        }
    }

    /// The cached value regardless of age.
    pub fn last(&self) -> Option<&T> {
        self.entry.as_ref().map(|(value, _)| value)
    }

    pub fn fetched_at_ms(&self) -> Option<i64> {
        self.entry.as_ref().map(|(_, fetched_at_ms)| *fetched_at_ms)
    }

    pub fn store(&mut self, value: T, now_ms: i64) {
        self.entry = Some((value, now_ms));
    }
}
