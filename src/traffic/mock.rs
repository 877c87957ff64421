use crate::traffic::{TrafficError, TrafficReading, TrafficSource};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct MockTrafficSource {
    delay_minutes: Option<f64>,
    calls: AtomicUsize,
}

impl MockTrafficSource {
    pub fn with_delay(delay_minutes: f64) -> Self {
        Self {
            delay_minutes: Some(delay_minutes),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            delay_minutes: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl TrafficSource for MockTrafficSource {
    fn fetch(&self, _checkpoint_id: &str, now_ms: i64) -> Result<TrafficReading, TrafficError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.delay_minutes {
            Some(delay_minutes) => Ok(TrafficReading {
                delay_minutes,
                fetched_at_ms: now_ms,
            }),
            None => Err(TrafficError::Unavailable("mock failure".to_string())),
        }
    }
}
