use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimit {
    pub capacity: u64,
    #[serde(rename = "window_ms", with = "crate::config::millis")]
    pub window: Duration,
}

impl RateLimit {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self { capacity, window }
    }
}

#[derive(Debug)]
struct Window {
    consumed: u64,
    started: Option<Instant>,
}

/// Fixed-window weight budget.
///
/// Admission is two separate steps: `is_rate_limited` to check, then `request` to commit.
/// A caller that checks and then abandons its call spends nothing. `request` never refuses
/// and never clamps; overshooting the capacity just keeps the limiter closed until the
/// window rolls over.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    state: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self { limit, state: Mutex::new(Window { consumed: 0, started: None }) }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    pub fn is_rate_limited(&self) -> bool {
        let state = self.state.lock();
        match state.started {
            Some(started) if started.elapsed() < self.limit.window => state.consumed >= self.limit.capacity,
            // no active window: only a zero-capacity limiter is closed
            _ => self.limit.capacity == 0,
        }
    }

    pub fn request(&self, weight: u64) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let expired = state.started.map_or(true, |started| now.duration_since(started) >= self.limit.window);
        if expired {
            state.started = Some(now);
            state.consumed = 0;
        }
        state.consumed = state.consumed.saturating_add(weight);
    }

    /// Weight committed in the active window, zero once it has expired.
    pub fn consumed(&self) -> u64 {
        let state = self.state.lock();
        match state.started {
            Some(started) if started.elapsed() < self.limit.window => state.consumed,
            _ => 0,
        }
    }
}
