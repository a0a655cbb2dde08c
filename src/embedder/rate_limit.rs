//! Fixed-window call limiter.

use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::Result;
use crate::runner::CancellationToken;

const WAIT_SLICE: Duration = Duration::from_millis(100);

/// At most `calls` service calls per `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub calls: u32,
    pub per: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            calls: 100,
            per: Duration::from_secs(60),
        }
    }
}

/// Counts calls inside a window and blocks once the window is full.
///
/// The window opens at the first call after a reset, so `calls` calls never
/// complete in less than `per`.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    calls: u32,
    window_start: Option<Instant>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            calls: 0,
            window_start: None,
        }
    }

    /// Records one completed call, waiting out the window when it is full.
    ///
    /// Returns the time spent waiting. The wait is sliced so cancellation
    /// interrupts it with [`crate::PipelineError::Cancelled`].
    pub fn record_call(&mut self, cancel: &CancellationToken) -> Result<Duration> {
        if self.limit.calls == 0 {
            return Ok(Duration::ZERO);
        }
        let started = *self.window_start.get_or_insert_with(Instant::now);
        self.calls += 1;
        if self.calls < self.limit.calls {
            return Ok(Duration::ZERO);
        }

        let deadline = started + self.limit.per;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            info!(
                wait_ms = remaining.as_millis() as u64,
                calls = self.calls,
                "rate limit reached, waiting"
            );
        }
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            cancel.check()?;
            thread::sleep(left.min(WAIT_SLICE));
        }
        self.calls = 0;
        self.window_start = None;
        Ok(remaining)
    }
}
