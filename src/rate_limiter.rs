//! Sliding-window rate limiter
//!
//! Keeps the instants of the calls made in the last window and suspends a
//! caller until one more call fits under the cap. Uses `tokio::time::Instant`
//! so the window follows tokio's (pausable) clock.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default rolling window for per-minute caps
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Extra wait added after the oldest call leaves the window
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_millis(100);

/// Caps outbound calls to `max_calls` per rolling `window`.
pub struct SlidingWindowLimiter {
    max_calls: usize,
    window: Duration,
    safety_margin: Duration,
    // Held across the wait so acquirers are served one at a time.
    calls: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_calls: usize, window: Duration, safety_margin: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            safety_margin,
            calls: Mutex::new(VecDeque::with_capacity(max_calls.max(1))),
        }
    }

    /// `rpm` calls per rolling minute with the default safety margin
    pub fn per_minute(rpm: u32) -> Self {
        Self::new(rpm as usize, DEFAULT_WINDOW, DEFAULT_SAFETY_MARGIN)
    }

    /// Waits until one more call is allowed, then records it.
    ///
    /// Returns how long the caller was suspended.
    pub async fn acquire(&self) -> Duration {
        let mut calls = self.calls.lock().await;
        let started = Instant::now();

        loop {
            let now = Instant::now();
            while calls
                .front()
                .is_some_and(|oldest| now.duration_since(*oldest) >= self.window)
            {
                calls.pop_front();
            }

            if calls.len() < self.max_calls {
                calls.push_back(now);
                return now.duration_since(started);
            }

            let oldest = calls[0];
            let wait = (oldest + self.window).saturating_duration_since(now) + self.safety_margin;
            debug!(
                wait_ms = wait.as_millis() as u64,
                in_window = calls.len(),
                max_calls = self.max_calls,
                "Rate limit reached, waiting for window to slide"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Number of calls currently inside the window
    pub async fn in_window(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_calls_under_cap_do_not_wait() {
        let limiter = SlidingWindowLimiter::per_minute(3);

        for _ in 0..3 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
        assert_eq!(limiter.in_window().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_over_cap_waits_for_oldest_to_expire() {
        let limiter = SlidingWindowLimiter::per_minute(2);
        let start = Instant::now();

        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.acquire().await;

        // Third call must wait until the first leaves the window (+ margin)
        let waited = limiter.acquire().await;
        let elapsed = start.elapsed();

        assert_eq!(waited, Duration::from_secs(50) + DEFAULT_SAFETY_MARGIN);
        assert_eq!(elapsed, Duration::from_secs(60) + DEFAULT_SAFETY_MARGIN);
        assert_eq!(limiter.in_window().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(1), Duration::ZERO);

        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_cap_in_any_window() {
        let limiter = SlidingWindowLimiter::new(5, Duration::from_secs(60), Duration::from_millis(100));
        let mut stamps = Vec::new();

        for _ in 0..17 {
            limiter.acquire().await;
            stamps.push(Instant::now());
        }

        for (i, t) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .filter(|s| s.duration_since(*t) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 5, "window starting at call {i} holds {in_window} calls");
        }
    }
}
