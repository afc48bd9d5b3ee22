use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window limiter for outgoing REST requests of one exchange account
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum number of requests per window
    max_requests: usize,
    /// Window length
    window: Duration,
    /// Timestamps of requests still inside the window, oldest first
    history: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            history: VecDeque::new(),
        }
    }

    /// Requests-per-minute convenience constructor
    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests as usize, Duration::from_secs(60))
    }

    /// Record a request if budget remains, otherwise return the wait until the next slot
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.evict(now);
        if self.history.len() >= self.max_requests {
            let oldest = self.history.front().copied().unwrap_or(now);
            let wait = self.window.saturating_sub(now.saturating_duration_since(oldest));
            return Err(wait);
        }
        self.history.push_back(now);
        Ok(())
    }

    /// Requests currently counted against the window
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.history.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.history.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_blocks_then_recovers() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            assert!(limiter.try_acquire(start).is_ok());
        }
        let wait = limiter
            .try_acquire(start + Duration::from_secs(20))
            .unwrap_err();
        assert_eq!(wait, Duration::from_secs(40));
        assert_eq!(limiter.in_window(start + Duration::from_secs(20)), 3);

        // the window slides past the first three requests
        assert!(limiter.try_acquire(start + Duration::from_secs(60)).is_ok());
        assert_eq!(limiter.in_window(start + Duration::from_secs(60)), 1);
    }
}
