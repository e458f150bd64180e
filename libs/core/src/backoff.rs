//! Backoff policies for transport reconnects and quota-limited collaborators.

use std::collections::VecDeque;
use std::time::Duration;

/// Exponential reconnect schedule: 2s doubling per attempt, capped at 30s,
/// at most 5 attempts before giving up.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before attempt number `attempt` (1-based), or `None` once the
    /// attempt budget is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.base.saturating_mul(factor).min(self.cap))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Backoff window plus bounded FIFO queue for quota-limited APIs: the window
/// starts at 60s, doubles on every quota failure, and caps at 30 minutes.
/// Work enqueued past the queue cap is dropped oldest-first.
#[derive(Debug)]
pub struct QuotaBackoff<T> {
    window: Duration,
    queue: VecDeque<T>,
    queue_cap: usize,
    dropped: u64,
}

const QUOTA_BASE: Duration = Duration::from_secs(60);
const QUOTA_CAP: Duration = Duration::from_secs(30 * 60);
const QUOTA_QUEUE_CAP: usize = 500;

impl<T> Default for QuotaBackoff<T> {
    fn default() -> Self {
        Self {
            window: QUOTA_BASE,
            queue: VecDeque::new(),
            queue_cap: QUOTA_QUEUE_CAP,
            dropped: 0,
        }
    }
}

impl<T> QuotaBackoff<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current wait before the next attempt is allowed.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Doubles the window after a quota failure, up to the cap.
    pub fn note_quota_failure(&mut self) {
        self.window = self.window.saturating_mul(2).min(QUOTA_CAP);
    }

    /// Resets the window after a successful call.
    pub fn note_success(&mut self) {
        self.window = QUOTA_BASE;
    }

    /// Enqueues deferred work, dropping the oldest entry past capacity.
    pub fn enqueue(&mut self, item: T) {
        self.queue.push_back(item);
        while self.queue.len() > self.queue_cap {
            self.queue.pop_front();
            self.dropped += 1;
        }
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Total entries dropped to keep the queue bounded.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delays_double_and_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay(4), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay(5), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(6), None);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn quota_window_doubles_to_cap_and_resets() {
        let mut backoff: QuotaBackoff<u32> = QuotaBackoff::new();
        assert_eq!(backoff.window(), Duration::from_secs(60));
        for _ in 0..10 {
            backoff.note_quota_failure();
        }
        assert_eq!(backoff.window(), Duration::from_secs(1800));
        backoff.note_success();
        assert_eq!(backoff.window(), Duration::from_secs(60));
    }

    #[test]
    fn quota_queue_drops_oldest_past_cap() {
        let mut backoff: QuotaBackoff<usize> = QuotaBackoff::new();
        for i in 0..502 {
            backoff.enqueue(i);
        }
        assert_eq!(backoff.queued(), 500);
        assert_eq!(backoff.dropped(), 2);
        assert_eq!(backoff.dequeue(), Some(2));
    }
}
