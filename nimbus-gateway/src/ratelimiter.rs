//! Ratelimiter for commands sent over the gateway.

use leaky_bucket_lite::LeakyBucket;
use std::time::{Duration, Instant};

/// Token bucket that refills to capacity at the start of each window.
///
/// The gateway allows 120 commands per 60 seconds per connection, counting
/// heartbeats, and separately allows one identify per 5 seconds per identify
/// bucket. Both limits are whole-window refills, so the bucket refills all of
/// its tokens at once rather than leaking continuously.
#[derive(Debug)]
pub struct CommandRatelimiter {
    /// Bucket used for limiting actions.
    bucket: LeakyBucket,
}

impl CommandRatelimiter {
    /// Number of commands allowed on one connection per refill window.
    pub const SEND_CAPACITY: u32 = 120;

    /// Refill window of the send limiter.
    pub const SEND_WINDOW: Duration = Duration::from_secs(60);

    /// Create a new ratelimiter refilling `capacity` tokens every `window`.
    pub fn new(capacity: u32, window: Duration) -> Self {
        let bucket = LeakyBucket::builder()
            .max(capacity)
            .tokens(capacity)
            .refill_interval(window)
            .refill_amount(capacity)
            .build();

        Self { bucket }
    }

    /// Create the per-connection send limiter.
    pub fn send_limiter() -> Self {
        Self::new(Self::SEND_CAPACITY, Self::SEND_WINDOW)
    }

    /// Current number of commands that are still available within the window.
    pub fn available(&self) -> u32 {
        self.bucket.tokens()
    }

    /// Maximum number of commands that may be made per window.
    pub fn max(&self) -> u32 {
        self.bucket.max()
    }

    /// When the bucket will next refill.
    pub fn next_refill(&self) -> Instant {
        self.bucket.next_refill().into_std()
    }

    /// Acquire a token, waiting until one is available.
    pub async fn acquire_one(&self) {
        self.bucket.acquire_one().await;
    }
}

#[cfg(test)]
mod tests {
    use super::CommandRatelimiter;
    use static_assertions::assert_impl_all;
    use std::{fmt::Debug, time::Duration};
    use tokio::time;

    assert_impl_all!(CommandRatelimiter: Debug, Send, Sync);

    #[test]
    fn send_limiter_capacity() {
        let limiter = CommandRatelimiter::send_limiter();

        assert_eq!(120, limiter.max());
        assert_eq!(120, limiter.available());
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_per_window() {
        let limiter = CommandRatelimiter::new(2, Duration::from_secs(5));

        limiter.acquire_one().await;
        limiter.acquire_one().await;
        assert_eq!(0, limiter.available());

        // The third acquisition can't complete inside the current window.
        let blocked = time::timeout(Duration::from_secs(4), limiter.acquire_one()).await;
        assert!(blocked.is_err());

        // It resolves once the window rolls over and the bucket refills.
        time::timeout(Duration::from_secs(2), limiter.acquire_one())
            .await
            .expect("bucket refills at the window boundary");
    }
}
