use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Returned when a rate-limited wait is abandoned because the run is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limiter wait cancelled")]
pub struct Cancelled;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    tokens_acquired: f64,
    total_wait: Duration,
    max_wait: Duration,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, refill_rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
    }
}

/// Snapshot of limiter counters.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct RateLimiterMetrics {
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens_acquired: f64,
    pub total_wait_secs: f64,
    pub max_wait_secs: f64,
}

/// Token bucket shared by every agent task in a run.
///
/// Refill is computed lazily from elapsed time on each call, so an idle
/// bucket costs nothing. All state lives behind one mutex; callers contend
/// for the lock rather than queueing.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_rate: f64,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `refill_rate` is not positive.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        assert!(capacity > 0.0, "capacity must be positive");
        assert!(refill_rate > 0.0, "refill_rate must be positive");

        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                tokens_acquired: 0.0,
                total_wait: Duration::ZERO,
                max_wait: Duration::ZERO,
            }),
            capacity,
            refill_rate,
        }
    }

    /// One second of burst at `requests_per_sec`, and never less than one token.
    pub fn per_second(requests_per_sec: f64) -> Self {
        Self::new(requests_per_sec.max(1.0), requests_per_sec)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Try to take `tokens` without waiting.
    ///
    /// Returns `Duration::ZERO` when the tokens were deducted, otherwise the
    /// time until enough tokens will have accumulated. Nothing is deducted in
    /// the second case.
    pub async fn acquire(&self, tokens: f64) -> Duration {
        let tokens = tokens.min(self.capacity);
        let mut state = self.state.lock().await;

        state.refill(self.capacity, self.refill_rate);

        if state.tokens >= tokens {
            state.tokens -= tokens;
            state.tokens_acquired += tokens;
            return Duration::ZERO;
        }

        let needed = tokens - state.tokens;
        Duration::try_from_secs_f64(needed / self.refill_rate).unwrap_or(Duration::MAX)
    }

    /// Take `tokens`, sleeping as long as necessary.
    pub async fn wait_and_acquire(&self, tokens: f64) {
        // A never-completing cancel future can't produce Err.
        let _ = self
            .wait_and_acquire_with_cancel(tokens, std::future::pending::<()>())
            .await;
    }

    /// Take `tokens`, sleeping as long as necessary, unless `cancel` completes first.
    ///
    /// Every wake re-checks the bucket, so concurrent waiters that all slept
    /// for the same deficit cannot all deduct at once.
    pub async fn wait_and_acquire_with_cancel<F>(
        &self,
        tokens: f64,
        cancel: F,
    ) -> Result<Duration, Cancelled>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let started = Instant::now();

        loop {
            let wait = self.acquire(tokens).await;
            if wait.is_zero() {
                let waited = started.elapsed();
                if !waited.is_zero() {
                    self.record_wait(waited).await;
                }
                return Ok(waited);
            }

            // Floor the sleep so heavy contention doesn't spin on the mutex.
            let wait = wait.max(Duration::from_millis(1));

            tokio::select! {
                biased;
                () = &mut cancel => return Err(Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn record_wait(&self, waited: Duration) {
        let mut state = self.state.lock().await;
        state.total_wait += waited;
        if waited > state.max_wait {
            state.max_wait = waited;
        }
    }

    /// Current token count after refilling.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(self.capacity, self.refill_rate);
        state.tokens
    }

    pub async fn metrics(&self) -> RateLimiterMetrics {
        let state = self.state.lock().await;
        RateLimiterMetrics {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            tokens_acquired: state.tokens_acquired,
            total_wait_secs: state.total_wait.as_secs_f64(),
            max_wait_secs: state.max_wait.as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_new_bucket_starts_full() {
        let bucket = TokenBucket::new(10.0, 1.0);
        let available = bucket.available().await;
        assert!((available - 10.0).abs() < 0.1, "got {}", available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_past_capacity_reports_wait() {
        let bucket = TokenBucket::new(10.0, 10.0);

        for _ in 0..10 {
            assert_eq!(bucket.acquire(1.0).await, Duration::ZERO);
        }

        let wait = bucket.acquire(1.0).await;
        let secs = wait.as_secs_f64();
        assert!((secs - 0.1).abs() < 0.01, "expected ~0.1s, got {:?}", wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_does_not_deduct_when_waiting() {
        let bucket = TokenBucket::new(2.0, 1.0);
        assert_eq!(bucket.acquire(2.0).await, Duration::ZERO);

        let first = bucket.acquire(1.0).await;
        let second = bucket.acquire(1.0).await;
        assert!(!first.is_zero());
        assert!((first.as_secs_f64() - second.as_secs_f64()).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(5.0, 100.0);
        bucket.acquire(5.0).await;

        tokio::time::sleep(Duration::from_secs(1)).await;

        let available = bucket.available().await;
        assert!((available - 5.0).abs() < 1e-6, "got {}", available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_and_acquire_sleeps_for_deficit() {
        let bucket = TokenBucket::new(1.0, 10.0);
        bucket.wait_and_acquire(1.0).await;

        let start = Instant::now();
        bucket.wait_and_acquire(1.0).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(99), "waited {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(200), "waited {:?}", elapsed);

        let metrics = bucket.metrics().await;
        assert!((metrics.tokens_acquired - 2.0).abs() < 1e-9);
        assert!(metrics.max_wait_secs >= 0.099);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_rate_is_not_exceeded() {
        let bucket = TokenBucket::per_second(0.5);
        assert_eq!(bucket.capacity(), 1.0);

        let start = Instant::now();
        for _ in 0..5 {
            bucket.wait_and_acquire(1.0).await;
        }
        let elapsed = start.elapsed();

        // One burst token, then four more at two seconds each.
        assert!(elapsed >= Duration::from_secs(8), "waited {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_is_clamped() {
        let bucket = TokenBucket::new(2.0, 1.0);
        assert_eq!(bucket.acquire(50.0).await, Duration::ZERO);
        assert!(bucket.available().await < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_do_not_over_admit() {
        let bucket = Arc::new(TokenBucket::new(1.0, 10.0));
        bucket.acquire(1.0).await;

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                bucket.wait_and_acquire(1.0).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Five tokens at 10/s cannot be admitted in under half a second.
        assert!(
            start.elapsed() >= Duration::from_millis(490),
            "admitted too fast: {:?}",
            start.elapsed()
        );
        let metrics = bucket.metrics().await;
        assert!((metrics.tokens_acquired - 6.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled() {
        let bucket = TokenBucket::new(1.0, 0.1);
        bucket.acquire(1.0).await;

        let cancel = tokio::time::sleep(Duration::from_millis(20));
        let result = bucket.wait_and_acquire_with_cancel(1.0, cancel).await;
        assert_eq!(result, Err(Cancelled));
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(Cancelled.to_string(), "rate limiter wait cancelled");
    }
}
