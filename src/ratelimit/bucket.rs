//! Token bucket admission control.
//!
//! State lives behind a single mutex; refill happens lazily on each
//! acquisition attempt so there is no background task to supervise.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interval between wakeups while waiting for a token.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: u32,
    refill_period: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A bucket starts full. `capacity` and `refill_rate` must be positive
    /// and `refill_period` non-zero; violations are programmer errors.
    pub fn new(capacity: u32, refill_rate: u32, refill_period: Duration) -> Self {
        assert!(capacity > 0, "token bucket capacity must be positive");
        assert!(refill_rate > 0, "token bucket refill rate must be positive");
        assert!(
            !refill_period.is_zero(),
            "token bucket refill period must be non-zero"
        );

        Self {
            capacity,
            refill_rate,
            refill_period,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token if one is available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Wait until a token can be taken. Returns `false` if `cancel` fires
    /// first. With a positive refill rate the wait is always finite.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            if self.try_acquire() {
                return true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(ACQUIRE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Tokens currently available, after applying any pending refill.
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Credit whole elapsed refill intervals. `last_refill` advances by the
    /// exact credited amount rather than jumping to `now`, so partial
    /// intervals are never lost to drift.
    fn refill(&self, state: &mut BucketState) {
        let elapsed = Instant::now().duration_since(state.last_refill);
        let intervals = (elapsed.as_nanos() / self.refill_period.as_nanos()) as u64;
        if intervals == 0 {
            return;
        }

        let credited = intervals.saturating_mul(self.refill_rate as u64);
        state.tokens = state
            .tokens
            .saturating_add(credited.min(self.capacity as u64) as u32)
            .min(self.capacity);
        state.last_refill += self.refill_period * intervals as u32;
    }
}
