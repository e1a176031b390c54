use crate::error::GatewayError;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rounding slack so that a refill landing a hair under one token after the
/// computed wait does not trigger another sub-nanosecond sleep.
const EPSILON: f64 = 1e-9;

/// Token bucket with lazy continuous refill.
///
/// Holds at most `burst` tokens and gains `qps` tokens per second, computed on
/// access from the time since the last refill. A caller that finds the bucket
/// empty sleeps until the next token is due instead of being rejected.
///
/// The mutex guards only the refill arithmetic. It is never held across the
/// sleep, so a slow waiter cannot stall other callers of the same bucket.
pub struct TokenBucket {
    qps: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(qps: f64, burst: u64) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            qps,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn qps(&self) -> f64 {
        self.qps
    }

    pub fn burst(&self) -> u64 {
        self.capacity as u64
    }

    /// Wait for a token and consume it. Returns the instant the token was
    /// granted. Dropping the future before it completes consumes nothing.
    pub async fn take(&self) -> Instant {
        loop {
            match self.try_consume() {
                Ok(granted) => return granted,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Like [`take`](Self::take), but gives up with `Cancelled` as soon as
    /// `cancel` fires. A cancelled wait consumes no token.
    pub async fn take_or_cancel(&self, cancel: &CancellationToken) -> Result<Instant, GatewayError> {
        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            match self.try_consume() {
                Ok(granted) => return Ok(granted),
                Err(wait) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Current token count after refill, without consuming.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Refill, then either consume one token or report how long until one is due.
    fn try_consume(&self) -> Result<Instant, Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens + EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            Ok(now)
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.qps))
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.qps).min(self.capacity);
            state.last_refill = now;
        }
    }
}
