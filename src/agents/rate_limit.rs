//! Shared token-bucket rate limiting, one bucket per agent name.
//!
//! Buckets live in a process-wide registry with explicit init/shutdown; tests
//! construct private instances. `acquire` suspends until a token is available
//! and returns promptly with `Cancelled` when the context is cancelled.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::errors::AdapterError;

/// A single token bucket.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(0.001),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, or report how long until one is available.
    fn try_take(&self) -> Result<(), Duration> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Tokens currently available (for scheduling-cap queries).
    pub fn available(&self) -> u32 {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
        state.tokens as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }
}

/// Registry of buckets, keyed by agent name.
#[derive(Clone, Default)]
pub struct RateLimiters {
    buckets: Arc<DashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bucket for an agent. Replaces any existing bucket.
    pub fn register(&self, agent: &str, capacity: u32, refill_per_sec: f64) {
        self.buckets.insert(
            agent.to_string(),
            Arc::new(TokenBucket::new(capacity, refill_per_sec)),
        );
    }

    pub fn bucket(&self, agent: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.get(agent).map(|entry| Arc::clone(&entry))
    }

    /// Block until a token is available for the agent. Agents without a
    /// registered bucket are unthrottled.
    pub async fn acquire(
        &self,
        agent: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdapterError> {
        let Some(bucket) = self.bucket(agent) else {
            return Ok(());
        };

        loop {
            match bucket.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(AdapterError::cancelled(agent));
                        }
                        _ = tokio::time::sleep(wait.min(Duration::from_millis(250))) => {}
                    }
                }
            }
        }
    }
}

static GLOBAL: OnceLock<RateLimiters> = OnceLock::new();

/// Initialize the process-wide registry. Later calls return the existing one.
pub fn init_global() -> &'static RateLimiters {
    GLOBAL.get_or_init(RateLimiters::new)
}

/// Drop all buckets from the process-wide registry.
pub fn shutdown_global() {
    if let Some(limiters) = GLOBAL.get() {
        limiters.buckets.clear();
    }
}
