//! Async, FIFO-queued token-bucket rate limiter.
//!
//! Fixed-point milli-token bucket behind a `parking_lot::Mutex`, refilled
//! based on elapsed wall-clock time since the last refill. `acquire()`
//! queues callers up to `max_queue_size` rather than rejecting outright,
//! and fails with a typed error instead of a boolean when the queue is
//! full or the wait exceeds its deadline.

use crate::error::ExecError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Fixed-point scale: tokens are stored as integer milli-tokens so the
/// refill math never touches floating point.
const SCALE: u64 = 1000;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub capacity: u32,
    pub refill_per_sec: u32,
    pub max_queue_size: usize,
    pub max_wait_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            refill_per_sec: 5,
            max_queue_size: 100,
            max_wait_ms: 30_000,
        }
    }
}

impl RateLimiterConfig {
    pub fn conservative() -> Self {
        Self {
            capacity: 20,
            refill_per_sec: 2,
            max_queue_size: 50,
            max_wait_ms: 30_000,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            capacity: 100,
            refill_per_sec: 10,
            max_queue_size: 200,
            max_wait_ms: 30_000,
        }
    }
}

struct Bucket {
    tokens_milli: u64,
    last_refill: Instant,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<Bucket>,
    queue_len: AtomicUsize,
    stopped: AtomicBool,
    notify: Notify,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let capacity_milli = config.capacity as u64 * SCALE;
        Self {
            bucket: Mutex::new(Bucket {
                tokens_milli: capacity_milli,
                last_refill: Instant::now(),
            }),
            config,
            queue_len: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn refill_locked(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let capacity_milli = self.config.capacity as u64 * SCALE;
        let refill_milli = (elapsed.as_secs_f64() * self.config.refill_per_sec as f64 * SCALE as f64) as u64;
        if refill_milli > 0 {
            bucket.tokens_milli = (bucket.tokens_milli + refill_milli).min(capacity_milli);
            bucket.last_refill = now;
        }
    }

    /// Attempts to take one token without blocking.
    fn try_consume(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill_locked(&mut bucket);
        if bucket.tokens_milli >= SCALE {
            bucket.tokens_milli -= SCALE;
            true
        } else {
            false
        }
    }

    /// Consumes one token, waiting (queued, bounded by `max_queue_size`)
    /// until one is available or `max_wait_ms` elapses.
    pub async fn acquire(&self) -> Result<(), ExecError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ExecError::RateLimiterStopped);
        }

        if self.try_consume() {
            return Ok(());
        }

        let queued = self.queue_len.fetch_add(1, Ordering::AcqRel) + 1;
        if queued > self.config.max_queue_size {
            self.queue_len.fetch_sub(1, Ordering::AcqRel);
            return Err(ExecError::RateLimitQueueFull {
                max_queue_size: self.config.max_queue_size,
            });
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.max_wait_ms);
        let result = loop {
            if self.stopped.load(Ordering::Acquire) {
                break Err(ExecError::RateLimiterStopped);
            }
            if self.try_consume() {
                break Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(ExecError::RateLimitQueueTimeout {
                    waited_ms: self.config.max_wait_ms,
                });
            }
            let poll_interval = Duration::from_millis(50).min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = self.notify.notified() => {}
            }
        };

        self.queue_len.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Wakes all waiters with `RateLimiterStopped`; called on graceful
    /// shutdown alongside the other loops polling the shutdown flag.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }
}
