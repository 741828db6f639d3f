//! Exchange circuit breaker: CLOSED -> OPEN -> HALF_OPEN -> CLOSED over a
//! sliding window of the last `W` call outcomes.
//!
//! State lives in an `AtomicU8` so a fast-path `is_open()` check never
//! takes the lock; the sliding window of call outcomes sits behind a
//! `parking_lot::Mutex` since it's only touched around state transitions.

use crate::error::ExecError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            1 => State::Open,
            2 => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub timeout: Duration,
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            window_size: 10,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn conservative() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 5,
            timeout: Duration::from_secs(60),
            window_size: 10,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 8,
            success_threshold: 2,
            timeout: Duration::from_secs(15),
            window_size: 10,
        }
    }
}

struct Inner {
    window: VecDeque<bool>,
    half_open_successes: usize,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(State::Closed as u8),
            inner: Mutex::new(Inner {
                window: VecDeque::with_capacity(config.window_size),
                half_open_successes: 0,
                last_failure: None,
            }),
            config,
        }
    }

    fn state(&self) -> State {
        State::from(self.state.load(Ordering::Acquire))
    }

    /// Runs `f` through the breaker: fails fast with `ExchangeUnavailable`
    /// while open (until the timeout elapses, at which point a single
    /// probe transitions to half-open), records the outcome otherwise.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, ExecError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExecError>>,
    {
        self.before_call()?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    fn before_call(&self) -> Result<(), ExecError> {
        match self.state() {
            State::Closed => Ok(()),
            State::HalfOpen => Ok(()),
            State::Open => {
                let elapsed_ok = {
                    let inner = self.inner.lock();
                    inner
                        .last_failure
                        .map(|t| t.elapsed() >= self.config.timeout)
                        .unwrap_or(true)
                };
                if elapsed_ok {
                    self.transition(State::HalfOpen);
                    Ok(())
                } else {
                    Err(ExecError::ExchangeUnavailable)
                }
            }
        }
    }

    fn record_success(&self) {
        match self.state() {
            State::HalfOpen => {
                let mut inner = self.inner.lock();
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.window.clear();
                    inner.half_open_successes = 0;
                    drop(inner);
                    self.transition(State::Closed);
                }
            }
            State::Closed => {
                let mut inner = self.inner.lock();
                push_window(&mut inner.window, self.config.window_size, true);
            }
            State::Open => {}
        }
    }

    fn record_failure(&self) {
        match self.state() {
            State::HalfOpen => {
                let mut inner = self.inner.lock();
                inner.half_open_successes = 0;
                inner.last_failure = Some(Instant::now());
                drop(inner);
                self.transition(State::Open);
            }
            State::Closed => {
                let trip = {
                    let mut inner = self.inner.lock();
                    push_window(&mut inner.window, self.config.window_size, false);
                    inner.last_failure = Some(Instant::now());
                    let failures = inner.window.iter().filter(|&&ok| !ok).count();
                    inner.window.len() >= self.config.window_size && failures >= self.config.failure_threshold
                };
                if trip {
                    self.transition(State::Open);
                }
            }
            State::Open => {}
        }
    }

    fn transition(&self, new_state: State) {
        let old = self.state();
        if old == new_state {
            return;
        }
        self.state.store(new_state as u8, Ordering::Release);
        match new_state {
            State::Open => warn!(?old, "circuit breaker opened"),
            State::HalfOpen => info!(?old, "circuit breaker half-open, probing"),
            State::Closed => info!(?old, "circuit breaker closed"),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }
}

fn push_window(window: &mut VecDeque<bool>, window_size: usize, ok: bool) {
    window.push_back(ok);
    while window.len() > window_size {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(window_size: usize, failure_threshold: usize) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            window_size,
        })
    }

    async fn ok() -> Result<(), ExecError> {
        Ok(())
    }
    async fn fail() -> Result<(), ExecError> {
        Err(ExecError::ExchangeTimeout)
    }

    #[tokio::test]
    async fn opens_only_once_window_is_full() {
        let cb = breaker(5, 3);
        for _ in 0..3 {
            let _ = cb.call(|| fail()).await;
        }
        assert!(!cb.is_open(), "window not full yet, should stay closed");
        for _ in 0..2 {
            let _ = cb.call(|| fail()).await;
        }
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = breaker(3, 2);
        let _ = cb.call(|| fail()).await;
        let _ = cb.call(|| fail()).await;
        let _ = cb.call(|| fail()).await;
        assert!(cb.is_open());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let result = cb.call(|| fail()).await;
        assert!(result.is_err());
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn half_open_success_threshold_closes() {
        let cb = breaker(3, 2);
        let _ = cb.call(|| fail()).await;
        let _ = cb.call(|| fail()).await;
        let _ = cb.call(|| fail()).await;
        assert!(cb.is_open());

        tokio::time::sleep(Duration::from_millis(60)).await;
        cb.call(|| ok()).await.unwrap();
        cb.call(|| ok()).await.unwrap();
        assert!(!cb.is_open());
    }
}
