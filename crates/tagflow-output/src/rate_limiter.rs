//! Blocking rate limiting for a sink, paced with `std::thread::sleep`
//! instead of an async timer.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::WriteError;
use crate::sink::OutputSink;

/// Paces calls to at most one per `interval`. `None` interval means
/// unlimited (`wait` never blocks).
pub trait RateLimiter: Send + Sync {
    fn wait(&self);

    fn target_rate(&self) -> Option<f64> {
        None
    }
}

struct IntervalState {
    last_tick: Option<Instant>,
}

/// A sink-rate limiter keyed on wall-clock interval between permitted calls.
pub struct IntervalRateLimiter {
    interval: Option<Duration>,
    rate_per_sec: f64,
    state: Mutex<IntervalState>,
}

impl IntervalRateLimiter {
    pub fn new(period: Duration) -> Self {
        let interval = if period.is_zero() { None } else { Some(period) };
        let rate_per_sec = if period.is_zero() {
            0.0
        } else {
            1.0 / period.as_secs_f64()
        };
        Self {
            interval,
            rate_per_sec,
            state: Mutex::new(IntervalState { last_tick: None }),
        }
    }

    /// Panics if `rate_per_sec` is not positive.
    pub fn from_rate(rate_per_sec: f64) -> Self {
        assert!(rate_per_sec > 0.0, "rate_per_sec must be positive");
        Self::new(Duration::from_secs_f64(1.0 / rate_per_sec))
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl RateLimiter for IntervalRateLimiter {
    fn wait(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        if let Some(last) = state.last_tick {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        state.last_tick = Some(Instant::now());
    }

    fn target_rate(&self) -> Option<f64> {
        self.interval.map(|_| self.rate_per_sec)
    }
}

/// Never waits; yields the thread instead, for tests that want to exercise
/// the rate-limited code path without timing sensitivity.
#[derive(Debug, Default)]
pub struct YieldingRateLimiter;

impl RateLimiter for YieldingRateLimiter {
    fn wait(&self) {
        std::thread::yield_now();
    }
}

/// Wraps a sink so every `write` is paced through a [`RateLimiter`] before
/// reaching the inner sink — used optionally by an `Output` that wants to
/// cap its write rate, e.g. against a downstream with its own throttling.
pub struct RateLimitedSink<S, R> {
    inner: S,
    limiter: R,
}

impl<S: OutputSink, R: RateLimiter> RateLimitedSink<S, R> {
    pub fn new(inner: S, limiter: R) -> Self {
        Self { inner, limiter }
    }
}

impl<S: OutputSink, R: RateLimiter> OutputSink for RateLimitedSink<S, R> {
    fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        self.limiter.wait();
        self.inner.write(bytes)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
