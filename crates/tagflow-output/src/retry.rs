//! Retry and circuit-breaking wrappers around an [`OutputSink`]. Sleeps are
//! `std::thread::sleep`, calls are plain blocking `write`s.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::warn;

use crate::error::WriteError;
use crate::sink::OutputSink;

/// Exponential backoff with a cap, mirroring
/// `resilient_exporter::RetryConfig`.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// `attempt` is 1-based: the delay to wait *before* attempt number
    /// `attempt` (attempt 1 is the first retry, after the initial try).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Wraps a sink with bounded retry: on a recoverable ([`WriteError::is_recoverable`])
/// failure, sleeps for the backoff delay and tries again, up to
/// `config.max_retries` additional attempts. A fatal error or
/// `WriteError::CircuitOpen` is never retried.
pub struct RetryingSink<S> {
    inner: S,
    config: RetryConfig,
    total_retries: AtomicU64,
    recovered_writes: AtomicU64,
}

impl<S: OutputSink> RetryingSink<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered_writes: AtomicU64::new(0),
        }
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn recovered_writes(&self) -> u64 {
        self.recovered_writes.load(Ordering::Relaxed)
    }
}

impl<S: OutputSink> OutputSink for RetryingSink<S> {
    fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        let max_attempts = self.config.max_retries + 1;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                crate::invariants::debug_assert_retry_attempt_bounded!(attempt, max_attempts);
                std::thread::sleep(self.config.delay_for_attempt(attempt - 1));
                self.total_retries.fetch_add(1, Ordering::Relaxed);
            }

            match self.inner.write(bytes) {
                Ok(()) => {
                    if attempt > 1 {
                        self.recovered_writes.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(());
                }
                Err(err @ WriteError::CircuitOpen) => return Err(err),
                Err(err) if !err.is_recoverable() => return Err(err),
                Err(err) => {
                    warn!(
                        "{} write attempt {attempt}/{max_attempts} failed: {err}",
                        self.inner.name()
                    );
                }
            }
        }

        Err(WriteError::RetriesExhausted {
            attempts: max_attempts,
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Circuit breaker state, mirroring `resilient_exporter::CircuitState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_time: Option<Instant>,
}

/// Wraps a sink so that after `failure_threshold` consecutive failures it
/// stops calling the inner sink entirely (returning `WriteError::CircuitOpen`
/// immediately) until `reset_timeout` elapses, then allows a trial write
/// (half-open); `success_threshold` consecutive trial successes close the
/// circuit again.
pub struct CircuitBreakerSink<S> {
    inner: S,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    times_opened: AtomicU32,
}

impl<S: OutputSink> CircuitBreakerSink<S> {
    pub fn new(inner: S, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure_time: None,
            }),
            times_opened: AtomicU32::new(0),
        }
    }

    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    fn should_allow_request(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_enough = state
                    .last_failure_time
                    .map(|t| t.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed_enough {
                    state.state = CircuitState::HalfOpen;
                    state.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        let before = state.state;
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.consecutive_failures = 0;
                }
            }
            CircuitState::Open => {
                // a stray success while open shouldn't happen since
                // should_allow_request gates calls, but don't panic on it.
            }
        }
        debug_assert!(
            matches!(
                (before, state.state),
                (CircuitState::Closed, CircuitState::Closed)
                    | (CircuitState::HalfOpen, CircuitState::HalfOpen)
                    | (CircuitState::HalfOpen, CircuitState::Closed)
                    | (CircuitState::Open, CircuitState::Open)
            ),
            "invalid circuit breaker transition on success: {before:?} -> {:?}",
            state.state
        );
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        let before = state.state;
        state.last_failure_time = Some(Instant::now());
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    self.times_opened.fetch_add(1, Ordering::Relaxed);
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.consecutive_failures = self.config.failure_threshold;
                self.times_opened.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::Open => {}
        }
        debug_assert!(
            matches!(
                (before, state.state),
                (CircuitState::Closed, CircuitState::Closed)
                    | (CircuitState::Closed, CircuitState::Open)
                    | (CircuitState::HalfOpen, CircuitState::Open)
                    | (CircuitState::Open, CircuitState::Open)
            ),
            "invalid circuit breaker transition on failure: {before:?} -> {:?}",
            state.state
        );
    }
}

impl<S: OutputSink> OutputSink for CircuitBreakerSink<S> {
    fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        if !self.should_allow_request() {
            return Err(WriteError::CircuitOpen);
        }
        match self.inner.write(bytes) {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::test_doubles::{AlwaysFatalSink, CollectingSink, FailingSink};

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let sink = RetryingSink::new(
            FailingSink::new(2),
            RetryConfig {
                max_retries: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 1.0,
            },
        );
        sink.write(b"hello").unwrap();
        assert_eq!(sink.recovered_writes(), 1);
        assert_eq!(sink.total_retries(), 2);
    }

    #[test]
    fn retry_exhausts_and_reports_attempts() {
        let sink = RetryingSink::new(
            FailingSink::new(100),
            RetryConfig {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                backoff_multiplier: 1.0,
            },
        );
        let err = sink.write(b"hello").unwrap_err();
        assert_eq!(err, WriteError::RetriesExhausted { attempts: 3 });
    }

    #[test]
    fn fatal_errors_are_never_retried() {
        let sink = RetryingSink::new(AlwaysFatalSink, RetryConfig::default());
        let err = sink.write(b"hello").unwrap_err();
        assert!(matches!(err, WriteError::Fatal(_)));
    }

    #[test]
    fn backoff_delay_grows_and_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(450)); // capped
    }

    #[test]
    fn circuit_breaker_opens_after_threshold_and_blocks_calls() {
        let sink = CircuitBreakerSink::new(
            AlwaysFatalSink,
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
        );
        for _ in 0..3 {
            assert!(sink.write(b"x").is_err());
        }
        let err = sink.write(b"x").unwrap_err();
        assert_eq!(err, WriteError::CircuitOpen);
        assert_eq!(sink.times_opened(), 1);
    }

    #[test]
    fn circuit_breaker_half_opens_after_timeout_and_recovers() {
        let failing = FailingSink::new(1);
        let sink = CircuitBreakerSink::new(
            failing,
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(5),
                success_threshold: 1,
            },
        );
        assert!(sink.write(b"x").is_err());
        assert!(sink.write(b"x").is_err(), "still open immediately after tripping");
        std::thread::sleep(Duration::from_millis(10));
        sink.write(b"x").unwrap();
    }

    #[test]
    fn collecting_sink_receives_bytes_verbatim() {
        let sink = CollectingSink::default();
        sink.write(b"payload").unwrap();
        assert_eq!(sink.writes.lock().unwrap().as_slice(), [b"payload".to_vec()]);
    }
}
