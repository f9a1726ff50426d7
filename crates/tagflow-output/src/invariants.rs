//! Debug assertion macros specific to the retry/flush engine.

/// Assert that a retry attempt counter never exceeds the computed attempt
/// budget (`max_retries + 1`).
macro_rules! debug_assert_retry_attempt_bounded {
    ($attempt:expr, $max_attempts:expr) => {
        debug_assert!(
            $attempt <= $max_attempts,
            "INV-BUF-06 violated: retry attempt {} exceeds budget {}",
            $attempt,
            $max_attempts
        )
    };
}

pub(crate) use debug_assert_retry_attempt_bounded;
