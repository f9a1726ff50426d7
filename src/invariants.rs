//! Debug assertion macros for buffer and router invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]` via
//! `debug_assert!`), so there is zero overhead in release builds.

// =============================================================================
// INV-BUF-01: Append-Only Growth
// =============================================================================

/// Assert that appending to an open chunk never shrinks it.
///
/// **Invariant**: `size_after >= size_before` for any unpurged chunk.
macro_rules! debug_assert_append_only {
    ($before:expr, $after:expr) => {
        debug_assert!(
            $after >= $before,
            "INV-BUF-01 violated: chunk size shrank from {} to {} on append",
            $before,
            $after
        )
    };
}

// =============================================================================
// INV-BUF-02: Lock Ordering
// =============================================================================

/// Assert that the Buffer lock is held before the Queue lock is ever taken.
///
/// **Invariant**: Queue lock acquisition always nests inside an active Buffer
/// lock hold, never the reverse.
macro_rules! debug_assert_buffer_locked_before_queue {
    ($buffer_locked:expr) => {
        debug_assert!(
            $buffer_locked,
            "INV-BUF-02 violated: queue lock acquired without holding the buffer lock"
        )
    };
}

// =============================================================================
// INV-BUF-03: Purge Is Terminal
// =============================================================================

/// Assert that a chunk already marked purged never becomes un-purged.
///
/// **Invariant**: once `purged == true`, it stays `true`.
macro_rules! debug_assert_purge_terminal {
    ($was_purged:expr, $is_purged:expr) => {
        debug_assert!(
            !$was_purged || $is_purged,
            "INV-BUF-03 violated: a purged chunk became un-purged"
        )
    };
}

// =============================================================================
// INV-BUF-04: Serial Pop Preserves FIFO
// =============================================================================

/// Assert that serial `Pop` returns chunks in non-decreasing enqueue order.
///
/// **Invariant**: `popped.enqueue_seq >= last_popped.enqueue_seq`.
macro_rules! debug_assert_pop_fifo {
    ($last_seq:expr, $popped_seq:expr) => {
        debug_assert!(
            $popped_seq >= $last_seq,
            "INV-BUF-04 violated: serial pop returned seq {} after seq {}",
            $popped_seq,
            $last_seq
        )
    };
}

// =============================================================================
// INV-BUF-05: Flush Trigger Accuracy
// =============================================================================

/// Assert that `Append` signals a flush trigger only when a chunk actually
/// transitioned from open (in the map) to queued.
///
/// **Invariant**: `trigger == true` implies a chunk was enqueued this call.
macro_rules! debug_assert_flush_trigger_accurate {
    ($trigger:expr, $enqueued_this_call:expr) => {
        debug_assert!(
            !$trigger || $enqueued_this_call,
            "INV-BUF-05 violated: flush trigger fired without an enqueue"
        )
    };
}

// =============================================================================
// INV-BUF-06: Bounded Retry
// =============================================================================

/// Assert that an output's retry count never exceeds its configured limit
/// before the output is dead-lettered (dropped and reset).
///
/// **Invariant**: `attempts <= retry_limit` at the point a write is issued.
macro_rules! debug_assert_retry_bounded {
    ($attempts:expr, $limit:expr) => {
        debug_assert!(
            $attempts <= $limit,
            "INV-BUF-06 violated: retry attempt {} exceeds limit {}",
            $attempts,
            $limit
        )
    };
}

pub(crate) use debug_assert_append_only;
pub(crate) use debug_assert_buffer_locked_before_queue;
pub(crate) use debug_assert_flush_trigger_accurate;
pub(crate) use debug_assert_pop_fifo;
pub(crate) use debug_assert_purge_terminal;
pub(crate) use debug_assert_retry_bounded;
