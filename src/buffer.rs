//! Buffer: the two-level-locked map/queue of chunks an output drains.
//!
//! Two locks guard disjoint state: the Buffer lock protects `Map<key, Chunk>`
//! (the open chunks currently being appended to), the Queue lock protects the
//! FIFO `Queue<Chunk>` (chunks that are full and waiting to be written). Code
//! in this module only ever acquires the Buffer lock before the Queue lock —
//! never the reverse.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::chunk::{Chunk, ChunkBacking};
use crate::error::BufferError;
use crate::invariants::{
    debug_assert_buffer_locked_before_queue, debug_assert_flush_trigger_accurate,
};
use crate::observe::{Observe, ObservedValue};
use crate::record::Record;

/// Tunable limits and presets, mirroring the config-struct-with-presets shape
/// used across the pack (e.g. `StreamConfig::low_latency()`).
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub chunk_limit_bytes: usize,
    pub queue_limit: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_limit_bytes: 8 * 1024 * 1024,
            queue_limit: 256,
        }
    }
}

impl BufferConfig {
    /// Small chunks, short queue: favors low per-event latency over
    /// throughput.
    pub fn low_latency() -> Self {
        Self {
            chunk_limit_bytes: 256 * 1024,
            queue_limit: 32,
        }
    }

    /// Large chunks, long queue: favors batching efficiency over latency.
    pub fn high_throughput() -> Self {
        Self {
            chunk_limit_bytes: 32 * 1024 * 1024,
            queue_limit: 1024,
        }
    }

    pub fn with_chunk_limit_bytes(mut self, limit: usize) -> Self {
        self.chunk_limit_bytes = limit;
        self
    }

    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }
}

struct QueueState<C> {
    queue: VecDeque<C>,
}

/// The chunk map + queue an `Output` drains, generic over the concrete
/// [`ChunkBacking`] (memory, file, ...).
pub struct Buffer<B: ChunkBacking> {
    backing: B,
    config: BufferConfig,
    map: Mutex<HashMap<String, B::Chunk>>,
    queue: Mutex<QueueState<B::Chunk>>,
    queue_not_empty: Condvar,
    shut_down: AtomicBool,
    queued_bytes: AtomicUsize,
    queued_chunks_total: AtomicUsize,
}

impl<B: ChunkBacking> Buffer<B> {
    pub fn new(backing: B, config: BufferConfig) -> Self {
        let (map, queue) = backing.resume();
        let queued_bytes = queue.iter().map(Chunk::size).sum();
        Self {
            backing,
            config,
            map: Mutex::new(map),
            queue: Mutex::new(QueueState { queue }),
            queue_not_empty: Condvar::new(),
            shut_down: AtomicBool::new(false),
            queued_bytes: AtomicUsize::new(queued_bytes),
            queued_chunks_total: AtomicUsize::new(0),
        }
    }

    /// Appends one record under `key`, rotating the open chunk into the
    /// queue first if the record would overflow it. Returns `Ok(true)` when
    /// this call caused a chunk to become queued (the output's flusher
    /// should wake), `Ok(false)` otherwise.
    pub fn append(&self, key: &str, time: i64, record: &Record) -> Result<bool, BufferError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(BufferError::ShutDown);
        }

        let estimated = record.estimated_size();
        if estimated > self.config.chunk_limit_bytes {
            return Err(BufferError::ChunkTooLarge {
                size: estimated,
                limit: self.config.chunk_limit_bytes,
            });
        }

        let mut map = self.map.lock().unwrap();
        let mut trigger = false;

        let needs_rotation = match map.get(key) {
            Some(chunk) => chunk.size() + estimated > self.config.chunk_limit_bytes && !chunk.is_empty(),
            None => false,
        };

        if needs_rotation {
            let full = map.remove(key).expect("checked above");
            trigger = self.enqueue(&mut *map, full)?;
        }

        let chunk = map
            .entry(key.to_string())
            .or_insert_with(|| self.backing.new_chunk(key));
        chunk.append(time, record, self.config.chunk_limit_bytes)?;

        debug_assert_flush_trigger_accurate!(trigger, needs_rotation);
        Ok(trigger)
    }

    /// Moves the open chunk for `key` into the queue immediately, regardless
    /// of fill level. Used by a timed flush (`flush_interval` elapsed with a
    /// non-empty open chunk) as well as explicit `force_flush`.
    pub fn force_flush(&self, key: &str) -> Result<bool, BufferError> {
        let mut map = self.map.lock().unwrap();
        match map.remove(key) {
            Some(chunk) if !chunk.is_empty() => {
                self.enqueue(&mut *map, chunk)?;
                Ok(true)
            }
            Some(chunk) => {
                // put back an empty chunk untouched rather than discard it
                map.insert(key.to_string(), chunk);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Enqueues `chunk`, called with the Buffer (map) lock already held so
    /// lock ordering Buffer -> Queue is observed. Returns whether the queue
    /// was empty immediately before this push — the `FlushTrigger` signal a
    /// caller wakes its flusher on, snapshotted under the Queue sub-lock
    /// before the push so a second enqueue arriving while the first chunk is
    /// still queued correctly reports `false`.
    fn enqueue(
        &self,
        _map_guard: &mut HashMap<String, B::Chunk>,
        chunk: B::Chunk,
    ) -> Result<bool, BufferError> {
        debug_assert_buffer_locked_before_queue!(true);
        let mut state = self.queue.lock().unwrap();
        if state.queue.len() >= self.config.queue_limit {
            return Err(BufferError::QueueFull {
                len: state.queue.len(),
                limit: self.config.queue_limit,
            });
        }
        let queue_was_empty = state.queue.is_empty();
        self.backing.on_enqueue(&chunk);
        self.queued_bytes.fetch_add(chunk.size(), Ordering::AcqRel);
        self.queued_chunks_total.fetch_add(1, Ordering::Relaxed);
        state.queue.push_back(chunk);
        self.queue_not_empty.notify_all();
        Ok(queue_was_empty)
    }

    /// Selects one queued chunk for writing.
    ///
    /// `parallel = false` (serial mode): only the front of the queue is
    /// eligible; if it's already locked by another writer, returns `None`
    /// rather than skip ahead, preserving FIFO order across concurrent
    /// pops.
    ///
    /// `parallel = true`: scans the whole queue for the first chunk whose
    /// advisory lock can be acquired, so one locked chunk (slow writer key)
    /// doesn't stall chunks queued for other keys.
    ///
    /// The returned chunk is removed from the queue and left locked. It is
    /// not yet settled: the caller MUST follow up with exactly one of
    /// [`Buffer::purge_popped`] (write succeeded, or the chunk was empty) or
    /// [`Buffer::requeue_after_failure`] (write failed) — never neither,
    /// never both — so a failed write never silently loses the chunk.
    pub fn pop(&self, parallel: bool) -> Option<B::Chunk> {
        let mut state = self.queue.lock().unwrap();
        let idx = if parallel {
            state.queue.iter().position(Chunk::try_lock)
        } else {
            match state.queue.front() {
                Some(front) if front.try_lock() => Some(0),
                _ => None,
            }
        }?;
        let chunk = state.queue.remove(idx).expect("index just located");
        self.queued_bytes
            .fetch_sub(chunk.size().min(self.queued_bytes.load(Ordering::Acquire)), Ordering::AcqRel);
        Some(chunk)
    }

    /// Settles a popped chunk after a successful write (or a defensive
    /// empty-chunk skip): purges it for good. `Pop` purges the chunk iff the
    /// write actually succeeded — a failed write must go through
    /// [`Buffer::requeue_after_failure`] instead.
    pub fn purge_popped(&self, mut chunk: B::Chunk) {
        chunk.purge();
    }

    /// Settles a popped chunk after a failed write: the chunk was never
    /// delivered, so it goes back onto the front of the queue — still
    /// retry-visible on the next `pop` — with its advisory lock released.
    /// `TotalQueuedBytes` is restored to account for it. Backoff between
    /// retry attempts is the caller's (the flush loop's) responsibility, not
    /// the chunk's: the lock itself is released on every exit path so a
    /// different flusher thread isn't blocked behind a failing one.
    pub fn requeue_after_failure(&self, chunk: B::Chunk) {
        chunk.unlock();
        let mut state = self.queue.lock().unwrap();
        self.queued_bytes.fetch_add(chunk.size(), Ordering::AcqRel);
        state.queue.push_front(chunk);
        self.queue_not_empty.notify_all();
    }

    /// Blocks the calling (flusher) thread until either a chunk is queued or
    /// `timeout` elapses, whichever first. Used by the output's flush loop
    /// instead of busy-polling.
    pub fn wait_for_queued(&self, timeout: Duration) {
        let state = self.queue.lock().unwrap();
        if !state.queue.is_empty() {
            return;
        }
        let _ = self.queue_not_empty.wait_timeout(state, timeout).unwrap();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().queue.len()
    }

    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.queue_not_empty.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl<B: ChunkBacking> Observe for Buffer<B> {
    fn observe(&self) -> HashMap<String, ObservedValue> {
        let mut out = HashMap::new();
        out.insert(
            "BufferQueueLength".to_string(),
            ObservedValue::from(self.queue_len()),
        );
        out.insert(
            "BufferTotalQueuedBytes".to_string(),
            ObservedValue::from(self.queued_bytes.load(Ordering::Relaxed)),
        );
        out.insert(
            "BufferQueuedChunksTotal".to_string(),
            ObservedValue::from(self.queued_chunks_total.load(Ordering::Relaxed)),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::MemoryBacking;

    fn tiny_buffer() -> Buffer<MemoryBacking> {
        Buffer::new(
            MemoryBacking,
            BufferConfig::default()
                .with_chunk_limit_bytes(64)
                .with_queue_limit(4),
        )
    }

    #[test]
    fn append_returns_false_until_chunk_fills() {
        let buffer = tiny_buffer();
        let small = Record::new().with_field("a", 1_i64);
        let triggered = buffer.append("app.access", 1, &small).unwrap();
        assert!(!triggered);
        assert_eq!(buffer.queue_len(), 0);
    }

    #[test]
    fn append_rotates_and_triggers_flush_when_chunk_would_overflow() {
        let buffer = tiny_buffer();
        let filler = Record::new().with_field("blob", "x".repeat(40));
        assert!(!buffer.append("k", 1, &filler).unwrap());
        let triggered = buffer.append("k", 2, &filler).unwrap();
        assert!(triggered, "second oversized append should rotate the first chunk into the queue");
        assert_eq!(buffer.queue_len(), 1);
    }

    #[test]
    fn oversize_record_fails_fast() {
        let buffer = tiny_buffer();
        let huge = Record::new().with_field("blob", "x".repeat(1000));
        let err = buffer.append("k", 1, &huge).unwrap_err();
        assert!(matches!(err, BufferError::ChunkTooLarge { .. }));
    }

    #[test]
    fn queue_full_is_reported() {
        let buffer = tiny_buffer();
        let filler = Record::new().with_field("blob", "x".repeat(40));
        for i in 0..4 {
            buffer.append(&format!("k{i}"), 1, &filler).unwrap();
            buffer.force_flush(&format!("k{i}")).unwrap();
        }
        let err = buffer
            .append("k4", 1, &filler)
            .and_then(|_| buffer.force_flush("k4"))
            .unwrap_err();
        assert!(matches!(err, BufferError::QueueFull { .. }));
    }

    #[test]
    fn serial_pop_respects_fifo_and_lock() {
        let buffer = tiny_buffer();
        let record = Record::new().with_field("a", 1_i64);
        buffer.append("k1", 1, &record).unwrap();
        buffer.force_flush("k1").unwrap();
        buffer.append("k2", 2, &record).unwrap();
        buffer.force_flush("k2").unwrap();

        let first = buffer.pop(false).unwrap();
        assert_eq!(first.key(), "k1");
        // front chunk is already popped; queue now has only k2 at front
        let second = buffer.pop(false).unwrap();
        assert_eq!(second.key(), "k2");
        assert!(buffer.pop(false).is_none());
    }

    #[test]
    fn parallel_pop_skips_locked_front_chunk() {
        let buffer = tiny_buffer();
        let record = Record::new().with_field("a", 1_i64);
        buffer.append("k1", 1, &record).unwrap();
        buffer.force_flush("k1").unwrap();
        buffer.append("k2", 2, &record).unwrap();
        buffer.force_flush("k2").unwrap();

        let locked_front = buffer.pop(true).unwrap();
        assert_eq!(locked_front.key(), "k1");
        // k1 removed from queue entirely on pop (not just locked-in-place),
        // so a concurrent parallel pop now sees only k2.
        let other = buffer.pop(true);
        assert!(other.is_some());
        assert_eq!(other.unwrap().key(), "k2");
    }

    #[test]
    fn pop_on_empty_queue_is_none() {
        let buffer = tiny_buffer();
        assert!(buffer.pop(false).is_none());
        assert!(buffer.pop(true).is_none());
    }

    #[test]
    fn requeue_after_failure_puts_the_chunk_back_at_the_front_unlocked() {
        let buffer = tiny_buffer();
        let record = Record::new().with_field("a", 1_i64);
        buffer.append("k1", 1, &record).unwrap();
        buffer.force_flush("k1").unwrap();
        buffer.append("k2", 2, &record).unwrap();
        buffer.force_flush("k2").unwrap();

        let failed = buffer.pop(false).unwrap();
        assert_eq!(failed.key(), "k1");
        assert_eq!(buffer.queue_len(), 1, "k1 is out of the queue while its write is attempted");

        buffer.requeue_after_failure(failed);
        assert_eq!(buffer.queue_len(), 2, "failed write restores the chunk to the queue");

        let retried = buffer.pop(false).unwrap();
        assert_eq!(retried.key(), "k1", "requeue puts the chunk back at the front for the next retry");
    }

    #[test]
    fn shutdown_rejects_further_appends() {
        let buffer = tiny_buffer();
        buffer.shutdown();
        let err = buffer
            .append("k", 1, &Record::new().with_field("a", 1_i64))
            .unwrap_err();
        assert!(matches!(err, BufferError::ShutDown));
    }
}
