//! Chunk: an append-only, size-bounded batch of records keyed by routing key.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::BufferError;
use crate::record::Record;

static NEXT_CHUNK_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique, monotonically increasing chunk identifier.
///
/// Used verbatim as the numeric suffix in the `.b<id>`/`.q<id>` file naming
/// scheme a durable [`ChunkBacking`] implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u64);

impl ChunkId {
    pub fn generate() -> Self {
        Self(NEXT_CHUNK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An append-only batch of serialized records sharing one routing key.
///
/// Append is only ever valid while the chunk is "open" (not yet purged).
/// `try_lock`/`unlock` provide advisory, non-reentrant mutual exclusion over
/// a chunk while it's being written out by an [`crate::buffer::Buffer::pop`]
/// consumer — they are not a substitute for the Buffer/Queue locks, which
/// protect the containers the chunk lives in.
pub trait Chunk: Send {
    fn id(&self) -> ChunkId;
    fn key(&self) -> &str;

    /// Appends one record, failing if doing so would exceed `limit` bytes.
    fn append(&mut self, time: i64, record: &Record, limit: usize) -> Result<(), BufferError>;

    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Acquires the advisory lock. Returns `false` if already held.
    fn try_lock(&self) -> bool;

    /// Releases the advisory lock. No-op if not held.
    fn unlock(&self);

    /// Marks the chunk purged. Idempotent: purging an already-purged chunk
    /// has no further effect.
    fn purge(&mut self);

    fn is_purged(&self) -> bool;

    /// Returns the serialized bytes written so far. Valid to call at any
    /// point in the chunk's life, including after purge (returns whatever
    /// was accumulated, for diagnostics).
    fn read(&self) -> &[u8];
}

/// The callback surface a concrete chunk/queue backing provides to
/// `Buffer<B>`: construction, an enqueue hook, and startup resumption.
pub trait ChunkBacking: Send + Sync {
    type Chunk: Chunk;

    fn new_chunk(&self, key: &str) -> Self::Chunk;

    /// Called once, with the Queue sub-lock held, right after a chunk moves
    /// from the Buffer's map into the Queue. The default does nothing; a
    /// durable backing uses this to rename `.b<id>` to `.q<id>`.
    fn on_enqueue(&self, _chunk: &Self::Chunk) {}

    /// Reconstructs in-flight state left behind by a previous process. The
    /// default assumes nothing survives a restart (the in-memory backing).
    fn resume(&self) -> (HashMap<String, Self::Chunk>, VecDeque<Self::Chunk>) {
        (HashMap::new(), VecDeque::new())
    }
}

/// The non-durable `Chunk` implementation: bytes live only in the process.
pub struct MemoryChunk {
    id: ChunkId,
    key: String,
    bytes: Vec<u8>,
    locked: AtomicBool,
    purged: bool,
}

impl MemoryChunk {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            id: ChunkId::generate(),
            key: key.into(),
            bytes: Vec::new(),
            locked: AtomicBool::new(false),
            purged: false,
        }
    }
}

impl Chunk for MemoryChunk {
    fn id(&self) -> ChunkId {
        self.id
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn append(&mut self, _time: i64, record: &Record, limit: usize) -> Result<(), BufferError> {
        let encoded = serde_json::to_vec(record).unwrap_or_default();
        let before = self.bytes.len();
        if before + encoded.len() > limit {
            return Err(BufferError::ChunkTooLarge {
                size: before + encoded.len(),
                limit,
            });
        }
        self.bytes.extend_from_slice(&encoded);
        self.bytes.push(b'\n');
        crate::invariants::debug_assert_append_only!(before, self.bytes.len());
        Ok(())
    }

    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn purge(&mut self) {
        let was_purged = self.purged;
        self.purged = true;
        self.bytes.clear();
        crate::invariants::debug_assert_purge_terminal!(was_purged, self.purged);
    }

    fn is_purged(&self) -> bool {
        self.purged
    }

    fn read(&self) -> &[u8] {
        &self.bytes
    }
}

/// The in-memory backing: chunks disappear on process exit, `resume` always
/// starts empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBacking;

impl ChunkBacking for MemoryBacking {
    type Chunk = MemoryChunk;

    fn new_chunk(&self, key: &str) -> Self::Chunk {
        MemoryChunk::new(key)
    }
}
