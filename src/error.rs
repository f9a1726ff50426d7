//! Error taxonomy for the buffer and router.
//!
//! Each enum is small and matched exhaustively at call sites; a single
//! catch-all error type is never used inside the core.

use thiserror::Error;

/// Errors raised while appending to or draining a [`crate::buffer::Buffer`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BufferError {
    #[error("record of {size} bytes exceeds chunk limit of {limit} bytes")]
    ChunkTooLarge { size: usize, limit: usize },

    #[error("queue is full: {len} chunks queued, limit is {limit}")]
    QueueFull { len: usize, limit: usize },

    #[error("buffer has been shut down")]
    ShutDown,
}

impl BufferError {
    /// Whether a caller should back off and retry the same append later
    /// rather than drop the record.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BufferError::QueueFull { .. })
    }

    /// Whether the buffer is unusable from here on and should be torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BufferError::ShutDown)
    }
}

/// Errors raised while matching or dispatching an event through an
/// [`crate::router::EventRouter`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RouterError {
    #[error("no rule matches tag {tag:?}")]
    NoMatchingRule { tag: String },

    #[error("label {0:?} is not defined")]
    UnknownLabel(String),

    #[error("label cycle detected: {0}")]
    LabelCycle(String),
}

/// Errors raised while parsing the directive-tree configuration format.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unexpected end of input at line {0}")]
    UnexpectedEof(usize),

    #[error("expected </{expected}> but found </{found}> at line {line}")]
    MismatchedClose {
        expected: String,
        found: String,
        line: usize,
    },

    #[error("malformed directive at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("invalid value for key {key:?}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("missing required key {0:?}")]
    MissingKey(String),

    #[error(transparent)]
    Router(#[from] RouterError),
}
