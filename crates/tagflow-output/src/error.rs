//! Error taxonomy for the output sink and its resilience wrappers.

use thiserror::Error;

/// The result of attempting to write one chunk's bytes to a sink.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WriteError {
    /// The sink rejected the write for a reason that may clear on its own
    /// (timeout, connection reset, remote overloaded) — worth retrying.
    #[error("transient write failure: {0}")]
    Transient(String),

    /// The sink rejected the write for a reason retrying cannot fix
    /// (malformed payload, permanent auth failure) — retrying is pointless.
    #[error("fatal write failure: {0}")]
    Fatal(String),

    /// Every configured retry attempt was exhausted.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The circuit breaker is open; the call was rejected without reaching
    /// the underlying sink at all.
    #[error("circuit breaker is open")]
    CircuitOpen,
}

impl WriteError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WriteError::Transient(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WriteError::Fatal(_) | WriteError::RetriesExhausted { .. }
        )
    }
}
