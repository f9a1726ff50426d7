//! Pluggable log-event forwarding runtime.
//!
//! Records enter through an [`EventRouter`], are dispatched by
//! first-match-wins tag matching to a [`Filter`] chain or a terminal output,
//! and terminal outputs accumulate records into size-bounded [`Chunk`]s held
//! by a [`Buffer`] until a background flusher writes them out with retry.
//!
//! ```
//! use tagflow::buffer::{Buffer, BufferConfig};
//! use tagflow::chunk::MemoryBacking;
//! use tagflow::record::Record;
//!
//! let buffer = Buffer::new(MemoryBacking, BufferConfig::default());
//! let triggered = buffer
//!     .append("app.access", 0, &Record::new().with_field("status", 200_i64))
//!     .unwrap();
//! assert!(!triggered);
//! ```

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod error;
pub mod filter;
mod invariants;
pub mod matcher;
pub mod observe;
pub mod record;
pub mod router;

pub use buffer::{Buffer, BufferConfig};
pub use chunk::{Chunk, ChunkBacking, ChunkId, MemoryBacking, MemoryChunk};
pub use error::{BufferError, ConfigError, RouterError};
pub use filter::{Filter, FilterChain};
pub use matcher::Pattern;
pub use observe::{Observe, ObservedValue};
pub use record::{Event, EventStream, MultiEventStream, OneEventStream, Record, Value};
pub use router::{Agent, Collector, EventRouter, MatchRule, OutputBuilder};
