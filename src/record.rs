//! Record and dynamic value types carried through the event pipeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A dynamically typed value held in a [`Record`].
///
/// Mirrors the attribute shapes most log/trace payloads need: scalars, nested
/// arrays and nested maps. `Null` stands in for an explicitly absent value,
/// distinct from the key simply not being present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// An unordered mapping from string keys to dynamic [`Value`]s, stamped with
/// the Unix time (seconds) it was emitted at.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: HashMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &HashMap<String, Value> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Rough wire-size estimate used for chunk accounting. Exact byte count
    /// depends on the concrete [`crate::chunk::Chunk`] serialization, but
    /// `Buffer::append` needs an estimate before a chunk is touched at all.
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map_or(64, |b| b.len())
    }
}

/// A single tagged, timestamped event as it flows through the router.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub tag: String,
    pub time: i64,
    pub record: Record,
}

impl Event {
    pub fn new(tag: impl Into<String>, time: i64, record: Record) -> Self {
        Self {
            tag: tag.into(),
            time,
            record,
        }
    }
}

/// A finite, single-pass sequence of `(time, record)` pairs sharing one tag.
///
/// Streams backed by an in-memory array may be iterated more than once, but
/// callers must not assume this of every implementation (e.g. a stream
/// draining a file-backed chunk reader).
pub trait EventStream {
    fn for_each(&mut self, f: &mut dyn FnMut(i64, &Record));
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An [`EventStream`] holding exactly one event, the common case for a single
/// `Emit` call.
pub struct OneEventStream(Option<(i64, Record)>);

impl OneEventStream {
    pub fn new(time: i64, record: Record) -> Self {
        Self(Some((time, record)))
    }
}

impl EventStream for OneEventStream {
    fn for_each(&mut self, f: &mut dyn FnMut(i64, &Record)) {
        if let Some((time, record)) = &self.0 {
            f(*time, record);
        }
    }

    fn len(&self) -> usize {
        usize::from(self.0.is_some())
    }
}

/// An [`EventStream`] backed by a pre-built array of events, used for `EmitStream`.
pub struct MultiEventStream(Vec<(i64, Record)>);

impl MultiEventStream {
    pub fn new(events: Vec<(i64, Record)>) -> Self {
        Self(events)
    }
}

impl EventStream for MultiEventStream {
    fn for_each(&mut self, f: &mut dyn FnMut(i64, &Record)) {
        for (time, record) in &self.0 {
            f(*time, record);
        }
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_json() {
        let record = Record::new()
            .with_field("message", "boot complete")
            .with_field("code", 0_i64)
            .with_field("ok", true);
        let bytes = serde_json::to_vec(&record).unwrap();
        let back: Record = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn one_event_stream_yields_single_event() {
        let mut stream = OneEventStream::new(100, Record::new().with_field("k", "v"));
        let mut seen = 0;
        stream.for_each(&mut |time, record| {
            seen += 1;
            assert_eq!(time, 100);
            assert_eq!(record.get("k"), Some(&Value::String("v".into())));
        });
        assert_eq!(seen, 1);
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn multi_event_stream_preserves_order() {
        let events = vec![
            (1, Record::new().with_field("i", 1_i64)),
            (2, Record::new().with_field("i", 2_i64)),
            (3, Record::new().with_field("i", 3_i64)),
        ];
        let mut stream = MultiEventStream::new(events);
        let mut order = Vec::new();
        stream.for_each(&mut |time, _| order.push(time));
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(stream.len(), 3);
        assert!(!stream.is_empty());
    }
}
