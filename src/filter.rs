//! The filter chain: pure per-record transforms applied before a record
//! reaches its matched collector.

use crate::record::Record;

/// A filter receives one `(tag, time, record)` and either passes a
/// (possibly modified) record through or drops it. Filters are pure: they
/// never emit directly — a filter wanting to fan a record out to a different
/// tag re-submits it through the router's top (`EventRouter::emit`), it does
/// not call into a collector itself.
pub trait Filter: Send + Sync {
    fn filter(&self, tag: &str, time: i64, record: Record) -> Option<Record>;

    fn name(&self) -> &str {
        "filter"
    }
}

/// Drops records that don't have a truthy value at `key`.
pub struct RequireField {
    key: String,
}

impl RequireField {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Filter for RequireField {
    fn filter(&self, _tag: &str, _time: i64, record: Record) -> Option<Record> {
        record.get(&self.key).is_some().then_some(record)
    }

    fn name(&self) -> &str {
        "require_field"
    }
}

/// Adds or overwrites a fixed field on every record that passes through,
/// e.g. stamping a `hostname` or `environment` label.
pub struct AddField {
    key: String,
    value: crate::record::Value,
}

impl AddField {
    pub fn new(key: impl Into<String>, value: impl Into<crate::record::Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Filter for AddField {
    fn filter(&self, _tag: &str, _time: i64, mut record: Record) -> Option<Record> {
        record.set(self.key.clone(), self.value.clone());
        Some(record)
    }

    fn name(&self) -> &str {
        "add_field"
    }
}

/// Runs a chain of filters in order, short-circuiting (dropping the record)
/// as soon as any filter returns `None`.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn apply(&self, tag: &str, time: i64, mut record: Record) -> Option<Record> {
        for filter in &self.filters {
            record = filter.filter(tag, time, record)?;
        }
        Some(record)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
