//! End-to-end scenario tests covering backpressure, flush triggering,
//! parallel pop independence, and match/label dispatch precedence.
//! Retry/backoff timing lives in `crates/tagflow-output/tests/integration.rs`,
//! next to the retry engine it exercises.

use tagflow::buffer::{Buffer, BufferConfig};
use tagflow::chunk::{Chunk, MemoryBacking};
use tagflow::error::BufferError;
use tagflow::record::Record;
use tagflow::router::{Agent, Collector, EventRouter, MatchRule};

/// S1: once the queue reaches its limit, further appends that would enqueue
/// a new chunk are rejected with `QueueFull` rather than growing unbounded —
/// this is the caller's backpressure signal.
#[test]
fn scenario_backpressure_on_full_queue() {
    let buffer = Buffer::new(
        MemoryBacking,
        BufferConfig::default()
            .with_chunk_limit_bytes(32)
            .with_queue_limit(2),
    );
    let filler = Record::new().with_field("blob", "x".repeat(20));

    for i in 0..2 {
        let key = format!("k{i}");
        buffer.append(&key, 0, &filler).unwrap();
        buffer.force_flush(&key).unwrap();
    }
    assert_eq!(buffer.queue_len(), 2);

    buffer.append("k2", 0, &filler).unwrap();
    let err = buffer.force_flush("k2").unwrap_err();
    assert!(matches!(err, BufferError::QueueFull { .. }));
}

/// S2: `append` reports a flush trigger exactly when the call caused a chunk
/// to move from open to queued, never on an append that merely adds to an
/// already-open chunk.
#[test]
fn scenario_flush_trigger_fires_only_on_rotation() {
    let buffer = Buffer::new(
        MemoryBacking,
        BufferConfig::default().with_chunk_limit_bytes(50),
    );
    let small = Record::new().with_field("a", 1_i64);
    assert!(!buffer.append("k", 0, &small).unwrap());
    assert!(!buffer.append("k", 1, &small).unwrap());

    let big = Record::new().with_field("blob", "x".repeat(40));
    assert!(buffer.append("k", 2, &big).unwrap(), "oversized append should rotate the prior chunk in");
}

/// S3: parallel pop mode lets a writer for one key make progress even while
/// another key's chunk is locked by a slow concurrent writer, instead of
/// blocking behind strict FIFO order.
#[test]
fn scenario_parallel_pop_is_per_key_independent() {
    let buffer = Buffer::new(MemoryBacking, BufferConfig::default());
    let record = Record::new().with_field("a", 1_i64);

    buffer.append("slow-key", 0, &record).unwrap();
    buffer.force_flush("slow-key").unwrap();
    buffer.append("fast-key", 0, &record).unwrap();
    buffer.force_flush("fast-key").unwrap();

    let slow_chunk = buffer.pop(true).unwrap();
    assert_eq!(slow_chunk.key(), "slow-key");
    // Simulate "slow-key" still being written: its chunk stays locked and out
    // of the queue. A second parallel pop still finds "fast-key".
    let fast_chunk = buffer.pop(true).unwrap();
    assert_eq!(fast_chunk.key(), "fast-key");
}

/// S5: match precedence — the first rule whose pattern matches a tag wins,
/// even when a later, more specific pattern would also match.
#[test]
fn scenario_match_precedence_is_first_rule_wins() {
    let mut router = EventRouter::new();
    router
        .root_agent_mut()
        .add_rule(MatchRule::new("app.**", Collector::Output(Box::new(|_, _, _| {}))));
    router
        .root_agent_mut()
        .add_rule(MatchRule::new("app.access", Collector::Output(Box::new(|_, _, _| {
            panic!("more specific rule should never run: first match already won");
        }))));
    router.validate().unwrap();
    router.emit("app.access", 0, Record::new()).unwrap();
}

/// S6: a record dispatched into a label is routed by that label's own rule
/// set, completely independent of the root agent's rules.
#[test]
fn scenario_label_redispatch_uses_label_rule_set() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let label_ran = Arc::new(AtomicBool::new(false));
    let label_ran_clone = label_ran.clone();

    let mut errors_agent = Agent::new();
    errors_agent.add_rule(MatchRule::new(
        "**",
        Collector::Output(Box::new(move |_, _, _| {
            label_ran_clone.store(true, Ordering::SeqCst);
        })),
    ));

    let mut router = EventRouter::new();
    router.add_label("errors", errors_agent);
    router.root_agent_mut().add_rule(MatchRule::new(
        "app.error",
        Collector::Label("errors".to_string()),
    ));
    router.validate().unwrap();

    router.emit("app.error", 0, Record::new()).unwrap();
    assert!(label_ran.load(Ordering::SeqCst));
}
