//! Journal capture and deterministic replay.

mod common;

use std::sync::Arc;

use common::{Fleet, Worker, SHARD};
use fleet::recorder::Entry;
use fleet::{
    Agency, Interest, Journal, Manager, ManagerContext, MemoryBus, Recipient, Registry, Replay,
};
use serde_json::json;

const JOB: &str = "index";

struct Indexer;

impl Manager for Indexer {
    fn initiate(&mut self, ctx: &mut ManagerContext) -> anyhow::Result<()> {
        ctx.announce(json!({ "shards": 4 }));
        Ok(())
    }
}

fn contractor(worker: Worker) -> Registry {
    Registry::builder()
        .register(Interest::contractor(JOB, move || worker.clone()))
        .unwrap()
        .build()
}

#[test]
fn test_replay_reproduces_outcome_without_sending() {
    let mut fleet = Fleet::new();
    fleet.add("a", contractor(Worker::bidding("a", 3).reporting()));
    fleet.add("b", contractor(Worker::refusing("b")));
    let journal = Journal::new();
    let recorder = journal.clone();
    let manager = fleet.add_with("m", move |builder| builder.recorder(recorder));

    let mut original = fleet.agency("m").initiate_manager(
        JOB,
        Indexer,
        vec![Recipient::broadcast(JOB, SHARD)],
    );
    fleet.pump();
    let outcome = original.try_outcome().unwrap();
    assert_eq!(outcome, Ok(json!([{ "done_by": "a" }])));

    let entries = journal.entries();
    for effect in ["now", "session_id", "post"] {
        assert!(entries.iter().any(|e| e.effect == effect), "{effect} not journaled");
    }
    // the journal survives serialization
    let stored = serde_json::to_string(&entries).unwrap();
    let entries: Vec<Entry> = serde_json::from_str(&stored).unwrap();

    let quiet = MemoryBus::new();
    let mut replayed = Agency::builder(manager)
        .channel(Arc::new(quiet.clone()))
        .recorder(Replay::new(entries))
        .build()
        .unwrap();
    let mut handle = replayed.initiate_manager(JOB, Indexer, vec![Recipient::broadcast(JOB, SHARD)]);
    assert_eq!(handle.session_id(), original.session_id());

    for message in fleet.received("m") {
        replayed.on_message(message);
    }
    assert_eq!(handle.try_outcome(), Some(outcome));
    assert!(replayed.is_idle());
    assert!(quiet.history().is_empty());
}

#[test]
fn test_replay_sees_recorded_timeouts() {
    let mut fleet = Fleet::new();
    fleet.add("a", contractor(Worker::bidding("a", 3)));
    fleet.add_silent("late", contractor(Worker::bidding("late", 1)));
    let journal = Journal::new();
    let recorder = journal.clone();
    let manager = fleet.add_with("m", move |builder| builder.recorder(recorder));

    let mut original = fleet.agency("m").initiate_manager(
        JOB,
        Indexer,
        vec![Recipient::broadcast(JOB, SHARD)],
    );
    fleet.pump();
    // one step on the manager that fires the close timer
    fleet.clock.advance(chrono::Duration::seconds(10));
    assert_eq!(fleet.agency("m").advance(), 1);
    let session_id = original.session_id().clone();
    assert_eq!(fleet.agency("m").session(&session_id).unwrap().state, "Granted");

    // the replayed agency runs on a clock that never moves
    let mut replayed = Agency::builder(manager)
        .channel(Arc::new(MemoryBus::new()))
        .clock(Arc::new(fleet::ManualClock::new(chrono::Utc::now())))
        .recorder(Replay::new(journal.entries()))
        .build()
        .unwrap();
    let mut handle = replayed.initiate_manager(JOB, Indexer, vec![Recipient::broadcast(JOB, SHARD)]);
    for message in fleet.received("m") {
        replayed.on_message(message);
    }
    assert_eq!(replayed.advance(), 1);
    assert_eq!(replayed.session(&session_id).unwrap().state, "Granted");
    assert!(handle.try_outcome().is_none());
    assert!(original.try_outcome().is_none());
}
