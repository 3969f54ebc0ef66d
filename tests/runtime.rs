//! Agents on tokio tasks, with paused time.

mod common;

use std::sync::Arc;

use common::{Worker, SHARD};
use fleet::{
    Agency, AgentHandle, AgentRuntime, Interest, Manager, ManagerContext, MemoryBus,
    ProtocolFailure, Recipient, Registry, TokioClock,
};
use fleet::message::Grant;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const JOB: &str = "transcode";

struct Dispatch;

impl Manager for Dispatch {
    fn initiate(&mut self, ctx: &mut ManagerContext) -> anyhow::Result<()> {
        ctx.announce(json!({ "file": "a.mkv" }));
        Ok(())
    }
}

fn spawn(
    bus: &MemoryBus,
    clock: TokioClock,
    key: &str,
    registry: Registry,
) -> (AgentHandle, JoinHandle<Agency>) {
    let address = Recipient::agent(SHARD, key);
    let inbox = bus.connect(address.clone());
    let agency = Agency::builder(address)
        .registry(registry)
        .channel(Arc::new(bus.clone()))
        .clock(Arc::new(clock))
        .build()
        .unwrap();
    let (runtime, handle) = AgentRuntime::new(agency, inbox, clock);
    (handle, runtime.spawn())
}

fn contractor(worker: Worker) -> Registry {
    Registry::builder()
        .register(Interest::contractor(JOB, move || worker.clone()))
        .unwrap()
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_contract_across_tasks() {
    let bus = MemoryBus::new();
    let clock = TokioClock::new();
    let (fast, fast_task) = spawn(&bus, clock, "fast", contractor(Worker::bidding("fast", 2).reporting()));
    let (slow, slow_task) = spawn(&bus, clock, "slow", contractor(Worker::bidding("slow", 8)));
    // bound on the bus, never reads its inbox
    let mute = Recipient::agent(SHARD, "mute");
    let _mute_inbox = bus.connect(mute.clone());
    Agency::builder(mute)
        .registry(contractor(Worker::bidding("mute", 1)))
        .channel(Arc::new(bus.clone()))
        .build()
        .unwrap();
    let (manager, manager_task) = spawn(&bus, clock, "manager", Registry::empty());

    let started = Instant::now();
    let session = manager
        .initiate_manager(JOB, Dispatch, vec![Recipient::broadcast(JOB, SHARD)])
        .await
        .unwrap();
    let outcome = session.notify_finish().await;

    assert_eq!(outcome, Ok(json!([{ "done_by": "fast" }])));
    // the mute agent held the window open for the full announce timeout
    assert!(started.elapsed() >= std::time::Duration::from_secs(10));

    for handle in [&fast, &slow, &manager] {
        while !handle.is_idle().await.unwrap() {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
    drop((fast, slow, manager));
    for task in [fast_task, slow_task, manager_task] {
        assert!(task.await.unwrap().is_idle());
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_cancel_through_handle() {
    let bus = MemoryBus::new();
    let clock = TokioClock::new();
    let (worker, worker_task) = spawn(&bus, clock, "w", contractor(Worker::bidding("w", 1)));
    let (manager, manager_task) = spawn(&bus, clock, "m", Registry::empty());

    let session = manager
        .initiate_manager(JOB, Dispatch, vec![Recipient::broadcast(JOB, SHARD)])
        .await
        .unwrap();
    let session_id = session.session_id().clone();

    // wait until the worker holds the grant
    loop {
        let sessions = worker.sessions().await.unwrap();
        if sessions.iter().any(|s| s.state == "Granted") {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    manager.cancel(session_id, "operator").await.unwrap();

    assert_eq!(
        session.notify_finish().await,
        Err(ProtocolFailure::Cancelled("operator".into()))
    );
    drop((worker, manager));
    worker_task.await.unwrap();
    manager_task.await.unwrap();
}

/// Leaves granting to agent code.
struct Hold;

impl Manager for Hold {
    fn initiate(&mut self, ctx: &mut ManagerContext) -> anyhow::Result<()> {
        ctx.announce(Value::Null);
        Ok(())
    }

    fn closed(&mut self, _bids: &[fleet::Message], _ctx: &mut ManagerContext) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn wait_for_state(handle: &AgentHandle, state: &str) {
    loop {
        let sessions = handle.sessions().await.unwrap();
        if sessions.iter().any(|s| s.state == state) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_operations_through_handles() {
    let bus = MemoryBus::new();
    let clock = TokioClock::new();
    let (worker, worker_task) = spawn(&bus, clock, "w", contractor(Worker::bidding("w", 4)));
    let (manager, manager_task) = spawn(&bus, clock, "m", Registry::empty());

    let session = manager
        .initiate_manager(JOB, Hold, vec![Recipient::broadcast(JOB, SHARD)])
        .await
        .unwrap();
    let session_id = session.session_id().clone();
    wait_for_state(&manager, "Closed").await;

    manager
        .grant(session_id.clone(), vec![(worker.address().clone(), Grant::new(0))])
        .await
        .unwrap();
    wait_for_state(&worker, "Granted").await;
    worker
        .update_report(session_id.clone(), json!({ "progress": 10 }))
        .await
        .unwrap();
    worker.defect(session_id.clone(), "out of memory").await.unwrap();

    assert_eq!(
        session.notify_finish().await,
        Err(ProtocolFailure::Cancelled("out of memory".into()))
    );
    assert!(worker.defect(session_id, "twice").await.is_err());
    drop((worker, manager));
    worker_task.await.unwrap();
    manager_task.await.unwrap();
}

#[tokio::test]
async fn test_handle_outlives_runtime() {
    let bus = MemoryBus::new();
    let address = Recipient::agent(SHARD, "gone");
    let inbox = bus.connect(address.clone());
    let clock = TokioClock::new();
    let agency = Agency::builder(address)
        .channel(Arc::new(bus.clone()))
        .clock(Arc::new(clock))
        .build()
        .unwrap();
    let (runtime, handle) = AgentRuntime::new(agency, inbox, clock);
    drop(runtime);

    assert!(matches!(
        handle.notify("ping", vec![], Value::Null).await,
        Err(fleet::FleetError::Channel(_))
    ));
}
