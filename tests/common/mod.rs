//! Deterministic multi-agent harness.
//!
//! Every agency shares one `MemoryBus` and one `ManualClock`. Nothing runs on
//! its own: `pump` feeds queued messages until the bus is quiet and
//! `advance` moves the clock and fires due timers on every agency.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use fleet::message::Bid;
use fleet::{
    Agency, AgencyBuilder, Contractor, ContractorContext, ManualClock, MemoryBus, Message,
    Recipient, Registry, SequentialIds,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const SHARD: &str = "eu";

struct Agent {
    key: String,
    agency: Agency,
    inbox: mpsc::UnboundedReceiver<Message>,
    /// Never reads its inbox
    silent: bool,
    /// Messages fed to the agency, in order
    received: Vec<Message>,
}

pub struct Fleet {
    pub bus: MemoryBus,
    pub clock: ManualClock,
    agents: Vec<Agent>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::with_bus(MemoryBus::new())
    }

    pub fn with_bus(bus: MemoryBus) -> Self {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Self {
            bus,
            clock: ManualClock::new(start),
            agents: Vec::new(),
        }
    }

    /// Add an agent with `registry` and default settings.
    pub fn add(&mut self, key: &str, registry: Registry) -> Recipient {
        self.add_with(key, |b| b.registry(registry))
    }

    /// Add an agent, customising its builder.
    pub fn add_with<F>(&mut self, key: &str, customise: F) -> Recipient
    where
        F: FnOnce(AgencyBuilder) -> AgencyBuilder,
    {
        self.insert(key, customise, false)
    }

    /// Add an agent that is bound on the bus but never answers.
    pub fn add_silent(&mut self, key: &str, registry: Registry) -> Recipient {
        self.insert(key, |b| b.registry(registry), true)
    }

    fn insert<F>(&mut self, key: &str, customise: F, silent: bool) -> Recipient
    where
        F: FnOnce(AgencyBuilder) -> AgencyBuilder,
    {
        let address = Recipient::agent(SHARD, key);
        let inbox = self.bus.connect(address.clone());
        let builder = Agency::builder(address.clone())
            .channel(Arc::new(self.bus.clone()))
            .clock(Arc::new(self.clock.clone()))
            .ids(SequentialIds::new(key));
        let agency = customise(builder).build().unwrap();
        self.agents.push(Agent {
            key: key.to_string(),
            agency,
            inbox,
            silent,
            received: Vec::new(),
        });
        address
    }

    pub fn agency(&mut self, key: &str) -> &mut Agency {
        &mut self.agent(key).agency
    }

    /// Messages the agent has processed so far
    pub fn received(&mut self, key: &str) -> Vec<Message> {
        self.agent(key).received.clone()
    }

    fn agent(&mut self, key: &str) -> &mut Agent {
        self.agents
            .iter_mut()
            .find(|a| a.key == key)
            .unwrap_or_else(|| panic!("no agent {key}"))
    }

    /// Deliver queued messages until the bus is quiet; returns how many.
    pub fn pump(&mut self) -> usize {
        let mut total = 0;
        loop {
            let mut delivered = 0;
            for agent in self.agents.iter_mut().filter(|a| !a.silent) {
                while let Ok(message) = agent.inbox.try_recv() {
                    agent.received.push(message.clone());
                    agent.agency.on_message(message);
                    delivered += 1;
                }
            }
            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
    }

    /// Move the clock by `by`, then fire timers and deliver until quiet.
    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.settle();
    }

    /// Fire due timers and deliver messages until nothing happens.
    pub fn settle(&mut self) {
        loop {
            let fired: usize = self
                .agents
                .iter_mut()
                .filter(|a| !a.silent)
                .map(|a| a.agency.advance())
                .sum();
            let delivered = self.pump();
            if fired == 0 && delivered == 0 {
                return;
            }
        }
    }

    /// Advance one second at a time for `secs` seconds.
    pub fn run_for(&mut self, secs: i64) {
        for _ in 0..secs {
            self.advance(Duration::seconds(1));
        }
    }

    /// Messages of `kind` the bus delivered to `to`
    pub fn delivered(&self, kind: &str, to: &Recipient) -> usize {
        self.bus
            .history()
            .iter()
            .filter(|m| m.kind() == kind && &m.receiver == to)
            .count()
    }
}

/// Contractor that bids a fixed cost (or refuses) and optionally reports
/// as soon as it is granted.
#[derive(Clone)]
pub struct Worker {
    pub name: String,
    pub cost: Option<i64>,
    pub report_on_grant: bool,
    pub announcements: Arc<AtomicUsize>,
    pub cancellations: Arc<AtomicUsize>,
}

impl Worker {
    pub fn bidding(name: &str, cost: i64) -> Self {
        Self {
            name: name.to_string(),
            cost: Some(cost),
            report_on_grant: false,
            announcements: Arc::new(AtomicUsize::new(0)),
            cancellations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn refusing(name: &str) -> Self {
        Self {
            cost: None,
            ..Self::bidding(name, 0)
        }
    }

    pub fn reporting(mut self) -> Self {
        self.report_on_grant = true;
        self
    }

    pub fn announcements(&self) -> usize {
        self.announcements.load(Ordering::SeqCst)
    }

    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }
}

impl Contractor for Worker {
    fn announced(&mut self, _announcement: &Message, ctx: &mut ContractorContext) -> anyhow::Result<()> {
        self.announcements.fetch_add(1, Ordering::SeqCst);
        match self.cost {
            Some(cost) => ctx.bid(Bid::single(cost, json!({ "worker": self.name }))),
            None => ctx.refuse(Value::String("busy".into())),
        }
        Ok(())
    }

    fn granted(&mut self, _grant: &Message, ctx: &mut ContractorContext) -> anyhow::Result<()> {
        if self.report_on_grant {
            ctx.final_report(json!({ "done_by": self.name }));
        }
        Ok(())
    }

    fn cancelled(&mut self, _cancellation: &Message) {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
    }
}
