//! Transport abstraction.
//!
//! The protocol engine only needs to post a message to a recipient and to
//! bind an agent to a routing key so broadcasts reach it. Real deployments
//! put a message broker behind [`Channel`]; [`MemoryBus`] is the in-process
//! implementation used by embedded fleets, the CLI simulation and tests.
//!
//! ```text
//!  Agency A ──post──> ┌────────────┐ ──inbox──> Agency B
//!                     │ MemoryBus  │
//!  Agency C <──inbox─ │ bindings:  │ <──post─── Agency B
//!                     │ shard.proto│
//!                     └────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{FleetError, Result};
use crate::message::{Message, Recipient, RoutingKey};

/// Outbound side of the transport.
pub trait Channel: Send + Sync {
    /// Post `message` to `recipient`; returns how many agents it was delivered to.
    fn post(&self, recipient: &Recipient, message: &Message) -> Result<usize>;

    /// Subscribe `agent` to broadcasts on `key`.
    fn bind(&self, agent: &Recipient, key: &RoutingKey) -> Result<()>;

    /// Drop the subscription of `agent` on `key`.
    fn unbind(&self, agent: &Recipient, key: &RoutingKey) -> Result<()>;
}

/// In-process bus with per-agent unbounded inboxes.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusState>>,
}

#[derive(Default)]
struct BusState {
    inboxes: HashMap<Recipient, mpsc::UnboundedSender<Message>>,
    /// Subscribers per key, in bind order
    bindings: HashMap<RoutingKey, Vec<Recipient>>,
    /// Deliver every message twice (at-least-once simulation)
    duplicate: bool,
    history: Vec<Message>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every message twice, the way an at-least-once broker may.
    pub fn with_duplicates(self) -> Self {
        self.inner.lock().duplicate = true;
        self
    }

    /// Register an agent address and get its inbox.
    pub fn connect(&self, address: Recipient) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().inboxes.insert(address, tx);
        rx
    }

    /// Remove an agent and all its bindings, as if its process died.
    pub fn disconnect(&self, address: &Recipient) {
        let mut state = self.inner.lock();
        state.inboxes.remove(address);
        for subscribers in state.bindings.values_mut() {
            subscribers.retain(|a| a != address);
        }
    }

    /// Every message delivered so far, one entry per recipient copy.
    pub fn history(&self) -> Vec<Message> {
        self.inner.lock().history.clone()
    }

    /// Forget the delivery history
    pub fn clear_history(&self) {
        self.inner.lock().history.clear();
    }

    /// Number of agents bound to `key`
    pub fn subscribers(&self, key: &RoutingKey) -> usize {
        self.inner.lock().bindings.get(key).map_or(0, Vec::len)
    }
}

impl BusState {
    fn deliver(&mut self, address: &Recipient, message: &Message) -> bool {
        let Some(tx) = self.inboxes.get(address) else {
            return false;
        };
        let copies = if self.duplicate { 2 } else { 1 };
        let sent = (0..copies).all(|_| tx.send(message.clone()).is_ok());
        if !sent {
            tracing::debug!(agent = %address, "Inbox closed, dropping route");
            self.inboxes.remove(address);
            return false;
        }
        self.history.push(message.clone());
        true
    }
}

impl Channel for MemoryBus {
    fn post(&self, recipient: &Recipient, message: &Message) -> Result<usize> {
        let mut state = self.inner.lock();
        match RoutingKey::of(recipient) {
            None => {
                if state.deliver(recipient, message) {
                    Ok(1)
                } else {
                    Err(FleetError::Channel(format!("no route to {recipient}")))
                }
            },
            Some(key) => {
                let subscribers = state.bindings.get(&key).cloned().unwrap_or_default();
                let delivered = subscribers
                    .iter()
                    .filter(|agent| **agent != message.sender)
                    .filter(|agent| state.deliver(agent, message))
                    .count();
                tracing::trace!(key = %key, delivered, "Broadcast posted");
                Ok(delivered)
            },
        }
    }

    fn bind(&self, agent: &Recipient, key: &RoutingKey) -> Result<()> {
        let mut state = self.inner.lock();
        let subscribers = state.bindings.entry(key.clone()).or_default();
        if !subscribers.contains(agent) {
            subscribers.push(agent.clone());
        }
        Ok(())
    }

    fn unbind(&self, agent: &Recipient, key: &RoutingKey) -> Result<()> {
        if let Some(subscribers) = self.inner.lock().bindings.get_mut(key) {
            subscribers.retain(|a| a != agent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Announcement, Body, RequestMessage};
    use serde_json::json;

    fn message(sender: &Recipient, receiver: Recipient, body: Body) -> Message {
        Message::new("s-1".into(), "allocate", sender.clone(), receiver, body)
    }

    #[test]
    fn test_direct_delivery() {
        let bus = MemoryBus::new();
        let a = Recipient::agent("eu", "a");
        let b = Recipient::agent("eu", "b");
        let mut inbox = bus.connect(b.clone());

        let msg = message(&a, b.clone(), Body::Request(RequestMessage::new(json!(1))));
        assert_eq!(bus.post(&b, &msg).unwrap(), 1);
        assert_eq!(inbox.try_recv().unwrap(), msg);
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn test_unknown_agent_is_an_error() {
        let bus = MemoryBus::new();
        let a = Recipient::agent("eu", "a");
        let ghost = Recipient::agent("eu", "ghost");
        let msg = message(&a, ghost.clone(), Body::Request(RequestMessage::default()));
        assert!(matches!(bus.post(&ghost, &msg), Err(FleetError::Channel(_))));
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let bus = MemoryBus::new();
        let key = RoutingKey::for_protocol("allocate", "eu");
        let agents: Vec<Recipient> = ["a", "b", "c"].iter().map(|k| Recipient::agent("eu", *k)).collect();
        let mut inboxes: Vec<_> = agents.iter().map(|a| bus.connect(a.clone())).collect();
        for agent in &agents {
            bus.bind(agent, &key).unwrap();
        }
        assert_eq!(bus.subscribers(&key), 3);

        let broadcast = Recipient::broadcast("allocate", "eu");
        let msg = message(&agents[0], broadcast.clone(), Body::Announcement(Announcement::default()));
        assert_eq!(bus.post(&broadcast, &msg).unwrap(), 2);
        assert!(inboxes[0].try_recv().is_err());
        assert!(inboxes[1].try_recv().is_ok());
        assert!(inboxes[2].try_recv().is_ok());
    }

    #[test]
    fn test_disconnect_removes_bindings() {
        let bus = MemoryBus::new();
        let key = RoutingKey::for_protocol("allocate", "eu");
        let a = Recipient::agent("eu", "a");
        let _inbox = bus.connect(a.clone());
        bus.bind(&a, &key).unwrap();
        bus.disconnect(&a);
        assert_eq!(bus.subscribers(&key), 0);
    }

    #[test]
    fn test_duplicate_delivery() {
        let bus = MemoryBus::new().with_duplicates();
        let a = Recipient::agent("eu", "a");
        let b = Recipient::agent("eu", "b");
        let mut inbox = bus.connect(b.clone());
        let msg = message(&a, b.clone(), Body::Request(RequestMessage::default()));
        bus.post(&b, &msg).unwrap();
        assert!(inbox.try_recv().is_ok());
        assert!(inbox.try_recv().is_ok());
        assert_eq!(bus.history().len(), 1);
    }
}
