//! Interest registry and admission control.
//!
//! An agent declares up front which protocols it takes part in on the
//! interested side. The table is built once with [`RegistryBuilder`] and
//! never changes afterwards; the agency consults it for every inbound first
//! message.
//!
//! | Kind                     | Receives                        |
//! |--------------------------|---------------------------------|
//! | [`InterestKind::Public`] | broadcasts on `shard.protocol`  |
//! |                          | and direct messages             |
//! | [`InterestKind::Private`]| direct messages only            |
//!
//! A concurrency limit caps how many sessions of one interest may be live at
//! once. First messages beyond the cap wait in a FIFO queue ([`Admission`])
//! until a session of that interest terminates.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{FleetError, Result};
use crate::message::{Message, ProtocolType, RoutingKey, SessionId};
use crate::protocol::{Contractor, Listener, Replier};

/// Fan-in shape of an interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InterestKind {
    /// One-to-one: only direct messages
    Private,
    /// One-to-many: bound to the protocol's broadcast key
    #[default]
    Public,
}

/// Registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterestKey {
    /// Protocol id
    pub protocol_id: String,
    /// Protocol family
    pub protocol_type: ProtocolType,
}

impl InterestKey {
    /// Key for `protocol_id` in `protocol_type`
    pub fn new(protocol_id: impl Into<String>, protocol_type: ProtocolType) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            protocol_type,
        }
    }

    /// Key an inbound message is looked up under
    pub fn of(message: &Message) -> Self {
        Self::new(message.protocol_id.clone(), message.protocol_type)
    }
}

impl fmt::Display for InterestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol_type, self.protocol_id)
    }
}

/// Builds a fresh role instance for every session.
pub enum RoleFactory {
    /// Contract, interested side
    Contractor(Box<dyn FnMut() -> Box<dyn Contractor> + Send>),
    /// Request, interested side
    Replier(Box<dyn FnMut() -> Box<dyn Replier> + Send>),
    /// Notification receiver
    Listener(Box<dyn FnMut() -> Box<dyn Listener> + Send>),
}

impl RoleFactory {
    fn protocol_type(&self) -> ProtocolType {
        match self {
            Self::Contractor(_) => ProtocolType::Contract,
            Self::Replier(_) => ProtocolType::Request,
            Self::Listener(_) => ProtocolType::Notification,
        }
    }
}

impl fmt::Debug for RoleFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self {
            Self::Contractor(_) => "Contractor",
            Self::Replier(_) => "Replier",
            Self::Listener(_) => "Listener",
        };
        f.debug_tuple("RoleFactory").field(&role).finish()
    }
}

/// A standing registration for one protocol
#[derive(Debug)]
pub struct Interest {
    protocol_id: String,
    kind: InterestKind,
    concurrency: Option<usize>,
    pub(crate) factory: RoleFactory,
}

impl Interest {
    fn new(protocol_id: impl Into<String>, factory: RoleFactory) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            kind: InterestKind::default(),
            concurrency: None,
            factory,
        }
    }

    /// Take part in contracts as a contractor
    pub fn contractor<F, C>(protocol_id: impl Into<String>, mut factory: F) -> Self
    where
        F: FnMut() -> C + Send + 'static,
        C: Contractor + 'static,
    {
        Self::new(
            protocol_id,
            RoleFactory::Contractor(Box::new(move || -> Box<dyn Contractor> {
                Box::new(factory())
            })),
        )
    }

    /// Answer requests
    pub fn replier<F, R>(protocol_id: impl Into<String>, mut factory: F) -> Self
    where
        F: FnMut() -> R + Send + 'static,
        R: Replier + 'static,
    {
        Self::new(
            protocol_id,
            RoleFactory::Replier(Box::new(move || -> Box<dyn Replier> {
                Box::new(factory())
            })),
        )
    }

    /// Receive notifications
    pub fn listener<F, L>(protocol_id: impl Into<String>, mut factory: F) -> Self
    where
        F: FnMut() -> L + Send + 'static,
        L: Listener + 'static,
    {
        Self::new(
            protocol_id,
            RoleFactory::Listener(Box::new(move || -> Box<dyn Listener> {
                Box::new(factory())
            })),
        )
    }

    /// Receive broadcasts (the default)
    pub fn public(mut self) -> Self {
        self.kind = InterestKind::Public;
        self
    }

    /// Receive direct messages only
    pub fn private(mut self) -> Self {
        self.kind = InterestKind::Private;
        self
    }

    /// At most `limit` live sessions; the rest queue
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }

    /// Protocol id
    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    /// Protocol family, from the role
    pub fn protocol_type(&self) -> ProtocolType {
        self.factory.protocol_type()
    }

    /// Fan-in shape
    pub fn kind(&self) -> InterestKind {
        self.kind
    }

    /// Concurrency limit, `None` for unlimited
    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    /// Registry key
    pub fn key(&self) -> InterestKey {
        InterestKey::new(self.protocol_id.clone(), self.protocol_type())
    }

    /// Broadcast key to bind in `shard`; `None` for private interests
    pub fn routing_key(&self, shard: &str) -> Option<RoutingKey> {
        match self.kind {
            InterestKind::Public => Some(RoutingKey::for_protocol(&self.protocol_id, shard)),
            InterestKind::Private => None,
        }
    }
}

/// Collects interests before the agent starts
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    interests: HashMap<InterestKey, Interest>,
}

impl RegistryBuilder {
    /// Add an interest; one per protocol id and family
    pub fn register(mut self, interest: Interest) -> Result<Self> {
        let key = interest.key();
        if self.interests.contains_key(&key) {
            return Err(FleetError::DuplicateInterest(key.to_string()));
        }
        self.interests.insert(key, interest);
        Ok(self)
    }

    /// Freeze the table
    pub fn build(self) -> Registry {
        Registry {
            interests: self.interests,
        }
    }
}

/// Immutable interest table of one agent
#[derive(Debug, Default)]
pub struct Registry {
    interests: HashMap<InterestKey, Interest>,
}

impl Registry {
    /// Start building a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry with no interests, for pure initiators
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up an interest
    pub fn get(&self, key: &InterestKey) -> Option<&Interest> {
        self.interests.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &InterestKey) -> Option<&mut Interest> {
        self.interests.get_mut(key)
    }

    /// Expected fan-in of a protocol, if this agent is interested in it
    pub fn fan_in(&self, key: &InterestKey) -> Option<InterestKind> {
        self.get(key).map(Interest::kind)
    }

    /// All registered interests
    pub fn interests(&self) -> impl Iterator<Item = &Interest> {
        self.interests.values()
    }

    /// Broadcast keys to bind in `shard`
    pub fn routing_keys(&self, shard: &str) -> Vec<RoutingKey> {
        self.interests().filter_map(|i| i.routing_key(shard)).collect()
    }

    /// Number of interests
    pub fn len(&self) -> usize {
        self.interests.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }
}

/// Live-session counters and waiting first messages, per interest.
///
/// A slot is taken exactly when a session is created and given back exactly
/// when it is removed.
#[derive(Debug, Default)]
pub struct Admission {
    active: HashMap<InterestKey, usize>,
    queues: HashMap<InterestKey, VecDeque<Message>>,
}

impl Admission {
    /// Empty counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another session fits under `limit`
    pub fn has_room(&self, key: &InterestKey, limit: Option<usize>) -> bool {
        limit.map_or(true, |limit| self.active(key) < limit)
    }

    /// Take a slot
    pub fn acquire(&mut self, key: &InterestKey) {
        *self.active.entry(key.clone()).or_default() += 1;
    }

    /// Give a slot back
    pub fn release(&mut self, key: &InterestKey) {
        if let Some(count) = self.active.get_mut(key) {
            *count = count.saturating_sub(1);
        }
    }

    /// Park a first message until a slot frees up
    pub fn enqueue(&mut self, key: &InterestKey, message: Message) {
        self.queues.entry(key.clone()).or_default().push_back(message);
    }

    /// Oldest parked message, if a slot is free
    pub fn dequeue(&mut self, key: &InterestKey, limit: Option<usize>) -> Option<Message> {
        if !self.has_room(key, limit) {
            return None;
        }
        let queue = self.queues.get_mut(key)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        message
    }

    /// Drop parked messages whose deadline passed at `now`; returns them.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> Vec<Message> {
        let mut expired = Vec::new();
        for queue in self.queues.values_mut() {
            let (stale, fresh): (VecDeque<Message>, VecDeque<Message>) =
                queue.drain(..).partition(|m| m.is_expired(now));
            *queue = fresh;
            expired.extend(stale);
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        expired
    }

    /// Interests with parked messages, in a stable order
    pub fn waiting(&self) -> Vec<InterestKey> {
        let mut keys: Vec<InterestKey> = self.queues.keys().cloned().collect();
        keys.sort_by_key(InterestKey::to_string);
        keys
    }

    /// Whether a first message for `session_id` is already parked
    pub fn is_queued(&self, session_id: &SessionId) -> bool {
        self.queues
            .values()
            .any(|q| q.iter().any(|m| &m.session_id == session_id))
    }

    /// Live sessions of an interest
    pub fn active(&self, key: &InterestKey) -> usize {
        self.active.get(key).copied().unwrap_or(0)
    }

    /// Parked messages of an interest
    pub fn queued(&self, key: &InterestKey) -> usize {
        self.queues.get(key).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Announcement, Body, Recipient};
    use crate::protocol::ContractorContext;

    struct Idle;

    impl Contractor for Idle {
        fn announced(&mut self, _: &Message, ctx: &mut ContractorContext) -> anyhow::Result<()> {
            ctx.refuse(serde_json::Value::Null);
            Ok(())
        }

        fn granted(&mut self, _: &Message, _: &mut ContractorContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn announcement(id: &str) -> Message {
        Message::new(
            id.into(),
            "allocate",
            Recipient::agent("eu", "m"),
            Recipient::broadcast("allocate", "eu"),
            Body::Announcement(Announcement::default()),
        )
    }

    #[test]
    fn test_duplicate_interest_rejected() {
        let result = Registry::builder()
            .register(Interest::contractor("allocate", || Idle))
            .and_then(|b| b.register(Interest::contractor("allocate", || Idle).private()));
        assert!(matches!(result, Err(FleetError::DuplicateInterest(_))));
    }

    #[test]
    fn test_routing_keys_only_for_public() {
        let registry = Registry::builder()
            .register(Interest::contractor("allocate", || Idle))
            .unwrap()
            .register(Interest::contractor("migrate", || Idle).private())
            .unwrap()
            .build();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.routing_keys("eu"),
            vec![RoutingKey::for_protocol("allocate", "eu")]
        );
        let key = InterestKey::new("migrate", ProtocolType::Contract);
        assert_eq!(registry.fan_in(&key), Some(InterestKind::Private));
    }

    #[test]
    fn test_admission_fifo() {
        let key = InterestKey::new("allocate", ProtocolType::Contract);
        let mut admission = Admission::new();
        let limit = Some(1);

        assert!(admission.has_room(&key, limit));
        admission.acquire(&key);
        assert!(!admission.has_room(&key, limit));

        admission.enqueue(&key, announcement("s-2"));
        admission.enqueue(&key, announcement("s-3"));
        assert!(admission.is_queued(&SessionId::new("s-3")));
        assert!(admission.dequeue(&key, limit).is_none());

        admission.release(&key);
        assert_eq!(
            admission.dequeue(&key, limit).map(|m| m.session_id),
            Some(SessionId::new("s-2"))
        );
        assert_eq!(admission.queued(&key), 1);
    }

    #[test]
    fn test_admission_prunes_expired() {
        let key = InterestKey::new("allocate", ProtocolType::Contract);
        let now = chrono::Utc::now();
        let mut admission = Admission::new();
        admission.acquire(&key);
        admission.enqueue(&key, announcement("stale").with_expiration(now));
        admission.enqueue(&key, announcement("open"));

        let dropped = admission.prune_expired(now);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].session_id, SessionId::new("stale"));
        assert_eq!(admission.queued(&key), 1);

        admission.enqueue(&key, announcement("late").with_expiration(now));
        admission.release(&key);
        admission.prune_expired(now + chrono::Duration::seconds(1));
        assert_eq!(admission.waiting(), vec![key]);
    }
}
