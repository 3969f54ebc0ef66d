//! Per-agent session manager.
//!
//! An [`Agency`] owns every live session of one agent, its timer queue and
//! its interest registry. It is driven from outside, one step at a time:
//!
//! - [`Agency::on_message`] for every inbound message,
//! - [`Agency::advance`] whenever the clock may have passed a deadline
//!   ([`Agency::next_deadline`] says when),
//! - the `initiate_*` methods and the late operations (`grant`, `reply`,
//!   `final_report`, ...) from agent code.
//!
//! Each step reads the clock once, runs to completion and never blocks.
//! Terminal sessions are removed at the end of the step: their timers are
//! cancelled, their id is tombstoned, their concurrency slot is given back
//! and the initiator's outcome is delivered.
//!
//! ```text
//!   inbound ──> known session_id? ──yes──> session.on_message()
//!                     │ no
//!                     v
//!               first message? ──no──> dropped (late or stray)
//!                     │ yes
//!                     v
//!     tombstoned / queued / expired? ──yes──> dropped
//!                     │ no
//!                     v
//!            interest registered? ──no──> dropped
//!                     │ yes
//!                     v
//!            under concurrency limit? ──no──> FIFO queue
//!                     │ yes
//!                     v
//!             new Contractor / Replier (or Listener call)
//! ```

mod env;

pub(crate) use env::Env;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::channel::Channel;
use crate::clock::{Clock, IdSource, SystemClock, UuidIds};
use crate::config::AgencyConfig;
use crate::error::{FleetError, Outcome, ProtocolFailure, Result};
use crate::interest::{Admission, Interest, InterestKey, InterestKind, Registry, RoleFactory};
use crate::message::{Body, Grant, Message, Notification, Recipient, SessionId};
use crate::protocol::{
    deliver, ContractorSession, Initiator, Manager, ManagerSession, ReplierSession, Requester,
    RequesterSession, RetrySession, RetryingProtocol, Session, SessionInfo,
};
use crate::recorder::{PassThrough, Recorder};

/// Handle on an initiated protocol.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    outcome: oneshot::Receiver<Outcome>,
}

impl SessionHandle {
    /// Session id of the protocol instance
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Wait for the terminal outcome.
    pub async fn notify_finish(self) -> Outcome {
        self.outcome.await.unwrap_or_else(|_| Err(agency_gone()))
    }

    /// The outcome if the session already ended. Yields it once.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(agency_gone())),
        }
    }
}

fn agency_gone() -> ProtocolFailure {
    ProtocolFailure::Failed("agency dropped the session".to_string())
}

enum Role {
    Manager(ManagerSession),
    Contractor(ContractorSession),
    Requester(RequesterSession),
    Replier(ReplierSession),
    Retry(RetrySession),
}

impl Role {
    fn session(&self) -> &dyn Session {
        match self {
            Self::Manager(s) => s,
            Self::Contractor(s) => s,
            Self::Requester(s) => s,
            Self::Replier(s) => s,
            Self::Retry(s) => s,
        }
    }

    fn session_mut(&mut self) -> &mut dyn Session {
        match self {
            Self::Manager(s) => s,
            Self::Contractor(s) => s,
            Self::Requester(s) => s,
            Self::Replier(s) => s,
            Self::Retry(s) => s,
        }
    }
}

/// Session entry with bookkeeping
struct Slot {
    role: Role,
    /// Interest whose concurrency slot this session holds
    interest: Option<InterestKey>,
    /// Retry wrapper this session is an attempt of
    parent: Option<SessionId>,
}

impl Slot {
    fn wrong_role(&self, session_id: &SessionId, operation: &'static str) -> FleetError {
        let session = self.role.session();
        FleetError::InvalidState {
            session_id: session_id.clone(),
            state: format!("{} {}", session.core().role, session.state_name()),
            operation,
        }
    }
}

/// Builder for [`Agency`]
pub struct AgencyBuilder {
    address: Recipient,
    config: AgencyConfig,
    registry: Registry,
    channel: Option<Arc<dyn Channel>>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdSource>,
    recorder: Box<dyn Recorder>,
}

impl AgencyBuilder {
    /// Protocol timeouts and limits
    pub fn config(mut self, config: AgencyConfig) -> Self {
        self.config = config;
        self
    }

    /// Interests of this agent
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Transport (required)
    pub fn channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Time source, [`SystemClock`] by default
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Session id source, random UUIDs by default
    pub fn ids(mut self, ids: impl IdSource + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    /// Side-effect strategy, [`PassThrough`] by default
    pub fn recorder(mut self, recorder: impl Recorder + 'static) -> Self {
        self.recorder = Box::new(recorder);
        self
    }

    /// Build the agency and bind its public interests on the channel.
    pub fn build(self) -> Result<Agency> {
        let channel = self
            .channel
            .ok_or_else(|| FleetError::Config("agency needs a channel".to_string()))?;

        for key in self.registry.routing_keys(self.address.shard()) {
            channel.bind(&self.address, &key)?;
            tracing::debug!(agent = %self.address, key = %key, "Bound interest");
        }

        let env = Env::new(
            self.address,
            self.config,
            channel,
            self.clock,
            self.ids,
            self.recorder,
        );
        tracing::info!(
            agent = %env.address,
            interests = self.registry.len(),
            "Agency ready"
        );
        Ok(Agency {
            env,
            registry: self.registry,
            admission: Admission::new(),
            sessions: BTreeMap::new(),
            waiters: HashMap::new(),
            tombstones: HashMap::new(),
        })
    }
}

/// Session manager of one agent
pub struct Agency {
    env: Env,
    registry: Registry,
    admission: Admission,
    /// Live sessions, ordered by id so every sweep is deterministic
    sessions: BTreeMap<SessionId, Slot>,
    waiters: HashMap<SessionId, oneshot::Sender<Outcome>>,
    /// Finished session ids and when they may be forgotten
    tombstones: HashMap<SessionId, DateTime<Utc>>,
}

impl Agency {
    /// Start building an agency for the agent at `address`
    pub fn builder(address: Recipient) -> AgencyBuilder {
        AgencyBuilder {
            address,
            config: AgencyConfig::default(),
            registry: Registry::empty(),
            channel: None,
            clock: Arc::new(SystemClock),
            ids: Box::new(UuidIds),
            recorder: Box::new(PassThrough),
        }
    }

    /// Address this agent is reachable at
    pub fn address(&self) -> &Recipient {
        &self.env.address
    }

    /// Effective configuration
    pub fn config(&self) -> &AgencyConfig {
        &self.env.config
    }

    /// Interest table
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Concurrency counters and queues
    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Start a contract against `recipients`.
    pub fn initiate_manager(
        &mut self,
        protocol_id: impl Into<String>,
        manager: impl Manager + 'static,
        recipients: Vec<Recipient>,
    ) -> SessionHandle {
        self.env.begin_step();
        let session_id = self.env.new_session_id();
        let session = ManagerSession::start(
            &mut self.env,
            session_id.clone(),
            protocol_id.into(),
            Box::new(manager),
            recipients,
        );
        self.open_initiator(session_id, Role::Manager(session))
    }

    /// Send a request to `recipients`; `timeout` defaults to the configured one.
    pub fn initiate_request(
        &mut self,
        protocol_id: impl Into<String>,
        requester: impl Requester + 'static,
        recipients: Vec<Recipient>,
        timeout: Option<Duration>,
    ) -> SessionHandle {
        self.env.begin_step();
        let session_id = self.env.new_session_id();
        let timeout = timeout.unwrap_or_else(|| self.env.config.request_timeout());
        let session = RequesterSession::start(
            &mut self.env,
            session_id.clone(),
            protocol_id.into(),
            Box::new(requester),
            &recipients,
            timeout,
        );
        self.open_initiator(session_id, Role::Requester(session))
    }

    /// Run a protocol with retries; the handle resolves with the last attempt.
    pub fn initiate_retrying(&mut self, protocol: RetryingProtocol) -> SessionHandle {
        self.env.begin_step();
        let session_id = self.env.new_session_id();
        let session = RetrySession::start(&mut self.env, session_id.clone(), protocol);
        self.open_initiator(session_id, Role::Retry(session))
    }

    fn open_initiator(&mut self, session_id: SessionId, role: Role) -> SessionHandle {
        let (tx, rx) = oneshot::channel();
        tracing::debug!(session_id = %session_id, role = %role.session().core().role, "Initiated");
        self.waiters.insert(session_id.clone(), tx);
        self.sessions.insert(
            session_id.clone(),
            Slot {
                role,
                interest: None,
                parent: None,
            },
        );
        self.settle();
        SessionHandle {
            session_id,
            outcome: rx,
        }
    }

    /// Send a one-way notification; returns how many agents it reached.
    pub fn notify(
        &mut self,
        protocol_id: impl Into<String>,
        recipients: &[Recipient],
        payload: Value,
    ) -> Result<usize> {
        self.env.begin_step();
        let session_id = self.env.new_session_id();
        let notification = Message::new(
            session_id,
            protocol_id,
            self.env.address.clone(),
            self.env.address.clone(),
            Body::Notification(Notification { payload }),
        );
        let mut delivered = 0;
        let mut failure = None;
        for recipient in recipients {
            match self.env.post(recipient, notification.clone()) {
                Ok(count) => delivered += count,
                Err(err) => failure = Some(err),
            }
        }
        match failure {
            Some(err) if delivered == 0 => Err(err),
            _ => Ok(delivered),
        }
    }

    /// Feed one inbound message.
    pub fn on_message(&mut self, message: Message) {
        self.env.begin_step();
        self.dispatch(message);
        self.settle();
    }

    /// Fire every timer due now; returns how many fired.
    pub fn advance(&mut self) -> usize {
        let now = self.env.begin_step();
        let mut fired = 0;
        while let Some(timer) = self.env.timers.pop_due(now) {
            fired += 1;
            match self.sessions.get_mut(&timer.session_id) {
                Some(slot) => slot.role.session_mut().on_timer(&mut self.env, timer),
                None => tracing::warn!(session_id = %timer.session_id, "Timer for unknown session"),
            }
            // settle in between so a finished session's other timers never fire
            self.settle();
        }
        self.tombstones.retain(|_, until| *until > now);
        for message in self.admission.prune_expired(now) {
            tracing::debug!(
                session_id = %message.session_id,
                protocol_id = %message.protocol_id,
                "Queued first message expired"
            );
        }
        fired
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.env.timers.next_deadline()
    }

    /// Cancel a session. A retry wrapper cancels its running attempt.
    pub fn cancel(&mut self, session_id: &SessionId, reason: &str) -> Result<()> {
        self.env.begin_step();
        let slot = self
            .sessions
            .get(session_id)
            .ok_or_else(|| FleetError::UnknownSession(session_id.clone()))?;
        let target = match &slot.role {
            Role::Retry(retry) => retry.child().cloned().unwrap_or_else(|| session_id.clone()),
            _ => session_id.clone(),
        };
        let result = match self.sessions.get_mut(&target) {
            Some(slot) => slot.role.session_mut().cancel(&mut self.env, reason),
            None => Err(FleetError::UnknownSession(target)),
        };
        self.settle();
        result
    }

    /// Grant bids of a closed contract.
    pub fn grant(&mut self, session_id: &SessionId, grants: Vec<(Recipient, Grant)>) -> Result<()> {
        self.env.begin_step();
        let result = match self.sessions.get_mut(session_id) {
            Some(Slot {
                role: Role::Manager(manager),
                ..
            }) => manager.grant(&mut self.env, grants),
            Some(slot) => Err(slot.wrong_role(session_id, "grant")),
            None => Err(FleetError::UnknownSession(session_id.clone())),
        };
        self.settle();
        result
    }

    /// Report progress on a granted job.
    pub fn update_report(&mut self, session_id: &SessionId, payload: Value) -> Result<()> {
        self.with_contractor(session_id, "update_report", |c, env| {
            c.update_report(env, payload)
        })
    }

    /// Deliver the result of a granted job.
    pub fn final_report(&mut self, session_id: &SessionId, payload: Value) -> Result<()> {
        self.with_contractor(session_id, "final_report", |c, env| {
            c.final_report(env, payload)
        })
    }

    /// Give up on a granted job.
    pub fn defect(&mut self, session_id: &SessionId, reason: &str) -> Result<()> {
        self.with_contractor(session_id, "defect", |c, env| c.defect(env, reason))
    }

    fn with_contractor<F>(&mut self, session_id: &SessionId, operation: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ContractorSession, &mut Env) -> Result<()>,
    {
        self.env.begin_step();
        let result = match self.sessions.get_mut(session_id) {
            Some(Slot {
                role: Role::Contractor(contractor),
                ..
            }) => f(contractor, &mut self.env),
            Some(slot) => Err(slot.wrong_role(session_id, operation)),
            None => Err(FleetError::UnknownSession(session_id.clone())),
        };
        self.settle();
        result
    }

    /// Answer a pending request.
    pub fn reply(&mut self, session_id: &SessionId, payload: Value) -> Result<()> {
        self.env.begin_step();
        let result = match self.sessions.get_mut(session_id) {
            Some(Slot {
                role: Role::Replier(replier),
                ..
            }) => replier.reply(&mut self.env, payload),
            Some(slot) => Err(slot.wrong_role(session_id, "reply")),
            None => Err(FleetError::UnknownSession(session_id.clone())),
        };
        self.settle();
        result
    }

    /// No live session and nothing queued
    pub fn is_idle(&self) -> bool {
        self.sessions.is_empty() && self.admission.waiting().is_empty()
    }

    /// Snapshot of every live session
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .values()
            .map(|slot| slot.role.session().info())
            .collect()
    }

    /// Snapshot of one live session
    pub fn session(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.sessions
            .get(session_id)
            .map(|slot| slot.role.session().info())
    }

    /// Timers armed for a session
    pub fn pending_timers(&self, session_id: &SessionId) -> usize {
        self.env.timers.pending_for(session_id)
    }

    /// Whether a finished session id is still remembered
    pub fn is_tombstoned(&self, session_id: &SessionId) -> bool {
        self.tombstones.contains_key(session_id)
    }

    fn dispatch(&mut self, message: Message) {
        if let Some(slot) = self.sessions.get_mut(&message.session_id) {
            slot.role.session_mut().on_message(&mut self.env, message);
            return;
        }
        if !message.is_first_message() {
            tracing::debug!(
                session_id = %message.session_id,
                kind = message.kind(),
                finished = self.tombstones.contains_key(&message.session_id),
                "Message for no live session ignored"
            );
            return;
        }
        if self.tombstones.contains_key(&message.session_id)
            || self.admission.is_queued(&message.session_id)
        {
            tracing::debug!(session_id = %message.session_id, kind = message.kind(), "Duplicate first message ignored");
            return;
        }
        self.open(message);
    }

    /// Start the interested side of a first message.
    fn open(&mut self, message: Message) {
        if message.is_expired(self.env.now()) {
            tracing::info!(session_id = %message.session_id, kind = message.kind(), "Expired first message dropped");
            return;
        }
        if message.body.protocol_type() != message.protocol_type {
            tracing::warn!(
                session_id = %message.session_id,
                protocol_type = %message.protocol_type,
                kind = message.kind(),
                "Body does not match protocol type"
            );
            return;
        }
        let key = InterestKey::of(&message);
        let Some(interest) = self.registry.get_mut(&key) else {
            tracing::debug!(session_id = %message.session_id, interest = %key, "No interest");
            return;
        };
        if interest.kind() == InterestKind::Private && message.receiver.is_broadcast() {
            tracing::debug!(session_id = %message.session_id, interest = %key, "Broadcast to private interest ignored");
            return;
        }

        if let RoleFactory::Listener(factory) = &mut interest.factory {
            let mut listener = factory();
            deliver(listener.as_mut(), &message);
            self.tombstone(message.session_id);
            return;
        }

        if !self.admission.has_room(&key, interest.concurrency()) {
            tracing::debug!(
                session_id = %message.session_id,
                interest = %key,
                queued = self.admission.queued(&key) + 1,
                "Concurrency limit reached, queued"
            );
            self.admission.enqueue(&key, message);
            return;
        }

        let role = match &mut interest.factory {
            RoleFactory::Contractor(factory) => {
                Role::Contractor(ContractorSession::start(&mut self.env, factory(), &message))
            },
            RoleFactory::Replier(factory) => {
                Role::Replier(ReplierSession::start(&mut self.env, factory(), &message))
            },
            RoleFactory::Listener(_) => return,
        };
        tracing::debug!(session_id = %message.session_id, interest = %key, "Session opened");
        self.admission.acquire(&key);
        self.sessions.insert(
            message.session_id,
            Slot {
                role,
                interest: Some(key),
                parent: None,
            },
        );
    }

    /// Run the engine's own follow-ups until nothing changes: start due
    /// retry attempts, admit queued first messages, remove finished sessions.
    fn settle(&mut self) {
        loop {
            let launched = self.launch_attempts();
            let admitted = self.admit_queued();
            let finished = self.remove_finished();
            if !(launched || admitted || finished) {
                break;
            }
        }
    }

    fn launch_attempts(&mut self) -> bool {
        let retries: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, slot)| matches!(slot.role, Role::Retry(_)))
            .map(|(id, _)| id.clone())
            .collect();

        let mut launched = false;
        for parent in retries {
            let attempt = match self.sessions.get_mut(&parent) {
                Some(Slot {
                    role: Role::Retry(retry),
                    ..
                }) => retry.next_attempt(&mut self.env),
                _ => None,
            };
            let Some(attempt) = attempt else {
                continue;
            };
            launched = true;

            let child = self.env.new_session_id();
            let protocol_type = attempt.initiator.protocol_type();
            tracing::info!(
                session_id = %parent,
                attempt = attempt.number,
                child = %child,
                candidates = attempt.recipients.len(),
                "Starting attempt"
            );
            let role = match attempt.initiator {
                Initiator::Manager(manager) => Role::Manager(ManagerSession::start(
                    &mut self.env,
                    child.clone(),
                    attempt.protocol_id,
                    manager,
                    attempt.recipients,
                )),
                Initiator::Requester(requester) => Role::Requester(RequesterSession::start(
                    &mut self.env,
                    child.clone(),
                    attempt.protocol_id,
                    requester,
                    &attempt.recipients,
                    attempt.request_timeout,
                )),
            };
            if let Some(Slot {
                role: Role::Retry(retry),
                ..
            }) = self.sessions.get_mut(&parent)
            {
                retry.attach(child.clone(), protocol_type);
            }
            self.sessions.insert(
                child,
                Slot {
                    role,
                    interest: None,
                    parent: Some(parent),
                },
            );
        }
        launched
    }

    fn admit_queued(&mut self) -> bool {
        let mut admitted = false;
        for key in self.admission.waiting() {
            let limit = self.registry.get(&key).and_then(Interest::concurrency);
            while let Some(message) = self.admission.dequeue(&key, limit) {
                admitted = true;
                tracing::debug!(session_id = %message.session_id, interest = %key, "Dequeued");
                self.open(message);
            }
        }
        admitted
    }

    fn remove_finished(&mut self) -> bool {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, slot)| slot.role.session().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in &finished {
            self.finish(session_id);
        }
        !finished.is_empty()
    }

    fn finish(&mut self, session_id: &SessionId) {
        let Some(mut slot) = self.sessions.remove(session_id) else {
            return;
        };
        let session = slot.role.session_mut();
        self.env.timers.cancel_session(session_id);
        tracing::info!(
            session_id = %session_id,
            protocol_id = %session.core().protocol_id,
            role = %session.core().role,
            state = %session.state_name(),
            "Session finished"
        );
        let outcome = session.take_outcome();
        self.tombstone(session_id.clone());
        if let Some(key) = &slot.interest {
            self.admission.release(key);
        }

        if let Some(parent) = slot.parent {
            let outcome = outcome.unwrap_or_else(|| Err(no_outcome()));
            match self.sessions.get_mut(&parent) {
                Some(Slot {
                    role: Role::Retry(retry),
                    ..
                }) => retry.attempt_finished(&mut self.env, outcome),
                _ => tracing::warn!(session_id = %session_id, parent = %parent, "Attempt outlived its retry wrapper"),
            }
        } else if let Some(waiter) = self.waiters.remove(session_id) {
            let outcome = outcome.unwrap_or_else(|| Err(no_outcome()));
            if waiter.send(outcome).is_err() {
                tracing::debug!(session_id = %session_id, "Nobody waiting for the outcome");
            }
        }
    }

    fn tombstone(&mut self, session_id: SessionId) {
        let until = self.env.after(self.env.config.tombstone_ttl());
        self.tombstones.insert(session_id, until);
    }
}

fn no_outcome() -> ProtocolFailure {
    ProtocolFailure::InvariantViolation("initiator ended without an outcome".to_string())
}
