//! Request protocol: one request, first reply wins.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::session::{RoleKind, Session, SessionCore, StateMachine};
use crate::agency::Env;
use crate::error::{Outcome, ProtocolFailure, Result};
use crate::message::{
    Body, Message, ProtocolType, Recipient, RequestMessage, ResponseMessage, SessionId,
};
use crate::timer::{Expired, TimerKind};

/// Business hooks of a requester.
pub trait Requester: Send {
    /// Build the request with [`RequestContext::request`].
    fn initiate(&mut self, ctx: &mut RequestContext) -> anyhow::Result<()>;

    /// The first reply arrived; its value resolves the session.
    fn got_reply(&mut self, reply: &Message) -> anyhow::Result<Value> {
        Ok(reply.payload().cloned().unwrap_or(Value::Null))
    }

    /// Called when the session ends without a reply.
    fn closed(&mut self) {}
}

/// Business hooks of a replier.
pub trait Replier: Send {
    /// Answer with [`ReplyContext::reply`] now, or later through the agency.
    fn requested(&mut self, request: &Message, ctx: &mut ReplyContext) -> anyhow::Result<()>;

    /// The request expired before we replied.
    fn closed(&mut self) {}
}

/// Collects the request payload.
#[derive(Debug, Default)]
pub struct RequestContext {
    requests: Vec<Value>,
}

impl RequestContext {
    /// Send `payload` to every recipient.
    pub fn request(&mut self, payload: Value) {
        self.requests.push(payload);
    }
}

/// Collects the reply payload.
#[derive(Debug, Default)]
pub struct ReplyContext {
    replies: Vec<Value>,
}

impl ReplyContext {
    /// Answer the request.
    pub fn reply(&mut self, payload: Value) {
        self.replies.push(payload);
    }
}

/// Requester states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequesterState {
    /// Created, nothing sent
    Initiated,
    /// Request out
    Requested,
    /// Reply received
    Closed,
    /// Timed out
    Expired,
    /// Cancelled locally
    Cancelled,
    /// Undeliverable or hook failure
    Failed,
    /// Contract violated
    Wtf,
}

impl StateMachine for RequesterState {
    fn can_become(self, next: Self) -> bool {
        use RequesterState::*;
        match (self, next) {
            (Initiated, Requested) | (Requested, Closed | Expired) => true,
            (state, Cancelled | Failed | Wtf) => !state.is_terminal(),
            _ => false,
        }
    }

    fn is_terminal(self) -> bool {
        !matches!(self, Self::Initiated | Self::Requested)
    }
}

/// Replier states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplierState {
    /// Request received, no reply yet
    Requested,
    /// Reply sent
    Replied,
    /// Request expired before a reply
    Expired,
    /// Hook failure
    Failed,
    /// Contract violated
    Wtf,
}

impl StateMachine for ReplierState {
    fn can_become(self, next: Self) -> bool {
        matches!(self, Self::Requested) && next != Self::Requested
    }

    fn is_terminal(self) -> bool {
        !matches!(self, Self::Requested)
    }
}

/// A running request, requesting side.
pub(crate) struct RequesterSession {
    core: SessionCore,
    role: Box<dyn Requester>,
    state: RequesterState,
    outcome: Option<Outcome>,
}

impl RequesterSession {
    pub(crate) fn start(
        env: &mut Env,
        session_id: SessionId,
        protocol_id: String,
        role: Box<dyn Requester>,
        recipients: &[Recipient],
        timeout: Duration,
    ) -> Self {
        let core = SessionCore::new(
            env,
            session_id,
            protocol_id,
            ProtocolType::Request,
            RoleKind::Requester,
        );
        let mut session = Self {
            core,
            role,
            state: RequesterState::Initiated,
            outcome: None,
        };

        let mut ctx = RequestContext::default();
        if let Err(err) = session.role.initiate(&mut ctx) {
            session.finish_with(RequesterState::Failed, ProtocolFailure::from_hook(&err));
            return session;
        }
        let payload = match ctx.requests.len() {
            1 => ctx.requests.remove(0),
            n => {
                session.wtf(&format!("initiate() made {n} requests, expected one"));
                return session;
            },
        };

        let deadline = env.after(timeout);
        let request = Message::new(
            session.core.id.clone(),
            session.core.protocol_id.clone(),
            env.address.clone(),
            env.address.clone(),
            Body::Request(RequestMessage::new(payload)),
        )
        .with_expiration(deadline);
        let delivered: usize = recipients
            .iter()
            .filter_map(|r| env.post(r, request.clone()).ok())
            .sum();

        if delivered == 0 {
            tracing::info!(session_id = %session.core.id, "Request reached nobody");
            session.finish_with(
                RequesterState::Failed,
                ProtocolFailure::Failed("request reached nobody".to_string()),
            );
            return session;
        }
        session
            .core
            .transition(&mut session.state, RequesterState::Requested);
        session.core.arm(env, TimerKind::RequestTimeout, deadline);
        tracing::debug!(session_id = %session.core.id, delivered, "Requested");
        session
    }

    fn finish_with(&mut self, state: RequesterState, failure: ProtocolFailure) {
        if let ProtocolFailure::Failed(reason) = &failure {
            tracing::error!(session_id = %self.core.id, reason = %reason, "Request failed");
        }
        self.core.transition(&mut self.state, state);
        self.role.closed();
        self.outcome = Some(Err(failure));
    }

    fn wtf(&mut self, reason: &str) {
        tracing::error!(session_id = %self.core.id, reason, "Requester broke the protocol");
        self.core.transition(&mut self.state, RequesterState::Wtf);
        self.outcome = Some(Err(ProtocolFailure::InvariantViolation(reason.to_string())));
    }
}

impl Session for RequesterSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn on_message(&mut self, env: &mut Env, message: Message) {
        self.core.touch(env);
        match (self.state, &message.body) {
            (RequesterState::Requested, Body::Response(_)) => {
                self.core.cancel_timer(env);
                match self.role.got_reply(&message) {
                    Ok(value) => {
                        self.core.transition(&mut self.state, RequesterState::Closed);
                        tracing::debug!(session_id = %self.core.id, from = %message.sender, "Replied");
                        self.outcome = Some(Ok(value));
                    },
                    Err(err) => {
                        self.finish_with(RequesterState::Failed, ProtocolFailure::from_hook(&err));
                    },
                }
            },
            (state, _) => self.core.unexpected(state, &message),
        }
    }

    fn on_timer(&mut self, env: &mut Env, timer: Expired) {
        self.core.touch(env);
        if !self.core.claim(&timer) {
            return;
        }
        if self.state == RequesterState::Requested {
            tracing::info!(session_id = %self.core.id, "Request expired");
            self.finish_with(RequesterState::Expired, ProtocolFailure::Expired);
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn state_name(&self) -> String {
        format!("{:?}", self.state)
    }

    fn take_outcome(&mut self) -> Option<Outcome> {
        self.outcome.take()
    }

    fn cancel(&mut self, env: &mut Env, reason: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.core.invalid(self.state, "cancel"));
        }
        self.core.cancel_timer(env);
        self.finish_with(
            RequesterState::Cancelled,
            ProtocolFailure::Cancelled(reason.to_string()),
        );
        Ok(())
    }
}

/// A running request, replying side.
pub(crate) struct ReplierSession {
    core: SessionCore,
    role: Box<dyn Replier>,
    state: ReplierState,
    requester: Recipient,
}

impl ReplierSession {
    pub(crate) fn start(env: &mut Env, role: Box<dyn Replier>, request: &Message) -> Self {
        let core = SessionCore::new(
            env,
            request.session_id.clone(),
            request.protocol_id.clone(),
            ProtocolType::Request,
            RoleKind::Replier,
        );
        let mut session = Self {
            core,
            role,
            state: ReplierState::Requested,
            requester: request.sender.clone(),
        };

        let mut ctx = ReplyContext::default();
        if let Err(err) = session.role.requested(request, &mut ctx) {
            tracing::error!(
                session_id = %session.core.id,
                error = %format!("{err:#}"),
                "Replier hook failed"
            );
            session.core.transition(&mut session.state, ReplierState::Failed);
            return session;
        }
        match ctx.replies.len() {
            0 => {
                let deadline = reply_deadline(env, request);
                session.core.arm(env, TimerKind::RequestTimeout, deadline);
            },
            1 => {
                let payload = ctx.replies.remove(0);
                // state is Requested, cannot fail
                let _ = session.reply(env, payload);
            },
            n => session.wtf(&format!("requested() replied {n} times")),
        }
        session
    }

    pub(crate) fn reply(&mut self, env: &mut Env, payload: Value) -> Result<()> {
        if self.state != ReplierState::Requested {
            return Err(self.core.invalid(self.state, "reply"));
        }
        self.core.cancel_timer(env);
        let response = Message::new(
            self.core.id.clone(),
            self.core.protocol_id.clone(),
            env.address.clone(),
            self.requester.clone(),
            Body::Response(ResponseMessage { payload }),
        );
        let _ = env.post(&self.requester, response);
        self.core.transition(&mut self.state, ReplierState::Replied);
        Ok(())
    }

    fn wtf(&mut self, reason: &str) {
        tracing::error!(session_id = %self.core.id, reason, "Replier broke the protocol");
        self.core.transition(&mut self.state, ReplierState::Wtf);
    }
}

fn reply_deadline(env: &Env, request: &Message) -> DateTime<Utc> {
    request
        .expiration_time
        .unwrap_or_else(|| env.after(env.config.request_timeout()))
}

impl Session for ReplierSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn on_message(&mut self, env: &mut Env, message: Message) {
        self.core.touch(env);
        if matches!(message.body, Body::Request(_)) {
            tracing::warn!(
                session_id = %self.core.id,
                state = ?self.state,
                "Duplicate request ignored"
            );
            return;
        }
        self.core.unexpected(self.state, &message);
    }

    fn on_timer(&mut self, env: &mut Env, timer: Expired) {
        self.core.touch(env);
        if !self.core.claim(&timer) {
            return;
        }
        if self.state == ReplierState::Requested {
            tracing::info!(session_id = %self.core.id, "Request expired before reply");
            self.core.transition(&mut self.state, ReplierState::Expired);
            self.role.closed();
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn state_name(&self) -> String {
        format!("{:?}", self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requester_transitions() {
        use RequesterState::*;
        assert!(Initiated.can_become(Requested));
        assert!(Requested.can_become(Closed));
        assert!(Requested.can_become(Cancelled));
        assert!(!Closed.can_become(Expired));
        assert!(!Expired.can_become(Closed));
    }

    #[test]
    fn test_replier_replies_once() {
        assert!(ReplierState::Requested.can_become(ReplierState::Replied));
        assert!(!ReplierState::Replied.can_become(ReplierState::Replied));
        assert!(ReplierState::Replied.is_terminal());
    }

    #[test]
    fn test_contexts_collect() {
        let mut ctx = ReplyContext::default();
        ctx.reply(Value::Bool(true));
        assert_eq!(ctx.replies, vec![Value::Bool(true)]);

        let mut ctx = RequestContext::default();
        ctx.request(Value::Null);
        assert_eq!(ctx.requests.len(), 1);
    }
}
