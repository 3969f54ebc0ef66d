//! Retry wrapper around an initiator.
//!
//! Each attempt re-resolves the candidate set and builds a fresh initiator,
//! so the caller can drop a failed candidate between attempts. Only
//! retryable failures (see [`ProtocolFailure::is_retryable`]) are retried;
//! anything else, or the failure of the last attempt, is surfaced unchanged.

use chrono::Duration;

use super::manager::Manager;
use super::request::Requester;
use super::session::{RoleKind, Session, SessionCore, StateMachine};
use crate::agency::Env;
use crate::config::RetryConfig;
use crate::error::{Outcome, ProtocolFailure, Result};
use crate::message::{Message, ProtocolType, Recipient, SessionId};
use crate::timer::{Expired, TimerKind};

/// An initiating role, one per attempt.
pub enum Initiator {
    /// Run a contract
    Manager(Box<dyn Manager>),
    /// Run a request
    Requester(Box<dyn Requester>),
}

impl Initiator {
    /// Wrap a manager
    pub fn manager(manager: impl Manager + 'static) -> Self {
        Self::Manager(Box::new(manager))
    }

    /// Wrap a requester
    pub fn requester(requester: impl Requester + 'static) -> Self {
        Self::Requester(Box::new(requester))
    }

    pub(crate) fn protocol_type(&self) -> ProtocolType {
        match self {
            Self::Manager(_) => ProtocolType::Contract,
            Self::Requester(_) => ProtocolType::Request,
        }
    }
}

type InitiatorFactory = Box<dyn FnMut(u32) -> Initiator + Send>;
type CandidateResolver = Box<dyn FnMut() -> Vec<Recipient> + Send>;

/// A protocol to run with retries.
pub struct RetryingProtocol {
    protocol_id: String,
    factory: InitiatorFactory,
    resolve: CandidateResolver,
    policy: Option<RetryConfig>,
    request_timeout: Option<Duration>,
}

impl RetryingProtocol {
    /// `factory` gets the 1-based attempt number; `resolve` runs before
    /// every attempt.
    pub fn new<F, R>(protocol_id: impl Into<String>, factory: F, resolve: R) -> Self
    where
        F: FnMut(u32) -> Initiator + Send + 'static,
        R: FnMut() -> Vec<Recipient> + Send + 'static,
    {
        Self {
            protocol_id: protocol_id.into(),
            factory: Box::new(factory),
            resolve: Box::new(resolve),
            policy: None,
            request_timeout: None,
        }
    }

    /// Override the agency's retry policy
    pub fn with_policy(mut self, policy: RetryConfig) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Override the agency's request timeout for requester attempts
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Protocol id of every attempt
    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }
}

/// Retry wrapper states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryState {
    /// An attempt is due or running
    Running,
    /// Backing off before the next attempt
    Waiting,
    /// An attempt succeeded
    Succeeded,
    /// Retries exhausted or the failure was not retryable
    Failed,
    /// Cancelled by the agent
    Cancelled,
}

impl StateMachine for RetryState {
    fn can_become(self, next: Self) -> bool {
        use RetryState::*;
        match (self, next) {
            (Running, Waiting | Succeeded | Failed) | (Waiting, Running) => true,
            (state, Cancelled) => !state.is_terminal(),
            _ => false,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One attempt, ready for the agency to start.
pub(crate) struct Attempt {
    pub(crate) number: u32,
    pub(crate) protocol_id: String,
    pub(crate) initiator: Initiator,
    pub(crate) recipients: Vec<Recipient>,
    pub(crate) request_timeout: Duration,
}

/// Parent session of a chain of attempts.
pub(crate) struct RetrySession {
    core: SessionCore,
    protocol: RetryingProtocol,
    policy: RetryConfig,
    state: RetryState,
    attempts: u32,
    child: Option<SessionId>,
    due: bool,
    outcome: Option<Outcome>,
}

impl RetrySession {
    pub(crate) fn start(env: &mut Env, session_id: SessionId, protocol: RetryingProtocol) -> Self {
        // the family is known once the first attempt is attached
        let core = SessionCore::new(
            env,
            session_id,
            protocol.protocol_id.clone(),
            ProtocolType::Contract,
            RoleKind::Retry,
        );
        let policy = protocol
            .policy
            .clone()
            .unwrap_or_else(|| env.config.retry.clone());
        Self {
            core,
            protocol,
            policy,
            state: RetryState::Running,
            attempts: 0,
            child: None,
            due: true,
            outcome: None,
        }
    }

    pub(crate) fn child(&self) -> Option<&SessionId> {
        self.child.as_ref()
    }

    /// The next attempt if one is due. An empty candidate set counts as a
    /// failed attempt and returns `None`.
    pub(crate) fn next_attempt(&mut self, env: &mut Env) -> Option<Attempt> {
        if !self.due || self.state != RetryState::Running {
            return None;
        }
        self.due = false;
        self.attempts += 1;
        let recipients = (self.protocol.resolve)();
        if recipients.is_empty() {
            tracing::info!(
                session_id = %self.core.id,
                attempt = self.attempts,
                "No candidates"
            );
            self.attempt_finished(
                env,
                Err(ProtocolFailure::Failed("no candidates".to_string())),
            );
            return None;
        }
        let initiator = (self.protocol.factory)(self.attempts);
        Some(Attempt {
            number: self.attempts,
            protocol_id: self.protocol.protocol_id.clone(),
            initiator,
            recipients,
            request_timeout: self
                .protocol
                .request_timeout
                .unwrap_or_else(|| env.config.request_timeout()),
        })
    }

    pub(crate) fn attach(&mut self, child: SessionId, protocol_type: ProtocolType) {
        self.core.protocol_type = protocol_type;
        self.child = Some(child);
    }

    /// An attempt ended; retry or settle.
    pub(crate) fn attempt_finished(&mut self, env: &mut Env, outcome: Outcome) {
        self.child = None;
        self.core.touch(env);
        match outcome {
            Ok(value) => {
                tracing::info!(session_id = %self.core.id, attempts = self.attempts, "Attempt succeeded");
                self.core.transition(&mut self.state, RetryState::Succeeded);
                self.outcome = Some(Ok(value));
            },
            Err(failure) if failure.is_retryable() && self.attempts <= self.policy.max_retries => {
                let delay = self.policy.delay_for(self.attempts);
                tracing::info!(
                    session_id = %self.core.id,
                    attempt = self.attempts,
                    failure = %failure,
                    delay_ms = delay.num_milliseconds(),
                    "Attempt failed, retrying"
                );
                self.core.transition(&mut self.state, RetryState::Waiting);
                let deadline = env.after(delay);
                self.core.arm(env, TimerKind::RetryDelay, deadline);
            },
            Err(ProtocolFailure::Cancelled(reason)) => {
                self.core.transition(&mut self.state, RetryState::Cancelled);
                self.outcome = Some(Err(ProtocolFailure::Cancelled(reason)));
            },
            Err(failure) => {
                tracing::warn!(
                    session_id = %self.core.id,
                    attempts = self.attempts,
                    failure = %failure,
                    "Giving up"
                );
                self.core.transition(&mut self.state, RetryState::Failed);
                self.outcome = Some(Err(failure));
            },
        }
    }
}

impl Session for RetrySession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn on_message(&mut self, _env: &mut Env, message: Message) {
        self.core.unexpected(self.state, &message);
    }

    fn on_timer(&mut self, env: &mut Env, timer: Expired) {
        self.core.touch(env);
        if !self.core.claim(&timer) {
            return;
        }
        if self.state == RetryState::Waiting {
            self.core.transition(&mut self.state, RetryState::Running);
            self.due = true;
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

    /// Only reached when no attempt is running; the agency cancels a
    /// running attempt instead and the wrapper settles on its outcome.
    fn cancel(&mut self, env: &mut Env, reason: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.core.invalid(self.state, "cancel"));
        }
        self.core.cancel_timer(env);
        self.core.transition(&mut self.state, RetryState::Cancelled);
        self.outcome = Some(Err(ProtocolFailure::Cancelled(reason.to_string())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_transitions() {
        use RetryState::*;
        assert!(Running.can_become(Waiting));
        assert!(Waiting.can_become(Running));
        assert!(Waiting.can_become(Cancelled));
        assert!(!Succeeded.can_become(Running));
        assert!(!Waiting.can_become(Succeeded));
    }
}
