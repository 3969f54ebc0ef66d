//! Generic session lifecycle shared by every role.
//!
//! A session owns at most one "main" timer through [`SessionCore`]; arming a
//! new one always cancels the previous one, and every terminal transition
//! cancels it, so a stale timer can never fire into a later state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agency::Env;
use crate::error::{FleetError, Outcome, Result};
use crate::message::{Message, ProtocolType, SessionId};
use crate::timer::{Expired, TimerHandle, TimerKind};

/// Which side of which protocol a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    /// Contract initiator
    Manager,
    /// Contract participant
    Contractor,
    /// Request initiator
    Requester,
    /// Request participant
    Replier,
    /// Retry wrapper around an initiator
    Retry,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Manager => "manager",
            Self::Contractor => "contractor",
            Self::Requester => "requester",
            Self::Replier => "replier",
            Self::Retry => "retry",
        };
        f.write_str(name)
    }
}

/// A protocol state enum with an explicit transition table.
pub trait StateMachine: Copy + Eq + fmt::Debug {
    /// Whether `self → next` is a legal transition
    fn can_become(self, next: Self) -> bool;

    /// Whether no transition leaves this state
    fn is_terminal(self) -> bool;
}

/// Snapshot of one session, for introspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    /// Correlation id
    pub session_id: SessionId,
    /// Protocol id
    pub protocol_id: String,
    /// Protocol family
    pub protocol_type: ProtocolType,
    /// Role played
    pub role: RoleKind,
    /// Current state, rendered
    pub state: String,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Last message or timer handled
    pub last_activity: DateTime<Utc>,
}

/// Identity, timing and the main timer of a session.
pub(crate) struct SessionCore {
    pub(crate) id: SessionId,
    pub(crate) protocol_id: String,
    pub(crate) protocol_type: ProtocolType,
    pub(crate) role: RoleKind,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_activity: DateTime<Utc>,
    timer: Option<TimerHandle>,
}

impl SessionCore {
    pub(crate) fn new(
        env: &Env,
        id: SessionId,
        protocol_id: impl Into<String>,
        protocol_type: ProtocolType,
        role: RoleKind,
    ) -> Self {
        let now = env.now();
        Self {
            id,
            protocol_id: protocol_id.into(),
            protocol_type,
            role,
            created_at: now,
            last_activity: now,
            timer: None,
        }
    }

    /// Replace the pending timer with a new one.
    pub(crate) fn arm(&mut self, env: &mut Env, kind: TimerKind, deadline: DateTime<Utc>) {
        self.cancel_timer(env);
        self.timer = Some(env.timers.arm(&self.id, kind, deadline));
    }

    pub(crate) fn cancel_timer(&mut self, env: &mut Env) {
        if let Some(handle) = self.timer.take() {
            env.timers.cancel(handle);
        }
    }

    /// Accept a fired timer if it is the one currently armed.
    pub(crate) fn claim(&mut self, timer: &Expired) -> bool {
        if self.timer == Some(timer.handle) {
            self.timer = None;
            true
        } else {
            tracing::warn!(
                session_id = %self.id,
                kind = ?timer.kind,
                "Stale timer ignored"
            );
            false
        }
    }

    pub(crate) fn touch(&mut self, env: &Env) {
        self.last_activity = env.now();
    }

    /// Move `state` to `next`, refusing anything the table does not allow.
    pub(crate) fn transition<S: StateMachine>(&self, state: &mut S, next: S) -> bool {
        if state.can_become(next) {
            tracing::debug!(
                session_id = %self.id,
                role = %self.role,
                from = ?*state,
                to = ?next,
                "Transition"
            );
            *state = next;
            true
        } else {
            tracing::error!(
                session_id = %self.id,
                role = %self.role,
                from = ?*state,
                to = ?next,
                "Illegal transition refused"
            );
            false
        }
    }

    pub(crate) fn info(&self, state: String) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            protocol_id: self.protocol_id.clone(),
            protocol_type: self.protocol_type,
            role: self.role,
            state,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    pub(crate) fn invalid(&self, state: impl fmt::Debug, operation: &'static str) -> FleetError {
        FleetError::InvalidState {
            session_id: self.id.clone(),
            state: format!("{state:?}"),
            operation,
        }
    }

    pub(crate) fn unexpected(&self, state: impl fmt::Debug, message: &Message) {
        tracing::warn!(
            session_id = %self.id,
            role = %self.role,
            state = ?state,
            kind = message.kind(),
            from = %message.sender,
            "Unexpected message ignored"
        );
    }
}

/// Behaviour every session variant exposes to the agency.
pub(crate) trait Session: Send {
    fn core(&self) -> &SessionCore;

    fn on_message(&mut self, env: &mut Env, message: Message);

    fn on_timer(&mut self, env: &mut Env, timer: Expired);

    fn is_terminal(&self) -> bool;

    fn state_name(&self) -> String;

    /// Result for `notify_finish()`, once, after a terminal transition.
    fn take_outcome(&mut self) -> Option<Outcome> {
        None
    }

    /// Agent-requested cancellation.
    fn cancel(&mut self, _env: &mut Env, _reason: &str) -> Result<()> {
        Err(FleetError::InvalidState {
            session_id: self.core().id.clone(),
            state: self.state_name(),
            operation: "cancel",
        })
    }

    fn info(&self) -> SessionInfo {
        self.core().info(self.state_name())
    }
}
